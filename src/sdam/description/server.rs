use std::{fmt, time::Duration};

use serde::{Serialize, Serializer};

use super::stats::QueryStats;
use crate::{
    bson::{DateTime, Document},
    error::{Error, Result},
    hello::HelloReply,
    options::ServerAddress,
    selection_criteria::TagSet,
    serde_util,
};

/// The possible roles of a replica set member.
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq, Default, Serialize, derive_more::Display)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica set mongod. Such members are removed from the topology.
    Standalone,

    /// A router to a sharded cluster. Such members are removed from the topology.
    Mongos,

    /// The primary node in a replica set.
    #[serde(rename = "RSPrimary")]
    #[display("RSPrimary")]
    RsPrimary,

    /// A secondary node in a replica set.
    #[serde(rename = "RSSecondary")]
    #[display("RSSecondary")]
    RsSecondary,

    /// A non-data bearing node in a replica set which can participate in elections.
    #[serde(rename = "RSArbiter")]
    #[display("RSArbiter")]
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    #[serde(rename = "RSOther")]
    #[display("RSOther")]
    RsOther,

    /// A member of an uninitialized replica set or a member that has been removed from the
    /// replica set config.
    #[serde(rename = "RSGhost")]
    #[display("RSGhost")]
    RsGhost,

    /// A server that has not been checked yet or whose latest check failed.
    #[default]
    Unknown,
}

impl ServerType {
    /// Whether a server of this type answered its latest check.
    pub fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown)
    }
}

/// A description of the most up-to-date information known about a replica set member.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescription {
    pub(crate) address: ServerAddress,

    pub(crate) server_type: ServerType,

    /// The time of the latest successful check. Failed checks leave it untouched.
    pub(crate) last_update_time: Option<DateTime>,

    #[serde(serialize_with = "serde_util::duration_option_as_int_millis::serialize")]
    pub(crate) round_trip_time: Option<Duration>,

    pub(crate) query_stats: QueryStats,

    // A newly added server has neither a reply nor an error until its first check completes, and
    // a reply and an error are never present at the same time.
    #[serde(rename = "reply", serialize_with = "serialize_reply")]
    pub(crate) reply: Result<Option<HelloReply>>,
}

fn serialize_reply<S: Serializer>(
    reply: &Result<Option<HelloReply>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match reply {
        Ok(reply) => reply
            .as_ref()
            .map(|r| &r.raw_command_response)
            .serialize(serializer),
        Err(error) => serializer.serialize_str(&error.to_string()),
    }
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        if self.address != other.address || self.server_type != other.server_type {
            return false;
        }

        match (self.reply.as_ref(), other.reply.as_ref()) {
            (Ok(self_reply), Ok(other_reply)) => {
                let self_response = self_reply.as_ref().map(|r| &r.command_response);
                let other_response = other_reply.as_ref().map(|r| &r.command_response);

                self_response == other_response
            }
            (Err(self_err), Err(other_err)) => self_err.to_string() == other_err.to_string(),
            _ => false,
        }
    }
}

impl ServerDescription {
    /// A description of a server that has not been checked yet.
    pub(crate) fn new(address: &ServerAddress) -> Self {
        Self {
            address: address.clone(),
            server_type: Default::default(),
            last_update_time: None,
            round_trip_time: None,
            query_stats: QueryStats::default(),
            reply: Ok(None),
        }
    }

    /// A description built from a successful check.
    pub(crate) fn new_from_hello_reply(
        address: ServerAddress,
        mut reply: HelloReply,
        round_trip_time: Duration,
        query_stats: QueryStats,
    ) -> Self {
        let response = &mut reply.command_response;
        for hosts in [
            &mut response.hosts,
            &mut response.passives,
            &mut response.arbiters,
        ]
        .into_iter()
        .flatten()
        {
            for host in hosts.iter_mut() {
                *host = host.to_lowercase();
            }
        }
        if let Some(ref mut me) = response.me {
            *me = me.to_lowercase();
        }

        Self {
            address,
            server_type: reply.command_response.server_type(),
            last_update_time: Some(DateTime::now()),
            round_trip_time: Some(round_trip_time),
            query_stats,
            reply: Ok(Some(reply)),
        }
    }

    /// A description of a server whose latest check failed. The time of the last successful
    /// check and the round trip time statistics are carried over from `previous`.
    pub(crate) fn new_from_error(
        address: ServerAddress,
        error: Error,
        previous: Option<&ServerDescription>,
    ) -> Self {
        Self {
            address,
            server_type: ServerType::Unknown,
            last_update_time: previous.and_then(|sd| sd.last_update_time),
            round_trip_time: None,
            query_stats: previous.map(|sd| sd.query_stats).unwrap_or_default(),
            reply: Err(error),
        }
    }

    /// The address of the server.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The role of the server, as reported by its latest check.
    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    /// Whether this server answered its latest check.
    pub(crate) fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    /// The time of the latest successful check of the server.
    pub fn last_update_time(&self) -> Option<DateTime> {
        self.last_update_time
    }

    /// The round trip time of the latest successful check.
    pub fn round_trip_time(&self) -> Option<Duration> {
        self.round_trip_time
    }

    /// Statistics over every round trip time measured for this server.
    pub fn query_stats(&self) -> &QueryStats {
        &self.query_stats
    }

    /// The error returned by the latest check, if it failed.
    pub fn error(&self) -> Option<&Error> {
        self.reply.as_ref().err()
    }

    /// The raw reply to the latest check, if it succeeded.
    pub fn reply(&self) -> Option<&Document> {
        self.hello_reply().map(|r| &r.raw_command_response)
    }

    /// The tags of the server, if it reported any.
    pub fn tags(&self) -> Option<&TagSet> {
        self.hello_reply()
            .and_then(|r| r.command_response.tags.as_ref())
    }

    /// The replica set name the server reported.
    pub fn set_name(&self) -> Option<&str> {
        self.hello_reply()
            .and_then(|r| r.command_response.set_name.as_deref())
    }

    pub(crate) fn last_write_date(&self) -> Option<DateTime> {
        self.hello_reply()
            .and_then(|r| r.command_response.last_write.as_ref())
            .map(|write| write.last_write_date)
    }

    fn hello_reply(&self) -> Option<&HelloReply> {
        self.reply.as_ref().ok().and_then(Option::as_ref)
    }

    /// The members the server knows about: its hosts, passives and arbiters. Entries that are
    /// not valid addresses are skipped.
    pub(crate) fn known_hosts(&self) -> impl Iterator<Item = ServerAddress> + '_ {
        let known_hosts = self.hello_reply().map(|reply| {
            let response = &reply.command_response;
            let hosts = response.hosts.as_ref();
            let passives = response.passives.as_ref();
            let arbiters = response.arbiters.as_ref();

            hosts
                .into_iter()
                .flatten()
                .chain(passives.into_iter().flatten())
                .chain(arbiters.into_iter().flatten())
        });

        known_hosts
            .into_iter()
            .flatten()
            .filter_map(|host| ServerAddress::parse(host).ok())
    }

    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        if tag_set.is_empty() {
            return true;
        }

        let server_tags = match self.tags() {
            Some(tags) => tags,
            None => return false,
        };

        tag_set
            .iter()
            .all(|(key, val)| server_tags.get(key) == Some(val))
    }
}

impl fmt::Display for ServerDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ Address: {}, Type: {}",
            self.address, self.server_type
        )?;

        match self.reply {
            Ok(Some(ref reply)) => {
                if let Some(ref set_name) = reply.command_response.set_name {
                    write!(f, ", Set Name: {set_name}")?;
                }
                if let Some(ref tags) = reply.command_response.tags {
                    write!(f, ", Tags: {tags:?}")?;
                }
                if let Some(rtt) = self.round_trip_time {
                    write!(f, ", Round Trip Time: {rtt:?}")?;
                }
            }
            Ok(None) => {}
            Err(ref e) => write!(f, ", Error: {e}")?,
        }

        write!(f, " }}")
    }
}
