pub(crate) mod server_selection;
#[cfg(test)]
pub(crate) mod test;

use std::{
    collections::{HashMap, HashSet},
    fmt,
    time::Duration,
};

use serde::Serialize;

use crate::{
    error::{Error, ErrorKind, Result},
    options::{ClientOptions, ServerAddress},
    sdam::{
        description::server::{ServerDescription, ServerType},
        DEFAULT_HEARTBEAT_FREQUENCY,
    },
    serde_util,
};

use self::server_selection::IDLE_WRITE_PERIOD;

/// The possible types for a replica set topology.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Default, derive_more::Display)]
#[non_exhaustive]
pub enum TopologyType {
    /// A replica set with no known primary.
    #[default]
    ReplicaSetNoPrimary,

    /// A replica set with a known primary.
    ReplicaSetWithPrimary,
}

/// A description of the most up-to-date information known about a replica set.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyDescription {
    pub(crate) topology_type: TopologyType,

    /// The replica set name of the topology, either configured or adopted from the first member
    /// that reported one.
    pub(crate) set_name: Option<String>,

    /// How much slower than the fastest eligible member a member may be and still be picked
    /// by latency-windowed strategies.
    #[serde(serialize_with = "serde_util::duration_option_as_int_millis::serialize")]
    pub(crate) local_threshold: Option<Duration>,

    /// The time to wait between two checks of the same server.
    #[serde(serialize_with = "serde_util::duration_option_as_int_millis::serialize")]
    pub(crate) heartbeat_freq: Option<Duration>,

    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,
}

impl PartialEq for TopologyDescription {
    fn eq(&self, other: &Self) -> bool {
        self.servers == other.servers
            && self.topology_type == other.topology_type
            && self.set_name == other.set_name
    }
}

impl TopologyDescription {
    /// A description of the seed list in `options`, with every seed unknown.
    pub(crate) fn new(options: &ClientOptions) -> Self {
        let servers = options
            .hosts
            .iter()
            .map(|address| (address.clone(), ServerDescription::new(address)))
            .collect();

        Self {
            topology_type: TopologyType::ReplicaSetNoPrimary,
            set_name: options.repl_set_name.clone(),
            local_threshold: options.local_threshold,
            heartbeat_freq: options.heartbeat_freq,
            servers,
        }
    }

    /// The current type of the topology.
    pub fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    /// The replica set name of the topology.
    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    /// The descriptions of every member of the topology.
    pub fn servers(&self) -> impl Iterator<Item = &ServerDescription> {
        self.servers.values()
    }

    /// The description of the member at `address`, if it is part of the topology.
    pub fn server_description(&self, address: &ServerAddress) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    /// The current primary, if one is known.
    pub fn primary(&self) -> Option<&ServerDescription> {
        self.servers_with_type(&[ServerType::RsPrimary]).next()
    }

    pub(crate) fn server_addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    pub(crate) fn servers_with_type<'a>(
        &'a self,
        types: &'a [ServerType],
    ) -> impl Iterator<Item = &'a ServerDescription> {
        self.servers
            .values()
            .filter(move |server| types.contains(&server.server_type))
    }

    pub(crate) fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }

    /// If a primary and at least `min_secondaries` secondaries are known, returns the address
    /// of the primary and the number of secondaries.
    pub(crate) fn full_setup(&self, min_secondaries: u32) -> Option<(ServerAddress, usize)> {
        let primary = self.primary()?;
        let secondaries = self
            .servers_with_type(&[ServerType::RsSecondary])
            .count();

        if secondaries >= min_secondaries as usize {
            Some((primary.address.clone(), secondaries))
        } else {
            None
        }
    }

    /// What it takes to get from `self` to `other`, or `None` if nothing differs. An address only
    /// `other` knows about is "added".
    pub(crate) fn diff<'a>(
        &'a self,
        other: &'a TopologyDescription,
    ) -> Option<TopologyDescriptionDiff<'a>> {
        if self == other {
            return None;
        }

        let addresses: HashSet<&ServerAddress> = self.server_addresses().collect();
        let other_addresses: HashSet<&ServerAddress> = other.server_addresses().collect();

        let changed_servers = self
            .servers
            .iter()
            .filter_map(|(address, description)| match other.servers.get(address) {
                Some(other_description) if description != other_description => {
                    Some((address, (description, other_description)))
                }
                _ => None,
            });

        Some(TopologyDescriptionDiff {
            removed_addresses: addresses.difference(&other_addresses).cloned().collect(),
            added_addresses: other_addresses.difference(&addresses).cloned().collect(),
            changed_servers: changed_servers.collect(),
        })
    }

    /// Removes the member at `address` from the topology.
    pub(crate) fn remove_server(&mut self, address: &ServerAddress) {
        self.servers.remove(address);
        self.record_primary_state();
    }

    /// Applies the outcome of one check to the topology.
    ///
    /// A member that reports a replica set name other than the topology's is removed and the
    /// mismatch is returned as an error; the rest of the topology is still valid.
    pub(crate) fn update(&mut self, server_description: ServerDescription) -> Result<()> {
        if !self.servers.contains_key(&server_description.address) {
            return Ok(());
        }

        let result = match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost => {
                self.servers.insert(
                    server_description.address.clone(),
                    server_description,
                );
                Ok(())
            }
            ServerType::Standalone | ServerType::Mongos => {
                self.servers.remove(&server_description.address);
                Ok(())
            }
            ServerType::RsPrimary => self.update_rs_from_primary_server(server_description),
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.update_rs_from_member(server_description)
            }
        };

        self.record_primary_state();

        result
    }

    /// Adopts the set name of `server_description` if the topology doesn't have one yet, or
    /// removes the server if the names differ.
    fn check_set_name(&mut self, server_description: &ServerDescription) -> Result<()> {
        let actual = server_description.set_name();
        match self.set_name {
            None => {
                self.set_name = actual.map(String::from);
                Ok(())
            }
            Some(ref expected) if actual != Some(expected.as_str()) => {
                let error: Error = ErrorKind::SetNameMismatch {
                    address: server_description.address.clone(),
                    expected: expected.clone(),
                    actual: actual.unwrap_or_default().to_string(),
                }
                .into();
                self.servers.remove(&server_description.address);
                Err(error)
            }
            Some(_) => Ok(()),
        }
    }

    /// Update the topology based on a description from a secondary, an arbiter or another
    /// non-primary member.
    fn update_rs_from_member(&mut self, server_description: ServerDescription) -> Result<()> {
        self.check_set_name(&server_description)?;

        self.add_new_servers(server_description.known_hosts());
        self.servers.insert(
            server_description.address.clone(),
            server_description,
        );

        Ok(())
    }

    /// Update the topology based on a description from a primary.
    fn update_rs_from_primary_server(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        self.check_set_name(&server_description)?;

        // Most recent report wins: any other primary is reset to unknown until its next check.
        let stale_primaries: Vec<ServerAddress> = self
            .servers_with_type(&[ServerType::RsPrimary])
            .map(|server| server.address.clone())
            .filter(|address| *address != server_description.address)
            .collect();
        for address in stale_primaries {
            let description = ServerDescription::new(&address);
            self.servers.insert(address, description);
        }

        let known_hosts: HashSet<ServerAddress> = server_description.known_hosts().collect();
        self.add_new_servers(known_hosts.iter().cloned());
        self.servers.retain(|address, _| {
            known_hosts.contains(address) || *address == server_description.address
        });

        self.servers.insert(
            server_description.address.clone(),
            server_description,
        );

        Ok(())
    }

    /// Inspect the topology for a primary server, and update the topology type accordingly.
    fn record_primary_state(&mut self) {
        self.topology_type = if self
            .servers
            .values()
            .any(|server| server.server_type == ServerType::RsPrimary)
        {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    /// Starts tracking every address not already known, as `Unknown`.
    fn add_new_servers(&mut self, addresses: impl IntoIterator<Item = ServerAddress>) {
        for address in addresses {
            self.servers
                .entry(address.clone())
                .or_insert_with(|| ServerDescription::new(&address));
        }
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::result::Result<(), fmt::Error> {
        write!(f, "{{ Type: {}", self.topology_type)?;

        if let Some(ref set_name) = self.set_name {
            write!(f, ", Set Name: {set_name}")?;
        }

        if !self.servers.is_empty() {
            write!(f, ", Servers: [ ")?;
            let mut iter = self.servers.values();
            if let Some(server) = iter.next() {
                write!(f, "{server}")?;
            }
            for server in iter {
                write!(f, ", {server}")?;
            }
            write!(f, " ]")?;
        }

        write!(f, " }}")
    }
}

/// Returned by [`TopologyDescription::diff`].
#[derive(Debug)]
pub(crate) struct TopologyDescriptionDiff<'a> {
    pub(crate) removed_addresses: HashSet<&'a ServerAddress>,
    pub(crate) added_addresses: HashSet<&'a ServerAddress>,
    pub(crate) changed_servers:
        HashMap<&'a ServerAddress, (&'a ServerDescription, &'a ServerDescription)>,
}

pub(crate) fn verify_max_staleness(
    max_staleness: Duration,
    heartbeat_frequency: Duration,
) -> Result<()> {
    let smallest_max_staleness = std::cmp::max(
        Duration::from_secs(90),
        heartbeat_frequency
            .checked_add(IDLE_WRITE_PERIOD)
            .unwrap_or(Duration::MAX),
    );

    if max_staleness < smallest_max_staleness {
        return Err(Error::invalid_argument(format!(
            "invalid max_staleness value: must be at least {} seconds",
            smallest_max_staleness.as_secs()
        )));
    }

    Ok(())
}
