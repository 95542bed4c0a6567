
use std::{
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
    str::FromStr,
    time::Duration,
};

use derive_where::derive_where;
use serde::{de::Error as SerdeError, Deserialize, Deserializer, Serialize, Serializer};
use strsim::jaro_winkler;
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, ErrorKind, Result},
    event::{cmap::CmapEvent, sdam::SdamEvent, EventHandler},
    sdam::SelectionStrategy,
    selection_criteria::{ReadPreference, ReadPreferenceMode, TagSet},
    serde_util,
};

/// The default port used when an address does not specify one.
pub const DEFAULT_PORT: u16 = 27017;

const URI_OPTIONS: &[&str] = &[
    "connecttimeoutms",
    "heartbeatfrequencyms",
    "heartbeattimeoutms",
    "localthresholdms",
    "maxidletimems",
    "maxpoolsize",
    "maxstalenessseconds",
    "minpoolsize",
    "minsecondaries",
    "readpreference",
    "readpreferencetags",
    "replicaset",
    "secondaryacceptablelatencyms",
    "selectionstrategy",
    "serverremovalgraceperiodms",
    "strategy",
    "waitqueuetimeoutms",
];

/// The address of a replica set member.
///
/// The host is normalized to lowercase. Two addresses are equal when their hosts are equal and
/// their ports are equal once the default port has been applied.
#[derive(Clone, Debug, Eq)]
#[non_exhaustive]
pub struct ServerAddress {
    host: String,
    port: Option<u16>,
}

impl ServerAddress {
    /// Creates an address from a host and an optional port.
    pub fn new(host: impl AsRef<str>, port: impl Into<Option<u16>>) -> Self {
        Self {
            host: host.as_ref().to_lowercase(),
            port: port.into(),
        }
    }

    /// Parses an address string of the form `host` or `host:port`.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let mut parts = address.split(':');

        let host = match parts.next() {
            Some(part) if !part.is_empty() => part,
            _ => {
                return Err(Error::invalid_argument(format!(
                    "invalid server address: \"{address}\"; the host cannot be empty"
                )))
            }
        };

        let port = match parts.next() {
            Some(part) => {
                let port = u16::from_str(part)
                    .ok()
                    .filter(|port| *port != 0)
                    .ok_or_else(|| {
                        Error::invalid_argument(format!(
                            "invalid server address: \"{address}\"; port must be a valid, \
                             non-zero 16-bit integer"
                        ))
                    })?;

                if parts.next().is_some() {
                    return Err(Error::invalid_argument(format!(
                        "invalid server address: \"{address}\"; address contains more than one \
                         ':'"
                    )));
                }

                Some(port)
            }
            None => None,
        };

        Ok(Self::new(host, port))
    }

    /// The hostname of this address.
    pub fn host(&self) -> &str {
        self.host.as_str()
    }

    /// The port of this address, if one was specified.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The port of this address with the default applied.
    pub(crate) fn effective_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::new("localhost", None)
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.effective_port() == other.effective_port()
    }
}

impl Hash for ServerAddress {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        self.host.hash(state);
        self.effective_port().hash(state);
    }
}

impl Display for ServerAddress {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.host, self.effective_port())
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str()).map_err(|e| D::Error::custom(format!("{e}")))
    }
}

impl Serialize for ServerAddress {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

/// Contains the options that can be used to create a new [`Client`](crate::Client).
#[derive(Clone, Deserialize, TypedBuilder)]
#[derive_where(Debug, PartialEq)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ClientOptions {
    /// The initial list of seeds that the client should connect to.
    ///
    /// Further members are discovered from the replies of the seeds.
    #[builder(default = vec![ServerAddress::default()])]
    pub hosts: Vec<ServerAddress>,

    /// The name of the replica set that the client should connect to. Members reporting another
    /// set name are removed from the topology. When unset, the name reported by the first member
    /// that reports one is adopted.
    #[serde(rename = "replicaSet")]
    pub repl_set_name: Option<String>,

    /// The amount of time each monitoring task waits between completing a check and starting the
    /// next one.
    ///
    /// The default value is 1 second.
    #[serde(
        rename = "heartbeatFrequencyMS",
        default,
        with = "serde_util::duration_option_as_int_millis"
    )]
    pub heartbeat_freq: Option<Duration>,

    /// The timeout applied to the monitoring connection, both when connecting and for each
    /// check.
    ///
    /// The default value is 500 milliseconds.
    #[serde(
        rename = "heartbeatTimeoutMS",
        default,
        with = "serde_util::duration_option_as_int_millis"
    )]
    pub heartbeat_timeout: Option<Duration>,

    /// The connect timeout used for pooled connections.
    ///
    /// The default value is 10 seconds. A value of zero means no timeout.
    #[serde(
        rename = "connectTimeoutMS",
        default,
        with = "serde_util::duration_option_as_int_millis"
    )]
    pub connect_timeout: Option<Duration>,

    /// The width of the latency window: servers whose ranking key is within this amount of the
    /// best candidate's are eligible.
    ///
    /// The default value is 15 milliseconds.
    #[serde(
        rename = "secondaryAcceptableLatencyMS",
        alias = "localThresholdMS",
        default,
        with = "serde_util::duration_option_as_int_millis"
    )]
    pub local_threshold: Option<Duration>,

    /// The maximum number of connections each server's pool may hold, counting idle, checked out
    /// and pending connections.
    ///
    /// The default value is 10.
    #[serde(rename = "maxPoolSize")]
    pub max_pool_size: Option<u32>,

    /// The number of connections each server's pool tries to keep established.
    ///
    /// The default value is 0.
    #[serde(rename = "minPoolSize")]
    pub min_pool_size: Option<u32>,

    /// The amount of time a connection can sit idle in a pool before it is closed.
    ///
    /// By default, connections are not closed for being idle.
    #[serde(
        rename = "maxIdleTimeMS",
        default,
        with = "serde_util::duration_option_as_int_millis"
    )]
    pub max_idle_time: Option<Duration>,

    /// The amount of time a checkout waits for a connection before failing with a checkout
    /// timeout.
    ///
    /// By default, checkouts wait indefinitely.
    #[serde(
        rename = "waitQueueTimeoutMS",
        default,
        with = "serde_util::duration_option_as_int_millis"
    )]
    pub wait_queue_timeout: Option<Duration>,

    /// The strategy used to rank and pick among eligible servers.
    ///
    /// The default is [`SelectionStrategy::LatencyWindow`].
    #[serde(alias = "strategy")]
    pub selection_strategy: Option<SelectionStrategy>,

    /// Used by [`Client::select_default_server`](crate::Client::select_default_server).
    ///
    /// The default is [`ReadPreference::Primary`].
    pub read_preference: Option<ReadPreference>,

    /// The number of secondaries that must be known, in addition to a primary, for the topology
    /// to be considered fully set up.
    ///
    /// The default value is 0.
    pub min_secondaries: Option<u32>,

    /// The amount of time a member may stay unreachable before it is removed from the topology.
    ///
    /// By default, unreachable members are never removed for being unreachable.
    #[serde(
        rename = "serverRemovalGracePeriodMS",
        default,
        with = "serde_util::duration_option_as_int_millis"
    )]
    pub server_removal_grace_period: Option<Duration>,

    /// The handler that should process all Server Discovery and Monitoring events.
    #[derive_where(skip)]
    #[serde(skip)]
    pub sdam_event_handler: Option<EventHandler<SdamEvent>>,

    /// The handler that should process all Connection Monitoring and Pooling events.
    #[derive_where(skip)]
    #[serde(skip)]
    pub cmap_event_handler: Option<EventHandler<CmapEvent>>,

    #[cfg(test)]
    #[builder(setter(skip))]
    #[serde(skip)]
    pub(crate) test_options: Option<TestOptions>,
}

#[cfg(test)]
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct TestOptions {
    /// Disables the monitoring tasks so tests can drive the topology by hand.
    pub(crate) disable_monitoring_threads: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ClientOptions {
    /// Parses a connection string of the form
    /// `mongodb://host1[:port1][,host2[:port2],...][/][?options]` into a `ClientOptions` struct.
    ///
    /// The supported options are:
    ///
    ///   * `replicaSet`: maps to the `repl_set_name` field
    ///   * `heartbeatFrequencyMS`: maps to the `heartbeat_freq` field
    ///   * `heartbeatTimeoutMS`: maps to the `heartbeat_timeout` field
    ///   * `connectTimeoutMS`: maps to the `connect_timeout` field
    ///   * `secondaryAcceptableLatencyMS` / `localThresholdMS`: map to the `local_threshold` field
    ///   * `maxPoolSize`: maps to the `max_pool_size` field
    ///   * `minPoolSize`: maps to the `min_pool_size` field
    ///   * `maxIdleTimeMS`: maps to the `max_idle_time` field
    ///   * `waitQueueTimeoutMS`: maps to the `wait_queue_timeout` field
    ///   * `selectionStrategy` / `strategy`: maps to the `selection_strategy` field
    ///   * `readPreference`, `readPreferenceTags` and `maxStalenessSeconds`: map to the
    ///     `read_preference` field
    ///   * `minSecondaries`: maps to the `min_secondaries` field
    ///   * `serverRemovalGracePeriodMS`: maps to the `server_removal_grace_period` field
    ///
    /// Option names are case-insensitive. The returned options are validated.
    pub fn parse(uri: impl AsRef<str>) -> Result<Self> {
        let parser = ClientOptionsParser::parse(uri.as_ref())?;
        let options = Self::from(parser);
        options.validate()?;
        Ok(options)
    }

    /// Checks that the options are consistent with each other.
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::invalid_argument("the host list cannot be empty"));
        }

        if let Some(0) = self.max_pool_size {
            return Err(Error::invalid_argument("cannot specify maxPoolSize=0"));
        }

        if let (Some(min), Some(max)) = (self.min_pool_size, self.max_pool_size) {
            if min > max {
                return Err(Error::invalid_argument(format!(
                    "minPoolSize ({min}) is greater than maxPoolSize ({max})"
                )));
            }
        }

        if let Some(heartbeat_freq) = self.heartbeat_freq {
            if heartbeat_freq.is_zero() {
                return Err(Error::invalid_argument(
                    "heartbeatFrequencyMS must be greater than zero",
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
struct ClientOptionsParser {
    hosts: Vec<ServerAddress>,
    repl_set_name: Option<String>,
    heartbeat_freq: Option<Duration>,
    heartbeat_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    local_threshold: Option<Duration>,
    max_pool_size: Option<u32>,
    min_pool_size: Option<u32>,
    max_idle_time: Option<Duration>,
    wait_queue_timeout: Option<Duration>,
    selection_strategy: Option<SelectionStrategy>,
    read_preference: Option<ReadPreference>,
    read_preference_tags: Option<Vec<TagSet>>,
    max_staleness: Option<Duration>,
    min_secondaries: Option<u32>,
    server_removal_grace_period: Option<Duration>,
}

impl From<ClientOptionsParser> for ClientOptions {
    fn from(parser: ClientOptionsParser) -> Self {
        Self::builder()
            .hosts(parser.hosts)
            .repl_set_name(parser.repl_set_name)
            .heartbeat_freq(parser.heartbeat_freq)
            .heartbeat_timeout(parser.heartbeat_timeout)
            .connect_timeout(parser.connect_timeout)
            .local_threshold(parser.local_threshold)
            .max_pool_size(parser.max_pool_size)
            .min_pool_size(parser.min_pool_size)
            .max_idle_time(parser.max_idle_time)
            .wait_queue_timeout(parser.wait_queue_timeout)
            .selection_strategy(parser.selection_strategy)
            .read_preference(parser.read_preference)
            .min_secondaries(parser.min_secondaries)
            .server_removal_grace_period(parser.server_removal_grace_period)
            .build()
    }
}

fn exclusive_split_at(s: &str, i: usize) -> (Option<&str>, Option<&str>) {
    let (l, r) = s.split_at(i);

    let lout = if !l.is_empty() { Some(l) } else { None };
    let rout = if r.len() > 1 { Some(&r[1..]) } else { None };

    (lout, rout)
}

impl ClientOptionsParser {
    fn parse(s: &str) -> Result<Self> {
        let end_of_scheme = match s.find("://") {
            Some(index) => index,
            None => {
                return Err(Error::invalid_argument(
                    "connection string contains no scheme",
                ))
            }
        };

        if &s[..end_of_scheme] != "mongodb" {
            return Err(Error::invalid_argument(format!(
                "invalid connection string scheme: {}",
                &s[..end_of_scheme]
            )));
        }

        let after_scheme = &s[end_of_scheme + 3..];

        let (hosts_section, options_section) = match after_scheme.find('/') {
            Some(slash_index) => match exclusive_split_at(after_scheme, slash_index) {
                (Some(hosts), post_slash) => {
                    let options = post_slash.and_then(|section| match section.find('?') {
                        Some(index) => exclusive_split_at(section, index).1,
                        None => None,
                    });
                    (hosts, options)
                }
                (None, _) => return Err(Error::invalid_argument("missing hosts")),
            },
            None => {
                if after_scheme.contains('?') {
                    return Err(Error::invalid_argument(
                        "missing delimiting slash between hosts and options",
                    ));
                }
                (after_scheme, None)
            }
        };

        if hosts_section.contains('@') {
            return Err(Error::invalid_argument(
                "credentials are not supported in the connection string",
            ));
        }

        let hosts = hosts_section
            .split(',')
            .map(ServerAddress::parse)
            .collect::<Result<Vec<_>>>()?;

        let mut parser = ClientOptionsParser {
            hosts,
            ..Default::default()
        };

        if let Some(options) = options_section {
            parser.parse_options(options)?;
        }

        Ok(parser)
    }

    fn parse_options(&mut self, options: &str) -> Result<()> {
        if options.is_empty() {
            return Ok(());
        }

        let mut keys: Vec<String> = Vec::new();

        for option_pair in options.split('&') {
            let (key, value) = match option_pair.find('=') {
                Some(index) => option_pair.split_at(index),
                None => {
                    return Err(Error::invalid_argument(format!(
                        "connection string options is not a `key=value` pair: {option_pair}",
                    )))
                }
            };

            let key = key.to_lowercase();
            if key != "readpreferencetags" && keys.contains(&key) {
                return Err(Error::invalid_argument(
                    "repeated options are not allowed in the connection string",
                ));
            }

            // Skip leading '=' in value.
            let value = percent_encoding::percent_decode(&value.as_bytes()[1..]).decode_utf8_lossy();
            self.parse_option_pair(&key, value.as_ref())?;
            keys.push(key);
        }

        if let Some(tags) = self.read_preference_tags.take() {
            self.read_preference = match self.read_preference.take() {
                Some(read_pref) => Some(read_pref.with_tag_sets(tags)?),
                None => {
                    return Err(Error::invalid_argument(
                        "cannot set read preference tags without also setting read preference \
                         mode",
                    ))
                }
            };
        }

        if let Some(max_staleness) = self.max_staleness.take() {
            self.read_preference = match self.read_preference.take() {
                Some(read_pref) => Some(read_pref.with_max_staleness(max_staleness)?),
                None => {
                    return Err(Error::invalid_argument(
                        "cannot set max staleness without also setting read preference mode",
                    ))
                }
            };
        }

        Ok(())
    }

    fn parse_option_pair(&mut self, key: &str, value: &str) -> Result<()> {
        macro_rules! get_duration {
            ($value:expr, $option:expr) => {
                match u64::from_str($value) {
                    Ok(i) => Duration::from_millis(i),
                    _ => {
                        return Err(Error::invalid_argument(format!(
                            "connection string `{}` option must be a non-negative integer",
                            $option
                        )))
                    }
                }
            };
        }

        macro_rules! get_u32 {
            ($value:expr, $option:expr) => {
                match u32::from_str($value) {
                    Ok(u) => u,
                    Err(_) => {
                        return Err(Error::invalid_argument(format!(
                            "connection string `{}` argument must be a positive integer",
                            $option,
                        )))
                    }
                }
            };
        }

        match key {
            k @ "connecttimeoutms" => self.connect_timeout = Some(get_duration!(value, k)),
            k @ "heartbeatfrequencyms" => self.heartbeat_freq = Some(get_duration!(value, k)),
            k @ "heartbeattimeoutms" => self.heartbeat_timeout = Some(get_duration!(value, k)),
            k @ ("localthresholdms" | "secondaryacceptablelatencyms") => {
                self.local_threshold = Some(get_duration!(value, k))
            }
            k @ "maxidletimems" => self.max_idle_time = Some(get_duration!(value, k)),
            k @ "maxpoolsize" => self.max_pool_size = Some(get_u32!(value, k)),
            k @ "minpoolsize" => self.min_pool_size = Some(get_u32!(value, k)),
            k @ "minsecondaries" => self.min_secondaries = Some(get_u32!(value, k)),
            k @ "waitqueuetimeoutms" => self.wait_queue_timeout = Some(get_duration!(value, k)),
            k @ "serverremovalgraceperiodms" => {
                self.server_removal_grace_period = Some(get_duration!(value, k))
            }
            "maxstalenessseconds" => {
                let max_staleness = i64::from_str(value).map_err(|_| {
                    Error::invalid_argument(format!("'{value}' is not a valid maxStalenessSeconds"))
                })?;

                // -1 means no maximum
                match max_staleness {
                    -1 => {}
                    n if n < 0 => {
                        return Err(Error::invalid_argument(
                            "maxStalenessSeconds must be -1 or a non-negative integer",
                        ))
                    }
                    n => self.max_staleness = Some(Duration::from_secs(n as u64)),
                }
            }
            "readpreference" => {
                let mode = ReadPreferenceMode::from_str(value)?;
                self.read_preference = Some(ReadPreference::new(mode, None)?);
            }
            "readpreferencetags" => {
                let tags: Result<TagSet> = if value.is_empty() {
                    Ok(TagSet::new())
                } else {
                    value
                        .split(',')
                        .map(|tag| {
                            let mut values = tag.split(':');

                            match (values.next(), values.next()) {
                                (Some(key), Some(value)) => {
                                    Ok((key.to_string(), value.to_string()))
                                }
                                _ => Err(Error::invalid_argument(format!(
                                    "'{value}' is not a valid read preference tag (which must be \
                                     of the form 'key:value')",
                                ))),
                            }
                        })
                        .collect()
                };

                self.read_preference_tags
                    .get_or_insert_with(Vec::new)
                    .push(tags?);
            }
            "replicaset" => {
                self.repl_set_name = Some(value.to_string());
            }
            "selectionstrategy" | "strategy" => {
                self.selection_strategy = Some(SelectionStrategy::from_str(value)?);
            }
            other => {
                let (jaro_winkler, option) = URI_OPTIONS.iter().fold((0.0, ""), |acc, option| {
                    let jaro_winkler = jaro_winkler(option, other).abs();
                    if jaro_winkler > acc.0 {
                        return (jaro_winkler, option);
                    }
                    acc
                });
                let mut message = format!("{other} is an invalid option");
                if jaro_winkler >= 0.84 {
                    message.push_str(&format!(
                        ". An option with a similar name exists: {option}"
                    ));
                }
                return Err(ErrorKind::InvalidArgument { message }.into());
            }
        }

        Ok(())
    }
}
