#[cfg(test)]
mod test;

use std::{fmt, str::FromStr, time::Duration};

use rand::{seq::IndexedRandom, Rng};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::TopologyDescription;
use crate::{
    error::{Error, Result},
    options::ServerAddress,
    sdam::description::server::{ServerDescription, ServerType},
    selection_criteria::{ReadPreference, TagSet},
};

pub(crate) const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);
pub(crate) const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

/// How a server is picked among those that satisfy a read preference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum SelectionStrategy {
    /// Rank the candidates by the round trip time of their latest check and pick one of those
    /// within the latency window at random.
    #[default]
    LatencyWindow,

    /// Rank the candidates by the mean plus one standard deviation of every round trip time
    /// measured for them and pick the lowest.
    Statistics,
}

impl SelectionStrategy {
    fn as_str(&self) -> &'static str {
        match self {
            Self::LatencyWindow => "ping",
            Self::Statistics => "statistical",
        }
    }

    fn ranking_key(&self, server: &ServerDescription) -> Option<f64> {
        match self {
            Self::LatencyWindow => server
                .round_trip_time
                .map(|rtt| rtt.as_secs_f64() * 1000.0),
            Self::Statistics => {
                if server.query_stats.count() > 0 {
                    Some(server.query_stats.s_score())
                } else {
                    None
                }
            }
        }
    }

    /// Orders `candidates` from best to worst, keeping only those within `local_threshold` of
    /// the best. Candidates that have no ranking key yet are dropped.
    pub(crate) fn rank<'a>(
        &self,
        candidates: Vec<&'a ServerDescription>,
        local_threshold: Duration,
    ) -> Vec<&'a ServerDescription> {
        let mut ranked: Vec<(f64, &ServerDescription)> = candidates
            .into_iter()
            .filter_map(|server| self.ranking_key(server).map(|key| (key, server)))
            .collect();
        ranked.sort_by(|(a, _), (b, _)| a.total_cmp(b));

        let lowest = match ranked.first() {
            Some((key, _)) => *key,
            None => return Vec::new(),
        };
        let max_key = lowest + local_threshold.as_secs_f64() * 1000.0;

        ranked
            .into_iter()
            .take_while(|(key, _)| *key <= max_key)
            .map(|(_, server)| server)
            .collect()
    }

    /// Picks a server from the output of `rank`.
    pub(crate) fn choose<'a, R: Rng + ?Sized>(
        &self,
        ranked: &[&'a ServerDescription],
        rng: &mut R,
    ) -> Option<&'a ServerDescription> {
        match self {
            Self::LatencyWindow => ranked.choose(rng).copied(),
            Self::Statistics => ranked.first().copied(),
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ping" | "latency" => Ok(Self::LatencyWindow),
            "statistical" | "statistics" => Ok(Self::Statistics),
            other => Err(Error::invalid_argument(format!(
                "'{other}' is not a valid selection strategy; expected 'ping' or 'statistical'"
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for SelectionStrategy {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for SelectionStrategy {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl TopologyDescription {
    /// Selects a server that satisfies `read_preference`, using `strategy` to pick among the
    /// candidates.
    pub(crate) fn select_server<R: Rng + ?Sized>(
        &self,
        read_preference: &ReadPreference,
        strategy: SelectionStrategy,
        rng: &mut R,
    ) -> Result<ServerAddress> {
        let suitable_servers = self.suitable_servers(read_preference)?;
        let ranked = strategy.rank(suitable_servers, self.local_threshold());

        strategy
            .choose(&ranked, rng)
            .map(|server| server.address.clone())
            .ok_or_else(Error::no_eligible_servers)
    }

    fn local_threshold(&self) -> Duration {
        self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD)
    }

    /// The servers that satisfy the mode, max staleness and tag sets of `read_preference`,
    /// before ranking.
    pub(crate) fn suitable_servers(
        &self,
        read_preference: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        let tag_sets = read_preference.tag_sets();
        let max_staleness = read_preference.max_staleness();

        let servers = match read_preference {
            ReadPreference::Primary => self.servers_with_type(&[ServerType::RsPrimary]).collect(),
            ReadPreference::Secondary { .. } => self.suitable_servers_for_read_preference(
                &[ServerType::RsSecondary],
                tag_sets,
                max_staleness,
            )?,
            ReadPreference::PrimaryPreferred { .. } => match self.primary() {
                Some(primary) => vec![primary],
                None => self.suitable_servers_for_read_preference(
                    &[ServerType::RsSecondary],
                    tag_sets,
                    max_staleness,
                )?,
            },
            ReadPreference::SecondaryPreferred { .. } => {
                let suitable_servers = self.suitable_servers_for_read_preference(
                    &[ServerType::RsSecondary],
                    tag_sets,
                    max_staleness,
                )?;

                if suitable_servers.is_empty() {
                    self.servers_with_type(&[ServerType::RsPrimary]).collect()
                } else {
                    suitable_servers
                }
            }
            ReadPreference::Nearest { .. } => self.suitable_servers_for_read_preference(
                &[ServerType::RsPrimary, ServerType::RsSecondary],
                tag_sets,
                max_staleness,
            )?,
        };

        Ok(servers)
    }

    fn suitable_servers_for_read_preference(
        &self,
        types: &'static [ServerType],
        tag_sets: Option<&Vec<TagSet>>,
        max_staleness: Option<Duration>,
    ) -> Result<Vec<&ServerDescription>> {
        if let Some(max_staleness) = max_staleness {
            super::verify_max_staleness(max_staleness, self.heartbeat_frequency())?;
        }

        let mut servers = self.servers_with_type(types).collect();

        if let Some(max_staleness) = max_staleness {
            // max staleness <= 0 is the same as no max staleness
            if max_staleness > Duration::from_secs(0) {
                self.filter_servers_by_max_staleness(&mut servers, max_staleness);
            }
        }

        if let Some(tag_sets) = tag_sets {
            filter_servers_by_tag_sets(&mut servers, tag_sets);
        }

        Ok(servers)
    }

    fn filter_servers_by_max_staleness(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        match self.primary() {
            Some(primary) => {
                self.filter_servers_by_max_staleness_with_primary(servers, primary, max_staleness)
            }
            None => self.filter_servers_by_max_staleness_without_primary(servers, max_staleness),
        };
    }

    fn filter_servers_by_max_staleness_with_primary(
        &self,
        servers: &mut Vec<&ServerDescription>,
        primary: &ServerDescription,
        max_staleness: Duration,
    ) {
        let max_staleness_ms = max_staleness.as_millis().try_into().unwrap_or(i64::MAX);

        servers.retain(|server| {
            // the primary is never stale
            if server.server_type == ServerType::RsPrimary {
                return true;
            }

            self.calculate_secondary_staleness_with_primary(server, primary)
                .map(|staleness| staleness <= max_staleness_ms)
                .unwrap_or(false)
        })
    }

    fn filter_servers_by_max_staleness_without_primary(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        let max_staleness = max_staleness.as_millis().try_into().unwrap_or(i64::MAX);
        let max_write_date = self
            .servers_with_type(&[ServerType::RsSecondary])
            .filter_map(ServerDescription::last_write_date)
            .map(|last_write_date| last_write_date.timestamp_millis())
            .max();

        let secondary_max_write_date = match max_write_date {
            Some(max_write_date) => max_write_date,
            None => return,
        };

        servers.retain(|server| {
            self.calculate_secondary_staleness_without_primary(server, secondary_max_write_date)
                .map(|staleness| staleness <= max_staleness)
                .unwrap_or(false)
        })
    }

    fn calculate_secondary_staleness_with_primary(
        &self,
        secondary: &ServerDescription,
        primary: &ServerDescription,
    ) -> Option<i64> {
        let primary_last_update = primary.last_update_time?.timestamp_millis();
        let primary_last_write = primary.last_write_date()?.timestamp_millis();

        let secondary_last_update = secondary.last_update_time?.timestamp_millis();
        let secondary_last_write = secondary.last_write_date()?.timestamp_millis();

        let heartbeat_frequency = self
            .heartbeat_frequency()
            .as_millis()
            .try_into()
            .unwrap_or(i64::MAX);

        // a huge heartbeat frequency saturates instead of overflowing
        let staleness = secondary_last_update
            .saturating_sub(secondary_last_write)
            .saturating_sub(primary_last_update.saturating_sub(primary_last_write))
            .saturating_add(heartbeat_frequency);

        Some(staleness)
    }

    fn calculate_secondary_staleness_without_primary(
        &self,
        secondary: &ServerDescription,
        max_last_write_date: i64,
    ) -> Option<i64> {
        let secondary_last_write = secondary.last_write_date()?.timestamp_millis();
        let heartbeat_frequency = self
            .heartbeat_frequency()
            .as_millis()
            .try_into()
            .unwrap_or(i64::MAX);

        let staleness = max_last_write_date
            .saturating_sub(secondary_last_write)
            .saturating_add(heartbeat_frequency);
        Some(staleness)
    }
}

fn filter_servers_by_tag_sets(servers: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    for tag_set in tag_sets {
        let matches_tag_set = |server: &&ServerDescription| server.matches_tag_set(tag_set);

        if servers.iter().any(matches_tag_set) {
            servers.retain(matches_tag_set);

            return;
        }
    }

    servers.clear();
}
