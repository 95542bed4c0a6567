//! Discovery and monitoring of the members of a replica set, and selection of the member an
//! operation should run on.

mod description;
mod monitor;
mod server;
mod topology;

pub use self::description::{
    server::{ServerDescription, ServerType},
    stats::QueryStats,
    topology::{server_selection::SelectionStrategy, TopologyDescription, TopologyType},
};

pub(crate) use self::{
    monitor::DEFAULT_HEARTBEAT_FREQUENCY,
    server::Server,
    topology::{Topology, TopologyUpdater, TopologyWatcher},
};
