use std::sync::Arc;

use super::monitor::MonitorManager;
use crate::{
    bson::oid::ObjectId,
    cmap::{establish::ConnectionEstablisher, options::ConnectionPoolOptions, ConnectionPool},
    options::{ClientOptions, ServerAddress},
    sdam::TopologyUpdater,
};

/// A member of the topology together with its pool and monitor.
#[derive(Debug)]
pub(crate) struct Server {
    pub(crate) address: ServerAddress,

    pub(crate) pool: ConnectionPool,

    /// Stops the server's monitor. `None` when monitoring is disabled.
    monitor_manager: Option<MonitorManager>,
}

impl Server {
    pub(crate) fn new(
        address: ServerAddress,
        options: &ClientOptions,
        connection_establisher: ConnectionEstablisher,
        topology_updater: TopologyUpdater,
        topology_id: ObjectId,
        monitor_manager: Option<MonitorManager>,
    ) -> Arc<Server> {
        Arc::new(Self {
            pool: ConnectionPool::new(
                address.clone(),
                connection_establisher,
                topology_updater,
                topology_id,
                Some(ConnectionPoolOptions::from_client_options(options)),
                options.cmap_event_handler.clone(),
            ),
            address,
            monitor_manager,
        })
    }

    /// Stops monitoring the server and closes its pool. Checkouts waiting on the pool fail, and
    /// connections that are checked out are closed when they are checked back in.
    pub(crate) async fn close(&self) {
        if let Some(ref monitor_manager) = self.monitor_manager {
            monitor_manager.cancel();
        }
        self.pool.close().await;
    }
}
