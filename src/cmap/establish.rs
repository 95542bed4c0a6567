use std::time::Duration;

use super::{conn::PendingConnection, Connection};
use crate::{
    client::options::ClientOptions,
    error::Result,
    options::ServerAddress,
    runtime::stream::tcp_connect,
};

/// Contains the logic to establish a connection. Replica set members don't need a handshake
/// beyond the TCP connect, so this only opens the stream within the configured connect timeout.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionEstablisher {
    connect_timeout: Option<Duration>,
}

pub(crate) struct EstablisherOptions {
    pub(crate) connect_timeout: Option<Duration>,
}

impl EstablisherOptions {
    pub(crate) fn from_client_options(opts: &ClientOptions) -> Self {
        Self {
            connect_timeout: opts.connect_timeout,
        }
    }
}

impl ConnectionEstablisher {
    /// Creates a new ConnectionEstablisher from the given options.
    pub(crate) fn new(options: EstablisherOptions) -> Self {
        Self {
            connect_timeout: options.connect_timeout,
        }
    }

    /// Establishes a connection for a pool.
    pub(crate) async fn establish_connection(
        &self,
        pending_connection: PendingConnection,
    ) -> Result<Connection> {
        let stream = tcp_connect(&pending_connection.address, self.connect_timeout).await?;
        Ok(Connection::new(pending_connection, stream))
    }

    /// Establishes a monitoring connection. Monitors use the heartbeat timeout rather than the
    /// connect timeout so that an unreachable member is detected quickly.
    pub(crate) async fn establish_monitoring_connection(
        &self,
        address: ServerAddress,
        heartbeat_timeout: Duration,
        id: u32,
    ) -> Result<Connection> {
        let stream = tcp_connect(&address, Some(heartbeat_timeout)).await?;
        Ok(Connection::new_monitoring(address, stream, id))
    }
}
