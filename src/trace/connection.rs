use crate::{
    bson::oid::ObjectId,
    event::cmap::{CmapEvent, ConnectionCheckoutFailedReason, ConnectionClosedReason},
    options::ServerAddress,
    trace::{TracingRepresentation, CONNECTION_TRACING_EVENT_TARGET},
};

/// Logs pool events at `debug` under `mongodb_replset::connection`.
#[derive(Clone)]
pub(crate) struct ConnectionTracingEventEmitter {
    topology_id: ObjectId,
}

impl ConnectionTracingEventEmitter {
    pub(crate) fn new(topology_id: ObjectId) -> ConnectionTracingEventEmitter {
        Self { topology_id }
    }

    pub(crate) fn handle(&self, event: CmapEvent) {
        use CmapEvent::*;
        match event {
            PoolCreated(event) => {
                let options = event.options.unwrap_or_default();
                tracing::debug!(
                    target: CONNECTION_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.address.host(),
                    serverPort = event.address.port_tracing_representation(),
                    maxPoolSize = options.max_pool_size,
                    minPoolSize = options.min_pool_size,
                    maxIdleTimeMS = options.max_idle_time.map(|t| t.as_millis() as u64),
                    waitQueueTimeoutMS = options.wait_queue_timeout.map(|t| t.as_millis() as u64),
                    "Connection pool created",
                );
            }
            PoolCleared(event) => self.pool_event(&event.address, "Connection pool cleared"),
            PoolClosed(event) => self.pool_event(&event.address, "Connection pool closed"),
            ConnectionCreated(event) => {
                self.connection_event(&event.address, event.connection_id, "Connection created")
            }
            ConnectionReady(event) => tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                topologyId = self.topology_id.tracing_representation(),
                serverHost = event.address.host(),
                serverPort = event.address.port_tracing_representation(),
                driverConnectionId = event.connection_id,
                durationMS = event.duration.as_millis() as u64,
                "Connection ready",
            ),
            ConnectionClosed(event) => tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                topologyId = self.topology_id.tracing_representation(),
                serverHost = event.address.host(),
                serverPort = event.address.port_tracing_representation(),
                driverConnectionId = event.connection_id,
                reason = event.reason.tracing_representation(),
                error = event.error.map(|e| e.tracing_representation()),
                "Connection closed",
            ),
            ConnectionCheckoutStarted(event) => tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                topologyId = self.topology_id.tracing_representation(),
                serverHost = event.address.host(),
                serverPort = event.address.port_tracing_representation(),
                "Connection checkout started",
            ),
            ConnectionCheckoutFailed(event) => tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                topologyId = self.topology_id.tracing_representation(),
                serverHost = event.address.host(),
                serverPort = event.address.port_tracing_representation(),
                reason = event.reason.tracing_representation(),
                error = event.error.map(|e| e.tracing_representation()),
                durationMS = event.duration.as_millis() as u64,
                "Connection checkout failed",
            ),
            ConnectionCheckedOut(event) => tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                topologyId = self.topology_id.tracing_representation(),
                serverHost = event.address.host(),
                serverPort = event.address.port_tracing_representation(),
                driverConnectionId = event.connection_id,
                durationMS = event.duration.as_millis() as u64,
                "Connection checked out",
            ),
            ConnectionCheckedIn(event) => tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                topologyId = self.topology_id.tracing_representation(),
                serverHost = event.address.host(),
                serverPort = event.address.port_tracing_representation(),
                driverConnectionId = event.connection_id,
                "Connection checked in",
            ),
        }
    }

    fn pool_event(&self, address: &ServerAddress, message: &'static str) {
        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            topologyId = self.topology_id.tracing_representation(),
            serverHost = address.host(),
            serverPort = address.port_tracing_representation(),
            "{message}"
        );
    }

    fn connection_event(&self, address: &ServerAddress, connection_id: u32, message: &'static str) {
        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            topologyId = self.topology_id.tracing_representation(),
            serverHost = address.host(),
            serverPort = address.port_tracing_representation(),
            driverConnectionId = connection_id,
            "{message}"
        );
    }
}

impl TracingRepresentation for ConnectionClosedReason {
    type Representation = &'static str;

    fn tracing_representation(&self) -> &'static str {
        match self {
            Self::Stale => "Stale: the pool was cleared after the connection was created",
            Self::Idle => "Idle: unused for longer than maxIdleTimeMS",
            Self::Error => "Error: the connection failed while in use",
            Self::Dropped => "Dropped: the connection was checked in in the middle of a command",
            Self::PoolClosed => "PoolClosed: the pool was closed",
        }
    }
}

impl TracingRepresentation for ConnectionCheckoutFailedReason {
    type Representation = &'static str;

    fn tracing_representation(&self) -> &'static str {
        match self {
            Self::PoolClosed => "PoolClosed: the pool was closed",
            Self::Timeout => "Timeout: no connection became available in time",
            Self::ConnectionError => "ConnectionError: establishing a new connection failed",
        }
    }
}
