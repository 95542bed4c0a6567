use crate::{
    bson::oid::ObjectId,
    event::sdam::SdamEvent,
    options::ServerAddress,
    trace::{TracingRepresentation, MONITOR_TRACING_EVENT_TARGET, TOPOLOGY_TRACING_EVENT_TARGET},
};

/// Logs topology events under `mongodb_replset::topology` and heartbeats under
/// `mongodb_replset::monitor`.
#[derive(Clone)]
pub(crate) struct TopologyTracingEventEmitter {
    topology_id: ObjectId,
}

impl TopologyTracingEventEmitter {
    pub(crate) fn new(topology_id: ObjectId) -> TopologyTracingEventEmitter {
        Self { topology_id }
    }

    pub(crate) fn handle(&self, event: SdamEvent) {
        use SdamEvent::*;
        match event {
            // the topology-level message already carries the server's new state
            ServerDescriptionChanged(_) => {}
            ServerOpening(event) => self.server_event(&event.address, "Starting server monitoring"),
            ServerClosed(event) => self.server_event(&event.address, "Stopped server monitoring"),
            TopologyOpening(_) => tracing::debug!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                topologyId = self.topology_id.tracing_representation(),
                "Starting topology monitoring",
            ),
            TopologyClosed(_) => tracing::debug!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                topologyId = self.topology_id.tracing_representation(),
                "Stopped topology monitoring",
            ),
            // rendering both descriptions is not free
            TopologyDescriptionChanged(event)
                if tracing::enabled!(target: TOPOLOGY_TRACING_EVENT_TARGET, tracing::Level::DEBUG) =>
            {
                tracing::debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    previousDescription = event.previous_description.tracing_representation(),
                    newDescription = event.new_description.tracing_representation(),
                    "Topology description changed",
                )
            }
            TopologyDescriptionChanged(_) => {}
            TopologyFullSetup(event) => tracing::debug!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                topologyId = self.topology_id.tracing_representation(),
                primaryHost = event.primary.host(),
                primaryPort = event.primary.port_tracing_representation(),
                secondaries = event.secondaries,
                "Replica set fully set up",
            ),
            TopologyError(event) => tracing::warn!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                topologyId = self.topology_id.tracing_representation(),
                serverHost = event.address.host(),
                serverPort = event.address.port_tracing_representation(),
                error = event.error.tracing_representation(),
                "Removing server from topology",
            ),
            ServerHeartbeatStarted(event) => tracing::trace!(
                target: MONITOR_TRACING_EVENT_TARGET,
                topologyId = self.topology_id.tracing_representation(),
                serverHost = event.server_address.host(),
                serverPort = event.server_address.port_tracing_representation(),
                driverConnectionId = event.driver_connection_id,
                "Heartbeat started",
            ),
            ServerHeartbeatSucceeded(event)
                if tracing::enabled!(target: MONITOR_TRACING_EVENT_TARGET, tracing::Level::TRACE) =>
            {
                tracing::trace!(
                    target: MONITOR_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.server_address.host(),
                    serverPort = event.server_address.port_tracing_representation(),
                    driverConnectionId = event.driver_connection_id,
                    reply = event.reply.tracing_representation(),
                    durationMS = event.duration.as_millis() as u64,
                    "Heartbeat succeeded",
                )
            }
            ServerHeartbeatSucceeded(_) => {}
            ServerHeartbeatFailed(event) => tracing::warn!(
                target: MONITOR_TRACING_EVENT_TARGET,
                topologyId = self.topology_id.tracing_representation(),
                serverHost = event.server_address.host(),
                serverPort = event.server_address.port_tracing_representation(),
                driverConnectionId = event.driver_connection_id,
                failure = event.failure.tracing_representation(),
                durationMS = event.duration.as_millis() as u64,
                "Heartbeat failed",
            ),
        }
    }

    fn server_event(&self, address: &ServerAddress, message: &'static str) {
        tracing::debug!(
            target: TOPOLOGY_TRACING_EVENT_TARGET,
            topologyId = self.topology_id.tracing_representation(),
            serverHost = address.host(),
            serverPort = address.port_tracing_representation(),
            "{message}"
        );
    }
}
