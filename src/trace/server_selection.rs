use bson::oid::ObjectId;

use super::{TracingRepresentation, SERVER_SELECTION_TRACING_EVENT_TARGET};
use crate::{
    error::Error,
    options::ServerAddress,
    sdam::{SelectionStrategy, TopologyDescription},
    selection_criteria::ReadPreference,
};

/// Logs one call to `Client::select_server`. Selection never waits, so there is no
/// "waiting for suitable server" message.
pub(crate) struct ServerSelectionEventEmitter<'a> {
    topology_id: ObjectId,
    read_preference: &'a ReadPreference,
    strategy: SelectionStrategy,
}

impl ServerSelectionEventEmitter<'_> {
    pub(crate) fn new(
        topology_id: ObjectId,
        read_preference: &ReadPreference,
        strategy: SelectionStrategy,
    ) -> ServerSelectionEventEmitter<'_> {
        ServerSelectionEventEmitter {
            topology_id,
            read_preference,
            strategy,
        }
    }

    pub(crate) fn emit_started_event(&self, topology_description: &TopologyDescription) {
        if tracing::enabled!(target: SERVER_SELECTION_TRACING_EVENT_TARGET, tracing::Level::TRACE) {
            tracing::trace!(
                target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                topologyId = self.topology_id.tracing_representation(),
                selector = self.read_preference.tracing_representation(),
                strategy = ?self.strategy,
                topologyDescription = topology_description.tracing_representation(),
                "Server selection started"
            );
        }
    }

    pub(crate) fn emit_failed_event(&self, topology_description: &TopologyDescription, error: &Error) {
        if tracing::enabled!(target: SERVER_SELECTION_TRACING_EVENT_TARGET, tracing::Level::DEBUG) {
            tracing::debug!(
                target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                topologyId = self.topology_id.tracing_representation(),
                selector = self.read_preference.tracing_representation(),
                topologyDescription = topology_description.tracing_representation(),
                failure = error.tracing_representation(),
                "Server selection failed"
            );
        }
    }

    pub(crate) fn emit_succeeded_event(&self, address: &ServerAddress) {
        tracing::debug!(
            target: SERVER_SELECTION_TRACING_EVENT_TARGET,
            topologyId = self.topology_id.tracing_representation(),
            selector = self.read_preference.tracing_representation(),
            strategy = ?self.strategy,
            serverHost = address.host(),
            serverPort = address.port_tracing_representation(),
            "Server selection succeeded"
        );
    }
}
