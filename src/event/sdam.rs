//! Events describing how the client's view of the replica set changes over time.

use std::time::Duration;

use derive_where::derive_where;
use serde::Serialize;

use crate::{
    bson::{oid::ObjectId, Document},
    error::Error,
    event::EventHandler,
    options::ServerAddress,
    serde_util,
    trace::topology::TopologyTracingEventEmitter,
};

pub use crate::sdam::{ServerDescription, TopologyDescription, TopologyType};

/// A member's description changed, after a check or an error.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ServerDescriptionChangedEvent {
    /// The member this event is about.
    pub address: ServerAddress,

    /// Identifies the topology that emitted the event.
    pub topology_id: ObjectId,

    /// State before the change.
    pub previous_description: ServerDescription,

    /// State after the change.
    pub new_description: ServerDescription,
}

/// An address joined the topology and its monitor was started.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ServerOpeningEvent {
    /// The member this event is about.
    pub address: ServerAddress,

    /// Identifies the topology that emitted the event.
    pub topology_id: ObjectId,
}

/// An address left the topology. Its monitor is stopped and its pool closed.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ServerClosedEvent {
    /// The member this event is about.
    pub address: ServerAddress,

    /// Identifies the topology that emitted the event.
    pub topology_id: ObjectId,
}

/// Emitted after every applied update, whether or not anything visible changed.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct TopologyDescriptionChangedEvent {
    /// Identifies the topology that emitted the event.
    pub topology_id: ObjectId,

    /// State before the change.
    pub previous_description: TopologyDescription,

    /// State after the change.
    pub new_description: TopologyDescription,
}

/// The first event of every topology, emitted before any seed is opened.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct TopologyOpeningEvent {
    /// Identifies the topology that emitted the event.
    pub topology_id: ObjectId,
}

/// Published when a topology is closed, either through [`Client::shutdown`](crate::Client::shutdown)
/// or because every handle to it was dropped.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct TopologyClosedEvent {
    /// Identifies the topology that emitted the event.
    pub topology_id: ObjectId,
}

/// Published the first time the topology knows a primary and at least the configured minimum
/// number of secondaries.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct TopologyFullSetupEvent {
    /// Identifies the topology that emitted the event.
    pub topology_id: ObjectId,

    /// The address of the primary at the time of full setup.
    pub primary: ServerAddress,

    /// The number of secondaries known at the time of full setup.
    pub secondaries: usize,
}

/// Published when a member reports a state that conflicts with the topology, such as a replica
/// set name other than the topology's. The member is removed from the topology.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct TopologyErrorEvent {
    /// Identifies the topology that emitted the event.
    pub topology_id: ObjectId,

    /// The address of the offending member.
    pub address: ServerAddress,

    /// The conflict that was detected.
    #[serde(serialize_with = "serde_util::serialize_error_as_string")]
    pub error: Error,
}

/// A monitor is about to send `hello`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ServerHeartbeatStartedEvent {
    /// The monitored member.
    pub server_address: ServerAddress,

    /// The monitoring connection's ID, or `None` if no connection is open yet.
    pub driver_connection_id: Option<u32>,
}

/// A monitor received a `hello` reply.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ServerHeartbeatSucceededEvent {
    /// Round trip time of this check alone, before averaging.
    #[serde(serialize_with = "serde_util::serialize_duration_as_int_millis")]
    pub duration: Duration,

    /// The raw `hello` reply.
    pub reply: Document,

    /// The monitored member.
    pub server_address: ServerAddress,

    /// The monitoring connection's ID.
    pub driver_connection_id: u32,
}

/// A monitor could not connect, timed out, or got an unusable reply.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ServerHeartbeatFailedEvent {
    /// Time spent before the check failed.
    #[serde(serialize_with = "serde_util::serialize_duration_as_int_millis")]
    pub duration: Duration,

    #[serde(serialize_with = "serde_util::serialize_error_as_string")]
    pub failure: Error,

    /// The monitored member.
    pub server_address: ServerAddress,

    /// The monitoring connection's ID, if it got far enough to have one.
    pub driver_connection_id: Option<u32>,
}

/// Every topology event, as delivered to an [`EventHandler<SdamEvent>`].
#[derive(Clone, Debug, Serialize)]
#[allow(missing_docs)]
#[non_exhaustive]
#[serde(untagged)]
pub enum SdamEvent {
    ServerDescriptionChanged(Box<ServerDescriptionChangedEvent>),
    ServerOpening(ServerOpeningEvent),
    ServerClosed(ServerClosedEvent),
    TopologyDescriptionChanged(Box<TopologyDescriptionChangedEvent>),
    TopologyOpening(TopologyOpeningEvent),
    TopologyClosed(TopologyClosedEvent),
    TopologyFullSetup(TopologyFullSetupEvent),
    TopologyError(TopologyErrorEvent),
    ServerHeartbeatStarted(ServerHeartbeatStartedEvent),
    ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent),
    ServerHeartbeatFailed(ServerHeartbeatFailedEvent),
}

/// Sends topology events to the user's handler, if any, and to the tracing subscriber.
#[derive(Clone)]
#[derive_where(Debug)]
pub(crate) struct SdamEventEmitter {
    user_handler: Option<EventHandler<SdamEvent>>,

    #[derive_where(skip)]
    tracing_emitter: TopologyTracingEventEmitter,
}

impl SdamEventEmitter {
    pub(crate) fn new(
        user_handler: Option<EventHandler<SdamEvent>>,
        topology_id: ObjectId,
    ) -> SdamEventEmitter {
        Self {
            user_handler,
            tracing_emitter: TopologyTracingEventEmitter::new(topology_id),
        }
    }

    pub(crate) fn emit_event(&self, generate_event: impl FnOnce() -> SdamEvent) {
        let event = generate_event();
        if let Some(ref handler) = self.user_handler {
            handler.handle(event.clone());
        }
        self.tracing_emitter.handle(event);
    }
}
