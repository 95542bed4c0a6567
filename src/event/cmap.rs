//! Contains the events and functionality for monitoring the behavior of the connection pools.

use std::time::Duration;

use derive_where::derive_where;
use serde::Serialize;

use crate::{
    bson::oid::ObjectId,
    cmap::options::ConnectionPoolOptions,
    error::Error,
    event::EventHandler,
    options::ServerAddress,
    serde_util,
    trace::connection::ConnectionTracingEventEmitter,
};

/// Event emitted when a connection pool is created.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct PoolCreatedEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,

    /// The options used for the pool.
    pub options: Option<ConnectionPoolOptions>,
}

/// Event emitted when a connection pool is cleared.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct PoolClearedEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,
}

/// Event emitted when a connection pool is closed.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct PoolClosedEvent {
    /// The address of the server that the pool's connections connected to.
    pub address: ServerAddress,
}

/// Event emitted when a connection is created.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionCreatedEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,

    /// The unique ID of the connection. This is not used for anything internally, but can be used
    /// to identify other events related to this connection.
    pub connection_id: u32,
}

/// Event emitted when a connection is ready to be used.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionReadyEvent {
    /// The address of the server that the connection is connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,

    /// The time it took to establish the connection.
    #[serde(serialize_with = "serde_util::serialize_duration_as_int_millis")]
    pub duration: Duration,
}

/// Event emitted when a connection is closed.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionClosedEvent {
    /// The address of the server that the connection was connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,

    /// The reason that the connection was closed.
    pub reason: ConnectionClosedReason,

    /// The error that caused the connection to be closed, if any.
    #[serde(skip)]
    pub(crate) error: Option<Error>,
}

/// The reasons that a connection may be closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum ConnectionClosedReason {
    /// The connection pool has been cleared since the connection was created.
    Stale,

    /// The connection has been available for longer than `max_idle_time` without being used.
    Idle,

    /// An error occurred while using the connection.
    Error,

    /// The connection was checked in while a command was still waiting for its reply.
    Dropped,

    /// The pool that the connection belongs to has been closed.
    PoolClosed,
}

/// Event emitted when a thread begins checking out a connection to use for an operation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionCheckoutStartedEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,
}

/// Event emitted when a thread is unable to check out a connection.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionCheckoutFailedEvent {
    /// The address of the server that the connection would have connected to.
    pub address: ServerAddress,

    /// The reason a connection was unable to be checked out.
    pub reason: ConnectionCheckoutFailedReason,

    /// The error that caused the checkout to fail, if any.
    #[serde(skip)]
    pub(crate) error: Option<Error>,

    /// The time it took before the checkout failed.
    #[serde(serialize_with = "serde_util::serialize_duration_as_int_millis")]
    pub duration: Duration,
}

/// The reasons a connection may not be able to be checked out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum ConnectionCheckoutFailedReason {
    /// The pool has been closed.
    PoolClosed,

    /// The `wait_queue_timeout` (or the per-call timeout) elapsed before a connection became
    /// available.
    Timeout,

    /// An error occurred while trying to establish a connection.
    ConnectionError,
}

/// Event emitted when a connection is successfully checked out.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionCheckedOutEvent {
    /// The address of the server that the connection is connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,

    /// The time it took to check out the connection.
    #[serde(serialize_with = "serde_util::serialize_duration_as_int_millis")]
    pub duration: Duration,
}

/// Event emitted when a connection is checked back into a connection pool.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionCheckedInEvent {
    /// The address of the server that the connection was connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,
}

#[derive(Clone, Debug, Serialize)]
#[allow(missing_docs)]
#[non_exhaustive]
#[serde(untagged)]
pub enum CmapEvent {
    PoolCreated(PoolCreatedEvent),
    PoolCleared(PoolClearedEvent),
    PoolClosed(PoolClosedEvent),
    ConnectionCreated(ConnectionCreatedEvent),
    ConnectionReady(ConnectionReadyEvent),
    ConnectionClosed(ConnectionClosedEvent),
    ConnectionCheckoutStarted(ConnectionCheckoutStartedEvent),
    ConnectionCheckoutFailed(ConnectionCheckoutFailedEvent),
    ConnectionCheckedOut(ConnectionCheckedOutEvent),
    ConnectionCheckedIn(ConnectionCheckedInEvent),
}

macro_rules! impl_from_event {
    ($($event:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$event> for CmapEvent {
                fn from(event: $event) -> Self {
                    Self::$variant(event)
                }
            }
        )*
    };
}

impl_from_event! {
    PoolCreatedEvent => PoolCreated,
    PoolClearedEvent => PoolCleared,
    PoolClosedEvent => PoolClosed,
    ConnectionCreatedEvent => ConnectionCreated,
    ConnectionReadyEvent => ConnectionReady,
    ConnectionClosedEvent => ConnectionClosed,
    ConnectionCheckoutStartedEvent => ConnectionCheckoutStarted,
    ConnectionCheckoutFailedEvent => ConnectionCheckoutFailed,
    ConnectionCheckedOutEvent => ConnectionCheckedOut,
    ConnectionCheckedInEvent => ConnectionCheckedIn,
}

/// Sends pool events to the user's handler, if any, and to the tracing subscriber.
#[derive(Clone)]
#[derive_where(Debug)]
pub(crate) struct CmapEventEmitter {
    user_handler: Option<EventHandler<CmapEvent>>,

    #[derive_where(skip)]
    tracing_emitter: ConnectionTracingEventEmitter,
}

impl CmapEventEmitter {
    pub(crate) fn new(
        user_handler: Option<EventHandler<CmapEvent>>,
        topology_id: ObjectId,
    ) -> CmapEventEmitter {
        Self {
            user_handler,
            tracing_emitter: ConnectionTracingEventEmitter::new(topology_id),
        }
    }

    pub(crate) fn emit_event(&self, generate_event: impl FnOnce() -> CmapEvent) {
        let event = generate_event();
        if let Some(ref handler) = self.user_handler {
            handler.handle(event.clone());
        }
        self.tracing_emitter.handle(event);
    }
}
