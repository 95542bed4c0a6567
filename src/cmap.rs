//! Contains the connection pool and the connections it manages.


pub(crate) mod conn;
mod connection_requester;
pub(crate) mod establish;
mod manager;
pub mod options;
mod status;
mod worker;

use std::time::{Duration, Instant};

use derive_where::derive_where;

pub use self::{conn::Connection, status::PoolStatus};
use self::{
    connection_requester::{ConnectionRequestResult, ConnectionRequester},
    establish::ConnectionEstablisher,
    manager::PoolManager,
    options::ConnectionPoolOptions,
    status::PoolStatusSubscriber,
    worker::ConnectionPoolWorker,
};
use crate::{
    bson::oid::ObjectId,
    error::{Error, Result},
    event::{
        cmap::{
            CmapEvent,
            CmapEventEmitter,
            ConnectionCheckoutFailedEvent,
            ConnectionCheckoutFailedReason,
            ConnectionCheckoutStartedEvent,
            PoolCreatedEvent,
        },
        EventHandler,
    },
    options::ServerAddress,
    runtime,
    sdam::TopologyUpdater,
};

pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 10;

/// A pool of connections to a single server.
/// This type is actually a handle to a task that manages the connections and is cheap to clone
/// and pass around.
#[derive(Clone)]
#[derive_where(Debug)]
pub(crate) struct ConnectionPool {
    address: ServerAddress,
    manager: PoolManager,
    connection_requester: ConnectionRequester,
    status_subscriber: PoolStatusSubscriber,
    wait_queue_timeout: Option<Duration>,

    #[derive_where(skip)]
    event_emitter: CmapEventEmitter,
}

impl ConnectionPool {
    pub(crate) fn new(
        address: ServerAddress,
        connection_establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        topology_id: ObjectId,
        options: Option<ConnectionPoolOptions>,
        event_handler: Option<EventHandler<CmapEvent>>,
    ) -> Self {
        let event_emitter = CmapEventEmitter::new(event_handler, topology_id);
        let wait_queue_timeout = options.as_ref().and_then(|opts| opts.wait_queue_timeout);

        let (manager, connection_requester, status_subscriber) = ConnectionPoolWorker::start(
            address.clone(),
            connection_establisher,
            server_updater,
            event_emitter.clone(),
            options.clone(),
        );

        event_emitter.emit_event(|| {
            PoolCreatedEvent {
                address: address.clone(),
                options,
            }
            .into()
        });

        Self {
            address,
            manager,
            connection_requester,
            status_subscriber,
            wait_queue_timeout,
            event_emitter,
        }
    }

    /// Checks out a connection from the pool. This method will yield until this thread is at the
    /// front of the wait queue, and then will wait again if no available connections are in the
    /// pool and the total number of connections is not less than the max pool size.
    ///
    /// `timeout` overrides the pool's `wait_queue_timeout`; with neither set, the checkout waits
    /// until a connection is available or the pool is closed.
    pub(crate) async fn check_out(&self, timeout: Option<Duration>) -> Result<Connection> {
        let time_started = Instant::now();
        self.event_emitter.emit_event(|| {
            ConnectionCheckoutStartedEvent {
                address: self.address.clone(),
            }
            .into()
        });

        let response = match timeout.or(self.wait_queue_timeout) {
            Some(timeout) => runtime::timeout(timeout, self.connection_requester.request())
                .await
                .map_err(|_| {
                    (
                        Error::checkout_timeout(&self.address),
                        ConnectionCheckoutFailedReason::Timeout,
                    )
                }),
            None => Ok(self.connection_requester.request().await),
        };

        let conn = match response {
            Ok(Some(ConnectionRequestResult::Pooled(c))) => Ok(*c),
            Ok(Some(ConnectionRequestResult::Establishing(task))) => task
                .await
                .map_err(|e| (e, ConnectionCheckoutFailedReason::ConnectionError)),
            Ok(Some(ConnectionRequestResult::PoolClosed)) | Ok(None) => Err((
                Error::pool_closed(&self.address),
                ConnectionCheckoutFailedReason::PoolClosed,
            )),
            Err(failure) => Err(failure),
        };

        match conn {
            Ok(conn) => {
                self.event_emitter
                    .emit_event(|| conn.checked_out_event(time_started).into());
                Ok(conn)
            }
            Err((error, reason)) => {
                self.event_emitter.emit_event(|| {
                    ConnectionCheckoutFailedEvent {
                        address: self.address.clone(),
                        reason,
                        error: Some(error.clone()),
                        duration: Instant::now() - time_started,
                    }
                    .into()
                });
                Err(error)
            }
        }
    }

    /// Increments the generation of the pool. Available connections are closed right away;
    /// checked out ones are closed when they are checked back in.
    pub(crate) async fn clear(&self) {
        self.manager.clear().await
    }

    /// Closes the pool. Pending and future checkouts fail with a `PoolClosed` error.
    pub(crate) async fn close(&self) {
        self.manager.close().await
    }

    pub(crate) fn generation(&self) -> u32 {
        self.status_subscriber.generation()
    }

    pub(crate) fn status(&self) -> PoolStatus {
        self.status_subscriber.status()
    }

    #[cfg(test)]
    pub(crate) fn status_subscriber(&self) -> PoolStatusSubscriber {
        self.status_subscriber.clone()
    }
}
