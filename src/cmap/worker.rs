use std::{collections::VecDeque, time::Duration};

use derive_where::derive_where;

use super::{
    conn::PendingConnection,
    connection_requester,
    connection_requester::{
        ConnectionRequest,
        ConnectionRequestReceiver,
        ConnectionRequestResult,
        ConnectionRequester,
    },
    establish::ConnectionEstablisher,
    manager,
    manager::{ConnectionSucceeded, ManagementRequestReceiver, PoolManagementRequest, PoolManager},
    options::ConnectionPoolOptions,
    status,
    status::{PoolStatus, PoolStatusPublisher, PoolStatusSubscriber},
    Connection,
    DEFAULT_MAX_POOL_SIZE,
};
use crate::{
    error::{Error, Result},
    event::cmap::{
        CmapEventEmitter,
        ConnectionClosedEvent,
        ConnectionClosedReason,
        PoolClearedEvent,
        PoolClosedEvent,
    },
    options::ServerAddress,
    runtime::{self, AsyncJoinHandle, WorkerHandleListener},
    sdam::TopologyUpdater,
};

const MAX_CONNECTING: u32 = 2;
const MAINTENANCE_FREQUENCY: Duration = Duration::from_millis(500);

/// The task that owns a pool's state. Every checkout, check-in, clear and close is a message
/// to this worker, so the bookkeeping below is never shared.
#[derive_where(Debug)]
pub(crate) struct ConnectionPoolWorker {
    address: ServerAddress,
    state: PoolState,

    /// Connections that exist or are being established, whether available or checked out.
    total_connection_count: u32,
    pending_connection_count: u32,
    next_connection_id: u32,

    /// Incremented on every clear. Connections from older generations are closed instead of
    /// being handed out or pooled again.
    generation: u32,

    /// Idle connections, most recently checked in at the back.
    available_connections: VecDeque<Connection>,

    establisher: ConnectionEstablisher,

    #[derive_where(skip)]
    event_emitter: CmapEventEmitter,

    maintenance_frequency: Duration,

    /// `None` disables idle reaping.
    max_idle_time: Option<Duration>,
    min_pool_size: Option<u32>,
    max_pool_size: u32,

    /// Completes once every `ConnectionPool` handle is gone.
    handle_listener: WorkerHandleListener,
    request_receiver: ConnectionRequestReceiver,

    /// Checkouts waiting for a connection, served in arrival order.
    wait_queue: VecDeque<ConnectionRequest>,

    management_receiver: ManagementRequestReceiver,
    status_publisher: PoolStatusPublisher,

    /// Handed to checked out connections so they can check themselves back in.
    manager: PoolManager,

    /// Establishment failures are reported here so the server can be marked unknown.
    server_updater: TopologyUpdater,
}

impl ConnectionPoolWorker {
    /// Spawns the worker for the pool of `address`. The worker stops once the returned requester
    /// and all of its clones are dropped.
    pub(super) fn start(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        event_emitter: CmapEventEmitter,
        options: Option<ConnectionPoolOptions>,
    ) -> (PoolManager, ConnectionRequester, PoolStatusSubscriber) {
        let max_idle_time = options
            .as_ref()
            .and_then(|opts| opts.max_idle_time)
            .filter(|idle| !idle.is_zero());

        let max_pool_size = options
            .as_ref()
            .and_then(|opts| opts.max_pool_size)
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);

        let min_pool_size = options.as_ref().and_then(|opts| opts.min_pool_size);

        let (handle, handle_listener) = WorkerHandleListener::channel();
        let (connection_requester, request_receiver) = connection_requester::channel(handle);
        let (manager, management_receiver) = manager::channel();
        let (status_publisher, status_subscriber) = status::channel(PoolStatus {
            max_pool_size,
            ..Default::default()
        });

        let worker = ConnectionPoolWorker {
            address,
            event_emitter,
            max_idle_time,
            min_pool_size,
            establisher,
            next_connection_id: 1,
            total_connection_count: 0,
            pending_connection_count: 0,
            generation: 0,
            available_connections: VecDeque::new(),
            max_pool_size,
            request_receiver,
            wait_queue: Default::default(),
            management_receiver,
            manager: manager.clone(),
            handle_listener,
            state: PoolState::Open,
            status_publisher,
            maintenance_frequency: MAINTENANCE_FREQUENCY,
            server_updater,
        };

        runtime::execute(async move {
            worker.execute().await;
        });

        (manager, connection_requester, status_subscriber)
    }

    /// Serves requests until every pool handle has been dropped, then closes what is left.
    async fn execute(mut self) {
        let mut maintenance_interval = tokio::time::interval(self.maintenance_frequency);

        loop {
            let task = tokio::select! {
                Some(request) = self.request_receiver.recv() => {
                    PoolTask::CheckOut(request)
                },
                Some(request) = self.management_receiver.recv() => request.into(),
                _ = self.handle_listener.wait_for_all_handle_drops() => break,
                _ = maintenance_interval.tick() => {
                    PoolTask::Maintenance
                },
                else => break,
            };

            self.handle_task(task);

            while self.can_service_connection_request() {
                match self.wait_queue.pop_front() {
                    Some(request) => self.check_out(request),
                    None => break,
                }
            }

            self.publish_status();
        }

        while let Some(connection) = self.available_connections.pop_front() {
            connection.close_and_drop(ConnectionClosedReason::PoolClosed);
        }

        if matches!(self.state, PoolState::Open) {
            self.event_emitter.emit_event(|| {
                PoolClosedEvent {
                    address: self.address.clone(),
                }
                .into()
            });
        }
    }

    fn handle_task(&mut self, task: PoolTask) {
        match task {
            PoolTask::CheckOut(request) => match self.state {
                PoolState::Open => self.wait_queue.push_back(request),
                PoolState::Closed => {
                    let _: std::result::Result<_, _> =
                        request.fulfill(ConnectionRequestResult::PoolClosed);
                }
            },
            PoolTask::HandleManagementRequest(request) => match request {
                PoolManagementRequest::CheckIn(connection) => self.check_in(*connection),
                PoolManagementRequest::Clear {
                    _completion_handler: handler,
                } => {
                    self.clear();
                    handler.acknowledge(());
                }
                PoolManagementRequest::Close {
                    _completion_handler: handler,
                } => {
                    self.close();
                    handler.acknowledge(());
                }
                PoolManagementRequest::HandleConnectionSucceeded(connection) => {
                    self.handle_connection_succeeded(connection)
                }
                PoolManagementRequest::HandleConnectionFailed => self.handle_connection_failed(),
            },
            PoolTask::Maintenance => self.perform_maintenance(),
        }
    }

    fn can_service_connection_request(&self) -> bool {
        if !matches!(self.state, PoolState::Open) {
            return false;
        }

        if !self.available_connections.is_empty() {
            return true;
        }

        self.total_connection_count < self.max_pool_size
            && self.pending_connection_count < MAX_CONNECTING
    }

    fn check_out(&mut self, request: ConnectionRequest) {
        while let Some(mut conn) = self.available_connections.pop_back() {
            if conn.is_stale(self.generation) {
                self.close_connection(conn, ConnectionClosedReason::Stale);
                continue;
            }
            if conn.is_idle(self.max_idle_time) {
                self.close_connection(conn, ConnectionClosedReason::Idle);
                continue;
            }

            conn.mark_as_in_use(self.manager.clone());
            if let Err(result) = request.fulfill(ConnectionRequestResult::Pooled(Box::new(conn))) {
                // the checkout timed out in the meantime
                if let Some(mut connection) = result.into_pooled_connection() {
                    connection.mark_as_available();
                    self.available_connections.push_back(connection);
                }
            }

            return;
        }

        if self.total_connection_count < self.max_pool_size {
            let handle = self.spawn_establishment(Establishment::ForCheckout);

            // a checkout that already timed out drops its end; the connection still gets
            // established and is checked in once the task's result is dropped
            let _: std::result::Result<_, _> =
                request.fulfill(ConnectionRequestResult::Establishing(handle));
        } else {
            // still first in line for the next slot
            self.wait_queue.push_front(request);
        }
    }

    /// Starts establishing a new connection in the background.
    fn spawn_establishment(
        &mut self,
        purpose: Establishment,
    ) -> AsyncJoinHandle<Result<Connection>> {
        let pending_connection = self.create_pending_connection();
        let establisher = self.establisher.clone();
        let manager = self.manager.clone();
        let server_updater = self.server_updater.clone();
        let event_emitter = self.event_emitter.clone();

        runtime::spawn(async move {
            let result = establish_connection(
                &establisher,
                pending_connection,
                &server_updater,
                &manager,
                &event_emitter,
            )
            .await;

            match (result, purpose) {
                (Ok(mut connection), Establishment::ForCheckout) => {
                    connection.mark_as_in_use(manager.clone());
                    manager.handle_connection_succeeded(ConnectionSucceeded::Used);
                    Ok(connection)
                }
                (Ok(connection), Establishment::ForPool) => {
                    manager.handle_connection_succeeded(ConnectionSucceeded::ForPool(Box::new(
                        connection,
                    )));
                    Err(Error::internal("connection was added to the pool"))
                }
                (Err(error), _) => Err(error),
            }
        })
    }

    fn create_pending_connection(&mut self) -> PendingConnection {
        self.total_connection_count += 1;
        self.pending_connection_count += 1;

        let pending_connection = PendingConnection {
            id: self.next_connection_id,
            address: self.address.clone(),
            generation: self.generation,
            time_created: std::time::Instant::now(),
            event_emitter: self.event_emitter.clone(),
        };
        self.next_connection_id += 1;
        self.event_emitter
            .emit_event(|| pending_connection.created_event().into());

        pending_connection
    }

    fn handle_connection_failed(&mut self) {
        self.total_connection_count -= 1;
        self.pending_connection_count -= 1;
    }

    fn handle_connection_succeeded(&mut self, connection: ConnectionSucceeded) {
        self.pending_connection_count -= 1;
        if let ConnectionSucceeded::ForPool(connection) = connection {
            let mut connection = *connection;
            connection.mark_as_available();
            match self.state {
                PoolState::Open => self.available_connections.push_back(connection),
                PoolState::Closed => {
                    self.close_connection(connection, ConnectionClosedReason::PoolClosed)
                }
            }
        }
    }

    fn check_in(&mut self, mut conn: Connection) {
        self.event_emitter
            .emit_event(|| conn.checked_in_event().into());

        conn.mark_as_available();

        if conn.has_errored() {
            self.close_connection(conn, ConnectionClosedReason::Error);
        } else if matches!(self.state, PoolState::Closed) {
            self.close_connection(conn, ConnectionClosedReason::PoolClosed);
        } else if conn.is_stale(self.generation) {
            self.close_connection(conn, ConnectionClosedReason::Stale);
        } else if conn.is_executing() {
            self.close_connection(conn, ConnectionClosedReason::Dropped);
        } else {
            self.available_connections.push_back(conn);
        }
    }

    fn clear(&mut self) {
        self.generation += 1;
        self.publish_status();

        self.event_emitter.emit_event(|| {
            PoolClearedEvent {
                address: self.address.clone(),
            }
            .into()
        });

        // every available connection is now stale
        self.remove_perished_connections();
    }

    fn close(&mut self) {
        if matches!(self.state, PoolState::Closed) {
            return;
        }
        self.state = PoolState::Closed;

        for request in self.wait_queue.drain(..) {
            let _: std::result::Result<_, _> = request.fulfill(ConnectionRequestResult::PoolClosed);
        }

        while let Some(connection) = self.available_connections.pop_front() {
            self.close_connection(connection, ConnectionClosedReason::PoolClosed);
        }

        // requests already in the channel are still received and rejected above
        self.request_receiver.close();

        self.publish_status();
        self.event_emitter.emit_event(|| {
            PoolClosedEvent {
                address: self.address.clone(),
            }
            .into()
        });
    }

    fn publish_status(&self) {
        let available = self.available_connections.len() as u32;
        self.status_publisher.publish(PoolStatus {
            generation: self.generation,
            available,
            in_use: self.total_connection_count - self.pending_connection_count - available,
            pending: self.pending_connection_count,
            total: self.total_connection_count,
            max_pool_size: self.max_pool_size,
            closed: matches!(self.state, PoolState::Closed),
        });
    }

    fn close_connection(&mut self, connection: Connection, reason: ConnectionClosedReason) {
        connection.close_and_drop(reason);
        self.total_connection_count -= 1;
    }

    fn perform_maintenance(&mut self) {
        self.remove_perished_connections();
        if matches!(self.state, PoolState::Open) {
            self.ensure_min_connections();
        }
    }

    /// Closes stale and idle connections from the front of the queue.
    fn remove_perished_connections(&mut self) {
        while let Some(connection) = self.available_connections.pop_front() {
            if connection.is_stale(self.generation) {
                self.close_connection(connection, ConnectionClosedReason::Stale);
            } else if connection.is_idle(self.max_idle_time) {
                self.close_connection(connection, ConnectionClosedReason::Idle);
            } else {
                // everything behind it was checked in later
                self.available_connections.push_front(connection);
                break;
            }
        }
    }

    /// Starts establishing connections until `min_pool_size` are managed.
    fn ensure_min_connections(&mut self) {
        let min_pool_size = self.min_pool_size.unwrap_or(0);
        while self.total_connection_count < min_pool_size
            && self.pending_connection_count < MAX_CONNECTING
        {
            drop(self.spawn_establishment(Establishment::ForPool));
        }
    }
}

/// Establishes `pending_connection`, reporting a failure to the topology and the pool.
async fn establish_connection(
    establisher: &ConnectionEstablisher,
    pending_connection: PendingConnection,
    server_updater: &TopologyUpdater,
    manager: &PoolManager,
    event_emitter: &CmapEventEmitter,
) -> Result<Connection> {
    let connection_id = pending_connection.id;
    let generation = pending_connection.generation;
    let address = pending_connection.address.clone();

    let establish_result = establisher.establish_connection(pending_connection).await;

    match establish_result {
        Err(ref e) => {
            event_emitter.emit_event(|| {
                ConnectionClosedEvent {
                    address: address.clone(),
                    reason: ConnectionClosedReason::Error,
                    connection_id,
                    error: Some(e.clone()),
                }
                .into()
            });
            server_updater
                .handle_application_error(address, e.clone(), Some(generation))
                .await;
            manager.handle_connection_failed();
        }
        Ok(ref connection) => {
            event_emitter.emit_event(|| connection.ready_event().into());
        }
    }

    establish_result
}

#[derive(Debug)]
enum PoolState {
    Open,

    /// Checkouts fail, and connections are closed when they are checked in.
    Closed,
}

/// What happens to a connection once it has been established.
#[derive(Clone, Copy, Debug)]
enum Establishment {
    /// Handed to the checkout that caused it to be created.
    ForCheckout,

    /// Added to the available connections to keep `min_pool_size` connections around.
    ForPool,
}

#[derive(Debug)]
enum PoolTask {
    HandleManagementRequest(PoolManagementRequest),
    CheckOut(ConnectionRequest),

    /// Reap stale and idle connections, then top up to `min_pool_size`.
    Maintenance,
}

impl From<PoolManagementRequest> for PoolTask {
    fn from(request: PoolManagementRequest) -> Self {
        PoolTask::HandleManagementRequest(request)
    }
}
