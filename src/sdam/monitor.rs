use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::watch;

use super::{
    description::{server::ServerDescription, stats::QueryStats},
    topology::{TopologyUpdateRequestReceiver, TopologyUpdater, TopologyWatcher},
};
use crate::{
    cmap::{establish::ConnectionEstablisher, Connection},
    error::Result,
    event::sdam::{
        SdamEvent,
        SdamEventEmitter,
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    hello::{hello_command, run_hello, HelloReply},
    options::{ClientOptions, ServerAddress},
    runtime,
};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(500);

/// Monitor that performs regular heartbeats to determine server status.
pub(crate) struct Monitor {
    address: ServerAddress,
    connection: Option<Connection>,
    next_connection_id: u32,
    connection_establisher: ConnectionEstablisher,
    topology_updater: TopologyUpdater,
    topology_watcher: TopologyWatcher,
    sdam_event_emitter: SdamEventEmitter,
    update_request_receiver: TopologyUpdateRequestReceiver,
    heartbeat_frequency: Duration,
    heartbeat_timeout: Duration,

    /// Round trip time statistics over every successful check of this server.
    query_stats: QueryStats,
}

impl Monitor {
    /// Starts a monitor for the server at `address`. The monitor runs until it is cancelled
    /// through the returned manager or the topology is dropped.
    pub(crate) fn start(
        address: ServerAddress,
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        sdam_event_emitter: SdamEventEmitter,
        update_request_receiver: TopologyUpdateRequestReceiver,
        connection_establisher: ConnectionEstablisher,
        client_options: &ClientOptions,
    ) -> MonitorManager {
        let (manager, cancellation_receiver) = MonitorManager::channel();
        let monitor = Self {
            address,
            connection: None,
            next_connection_id: 1,
            connection_establisher,
            topology_updater,
            topology_watcher,
            sdam_event_emitter,
            update_request_receiver,
            heartbeat_frequency: client_options
                .heartbeat_freq
                .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY),
            heartbeat_timeout: client_options
                .heartbeat_timeout
                .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT),
            query_stats: QueryStats::default(),
        };
        runtime::execute(monitor.execute(cancellation_receiver));
        manager
    }

    async fn execute(mut self, mut cancellation_receiver: MonitorCancellationReceiver) {
        while self.topology_watcher.is_alive() && !cancellation_receiver.is_cancelled() {
            tokio::select! {
                _ = cancellation_receiver.wait_for_cancellation() => break,
                _ = self.check_server() => {}
            }

            // requests that arrived during the check have been served by it
            self.update_request_receiver.clear_update_requests();

            tokio::select! {
                _ = cancellation_receiver.wait_for_cancellation() => break,
                _ = self.update_request_receiver.wait_for_update_request(self.heartbeat_frequency) => {}
            }
        }
    }

    /// Checks the server by running an `isMaster` command and reports the outcome to the
    /// topology. If an error occurs, the connection is dropped and a new one will be established
    /// on the next check.
    async fn check_server(&mut self) {
        let driver_connection_id = self.connection.as_ref().map(Connection::id);
        self.emit_event(|| {
            SdamEvent::ServerHeartbeatStarted(ServerHeartbeatStartedEvent {
                server_address: self.address.clone(),
                driver_connection_id,
            })
        });

        let start = Instant::now();
        let result = runtime::timeout(self.heartbeat_timeout, self.perform_hello())
            .await
            .and_then(std::convert::identity);

        match result {
            Ok((reply, round_trip_time)) => {
                self.query_stats.add_sample(round_trip_time);
                let driver_connection_id = self
                    .connection
                    .as_ref()
                    .map(Connection::id)
                    .unwrap_or_default();
                let raw_reply = reply.raw_command_response.clone();
                self.emit_event(|| {
                    SdamEvent::ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent {
                        duration: round_trip_time,
                        reply: raw_reply,
                        server_address: self.address.clone(),
                        driver_connection_id,
                    })
                });

                let server_description = ServerDescription::new_from_hello_reply(
                    self.address.clone(),
                    reply,
                    round_trip_time,
                    self.query_stats,
                );
                self.topology_updater.update(server_description).await;
            }
            Err(error) => {
                let driver_connection_id = self.connection.take().map(|c| c.id());
                let failure = error.clone();
                self.emit_event(|| {
                    SdamEvent::ServerHeartbeatFailed(ServerHeartbeatFailedEvent {
                        duration: start.elapsed(),
                        failure,
                        server_address: self.address.clone(),
                        driver_connection_id,
                    })
                });

                self.topology_updater
                    .handle_monitor_error(self.address.clone(), error)
                    .await;
            }
        }
    }

    /// Runs the status command, connecting first if there is no monitoring connection. Returns
    /// the reply and the round trip time of the command alone.
    async fn perform_hello(&mut self) -> Result<(HelloReply, Duration)> {
        let connection = match self.connection {
            Some(ref mut connection) => connection,
            None => {
                let connection = self
                    .connection_establisher
                    .establish_monitoring_connection(
                        self.address.clone(),
                        self.heartbeat_timeout,
                        self.next_connection_id,
                    )
                    .await?;
                self.next_connection_id += 1;
                self.connection.insert(connection)
            }
        };

        let start = Instant::now();
        let reply = run_hello(connection, hello_command()).await?;
        Ok((reply, start.elapsed()))
    }

    fn emit_event(&self, generate_event: impl FnOnce() -> SdamEvent) {
        self.sdam_event_emitter.emit_event(generate_event);
    }
}

/// Handle used to stop a server's monitor, e.g. when the server is removed from the topology.
#[derive(Clone, Debug)]
pub(crate) struct MonitorManager {
    cancellation_sender: Arc<watch::Sender<bool>>,
}

impl MonitorManager {
    fn channel() -> (MonitorManager, MonitorCancellationReceiver) {
        let (sender, receiver) = watch::channel(false);
        (
            MonitorManager {
                cancellation_sender: Arc::new(sender),
            },
            MonitorCancellationReceiver { receiver },
        )
    }

    /// Stops the monitor. A check in progress is abandoned.
    pub(crate) fn cancel(&self) {
        let _ = self.cancellation_sender.send(true);
    }
}

struct MonitorCancellationReceiver {
    receiver: watch::Receiver<bool>,
}

impl MonitorCancellationReceiver {
    fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Waits until the monitor is cancelled or every manager has been dropped.
    async fn wait_for_cancellation(&mut self) {
        let _ = self.receiver.wait_for(|cancelled| *cancelled).await;
    }
}
