use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use futures_util::future::join_all;
use tokio::sync::{
    broadcast,
    mpsc::{UnboundedReceiver, UnboundedSender},
    watch::{self, Ref},
};

use super::{
    description::{server::ServerDescription, topology::TopologyDescription},
    monitor::Monitor,
    server::Server,
};
use crate::{
    bson::oid::ObjectId,
    cmap::establish::{ConnectionEstablisher, EstablisherOptions},
    error::Error,
    event::sdam::{
        SdamEvent,
        SdamEventEmitter,
        ServerClosedEvent,
        ServerDescriptionChangedEvent,
        ServerOpeningEvent,
        TopologyClosedEvent,
        TopologyDescriptionChangedEvent,
        TopologyErrorEvent,
        TopologyFullSetupEvent,
        TopologyOpeningEvent,
    },
    options::{ClientOptions, ServerAddress},
    runtime::{self, AcknowledgedMessage, WorkerHandle, WorkerHandleListener},
    trace::TOPOLOGY_TRACING_EVENT_TARGET,
};

/// A handle to the replica set topology. The state is owned by a worker task; this handle reads
/// the latest published snapshot and sends updates to the worker.
#[derive(Debug)]
pub(crate) struct Topology {
    id: ObjectId,
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    _worker_handle: WorkerHandle,
}

impl Topology {
    /// Creates the topology for the seed list in `options` and starts monitoring every seed.
    ///
    /// This must be called from within a tokio runtime.
    pub(crate) fn new(options: ClientOptions) -> Topology {
        let id = ObjectId::new();
        let description = TopologyDescription::new(&options);
        let establisher =
            ConnectionEstablisher::new(EstablisherOptions::from_client_options(&options));
        let event_emitter = SdamEventEmitter::new(options.sdam_event_handler.clone(), id);

        let (update_requester, _) = UpdateRequester::channel();
        let (updater, update_receiver) = TopologyUpdater::channel();
        let (worker_handle, handle_listener) = WorkerHandleListener::channel();

        let mut seed_description = description.clone();
        seed_description.servers.clear();

        let state = TopologyState {
            description,
            servers: HashMap::new(),
            closed: false,
        };
        let (watcher, broadcaster) = TopologyWatcher::channel(state);

        let worker = TopologyWorker {
            id,
            update_receiver,
            handle_listener,
            broadcaster,
            update_requester,
            options,
            establisher,
            topology_watcher: watcher.clone(),
            topology_updater: updater.clone(),
            event_emitter,
            full_setup_emitted: false,
            unreachable_since: HashMap::new(),
        };

        worker.emit_event(|| SdamEvent::TopologyOpening(TopologyOpeningEvent { topology_id: id }));

        let mut state = worker.broadcaster.clone_latest();
        worker.add_servers(&mut state);
        worker.process_topology_diff(&seed_description, &state.description);
        worker.broadcaster.publish_new_state(state);

        worker.start();

        Topology {
            id,
            watcher,
            updater,
            _worker_handle: worker_handle,
        }
    }

    pub(crate) fn id(&self) -> ObjectId {
        self.id
    }

    pub(crate) fn watch(&self) -> TopologyWatcher {
        self.watcher.clone()
    }

    pub(crate) fn description(&self) -> TopologyDescription {
        self.watcher.snapshot()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.watcher.borrow_latest().closed
    }

    pub(crate) fn server(&self, address: &ServerAddress) -> Option<Arc<Server>> {
        self.watcher.server(address)
    }

    pub(crate) async fn handle_application_error(&self, address: ServerAddress, error: Error) {
        self.updater
            .handle_application_error(address, error, None)
            .await;
    }

    /// Stops every monitor, closes every pool and waits until the worker has done so.
    pub(crate) async fn shutdown(&self) {
        self.updater.shutdown().await;
    }

    #[cfg(test)]
    pub(crate) fn clone_updater(&self) -> TopologyUpdater {
        self.updater.clone()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    pub(crate) servers: HashMap<ServerAddress, Arc<Server>>,

    /// Set once the topology has been shut down. No further updates are applied.
    pub(crate) closed: bool,
}

#[derive(Debug)]
pub(crate) enum UpdateMessage {
    ServerUpdate(Box<ServerDescription>),
    MonitorError {
        address: ServerAddress,
        error: Error,
    },
    ApplicationError {
        address: ServerAddress,
        error: Error,
        generation: Option<u32>,
    },
    Shutdown,
}

struct TopologyWorker {
    id: ObjectId,
    update_receiver: TopologyUpdateReceiver,
    handle_listener: WorkerHandleListener,
    broadcaster: TopologyBroadcaster,
    update_requester: UpdateRequester,
    options: ClientOptions,
    establisher: ConnectionEstablisher,
    topology_watcher: TopologyWatcher,
    topology_updater: TopologyUpdater,
    event_emitter: SdamEventEmitter,

    /// Whether the full setup event has been published.
    full_setup_emitted: bool,

    /// When each currently unreachable server was first found unreachable.
    unreachable_since: HashMap<ServerAddress, Instant>,
}

impl TopologyWorker {
    fn start(mut self) {
        runtime::execute(async move {
            loop {
                let update = tokio::select! {
                    Some(update) = self.update_receiver.recv() => update,
                    _ = self.handle_listener.wait_for_all_handle_drops() => {
                        self.shutdown().await;
                        break;
                    }
                    else => break,
                };

                let (update, ack) = update.into_parts();
                let changed = match update {
                    UpdateMessage::ServerUpdate(sd) => self.update_server(*sd).await,
                    UpdateMessage::MonitorError { address, error } => {
                        self.handle_monitor_error(address, error).await
                    }
                    UpdateMessage::ApplicationError {
                        address,
                        error,
                        generation,
                    } => {
                        self.handle_application_error(address, error, generation)
                            .await
                    }
                    UpdateMessage::Shutdown => {
                        self.shutdown().await;
                        ack.acknowledge(true);
                        break;
                    }
                };
                ack.acknowledge(changed);
            }
        });
    }

    fn emit_event(&self, generate_event: impl FnOnce() -> SdamEvent) {
        self.event_emitter.emit_event(generate_event);
    }

    #[cfg(test)]
    fn monitoring_disabled(&self) -> bool {
        self.options
            .test_options
            .as_ref()
            .map(|to| to.disable_monitoring_threads)
            .unwrap_or(false)
    }

    #[cfg(not(test))]
    fn monitoring_disabled(&self) -> bool {
        false
    }

    /// Creates a server, and starts its monitor, for every address in the description that
    /// doesn't have one yet.
    fn add_servers(&self, state: &mut TopologyState) {
        let new_addresses: Vec<ServerAddress> = state
            .description
            .server_addresses()
            .filter(|address| !state.servers.contains_key(*address))
            .cloned()
            .collect();

        for address in new_addresses {
            let monitor_manager = if self.monitoring_disabled() {
                None
            } else {
                Some(Monitor::start(
                    address.clone(),
                    self.topology_updater.clone(),
                    self.topology_watcher.clone(),
                    self.event_emitter.clone(),
                    self.update_requester.subscribe(),
                    self.establisher.clone(),
                    &self.options,
                ))
            };

            let server = Server::new(
                address.clone(),
                &self.options,
                self.establisher.clone(),
                self.topology_updater.clone(),
                self.id,
                monitor_manager,
            );
            state.servers.insert(address, server);
        }
    }

    /// Brings the servers in line with the description: servers that were removed from it are
    /// closed and servers that were added to it are created.
    async fn sync_servers(&mut self, state: &mut TopologyState) {
        let removed_addresses: Vec<ServerAddress> = state
            .servers
            .keys()
            .filter(|address| !state.description.servers.contains_key(*address))
            .cloned()
            .collect();

        for address in removed_addresses {
            if let Some(server) = state.servers.remove(&address) {
                server.close().await;
            }
            self.unreachable_since.remove(&address);
        }

        self.add_servers(state);
    }

    async fn update_server(&mut self, sd: ServerDescription) -> bool {
        let mut latest_state = self.broadcaster.clone_latest();
        if latest_state.closed {
            return false;
        }

        let address = sd.address.clone();
        let reachable = sd.is_available();
        let old_description = latest_state.description.clone();

        if let Err(error) = latest_state.description.update(sd) {
            self.emit_event(|| {
                SdamEvent::TopologyError(TopologyErrorEvent {
                    topology_id: self.id,
                    address: address.clone(),
                    error,
                })
            });
        }
        self.track_reachability(&mut latest_state.description, &address, reachable);
        self.sync_servers(&mut latest_state).await;

        let topology_changed =
            self.process_topology_diff(&old_description, &latest_state.description);
        self.check_full_setup(&latest_state.description);
        self.broadcaster.publish_new_state(latest_state);

        topology_changed
    }

    /// Removes the server at `address` once it has been unreachable for longer than the
    /// configured grace period.
    fn track_reachability(
        &mut self,
        description: &mut TopologyDescription,
        address: &ServerAddress,
        reachable: bool,
    ) {
        if reachable {
            self.unreachable_since.remove(address);
            return;
        }

        let grace_period = match self.options.server_removal_grace_period {
            Some(grace_period) => grace_period,
            None => return,
        };
        if description.server_description(address).is_none() {
            return;
        }

        let unreachable_since = *self
            .unreachable_since
            .entry(address.clone())
            .or_insert_with(Instant::now);
        if unreachable_since.elapsed() >= grace_period {
            tracing::debug!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                %address,
                grace_period_ms = grace_period.as_millis() as u64,
                "removing unreachable server"
            );
            description.remove_server(address);
            self.unreachable_since.remove(address);
        }
    }

    /// Publishes the events for the difference between the two descriptions. Returns whether
    /// the descriptions differ.
    fn process_topology_diff(
        &self,
        old_description: &TopologyDescription,
        new_description: &TopologyDescription,
    ) -> bool {
        let diff = old_description.diff(new_description);
        let changed = diff.is_some();

        if let Some(diff) = diff {
            for (address, (previous_description, new_description)) in diff.changed_servers {
                self.emit_event(|| {
                    SdamEvent::ServerDescriptionChanged(Box::new(ServerDescriptionChangedEvent {
                        address: address.clone(),
                        topology_id: self.id,
                        previous_description: previous_description.clone(),
                        new_description: new_description.clone(),
                    }))
                });
            }

            for address in diff.removed_addresses {
                self.emit_event(|| {
                    SdamEvent::ServerClosed(ServerClosedEvent {
                        address: address.clone(),
                        topology_id: self.id,
                    })
                });
            }

            for address in diff.added_addresses {
                self.emit_event(|| {
                    SdamEvent::ServerOpening(ServerOpeningEvent {
                        address: address.clone(),
                        topology_id: self.id,
                    })
                });
            }
        }

        self.emit_event(|| {
            SdamEvent::TopologyDescriptionChanged(Box::new(TopologyDescriptionChangedEvent {
                topology_id: self.id,
                previous_description: old_description.clone(),
                new_description: new_description.clone(),
            }))
        });

        changed
    }

    fn check_full_setup(&mut self, description: &TopologyDescription) {
        if self.full_setup_emitted {
            return;
        }

        let min_secondaries = self.options.min_secondaries.unwrap_or(0);
        if let Some((primary, secondaries)) = description.full_setup(min_secondaries) {
            self.full_setup_emitted = true;
            self.emit_event(|| {
                SdamEvent::TopologyFullSetup(TopologyFullSetupEvent {
                    topology_id: self.id,
                    primary,
                    secondaries,
                })
            });
        }
    }

    async fn mark_server_as_unknown(&mut self, address: ServerAddress, error: Error) -> bool {
        let previous = self
            .broadcaster
            .borrow_latest()
            .description
            .server_description(&address)
            .cloned();
        let description = ServerDescription::new_from_error(address, error, previous.as_ref());
        self.update_server(description).await
    }

    async fn handle_application_error(
        &mut self,
        address: ServerAddress,
        error: Error,
        generation: Option<u32>,
    ) -> bool {
        let server = match self.server(&address) {
            Some(s) => s,
            None => return false,
        };

        // errors from connections created before the pool was last cleared are stale
        if let Some(generation) = generation {
            if generation < server.pool.generation() {
                return false;
            }
        }

        if !error.is_network_error() {
            return false;
        }

        let updated = self.mark_server_as_unknown(address, error).await;
        server.pool.clear().await;
        self.update_requester.request_update();

        updated
    }

    async fn handle_monitor_error(&mut self, address: ServerAddress, error: Error) -> bool {
        let server = match self.server(&address) {
            Some(s) => s,
            None => return false,
        };

        let was_available = self
            .broadcaster
            .borrow_latest()
            .description
            .server_description(&address)
            .map(ServerDescription::is_available)
            .unwrap_or(false);

        let updated = self.mark_server_as_unknown(address, error).await;
        if was_available {
            server.pool.clear().await;
        }

        updated
    }

    async fn shutdown(&mut self) {
        let mut state = self.broadcaster.clone_latest();
        if state.closed {
            return;
        }

        join_all(state.servers.values().map(|server| server.close())).await;
        for address in state.servers.keys() {
            self.emit_event(|| {
                SdamEvent::ServerClosed(ServerClosedEvent {
                    address: address.clone(),
                    topology_id: self.id,
                })
            });
        }

        state.closed = true;
        self.broadcaster.publish_new_state(state);

        self.emit_event(|| {
            SdamEvent::TopologyClosed(TopologyClosedEvent {
                topology_id: self.id,
            })
        });
    }

    fn server(&self, address: &ServerAddress) -> Option<Arc<Server>> {
        self.broadcaster
            .borrow_latest()
            .servers
            .get(address)
            .cloned()
    }
}

/// Handle used to send updates to the topology worker. Every update is acknowledged once the
/// worker has applied it.
#[derive(Debug, Clone)]
pub(crate) struct TopologyUpdater {
    sender: UnboundedSender<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl TopologyUpdater {
    pub(crate) fn channel() -> (TopologyUpdater, TopologyUpdateReceiver) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        let updater = TopologyUpdater { sender: tx };

        let update_receiver = TopologyUpdateReceiver {
            update_receiver: rx,
        };

        (updater, update_receiver)
    }

    async fn send_message(&self, update: UpdateMessage) -> bool {
        let (message, receiver) = AcknowledgedMessage::package(update);

        match self.sender.send(message) {
            Ok(_) => receiver.wait_for_acknowledgment().await.unwrap_or(false),
            _ => false,
        }
    }

    /// Reports the outcome of a successful check.
    pub(crate) async fn update(&self, sd: ServerDescription) -> bool {
        self.send_message(UpdateMessage::ServerUpdate(Box::new(sd)))
            .await
    }

    /// Reports a failed check.
    pub(crate) async fn handle_monitor_error(&self, address: ServerAddress, error: Error) -> bool {
        self.send_message(UpdateMessage::MonitorError { address, error })
            .await
    }

    /// Reports an error that occurred while using or establishing a connection to `address`.
    /// `generation` is the pool generation of the connection, if known.
    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        generation: Option<u32>,
    ) -> bool {
        self.send_message(UpdateMessage::ApplicationError {
            address,
            error,
            generation,
        })
        .await
    }

    pub(crate) async fn shutdown(&self) {
        self.send_message(UpdateMessage::Shutdown).await;
    }
}

pub(crate) struct TopologyUpdateReceiver {
    update_receiver: UnboundedReceiver<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl TopologyUpdateReceiver {
    pub(crate) async fn recv(&mut self) -> Option<AcknowledgedMessage<UpdateMessage, bool>> {
        self.update_receiver.recv().await
    }
}

/// Read access to the latest published topology state.
#[derive(Debug, Clone)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<TopologyState>,
}

impl TopologyWatcher {
    fn channel(initial_state: TopologyState) -> (TopologyWatcher, TopologyBroadcaster) {
        let (tx, rx) = watch::channel(initial_state);
        let watcher = TopologyWatcher { receiver: rx };
        let broadcaster = TopologyBroadcaster { state_sender: tx };
        (watcher, broadcaster)
    }

    /// Whether the topology worker is still running.
    pub(crate) fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }

    pub(crate) fn borrow_latest(&self) -> Ref<'_, TopologyState> {
        self.receiver.borrow()
    }

    /// An owned copy of the latest description. Later updates never show through it.
    pub(crate) fn snapshot(&self) -> TopologyDescription {
        self.borrow_latest().description.clone()
    }

    pub(crate) fn server(&self, address: &ServerAddress) -> Option<Arc<Server>> {
        self.borrow_latest().servers.get(address).cloned()
    }

    /// Waits until a primary and at least `min_secondaries` secondaries are known. Returns
    /// whether that happened within `timeout`.
    pub(crate) async fn wait_for_full_setup(
        &mut self,
        timeout: Duration,
        min_secondaries: u32,
    ) -> bool {
        let result = runtime::timeout(
            timeout,
            self.receiver.wait_for(|state| {
                state.description.full_setup(min_secondaries).is_some()
            }),
        )
        .await;
        matches!(result, Ok(Ok(_)))
    }

    /// Waits for the next published state. Returns false on timeout.
    #[cfg(test)]
    pub(crate) async fn wait_for_update(&mut self, timeout: Duration) -> bool {
        let changed = runtime::timeout(timeout, self.receiver.changed())
            .await
            .is_ok();
        self.receiver.borrow_and_update();
        changed
    }
}

struct TopologyBroadcaster {
    state_sender: watch::Sender<TopologyState>,
}

impl TopologyBroadcaster {
    fn clone_latest(&self) -> TopologyState {
        self.borrow_latest().clone()
    }

    fn borrow_latest(&self) -> Ref<'_, TopologyState> {
        self.state_sender.borrow()
    }

    fn publish_new_state(&self, state: TopologyState) {
        self.state_sender.send_replace(state);
    }
}

/// Wakes sleeping monitors so they check their server right away.
#[derive(Clone, Debug)]
struct UpdateRequester {
    sender: broadcast::Sender<()>,
}

impl UpdateRequester {
    fn channel() -> (UpdateRequester, TopologyUpdateRequestReceiver) {
        let (tx, rx) = broadcast::channel(1);
        (
            UpdateRequester { sender: tx },
            TopologyUpdateRequestReceiver { receiver: rx },
        )
    }

    fn request_update(&self) {
        // fails only when no monitor is subscribed
        let _: std::result::Result<_, _> = self.sender.send(());
    }

    fn subscribe(&self) -> TopologyUpdateRequestReceiver {
        TopologyUpdateRequestReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

pub(crate) struct TopologyUpdateRequestReceiver {
    receiver: broadcast::Receiver<()>,
}

impl TopologyUpdateRequestReceiver {
    pub(crate) async fn wait_for_update_request(&mut self, timeout: Duration) {
        let _: std::result::Result<_, _> = runtime::timeout(timeout, self.receiver.recv()).await;
    }

    pub(crate) fn clear_update_requests(&mut self) {
        let _: std::result::Result<_, _> = self.receiver.try_recv();
    }
}
