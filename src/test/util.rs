use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use tokio::{
    io::BufStream,
    net::{TcpListener, TcpStream},
    sync::Notify,
};

use crate::{
    bson::{doc, Document},
    cmap::conn::wire::Message,
    event::EventHandler,
    hello::LEGACY_HELLO_COMMAND_NAME,
    options::ServerAddress,
    runtime::{self, AsyncJoinHandle},
};

/// A server that speaks enough of the wire protocol to answer `isMaster` and any other command
/// with a scriptable reply.
#[derive(Debug)]
pub(crate) struct MockServer {
    address: ServerAddress,
    state: Arc<MockServerState>,
    accept_task: AsyncJoinHandle<()>,
}

#[derive(Debug)]
struct MockServerState {
    behavior: Mutex<Behavior>,
    connections_accepted: AtomicUsize,
    commands_received: AtomicUsize,
}

#[derive(Clone, Debug)]
struct Behavior {
    hello_reply: Document,
    command_reply: Document,
    delay: Option<Duration>,
    failing: bool,
}

impl MockServer {
    /// Binds a new server to an ephemeral port on the loopback interface. Until a reply is
    /// scripted, `isMaster` is answered as a standalone.
    pub(crate) async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(MockServerState {
            behavior: Mutex::new(Behavior {
                hello_reply: doc! { "ismaster": true, "ok": 1 },
                command_reply: doc! { "ok": 1 },
                delay: None,
                failing: false,
            }),
            connections_accepted: AtomicUsize::new(0),
            commands_received: AtomicUsize::new(0),
        });

        let accept_state = state.clone();
        let accept_task = runtime::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state
                    .connections_accepted
                    .fetch_add(1, Ordering::SeqCst);
                runtime::execute(serve(stream, accept_state.clone()));
            }
        });

        Self {
            address: ServerAddress::new("127.0.0.1", port),
            state,
            accept_task,
        }
    }

    pub(crate) fn address(&self) -> ServerAddress {
        self.address.clone()
    }

    pub(crate) fn set_hello_reply(&self, reply: Document) {
        self.state.behavior.lock().unwrap().hello_reply = reply;
    }

    pub(crate) fn set_command_reply(&self, reply: Document) {
        self.state.behavior.lock().unwrap().command_reply = reply;
    }

    /// Delays every reply by `delay`.
    pub(crate) fn set_delay(&self, delay: Option<Duration>) {
        self.state.behavior.lock().unwrap().delay = delay;
    }

    /// While failing, the server hangs up on every command it receives.
    pub(crate) fn set_failing(&self, failing: bool) {
        self.state.behavior.lock().unwrap().failing = failing;
    }

    pub(crate) fn connections_accepted(&self) -> usize {
        self.state.connections_accepted.load(Ordering::SeqCst)
    }

    pub(crate) fn commands_received(&self) -> usize {
        self.state.commands_received.load(Ordering::SeqCst)
    }

    /// Stops accepting connections and hangs up on the open ones.
    pub(crate) fn stop(&self) {
        self.accept_task.abort();
        self.set_failing(true);
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(stream: TcpStream, state: Arc<MockServerState>) {
    let mut stream = BufStream::new(stream);
    while let Ok(message) = Message::read_from(&mut stream, None).await {
        state.commands_received.fetch_add(1, Ordering::SeqCst);
        let behavior = state.behavior.lock().unwrap().clone();
        if behavior.failing {
            return;
        }
        if let Some(delay) = behavior.delay {
            runtime::delay_for(delay).await;
        }

        let reply = if message
            .document_payload
            .contains_key(LEGACY_HELLO_COMMAND_NAME)
        {
            behavior.hello_reply
        } else {
            behavior.command_reply
        };
        let response_to = message.request_id.unwrap_or_default();
        if Message::reply(reply, response_to)
            .write_to(&mut stream)
            .await
            .is_err()
        {
            return;
        }
    }
}

/// An `isMaster` reply from the primary of the replica set `set_name`.
pub(crate) fn primary_reply(set_name: &str, hosts: &[ServerAddress]) -> Document {
    doc! {
        "ismaster": true,
        "secondary": false,
        "setName": set_name,
        "hosts": host_strings(hosts),
        "ok": 1,
    }
}

/// An `isMaster` reply from a secondary of the replica set `set_name`.
pub(crate) fn secondary_reply(set_name: &str, hosts: &[ServerAddress], tags: Document) -> Document {
    doc! {
        "ismaster": false,
        "secondary": true,
        "setName": set_name,
        "hosts": host_strings(hosts),
        "tags": tags,
        "ok": 1,
    }
}

fn host_strings(hosts: &[ServerAddress]) -> Vec<String> {
    hosts.iter().map(ToString::to_string).collect()
}

/// A buffer of events that can be registered as an event handler and queried from tests.
#[derive(Clone, Debug)]
pub(crate) struct EventBuffer<T> {
    inner: Arc<EventBufferInner<T>>,
}

#[derive(Debug)]
struct EventBufferInner<T> {
    events: Mutex<Vec<T>>,
    event_received: Notify,
}

impl<T: Clone + Send + Sync + 'static> EventBuffer<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(EventBufferInner {
                events: Mutex::new(Vec::new()),
                event_received: Notify::new(),
            }),
        }
    }

    pub(crate) fn handler(&self) -> EventHandler<T> {
        let inner = self.inner.clone();
        EventHandler::callback(move |event| {
            inner.events.lock().unwrap().push(event);
            inner.event_received.notify_waiters();
        })
    }

    pub(crate) fn all(&self) -> Vec<T> {
        self.inner.events.lock().unwrap().clone()
    }

    /// Waits until an event matching `filter` has been received, returning it.
    pub(crate) async fn wait_for_event(
        &self,
        timeout: Duration,
        mut filter: impl FnMut(&T) -> bool,
    ) -> Option<T> {
        runtime::timeout(timeout, async {
            loop {
                let notified = self.inner.event_received.notified();
                if let Some(event) = self.all().into_iter().find(|e| filter(e)) {
                    return event;
                }
                notified.await;
            }
        })
        .await
        .ok()
    }
}
