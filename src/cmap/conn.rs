pub(crate) mod wire;

use std::time::{Duration, Instant};

use derive_where::derive_where;
use tokio::{io::BufStream, net::TcpStream};

use self::wire::Message;
use super::manager::PoolManager;
use crate::{
    bson::{Bson, Document},
    error::{CommandError, Error, ErrorKind, Result},
    event::cmap::{
        CmapEventEmitter,
        ConnectionCheckedInEvent,
        ConnectionCheckedOutEvent,
        ConnectionClosedEvent,
        ConnectionClosedReason,
        ConnectionCreatedEvent,
        ConnectionReadyEvent,
    },
    options::ServerAddress,
};

/// A connection to a replica set member.
///
/// Connections are checked out of a server's pool with
/// [`Client::check_out`](crate::Client::check_out). Dropping a checked-out connection checks it
/// back into its pool; connections on which a network error occurred, or that were marked as
/// broken, are closed instead of being reused.
#[derive_where(Debug)]
pub struct Connection {
    /// Driver-generated ID for the connection, unique within its pool.
    pub(crate) id: u32,

    /// The address of the server the connection is connected to.
    pub(crate) address: ServerAddress,

    /// The pool generation the connection was created in.
    pub(crate) generation: u32,

    /// The time the connection was created.
    pub(crate) time_created: Instant,

    #[derive_where(skip)]
    stream: Option<BufStream<TcpStream>>,

    /// Marks the time when the connection was last checked into the pool. This value is used to
    /// determine whether this connection is idle.
    ready_and_available_time: Option<Instant>,

    /// The manager used to check this connection back into the pool when dropped. This value is
    /// unset while the connection is checked into the pool.
    pool_manager: Option<PoolManager>,

    /// The first error that occurred on this connection, if any.
    error: Option<Error>,

    /// Set while a command has been written but its reply not fully read. A connection dropped
    /// in that state has stray bytes on the stream and can't be reused.
    command_executing: bool,

    /// Emitter for events related to this connection. Monitoring connections don't emit events.
    #[derive_where(skip)]
    event_emitter: Option<CmapEventEmitter>,
}

impl Connection {
    pub(crate) fn new(
        pending_connection: PendingConnection,
        stream: TcpStream,
    ) -> Self {
        Self {
            id: pending_connection.id,
            address: pending_connection.address,
            generation: pending_connection.generation,
            time_created: pending_connection.time_created,
            stream: Some(BufStream::new(stream)),
            ready_and_available_time: None,
            pool_manager: None,
            error: None,
            command_executing: false,
            event_emitter: Some(pending_connection.event_emitter),
        }
    }

    /// Creates a connection that doesn't belong to any pool. Used by server monitors.
    pub(crate) fn new_monitoring(address: ServerAddress, stream: TcpStream, id: u32) -> Self {
        Self {
            id,
            address,
            generation: 0,
            time_created: Instant::now(),
            stream: Some(BufStream::new(stream)),
            ready_and_available_time: None,
            pool_manager: None,
            error: None,
            command_executing: false,
            event_emitter: None,
        }
    }

    /// The driver-generated ID of this connection.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The address of the server this connection is connected to.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Runs `command` against the database `db` and returns the server's reply.
    ///
    /// A reply with `ok: 0` is returned as a [`ErrorKind::Command`] error. Network errors mark
    /// the connection as broken, so it will be closed rather than reused once it is dropped. The
    /// same happens if this future is dropped before the reply has been read.
    pub async fn send_command(&mut self, command: Document, db: &str) -> Result<Document> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => {
                return Err(Error::internal(format!(
                    "connection {} to {} has already been closed",
                    self.id, self.address
                )))
            }
        };

        let message = Message::from_command(command, db, None);
        self.command_executing = true;
        let result = send_message(stream, message).await;
        self.command_executing = false;

        let reply = match result {
            Ok(reply) => reply,
            Err(error) => {
                self.error.get_or_insert_with(|| error.clone());
                return Err(error);
            }
        };

        if reply_ok(&reply) {
            Ok(reply)
        } else {
            Err(ErrorKind::Command(CommandError {
                code: reply.get_i32("code").unwrap_or(0),
                code_name: reply.get_str("codeName").unwrap_or_default().to_string(),
                message: reply.get_str("errmsg").unwrap_or_default().to_string(),
            })
            .into())
        }
    }

    /// Marks this connection as broken, so it is closed instead of being returned to its pool.
    pub fn mark_as_broken(&mut self) {
        self.error.get_or_insert_with(|| {
            ErrorKind::Io(std::sync::Arc::new(std::io::Error::new(
                std::io::ErrorKind::Other,
                "connection was marked as broken",
            )))
            .into()
        });
    }

    /// Whether an error occurred on this connection or it was marked as broken.
    pub fn is_broken(&self) -> bool {
        self.error.is_some()
    }

    pub(crate) fn has_errored(&self) -> bool {
        self.error.is_some()
    }

    pub(crate) fn is_executing(&self) -> bool {
        self.command_executing
    }

    /// Updates the state of the connection to indicate that it is checked into the pool.
    pub(crate) fn mark_as_available(&mut self) {
        self.pool_manager.take();
        self.ready_and_available_time = Some(Instant::now());
    }

    /// Updates the state of the connection to indicate that it is checked out of the pool.
    pub(crate) fn mark_as_in_use(&mut self, manager: PoolManager) {
        self.pool_manager = Some(manager);
        self.ready_and_available_time.take();
    }

    /// Whether this connection is idle.
    pub(crate) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        self.ready_and_available_time
            .and_then(|ready_and_available_time| {
                max_idle_time.map(|max_idle_time| {
                    Instant::now().duration_since(ready_and_available_time) >= max_idle_time
                })
            })
            .unwrap_or(false)
    }

    pub(crate) fn is_stale(&self, current_generation: u32) -> bool {
        self.generation != current_generation
    }

    /// Close this connection, emitting a [`ConnectionClosedEvent`] with the supplied reason.
    pub(crate) fn close_and_drop(mut self, reason: ConnectionClosedReason) {
        self.close(reason);
    }

    fn close(&mut self, reason: ConnectionClosedReason) {
        self.pool_manager.take();
        self.stream.take();
        if let Some(ref emitter) = self.event_emitter {
            emitter.emit_event(|| self.closed_event(reason).into());
        }
    }

    /// Nullify the inner state and return it in a new `Connection` for checking back in to the
    /// pool.
    fn take(&mut self) -> Self {
        Self {
            id: self.id,
            address: self.address.clone(),
            generation: self.generation,
            time_created: self.time_created,
            stream: self.stream.take(),
            ready_and_available_time: None,
            pool_manager: None,
            error: self.error.take(),
            command_executing: self.command_executing,
            event_emitter: self.event_emitter.clone(),
        }
    }

    /// Helper to create a [`ConnectionCheckedOutEvent`] for the connection.
    pub(crate) fn checked_out_event(&self, time_started: Instant) -> ConnectionCheckedOutEvent {
        ConnectionCheckedOutEvent {
            address: self.address.clone(),
            connection_id: self.id,
            duration: Instant::now() - time_started,
        }
    }

    /// Helper to create a [`ConnectionCheckedInEvent`] for the connection.
    pub(crate) fn checked_in_event(&self) -> ConnectionCheckedInEvent {
        ConnectionCheckedInEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }

    /// Helper to create a [`ConnectionReadyEvent`] for the connection.
    pub(crate) fn ready_event(&self) -> ConnectionReadyEvent {
        ConnectionReadyEvent {
            address: self.address.clone(),
            connection_id: self.id,
            duration: Instant::now() - self.time_created,
        }
    }

    fn closed_event(&self, reason: ConnectionClosedReason) -> ConnectionClosedEvent {
        ConnectionClosedEvent {
            address: self.address.clone(),
            connection_id: self.id,
            reason,
            error: self.error.clone(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // A connection with a pool manager is being dropped while checked out, so it goes back
        // to its pool. Without one, the pool itself dropped it through `close_and_drop`, or it's
        // a monitoring connection.
        if let Some(pool_manager) = self.pool_manager.take() {
            let dropped_connection = self.take();
            if let Err(mut conn) = pool_manager.check_in(dropped_connection) {
                // the pool's worker is gone
                conn.close(ConnectionClosedReason::PoolClosed);
            }
        }
    }
}

async fn send_message(stream: &mut BufStream<TcpStream>, message: Message) -> Result<Document> {
    let request_id = message.write_to(stream).await?;
    let reply = Message::read_from(stream, None).await?;
    if reply.response_to != request_id {
        return Err(Error::invalid_response(format!(
            "expected a reply to request {request_id}, got a reply to {}",
            reply.response_to
        )));
    }
    Ok(reply.document_payload)
}

fn reply_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(Bson::Int32(i)) => *i == 1,
        Some(Bson::Int64(i)) => *i == 1,
        Some(Bson::Double(f)) => *f == 1.0,
        Some(Bson::Boolean(b)) => *b,
        _ => false,
    }
}

/// Struct encapsulating the information needed to establish a new connection.
#[derive_where(Debug)]
pub(crate) struct PendingConnection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: u32,
    pub(crate) time_created: Instant,

    #[derive_where(skip)]
    pub(crate) event_emitter: CmapEventEmitter,
}

impl PendingConnection {
    /// Helper to create a [`ConnectionCreatedEvent`] for the connection.
    pub(crate) fn created_event(&self) -> ConnectionCreatedEvent {
        ConnectionCreatedEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }
}
