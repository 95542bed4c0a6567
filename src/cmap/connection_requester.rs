use tokio::sync::{mpsc, oneshot};

use super::Connection;
use crate::{
    error::Result,
    runtime::{AsyncJoinHandle, WorkerHandle},
};

pub(super) fn channel(handle: WorkerHandle) -> (ConnectionRequester, ConnectionRequestReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        ConnectionRequester {
            sender,
            _handle: handle,
        },
        ConnectionRequestReceiver { receiver },
    )
}

/// Sends checkouts to a pool's worker. The worker keeps running for as long as a requester
/// exists.
#[derive(Clone, Debug)]
pub(super) struct ConnectionRequester {
    sender: mpsc::UnboundedSender<oneshot::Sender<ConnectionRequestResult>>,
    _handle: WorkerHandle,
}

impl ConnectionRequester {
    /// Returns `None` if the worker stopped before answering.
    pub(super) async fn request(&self) -> Option<ConnectionRequestResult> {
        let (sender, receiver) = oneshot::channel();

        // the receiver only goes away once the worker has exited, which happens after a close
        // or after every handle has been dropped
        self.sender.send(sender).ok()?;

        receiver.await.ok()
    }
}

#[derive(Debug)]
pub(super) struct ConnectionRequestReceiver {
    receiver: mpsc::UnboundedReceiver<oneshot::Sender<ConnectionRequestResult>>,
}

impl ConnectionRequestReceiver {
    pub(super) async fn recv(&mut self) -> Option<ConnectionRequest> {
        self.receiver
            .recv()
            .await
            .map(|sender| ConnectionRequest { sender })
    }

    /// Stop accepting new requests. Requests already sent can still be received.
    pub(super) fn close(&mut self) {
        self.receiver.close();
    }
}

/// One waiting checkout.
#[derive(Debug)]
pub(super) struct ConnectionRequest {
    sender: oneshot::Sender<ConnectionRequestResult>,
}

impl ConnectionRequest {
    /// Fails, handing `result` back, if the checkout stopped waiting.
    pub(super) fn fulfill(
        self,
        result: ConnectionRequestResult,
    ) -> std::result::Result<(), ConnectionRequestResult> {
        self.sender.send(result)
    }
}

#[derive(Debug)]
pub(super) enum ConnectionRequestResult {
    /// An idle connection taken from the pool.
    Pooled(Box<Connection>),

    /// A connection that is still being established for this checkout.
    Establishing(AsyncJoinHandle<Result<Connection>>),

    PoolClosed,
}

impl ConnectionRequestResult {
    pub(super) fn into_pooled_connection(self) -> Option<Connection> {
        match self {
            ConnectionRequestResult::Pooled(c) => Some(*c),
            _ => None,
        }
    }
}
