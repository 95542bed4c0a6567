use tokio::sync::mpsc;

use super::Connection;
use crate::runtime::AcknowledgedMessage;

pub(super) fn channel() -> (PoolManager, ManagementRequestReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        PoolManager { sender },
        ManagementRequestReceiver { receiver },
    )
}

/// Sends bookkeeping requests to a pool's worker. Unlike a `ConnectionRequester`, holding a
/// manager does not keep the worker running.
#[derive(Clone, Debug)]
pub(crate) struct PoolManager {
    sender: mpsc::UnboundedSender<PoolManagementRequest>,
}

impl PoolManager {
    /// Bumps the pool's generation. Returns once the worker has done so.
    pub(super) async fn clear(&self) {
        self.send_and_wait(|handler| PoolManagementRequest::Clear {
            _completion_handler: handler,
        })
        .await
    }

    /// Returns once queued checkouts have failed and idle connections are closed.
    pub(super) async fn close(&self) {
        self.send_and_wait(|handler| PoolManagementRequest::Close {
            _completion_handler: handler,
        })
        .await
    }

    async fn send_and_wait(
        &self,
        request: impl FnOnce(AcknowledgedMessage<()>) -> PoolManagementRequest,
    ) {
        let (handler, acknowledgment) = AcknowledgedMessage::package(());
        // a worker that is already gone has nothing left to clear or close
        if self.sender.send(request(handler)).is_ok() {
            let _: Option<()> = acknowledgment.wait_for_acknowledgment().await;
        }
    }

    /// Hands `connection` back to the worker, or back to the caller if the worker has exited.
    pub(crate) fn check_in(&self, connection: Connection) -> std::result::Result<(), Connection> {
        match self
            .sender
            .send(PoolManagementRequest::CheckIn(Box::new(connection)))
        {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(PoolManagementRequest::CheckIn(connection))) => {
                Err(*connection)
            }
            Err(_) => Ok(()),
        }
    }

    pub(super) fn handle_connection_failed(&self) {
        let _: std::result::Result<_, _> =
            self.sender.send(PoolManagementRequest::HandleConnectionFailed);
    }

    pub(super) fn handle_connection_succeeded(&self, connection: ConnectionSucceeded) {
        let _: std::result::Result<_, _> = self
            .sender
            .send(PoolManagementRequest::HandleConnectionSucceeded(connection));
    }
}

#[derive(Debug)]
pub(super) struct ManagementRequestReceiver {
    receiver: mpsc::UnboundedReceiver<PoolManagementRequest>,
}

impl ManagementRequestReceiver {
    pub(super) async fn recv(&mut self) -> Option<PoolManagementRequest> {
        self.receiver.recv().await
    }
}

#[derive(Debug)]
pub(super) enum PoolManagementRequest {
    /// Every existing connection becomes stale.
    Clear {
        _completion_handler: AcknowledgedMessage<()>,
    },

    Close {
        _completion_handler: AcknowledgedMessage<()>,
    },

    CheckIn(Box<Connection>),

    /// A pending connection failed to establish and no longer counts toward the pool's total.
    HandleConnectionFailed,

    HandleConnectionSucceeded(ConnectionSucceeded),
}

#[derive(Debug)]
pub(super) enum ConnectionSucceeded {
    /// Established in the background to keep `min_pool_size` connections around.
    ForPool(Box<Connection>),

    /// Established for a checkout and already handed to it.
    Used,
}
