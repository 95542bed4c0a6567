use tokio::sync::mpsc;

/// Keeps a background worker alive. The worker shuts down after the last clone is dropped.
#[derive(Debug, Clone)]
pub(crate) struct WorkerHandle {
    _alive: mpsc::Sender<()>,
}

/// The worker's side of a set of [`WorkerHandle`]s.
#[derive(Debug)]
pub(crate) struct WorkerHandleListener {
    receiver: mpsc::Receiver<()>,
}

impl WorkerHandleListener {
    pub(crate) fn channel() -> (WorkerHandle, WorkerHandleListener) {
        let (sender, receiver) = mpsc::channel(1);
        (
            WorkerHandle { _alive: sender },
            WorkerHandleListener { receiver },
        )
    }

    /// Resolves once every handle is gone. Nothing is ever sent on the channel, so this only
    /// makes sense as one branch of a `select!`.
    pub(crate) async fn wait_for_all_handle_drops(&mut self) {
        let _: Option<()> = self.receiver.recv().await;
    }
}
