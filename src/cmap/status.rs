use tokio::sync::watch;

/// A snapshot of a connection pool's bookkeeping, published by the pool's worker after each
/// request it handles.
///
/// `available + in_use + pending == total` and `total <= max_pool_size` hold for every snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolStatus {
    /// The current generation of the pool. The generation is incremented every time the pool is
    /// cleared.
    pub generation: u32,

    /// The number of established connections sitting idle in the pool.
    pub available: u32,

    /// The number of connections currently checked out.
    pub in_use: u32,

    /// The number of connections being established.
    pub pending: u32,

    /// The total number of connections managed by the pool.
    pub total: u32,

    /// The maximum number of connections the pool will manage.
    pub max_pool_size: u32,

    /// Whether the pool has been closed.
    pub closed: bool,
}

/// Create a channel for publishing and receiving updates to the pool's status.
pub(super) fn channel(init: PoolStatus) -> (PoolStatusPublisher, PoolStatusSubscriber) {
    let (sender, receiver) = watch::channel(init);
    (
        PoolStatusPublisher { sender },
        PoolStatusSubscriber { receiver },
    )
}

/// Struct used to publish updates to the pool's status.
#[derive(Debug)]
pub(super) struct PoolStatusPublisher {
    sender: watch::Sender<PoolStatus>,
}

impl PoolStatusPublisher {
    /// Publish a new status, skipping the notification if nothing changed.
    pub(super) fn publish(&self, new_status: PoolStatus) {
        self.sender.send_if_modified(|status| {
            if *status == new_status {
                false
            } else {
                *status = new_status;
                true
            }
        });
    }
}

/// Subscriber used to get the latest status of the pool.
#[derive(Clone, Debug)]
pub(crate) struct PoolStatusSubscriber {
    receiver: watch::Receiver<PoolStatus>,
}

impl PoolStatusSubscriber {
    /// Get a copy of the latest status.
    pub(crate) fn status(&self) -> PoolStatus {
        *self.receiver.borrow()
    }

    /// Get a copy of the latest generation.
    pub(crate) fn generation(&self) -> u32 {
        self.receiver.borrow().generation
    }

    /// Wait until the published status satisfies `predicate` or the timeout elapses.
    #[cfg(test)]
    pub(crate) async fn wait_for(
        &mut self,
        timeout: std::time::Duration,
        mut predicate: impl FnMut(&PoolStatus) -> bool,
    ) -> Option<PoolStatus> {
        crate::runtime::timeout(timeout, self.receiver.wait_for(|status| predicate(status)))
            .await
            .ok()?
            .ok()
            .map(|status| *status)
    }
}
