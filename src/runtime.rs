mod acknowledged_message;
mod join_handle;
pub(crate) mod stream;
mod worker_handle;

use std::{future::Future, net::SocketAddr, time::Duration};

pub(crate) use self::{
    acknowledged_message::AcknowledgedMessage,
    join_handle::AsyncJoinHandle,
    worker_handle::{WorkerHandle, WorkerHandleListener},
};
use crate::{error::Result, options::ServerAddress};

/// Spawns `fut` onto the current tokio runtime. Panics outside of a runtime.
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle::spawn(fut)
}

/// Like [`spawn`], for tasks nobody waits on.
pub(crate) fn execute<F, O>(fut: F)
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    spawn(fut);
}

pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}

/// Runs `future` for at most `limit`, failing with a `TimedOut` I/O error after that.
pub(crate) async fn timeout<F: Future>(limit: Duration, future: F) -> Result<F::Output> {
    match tokio::time::timeout(limit, future).await {
        Ok(output) => Ok(output),
        Err(_elapsed) => Err(std::io::Error::from(std::io::ErrorKind::TimedOut).into()),
    }
}

/// Looks up every socket address `address` resolves to.
pub(crate) async fn resolve_address(
    address: &ServerAddress,
) -> Result<impl Iterator<Item = SocketAddr>> {
    let target = (address.host().to_string(), address.effective_port());
    Ok(tokio::net::lookup_host(target).await?)
}
