//! Contains the events and functionality for monitoring the topology and the connection pools.

pub mod cmap;
pub mod sdam;

use std::sync::Arc;

use futures_core::future::BoxFuture;

use crate::runtime;

/// Where topology and pool events are delivered.
///
/// Handlers are invoked from the task that produced the event, so a callback should return
/// quickly. Channel and async handlers are driven on a spawned task instead.
///
/// ```rust
/// # use mongodb_replset::{event::{sdam::SdamEvent, EventHandler}, options::ClientOptions};
/// # async fn example() {
/// let (tx, mut rx) = tokio::sync::mpsc::channel::<SdamEvent>(64);
/// let options = ClientOptions::builder()
///     .sdam_event_handler(EventHandler::from(tx))
///     .cmap_event_handler(EventHandler::callback(|event| println!("{event:?}")))
///     .build();
///
/// while let Some(event) = rx.recv().await {
///     println!("{event:?}");
/// }
/// # let _ = options;
/// # }
/// ```
#[derive(Clone)]
#[non_exhaustive]
pub enum EventHandler<T> {
    /// Called inline with each event.
    Callback(Arc<dyn Fn(T) + Sync + Send>),
    /// Called with each event; the returned future is spawned.
    AsyncCallback(Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Sync + Send>),
    /// Each event is sent on the channel. A closed channel is ignored.
    TokioMpsc(tokio::sync::mpsc::Sender<T>),
}

impl<T> std::fmt::Debug for EventHandler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Callback(_) => "Callback",
            Self::AsyncCallback(_) => "AsyncCallback",
            Self::TokioMpsc(_) => "TokioMpsc",
        };
        f.debug_tuple("EventHandler").field(&kind).finish()
    }
}

impl<T> From<tokio::sync::mpsc::Sender<T>> for EventHandler<T> {
    fn from(value: tokio::sync::mpsc::Sender<T>) -> Self {
        Self::TokioMpsc(value)
    }
}

impl<T: Send + Sync + 'static> EventHandler<T> {
    pub fn callback(f: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self::Callback(Arc::new(f))
    }

    pub fn async_callback(f: impl Fn(T) -> BoxFuture<'static, ()> + Send + Sync + 'static) -> Self {
        Self::AsyncCallback(Arc::new(f))
    }

    pub(crate) fn handle(&self, event: T) {
        match self {
            Self::Callback(callback) => callback(event),
            Self::AsyncCallback(callback) => runtime::execute(callback(event)),
            Self::TokioMpsc(sender) => {
                let sender = sender.clone();
                runtime::execute(async move {
                    let _: std::result::Result<_, _> = sender.send(event).await;
                });
            }
        }
    }
}
