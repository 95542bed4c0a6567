use tokio::sync::oneshot;

/// A request paired with a one-shot reply channel. The sender of the request learns that it was
/// handled either through an explicit reply or through the message being dropped.
#[derive(Debug)]
pub(crate) struct AcknowledgedMessage<M, R = ()> {
    acknowledger: AcknowledgmentSender<R>,
    message: M,
}

impl<M, R> AcknowledgedMessage<M, R> {
    pub(crate) fn package(message: M) -> (Self, AcknowledgmentReceiver<R>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                message,
                acknowledger: AcknowledgmentSender { sender },
            },
            AcknowledgmentReceiver { receiver },
        )
    }

    pub(crate) fn acknowledge(self, result: impl Into<R>) {
        self.acknowledger.acknowledge(result)
    }

    /// Separates the payload from its reply channel so the reply can be sent after the payload
    /// has been consumed.
    pub(crate) fn into_parts(self) -> (M, AcknowledgmentSender<R>) {
        (self.message, self.acknowledger)
    }
}

#[derive(Debug)]
pub(crate) struct AcknowledgmentSender<R> {
    sender: oneshot::Sender<R>,
}

impl<R> AcknowledgmentSender<R> {
    pub(crate) fn acknowledge(self, result: impl Into<R>) {
        // the requester may have stopped waiting
        let _: std::result::Result<_, _> = self.sender.send(result.into());
    }
}

pub(crate) struct AcknowledgmentReceiver<R> {
    receiver: oneshot::Receiver<R>,
}

impl<R> AcknowledgmentReceiver<R> {
    /// Returns `None` if the message was dropped without a reply.
    pub(crate) async fn wait_for_acknowledgment(self) -> Option<R> {
        self.receiver.await.ok()
    }
}
