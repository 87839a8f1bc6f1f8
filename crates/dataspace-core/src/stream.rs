// ── Delivery streams ──
//
// `Stream` view over a topic subscription. Backed by a handler that
// forwards into an unbounded channel; dropping the stream removes the
// handler.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::payload::{Delivery, Handler};
use crate::session::SessionCommand;

/// Deliveries for one topic, starting with the cached value if any.
pub struct TopicStream {
    inner: UnboundedReceiverStream<Delivery>,
    topic: String,
    path: Option<String>,
    handler: Handler,
    commands: mpsc::Sender<SessionCommand>,
}

impl TopicStream {
    /// Handler that feeds a new stream, and the receiving half.
    pub(crate) fn channel() -> (Handler, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Handler::new(move |delivery: &Delivery| {
            let _ = tx.send(delivery.clone());
        });
        (handler, rx)
    }

    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<Delivery>,
        topic: String,
        path: Option<String>,
        handler: Handler,
        commands: mpsc::Sender<SessionCommand>,
    ) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
            topic,
            path,
            handler,
            commands,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Stream for TopicStream {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for TopicStream {
    fn drop(&mut self) {
        let command = SessionCommand::Unsubscribe {
            topic: std::mem::take(&mut self.topic),
            path: self.path.take(),
            handler: self.handler.clone(),
            reply: None,
        };
        match self.commands.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(command)) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let commands = self.commands.clone();
                    runtime.spawn(async move {
                        let _ = commands.send(command).await;
                    });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("stream dropped after session closed");
            }
        }
    }
}
