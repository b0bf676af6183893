// Outbound side of a live connection as seen by the rest of the gateway.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Notify};

/// Default per-connection outbound queue depth.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// A pre-encoded text frame, shared across every recipient of one fanout.
pub type Frame = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("outbound queue is full")]
    QueueFull,
    #[error("connection is closed")]
    Closed,
}

/// Handle used to push frames to, or force-close, one connection's socket task.
#[derive(Debug, Clone)]
pub struct ConnectionSink {
    outbound: mpsc::Sender<Frame>,
    close: Arc<Notify>,
}

/// The socket task's end of a [`ConnectionSink`].
#[derive(Debug)]
pub struct SinkReceiver {
    pub frames: mpsc::Receiver<Frame>,
    pub close: Arc<Notify>,
}

impl ConnectionSink {
    pub fn channel(capacity: usize) -> (Self, SinkReceiver) {
        let (outbound, frames) = mpsc::channel(capacity.max(1));
        let close = Arc::new(Notify::new());
        (Self { outbound, close: Arc::clone(&close) }, SinkReceiver { frames, close })
    }

    /// Enqueue without waiting; a slow reader loses the frame instead of
    /// stalling the publisher.
    pub fn try_deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        self.outbound.try_send(frame).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Ask the socket task to close the transport. Stored as a permit, so a
    /// task that is not currently waiting still observes it.
    pub fn close(&self) {
        self.close.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}
