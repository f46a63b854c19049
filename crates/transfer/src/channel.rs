//! Abstraction over the ordered, reliable, message-oriented channel the
//! engine writes frames into, plus an in-process implementation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use airdelivery_protocol::ChannelPayload;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Boxed future returned by [`DataChannel`] methods.
pub type ChannelFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outbound half of an established data channel.
pub trait DataChannel: Send + Sync {
    /// Queues a message for delivery.
    fn send(&self, payload: ChannelPayload) -> Result<(), ChannelError>;

    /// Bytes queued but not yet delivered to the remote side.
    fn buffered_amount(&self) -> usize;

    /// Resolves once [`buffered_amount`](Self::buffered_amount) is at or
    /// below `threshold`, or the channel closes.
    fn buffered_amount_low(&self, threshold: usize) -> ChannelFuture<'_, ()>;

    /// Largest message the transport accepts, if known.
    fn max_message_size(&self) -> Option<usize>;

    fn is_open(&self) -> bool;

    fn close(&self);
}

/// Errors returned by [`DataChannel::send`].
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("message of {size} bytes exceeds channel limit of {max}")]
    MessageTooLarge { size: usize, max: usize },
}

struct Direction {
    buffered: watch::Sender<usize>,
}

/// One end of an in-memory channel pair.
#[derive(Clone)]
pub struct MemoryChannel {
    tx: mpsc::UnboundedSender<ChannelPayload>,
    outbound: Arc<Direction>,
    closed: CancellationToken,
    max_message_size: Option<usize>,
}

/// Receiving side matching a [`MemoryChannel`] on the other end.
pub struct MemoryInbox {
    rx: mpsc::UnboundedReceiver<ChannelPayload>,
    inbound: Arc<Direction>,
    closed: CancellationToken,
}

/// Creates two connected channel ends: `a` sends into `b`'s inbox and
/// vice versa. Closing either end closes both.
pub fn memory_channel_pair(
    max_message_size: Option<usize>,
) -> ((MemoryChannel, MemoryInbox), (MemoryChannel, MemoryInbox)) {
    let closed = CancellationToken::new();
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let a_to_b = Arc::new(Direction {
        buffered: watch::Sender::new(0),
    });
    let b_to_a = Arc::new(Direction {
        buffered: watch::Sender::new(0),
    });

    let a = MemoryChannel {
        tx: a_tx,
        outbound: a_to_b.clone(),
        closed: closed.clone(),
        max_message_size,
    };
    let a_inbox = MemoryInbox {
        rx: a_rx,
        inbound: b_to_a.clone(),
        closed: closed.clone(),
    };
    let b = MemoryChannel {
        tx: b_tx,
        outbound: b_to_a,
        closed: closed.clone(),
        max_message_size,
    };
    let b_inbox = MemoryInbox {
        rx: b_rx,
        inbound: a_to_b,
        closed,
    };
    ((a, a_inbox), (b, b_inbox))
}

impl DataChannel for MemoryChannel {
    fn send(&self, payload: ChannelPayload) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        if let Some(max) = self.max_message_size {
            if payload.len() > max {
                return Err(ChannelError::MessageTooLarge {
                    size: payload.len(),
                    max,
                });
            }
        }
        let len = payload.len();
        self.tx.send(payload).map_err(|_| ChannelError::Closed)?;
        self.outbound.buffered.send_modify(|b| *b += len);
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        *self.outbound.buffered.borrow()
    }

    fn buffered_amount_low(&self, threshold: usize) -> ChannelFuture<'_, ()> {
        let mut rx = self.outbound.buffered.subscribe();
        Box::pin(async move {
            let drained = async {
                let _ = rx.wait_for(|b| *b <= threshold).await;
            };
            tokio::select! {
                _ = drained => {}
                _ = self.closed.cancelled() => {}
            }
        })
    }

    fn max_message_size(&self) -> Option<usize> {
        self.max_message_size
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

impl MemoryInbox {
    /// Receives the next message, or `None` once the pair is closed and
    /// everything already queued has been read.
    pub async fn recv(&mut self) -> Option<ChannelPayload> {
        let payload = tokio::select! {
            biased;
            p = self.rx.recv() => p?,
            _ = self.closed.cancelled() => {
                // Drain whatever was queued before the close.
                self.rx.try_recv().ok()?
            }
        };
        let len = payload.len();
        self.inbound
            .buffered
            .send_modify(|b| *b = b.saturating_sub(len));
        Some(payload)
    }

    /// Token cancelled when either end of the pair closes.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}
