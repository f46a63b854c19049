//! Abstraction over the peer-to-peer transport being negotiated.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;

use airdelivery_protocol::ChannelPayload;
use airdelivery_protocol::types::{IceCandidate, SessionDescription};
use airdelivery_transfer::{CloseReason, DataChannel};

/// Errors raised by a [`PeerTransport`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("remote description not set")]
    NoRemoteDescription,

    #[error("unrecognised session description")]
    UnknownDescription,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("transport closed")]
    Closed,
}

/// A boxed future returned by transport operations.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Something that happened on a transport.
#[derive(Clone)]
pub enum TransportEvent {
    /// A local candidate to forward to the remote peer.
    LocalCandidate(IceCandidate),
    /// The data channel is open and ready for frames.
    ChannelOpen(Arc<dyn DataChannel>),
    /// A message arrived on the data channel.
    Message(ChannelPayload),
    /// The transport went away.
    Closed(CloseReason),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::ChannelOpen(_) => f.write_str("ChannelOpen"),
            Self::Message(p) => write!(f, "Message({} bytes)", p.len()),
            Self::Closed(r) => f.debug_tuple("Closed").field(r).finish(),
        }
    }
}

/// Event sink handed to a transport, tagged with the attempt it belongs to
/// so events from a torn-down attempt can be told apart.
#[derive(Clone)]
pub struct TransportEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl TransportEvents {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Publishes an event. Returns `false` once nobody is listening.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// One connection attempt between two peers.
///
/// Mirrors the browser peer-connection lifecycle: the offerer calls
/// [`create_offer`](Self::create_offer) then
/// [`accept_answer`](Self::accept_answer); the answerer calls
/// [`accept_offer`](Self::accept_offer). Remote candidates are only valid
/// once a remote description has been applied.
pub trait PeerTransport: Send + Sync {
    /// Creates the data channel and returns the local offer.
    fn create_offer(&self) -> TransportFuture<'_, SessionDescription>;

    /// Applies a remote offer and returns the local answer.
    fn accept_offer(&self, offer: SessionDescription) -> TransportFuture<'_, SessionDescription>;

    /// Applies the remote answer.
    fn accept_answer(&self, answer: SessionDescription) -> TransportFuture<'_, ()>;

    /// Applies a remote candidate.
    fn add_remote_candidate(&self, candidate: IceCandidate) -> TransportFuture<'_, ()>;

    /// Tears the transport down. Safe to call more than once.
    fn close(&self);
}

/// Creates transports for new connection attempts.
pub trait TransportFactory: Send + Sync {
    fn create(&self, label: &str, events: TransportEvents) -> Arc<dyn PeerTransport>;
}
