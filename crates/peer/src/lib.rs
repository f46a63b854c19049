//! Peer side of AirDelivery.
//!
//! Talks to the rendezvous server, negotiates a direct channel with the
//! other flight member and hands that channel to the transfer engine.

mod memory;
mod negotiator;
mod pumps;
mod session;
mod signaling;
mod transport;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use negotiator::{Action, NegotiationState, Negotiator, NegotiatorConfig, Role};
pub use session::{PeerSession, SessionEvent};
pub use signaling::SignalingClient;
pub use transport::{
    PeerTransport, TransportError, TransportEvent, TransportEvents, TransportFactory,
    TransportFuture,
};

use airdelivery_protocol::constants::MessageType;
use tokio_tungstenite::tungstenite;

/// Errors talking to the rendezvous server.
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("missing payload in {0:?}")]
    MissingPayload(MessageType),

    /// The server refused the operation; carries its reason.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },
}
