//! Rendezvous server for AirDelivery peers.
//!
//! Peers connect over WebSocket, receive a session-scoped identity, and use
//! the server to create or join flights (two-member sessions), discover
//! nearby peers and relay the offer/answer/candidate handshake. File bytes
//! never pass through here.

mod address;
mod connection;
mod handler;
mod names;
mod registry;
mod server;

pub use address::{AddressGroup, PeerAddress, client_ip};
pub use connection::{SendError, Sender};
pub use registry::{ConnectError, FlightSnapshot, InviteError, JoinError, SessionRegistry};
pub use server::{RendezvousServer, ServerConfig};

/// Outbound queue capacity per connection.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors produced by the rendezvous server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
