use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time to wait for a pong response (or any incoming message).
///
/// Acts as a read deadline on both ends of the signaling socket: if nothing
/// arrives within this window the connection is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often to send pings (must be well below [`WS_PONG_WAIT`]).
pub const WS_PING_PERIOD: Duration = Duration::from_secs(20);

/// Maximum signaling message size in bytes (1 MB).
///
/// Signaling only carries session descriptions and candidates, never file
/// bytes, so this is generous.
pub const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Timeout for request/response operations on the signaling socket.
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval of the sweep that reclaims empty or owner-less flights.
pub const FLIGHT_SWEEP_INTERVAL: Duration = Duration::from_secs(120);

/// Maximum number of members in a flight.
pub const MAX_FLIGHT_MEMBERS: usize = 2;

/// Length of a generated flight code.
pub const FLIGHT_CODE_LEN: usize = 6;

/// Upper bound on the uncompressed size of one file chunk (256 KiB).
pub const MAX_CHUNK_SIZE: usize = 256 * 1024;

/// Upper bound on the byte length of a transfer id inside a data frame.
pub const MAX_TRANSFER_ID_LEN: usize = 128;

/// Signaling message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Requests from peer to server
    #[serde(rename = "create_flight")]
    CreateFlight,
    #[serde(rename = "join_flight")]
    JoinFlight,
    #[serde(rename = "invite_to_flight")]
    InviteToFlight,
    #[serde(rename = "request_to_connect")]
    RequestToConnect,
    #[serde(rename = "leave_flight")]
    LeaveFlight,
    #[serde(rename = "get_nearby_users")]
    GetNearbyUsers,

    // Handshake relay (both directions)
    #[serde(rename = "offer")]
    Offer,
    #[serde(rename = "answer")]
    Answer,
    #[serde(rename = "ice_candidate")]
    IceCandidate,

    // Responses from server to peer
    #[serde(rename = "flight_created")]
    FlightCreated,
    #[serde(rename = "operation_result")]
    OperationResult,
    #[serde(rename = "error")]
    Error,

    // Events from server to peer (push notifications)
    #[serde(rename = "your_name")]
    YourName,
    #[serde(rename = "flight_users")]
    FlightUsers,
    #[serde(rename = "flight_started")]
    FlightStarted,
    #[serde(rename = "nearby_users")]
    NearbyUsers,
    #[serde(rename = "invited_to_flight")]
    InvitedToFlight,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_uses_snake_case_tags() {
        let json = serde_json::to_string(&MessageType::IceCandidate).unwrap();
        assert_eq!(json, "\"ice_candidate\"");

        let parsed: MessageType = serde_json::from_str("\"flight_users\"").unwrap();
        assert_eq!(parsed, MessageType::FlightUsers);
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let result = serde_json::from_str::<MessageType>("\"update_stats\"");
        assert!(result.is_err());
    }

    #[test]
    fn ping_period_below_pong_wait() {
        assert!(WS_PING_PERIOD < WS_PONG_WAIT);
    }
}
