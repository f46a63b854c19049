use serde::{Deserialize, Serialize};

use crate::types::{IceCandidate, PeerInfo, SessionDescription};

// ---------------------------------------------------------------------------
// Requests (peer -> server)
// ---------------------------------------------------------------------------

/// Payload of `join_flight`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinFlightRequest {
    pub code: String,
}

/// Payload of `invite_to_flight`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteToFlightRequest {
    pub target_id: String,
    pub code: String,
}

/// Payload of `request_to_connect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestToConnectRequest {
    pub target_id: String,
}

/// Payload of an outgoing `offer` or `answer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptionRequest {
    pub code: String,
    pub sdp: SessionDescription,
}

/// Payload of an outgoing `ice_candidate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateRequest {
    pub target_id: String,
    pub candidate: IceCandidate,
}

// ---------------------------------------------------------------------------
// Responses (server -> peer)
// ---------------------------------------------------------------------------

/// Response to `create_flight`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightCreatedResponse {
    pub code: String,
}

/// Generic success/failure response used by join, invite and connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OperationResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

impl<E: std::fmt::Display> From<Result<(), E>> for OperationResult {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self::failed(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Events (server -> peer, pushed)
// ---------------------------------------------------------------------------

/// Pushed once on connect with the identity the server assigned.
pub type YourNameEvent = PeerInfo;

/// Relayed `offer` or `answer`, tagged with the sender's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptionEvent {
    pub from: String,
    pub sdp: SessionDescription,
}

/// Relayed `ice_candidate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidateEvent {
    pub from: String,
    pub candidate: IceCandidate,
}

/// Current roster of a flight, pushed to its members on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlightUsersEvent {
    pub code: String,
    pub owner_id: String,
    pub members: Vec<PeerInfo>,
    pub owner_connected: bool,
}

/// A flight created on behalf of two peers by `request_to_connect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlightStartedEvent {
    pub code: String,
    pub owner_id: String,
    pub members: Vec<PeerInfo>,
}

/// Answer to `get_nearby_users`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyUsersEvent {
    pub users: Vec<PeerInfo>,
}

/// Notification that another peer invited us into a flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitedToFlightEvent {
    pub code: String,
    pub from_id: String,
    pub from_name: String,
}
