//! In-memory registry of connected peers and their flights.
//!
//! One [`SessionRegistry`] exists per server. Every operation takes the
//! registry lock for its whole duration and pushes the resulting events to
//! the affected peers before returning, so observers always see membership
//! changes in the order they were applied.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, info};

use airdelivery_protocol::constants::{MAX_FLIGHT_MEMBERS, MessageType};
use airdelivery_protocol::messages::{
    DescriptionEvent, FlightStartedEvent, FlightUsersEvent, IceCandidateEvent,
    InvitedToFlightEvent,
};
use airdelivery_protocol::types::{IceCandidate, PeerInfo, SessionDescription};

use crate::address::PeerAddress;
use crate::connection::Sender;
use crate::names;

/// Why a `join_flight` was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("Flight not found")]
    NotFound,

    #[error("Flight is full")]
    Full,
}

/// Why an `invite_to_flight` was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InviteError {
    #[error("Flight not found")]
    NotFound,

    #[error("You are not part of this flight")]
    NotMember,

    #[error("Target user not connected")]
    TargetOffline,
}

/// Why a `request_to_connect` was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("User not found or offline")]
    TargetOffline,
}

/// Read-only view of a flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlightSnapshot {
    pub code: String,
    pub owner_id: String,
    pub members: Vec<String>,
    pub owner_connected: bool,
    pub has_offer: bool,
}

struct PeerEntry {
    name: String,
    address: PeerAddress,
    sender: Sender,
}

struct Flight {
    owner_id: String,
    /// Join order, at most [`MAX_FLIGHT_MEMBERS`].
    members: Vec<String>,
    owner_connected: bool,
    /// Last offer from the owner, replayed to whoever joins next.
    offer: Option<SessionDescription>,
}

#[derive(Default)]
struct State {
    peers: HashMap<String, PeerEntry>,
    flights: HashMap<String, Flight>,
}

/// Owned store of peers and flights.
#[derive(Default)]
pub struct SessionRegistry {
    state: Mutex<State>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new connection under a fresh id and random name, and
    /// pushes `your_name` to it.
    pub fn connect(&self, address: PeerAddress, sender: Sender) -> PeerInfo {
        let info = PeerInfo {
            id: uuid::Uuid::new_v4().to_string(),
            name: names::random_name(),
        };
        info!(peer_id = %info.id, name = %info.name, ip = %address.ip, "peer connected");

        let mut state = self.lock();
        state.peers.insert(
            info.id.clone(),
            PeerEntry {
                name: info.name.clone(),
                address,
                sender,
            },
        );
        state.deliver(&info.id, MessageType::YourName, &info);
        info
    }

    /// Removes a peer. Flights it owned are deleted after a final roster
    /// push; flights it joined lose it as a member.
    pub fn disconnect(&self, peer_id: &str) {
        let mut state = self.lock();
        if state.peers.remove(peer_id).is_none() {
            return;
        }
        state.leave_all(peer_id, true);
        info!(%peer_id, "peer disconnected");
    }

    /// Creates a flight owned by `peer_id` and returns its code.
    pub fn create_flight(&self, peer_id: &str) -> String {
        let mut state = self.lock();
        state.leave_all(peer_id, false);

        let code = names::unique_code(|c| state.flights.contains_key(c));
        state.flights.insert(
            code.clone(),
            Flight {
                owner_id: peer_id.to_owned(),
                members: vec![peer_id.to_owned()],
                owner_connected: true,
                offer: None,
            },
        );
        info!(%peer_id, code = %code, "flight created");
        state.broadcast_roster(&code);
        code
    }

    /// Adds `peer_id` as the second member of `code`.
    ///
    /// Rejoining a flight the peer is already in succeeds without changes.
    /// A stored offer is replayed to the joiner.
    pub fn join_flight(&self, peer_id: &str, code: &str) -> Result<(), JoinError> {
        let mut state = self.lock();
        let flight = state
            .flights
            .get(code)
            .filter(|f| f.owner_connected)
            .ok_or(JoinError::NotFound)?;
        if flight.members.iter().any(|m| m == peer_id) {
            return Ok(());
        }
        if flight.members.len() >= MAX_FLIGHT_MEMBERS {
            debug!(%peer_id, %code, "join refused: flight full");
            return Err(JoinError::Full);
        }

        state.leave_all(peer_id, false);
        let Some(flight) = state.flights.get_mut(code) else {
            return Err(JoinError::NotFound);
        };
        flight.members.push(peer_id.to_owned());
        let replay = flight.offer.clone().map(|sdp| DescriptionEvent {
            from: flight.owner_id.clone(),
            sdp,
        });
        info!(%peer_id, %code, "joined flight");

        if let Some(offer) = replay {
            state.deliver(peer_id, MessageType::Offer, &offer);
        }
        state.broadcast_roster(code);
        Ok(())
    }

    /// Tells `target_id` it was invited to `code`. The target still has to
    /// join on its own.
    pub fn invite(&self, peer_id: &str, target_id: &str, code: &str) -> Result<(), InviteError> {
        let state = self.lock();
        let flight = state.flights.get(code).ok_or(InviteError::NotFound)?;
        if !flight.members.iter().any(|m| m == peer_id) {
            return Err(InviteError::NotMember);
        }
        if !state.peers.contains_key(target_id) {
            return Err(InviteError::TargetOffline);
        }

        let event = InvitedToFlightEvent {
            code: code.to_owned(),
            from_id: peer_id.to_owned(),
            from_name: state.name_of(peer_id),
        };
        state.deliver(target_id, MessageType::InvitedToFlight, &event);
        debug!(%peer_id, %target_id, %code, "invite sent");
        Ok(())
    }

    /// Creates a flight containing the caller (owner) and `target_id`,
    /// notifying both with `flight_started`.
    pub fn request_to_connect(&self, peer_id: &str, target_id: &str) -> Result<String, ConnectError> {
        let mut state = self.lock();
        if peer_id == target_id || !state.peers.contains_key(target_id) {
            return Err(ConnectError::TargetOffline);
        }
        state.leave_all(peer_id, false);
        state.leave_all(target_id, false);

        let code = names::unique_code(|c| state.flights.contains_key(c));
        state.flights.insert(
            code.clone(),
            Flight {
                owner_id: peer_id.to_owned(),
                members: vec![peer_id.to_owned(), target_id.to_owned()],
                owner_connected: true,
                offer: None,
            },
        );
        info!(%peer_id, %target_id, code = %code, "direct flight started");

        let event = FlightStartedEvent {
            code: code.clone(),
            owner_id: peer_id.to_owned(),
            members: vec![state.info_of(peer_id), state.info_of(target_id)],
        };
        state.deliver(peer_id, MessageType::FlightStarted, &event);
        state.deliver(target_id, MessageType::FlightStarted, &event);
        state.broadcast_roster(&code);
        Ok(code)
    }

    /// Stores the owner's offer and forwards it to the other member, if any.
    pub fn relay_offer(&self, peer_id: &str, code: &str, sdp: SessionDescription) -> bool {
        let mut state = self.lock();
        let Some(flight) = state.flights.get_mut(code) else {
            debug!(%peer_id, %code, "offer for unknown flight");
            return false;
        };
        if !flight.members.iter().any(|m| m == peer_id) {
            debug!(%peer_id, %code, "offer from non-member");
            return false;
        }
        flight.offer = Some(sdp.clone());
        let others: Vec<String> = flight
            .members
            .iter()
            .filter(|m| *m != peer_id)
            .cloned()
            .collect();

        let event = DescriptionEvent {
            from: peer_id.to_owned(),
            sdp,
        };
        for other in &others {
            state.deliver(other, MessageType::Offer, &event);
        }
        true
    }

    /// Forwards an answer to the flight owner only.
    pub fn relay_answer(&self, peer_id: &str, code: &str, sdp: SessionDescription) -> bool {
        let state = self.lock();
        let Some(flight) = state.flights.get(code) else {
            return false;
        };
        if flight.owner_id == peer_id
            || !flight.owner_connected
            || !flight.members.iter().any(|m| m == peer_id)
        {
            debug!(%peer_id, %code, "answer not relayable");
            return false;
        }
        let event = DescriptionEvent {
            from: peer_id.to_owned(),
            sdp,
        };
        state.deliver(&flight.owner_id, MessageType::Answer, &event);
        true
    }

    /// Forwards a candidate to `target_id` when both share a flight.
    pub fn relay_candidate(&self, peer_id: &str, target_id: &str, candidate: IceCandidate) -> bool {
        let state = self.lock();
        let shared = state.flights.values().any(|f| {
            f.members.iter().any(|m| m == peer_id) && f.members.iter().any(|m| m == target_id)
        });
        if !shared {
            debug!(%peer_id, %target_id, "candidate between non-members dropped");
            return false;
        }
        let event = IceCandidateEvent {
            from: peer_id.to_owned(),
            candidate,
        };
        state.deliver(target_id, MessageType::IceCandidate, &event);
        true
    }

    /// Removes the caller from every flight it belongs to.
    pub fn leave(&self, peer_id: &str) {
        self.lock().leave_all(peer_id, false);
    }

    /// Peers outside any flight whose address group matches the caller's.
    pub fn nearby(&self, peer_id: &str) -> Vec<PeerInfo> {
        let state = self.lock();
        let Some(me) = state.peers.get(peer_id) else {
            return Vec::new();
        };
        let mut users: Vec<PeerInfo> = state
            .peers
            .iter()
            .filter(|(id, _)| id.as_str() != peer_id)
            .filter(|(id, entry)| !state.is_busy(id) && me.address.is_nearby(&entry.address))
            .map(|(id, entry)| PeerInfo {
                id: id.clone(),
                name: entry.name.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        users
    }

    /// Deletes flights that are empty or whose owner is gone. Returns how
    /// many were removed.
    pub fn sweep(&self) -> usize {
        let mut state = self.lock();
        let before = state.flights.len();
        state.flights.retain(|code, f| {
            let keep = !f.members.is_empty() && f.owner_connected;
            if !keep {
                info!(%code, "removed inactive flight");
            }
            keep
        });
        before - state.flights.len()
    }

    pub fn flight(&self, code: &str) -> Option<FlightSnapshot> {
        self.lock().flights.get(code).map(|f| FlightSnapshot {
            code: code.to_owned(),
            owner_id: f.owner_id.clone(),
            members: f.members.clone(),
            owner_connected: f.owner_connected,
            has_offer: f.offer.is_some(),
        })
    }

    /// Returns `true` if the peer is a member of any flight.
    pub fn is_busy(&self, peer_id: &str) -> bool {
        self.lock().is_busy(peer_id)
    }

    pub fn peer_count(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn flight_count(&self) -> usize {
        self.lock().flights.len()
    }
}

impl State {
    fn is_busy(&self, peer_id: &str) -> bool {
        self.flights
            .values()
            .any(|f| f.members.iter().any(|m| m == peer_id))
    }

    fn name_of(&self, peer_id: &str) -> String {
        self.peers
            .get(peer_id)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "Unknown".to_owned())
    }

    fn info_of(&self, peer_id: &str) -> PeerInfo {
        PeerInfo {
            id: peer_id.to_owned(),
            name: self.name_of(peer_id),
        }
    }

    fn deliver<T: Serialize>(&self, peer_id: &str, msg_type: MessageType, payload: &T) {
        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };
        if let Err(e) = peer.sender.push(msg_type.clone(), payload) {
            debug!(%peer_id, ?msg_type, "push dropped: {e}");
        }
    }

    fn broadcast_roster(&self, code: &str) {
        let Some(flight) = self.flights.get(code) else {
            return;
        };
        let event = FlightUsersEvent {
            code: code.to_owned(),
            owner_id: flight.owner_id.clone(),
            members: flight.members.iter().map(|m| self.info_of(m)).collect(),
            owner_connected: flight.owner_connected,
        };
        for member in &flight.members {
            self.deliver(member, MessageType::FlightUsers, &event);
        }
    }

    /// Drops `peer_id` from all flights and pushes updated rosters.
    ///
    /// An owner leaving marks its flight owner-disconnected so the sweep
    /// reclaims it; an owner disconnecting deletes it outright. Any stored
    /// offer is discarded since it was negotiated for the old pair.
    fn leave_all(&mut self, peer_id: &str, disconnected: bool) {
        let codes: Vec<String> = self
            .flights
            .iter()
            .filter(|(_, f)| f.owner_id == peer_id || f.members.iter().any(|m| m == peer_id))
            .map(|(code, _)| code.clone())
            .collect();

        for code in codes {
            let Some(flight) = self.flights.get_mut(&code) else {
                continue;
            };
            let was_member = flight.members.iter().any(|m| m == peer_id);
            flight.members.retain(|m| m != peer_id);
            flight.offer = None;
            let owner = flight.owner_id == peer_id;
            if owner {
                flight.owner_connected = false;
            }
            let empty = flight.members.is_empty();

            if owner || was_member {
                debug!(%peer_id, code = %code, owner, "left flight");
                self.broadcast_roster(&code);
            }
            if empty || (owner && disconnected) {
                self.flights.remove(&code);
                debug!(code = %code, "flight deleted");
            }
        }
    }
}
