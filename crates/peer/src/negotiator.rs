//! Connection negotiation between the two members of a flight.
//!
//! The owner offers as soon as the roster shows exactly one other member;
//! the member answers. Remote candidates that arrive before the remote
//! description is applied are held back and flushed in arrival order.
//!
//! The negotiator never talks to the network itself: every input returns
//! the [`Action`]s the caller must carry out, which keeps all negotiation
//! state on a single task.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use airdelivery_protocol::ChannelPayload;
use airdelivery_protocol::messages::FlightUsersEvent;
use airdelivery_protocol::types::{IceCandidate, SessionDescription};
use airdelivery_transfer::{CloseReason, DataChannel};

use crate::transport::{
    PeerTransport, TransportError, TransportEvent, TransportEvents, TransportFactory,
};

/// Negotiator configuration.
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// WebSocket URL of the rendezvous server.
    pub signaling_url: String,
    /// Label of the data channel the offerer creates.
    pub channel_label: String,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:5500".into(),
            channel_label: "fileTransfer".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Offering,
    AwaitingAnswer,
    AwaitingOffer,
    Answering,
    Connected,
    Closed,
}

/// Which side of the handshake this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Flight owner: creates the offer.
    Owner,
    /// Joined member: answers.
    Member,
}

/// Work the caller must perform on behalf of the negotiator.
pub enum Action {
    SendOffer {
        code: String,
        sdp: SessionDescription,
    },
    SendAnswer {
        code: String,
        sdp: SessionDescription,
    },
    SendCandidate {
        target_id: String,
        candidate: IceCandidate,
    },
    /// The data channel is open.
    ChannelUp(Arc<dyn DataChannel>),
    /// A message arrived on the data channel.
    Deliver(ChannelPayload),
    /// The data channel went away.
    ChannelDown(CloseReason),
    /// The transport closed before its data channel ever opened.
    HandshakeFailed(CloseReason),
    /// Tell the rendezvous server we left the flight.
    Leave,
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendOffer { code, .. } => write!(f, "SendOffer({code})"),
            Self::SendAnswer { code, .. } => write!(f, "SendAnswer({code})"),
            Self::SendCandidate { target_id, .. } => write!(f, "SendCandidate({target_id})"),
            Self::ChannelUp(_) => f.write_str("ChannelUp"),
            Self::Deliver(p) => write!(f, "Deliver({} bytes)", p.len()),
            Self::ChannelDown(r) => write!(f, "ChannelDown({r:?})"),
            Self::HandshakeFailed(r) => write!(f, "HandshakeFailed({r:?})"),
            Self::Leave => f.write_str("Leave"),
        }
    }
}

/// Per-peer negotiation state machine.
pub struct Negotiator {
    config: NegotiatorConfig,
    self_id: String,
    factory: Arc<dyn TransportFactory>,
    events_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    generation: u64,
    state: NegotiationState,
    role: Option<Role>,
    code: Option<String>,
    remote_peer: Option<String>,
    transport: Option<Arc<dyn PeerTransport>>,
    remote_set: bool,
    channel_up: bool,
    /// Remote candidates received before the remote description, with
    /// the id of the peer that sent them.
    early_candidates: Vec<(String, IceCandidate)>,
}

impl Negotiator {
    /// Creates a negotiator for the peer `self_id`. Transport events must
    /// be fed back through [`on_transport_event`](Self::on_transport_event).
    pub fn new(
        config: NegotiatorConfig,
        self_id: impl Into<String>,
        factory: Arc<dyn TransportFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<(u64, TransportEvent)>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let negotiator = Self {
            config,
            self_id: self_id.into(),
            factory,
            events_tx,
            generation: 0,
            state: NegotiationState::Idle,
            role: None,
            code: None,
            remote_peer: None,
            transport: None,
            remote_set: false,
            channel_up: false,
            early_candidates: Vec::new(),
        };
        (negotiator, events_rx)
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// Code of the flight being negotiated in.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn remote_peer(&self) -> Option<&str> {
        self.remote_peer.as_deref()
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    /// Prepares to negotiate inside flight `code`. Any previous attempt is
    /// torn down.
    pub fn connect(&mut self, code: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.code.as_deref() != Some(code) {
            self.teardown(&mut actions);
            self.early_candidates.clear();
            self.role = None;
            self.remote_peer = None;
        }
        self.code = Some(code.to_owned());
        if self.state == NegotiationState::Closed {
            self.state = NegotiationState::Idle;
        }
        actions
    }

    /// Reacts to a roster update for the current flight.
    pub async fn on_roster(&mut self, roster: &FlightUsersEvent) -> Result<Vec<Action>, TransportError> {
        let mut actions = Vec::new();
        if self.code.as_deref() != Some(roster.code.as_str()) {
            actions.extend(self.connect(&roster.code));
        }

        let others: Vec<_> = roster
            .members
            .iter()
            .filter(|m| m.id != self.self_id)
            .collect();

        if roster.owner_id == self.self_id {
            self.role = Some(Role::Owner);
            match others.as_slice() {
                [] => {
                    if self.transport.is_some() || self.state != NegotiationState::Idle {
                        debug!("remote member left, back to idle");
                        self.teardown(&mut actions);
                        self.state = NegotiationState::Idle;
                    }
                }
                [other] if self.state == NegotiationState::Idle => {
                    self.remote_peer = Some(other.id.clone());
                    actions.push(self.start_offer().await?);
                }
                _ => {}
            }
        } else {
            self.role = Some(Role::Member);
            if !roster.owner_connected {
                debug!("flight owner gone");
                self.teardown(&mut actions);
                self.state = NegotiationState::Idle;
            } else if self.state == NegotiationState::Idle {
                self.remote_peer = Some(roster.owner_id.clone());
                self.state = NegotiationState::AwaitingOffer;
            }
        }
        Ok(actions)
    }

    async fn start_offer(&mut self) -> Result<Action, TransportError> {
        let code = self
            .code
            .clone()
            .ok_or(TransportError::InvalidState("no flight code"))?;
        self.state = NegotiationState::Offering;
        let transport = self.new_transport();
        match transport.create_offer().await {
            Ok(sdp) => {
                info!(%code, remote = ?self.remote_peer, "sending offer");
                self.state = NegotiationState::AwaitingAnswer;
                Ok(Action::SendOffer { code, sdp })
            }
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    /// Handles a relayed offer from `from`.
    pub async fn on_offer(
        &mut self,
        from: &str,
        sdp: SessionDescription,
    ) -> Result<Vec<Action>, TransportError> {
        if self.role == Some(Role::Owner) || self.state == NegotiationState::Closed {
            debug!(%from, state = ?self.state, "ignoring offer");
            return Ok(Vec::new());
        }
        let code = self
            .code
            .clone()
            .ok_or(TransportError::InvalidState("no flight code"))?;

        let mut actions = Vec::new();
        self.teardown(&mut actions);
        self.role = Some(Role::Member);
        self.remote_peer = Some(from.to_owned());
        self.state = NegotiationState::Answering;

        let transport = self.new_transport();
        let answer = match transport.accept_offer(sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                self.fail();
                return Err(e);
            }
        };
        self.remote_set = true;
        self.flush_candidates().await;

        info!(%code, %from, "sending answer");
        actions.push(Action::SendAnswer { code, sdp: answer });
        Ok(actions)
    }

    /// Handles a relayed answer from `from`.
    pub async fn on_answer(&mut self, from: &str, sdp: SessionDescription) -> Result<(), TransportError> {
        if self.state != NegotiationState::AwaitingAnswer
            || self.remote_set
            || self.remote_peer.as_deref() != Some(from)
        {
            debug!(%from, state = ?self.state, "ignoring answer");
            return Ok(());
        }
        let Some(transport) = self.transport.clone() else {
            return Ok(());
        };
        if let Err(e) = transport.accept_answer(sdp).await {
            self.fail();
            return Err(e);
        }
        self.remote_set = true;
        self.flush_candidates().await;
        Ok(())
    }

    /// Handles a relayed candidate. Buffered until the remote description
    /// is applied.
    pub async fn on_remote_candidate(&mut self, from: &str, candidate: IceCandidate) {
        match &self.transport {
            Some(transport) if self.remote_set && self.remote_peer.as_deref() == Some(from) => {
                if let Err(e) = transport.add_remote_candidate(candidate).await {
                    warn!(%from, "failed to add candidate: {e}");
                }
            }
            _ => {
                debug!(%from, "buffering early candidate");
                self.early_candidates.push((from.to_owned(), candidate));
            }
        }
    }

    async fn flush_candidates(&mut self) {
        let Some(transport) = self.transport.clone() else {
            return;
        };
        let buffered = std::mem::take(&mut self.early_candidates);
        for (from, candidate) in buffered {
            if self.remote_peer.as_deref() != Some(from.as_str()) {
                debug!(%from, "dropping candidate from another peer");
                continue;
            }
            if let Err(e) = transport.add_remote_candidate(candidate).await {
                warn!(%from, "failed to add buffered candidate: {e}");
            }
        }
    }

    /// Handles an event from the transport created for `generation`.
    /// Events from torn-down attempts are ignored.
    pub fn on_transport_event(&mut self, generation: u64, event: TransportEvent) -> Vec<Action> {
        if generation != self.generation || self.transport.is_none() {
            debug!(generation, ?event, "stale transport event");
            return Vec::new();
        }
        match event {
            TransportEvent::LocalCandidate(candidate) => match &self.remote_peer {
                Some(target) => vec![Action::SendCandidate {
                    target_id: target.clone(),
                    candidate,
                }],
                None => Vec::new(),
            },
            TransportEvent::ChannelOpen(channel) => {
                info!(remote = ?self.remote_peer, "data channel open");
                self.state = NegotiationState::Connected;
                self.channel_up = true;
                vec![Action::ChannelUp(channel)]
            }
            TransportEvent::Message(payload) => vec![Action::Deliver(payload)],
            TransportEvent::Closed(reason) => {
                info!(?reason, "data channel closed");
                let was_up = self.channel_up;
                self.channel_up = false;
                self.drop_transport();
                self.state = NegotiationState::Closed;
                if was_up {
                    vec![Action::ChannelDown(reason)]
                } else {
                    warn!(?reason, "transport closed during handshake");
                    vec![Action::HandshakeFailed(reason)]
                }
            }
        }
    }

    /// Tears everything down and leaves the flight. Calling it again does
    /// nothing.
    pub fn disconnect(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.teardown(&mut actions);
        self.early_candidates.clear();
        self.role = None;
        self.remote_peer = None;
        self.state = NegotiationState::Closed;
        if self.code.take().is_some() {
            actions.push(Action::Leave);
        }
        actions
    }

    fn new_transport(&mut self) -> Arc<dyn PeerTransport> {
        self.generation += 1;
        let events = TransportEvents::new(self.generation, self.events_tx.clone());
        let transport = self.factory.create(&self.config.channel_label, events);
        self.transport = Some(transport.clone());
        self.remote_set = false;
        transport
    }

    fn drop_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        self.generation += 1;
        self.remote_set = false;
    }

    /// Closes the current attempt, reporting the channel as closed if it
    /// was up.
    fn teardown(&mut self, actions: &mut Vec<Action>) {
        if self.channel_up {
            self.channel_up = false;
            actions.push(Action::ChannelDown(CloseReason::Closed));
        }
        self.drop_transport();
    }

    fn fail(&mut self) {
        self.drop_transport();
        self.state = NegotiationState::Closed;
    }
}
