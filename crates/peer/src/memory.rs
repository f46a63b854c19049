//! In-process transport: peers sharing a [`MemoryNetwork`] negotiate
//! through real signaling and end up connected by a memory channel pair.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use airdelivery_protocol::types::{IceCandidate, SessionDescription};
use airdelivery_transfer::{CloseReason, DataChannel, MemoryChannel, MemoryInbox, memory_channel_pair};

use crate::transport::{
    PeerTransport, TransportError, TransportEvent, TransportEvents, TransportFactory,
    TransportFuture,
};

/// Candidates each side advertises after producing its description.
const LOCAL_CANDIDATES: u32 = 2;

/// Shared medium the memory transports find each other through.
///
/// The offer carries a token; the answerer looks it up here to build the
/// channel pair, and applying the answer opens both ends.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    max_message_size: Option<usize>,
    links: Mutex<HashMap<String, Link>>,
    open: Mutex<Vec<OpenLink>>,
    applied: Mutex<Vec<String>>,
}

#[derive(Default)]
struct Link {
    /// Filled in once the offer is accepted.
    accepted: Option<Accepted>,
}

struct Accepted {
    offerer: (MemoryChannel, MemoryInbox),
    answerer: (MemoryChannel, MemoryInbox),
    answerer_events: TransportEvents,
}

struct OpenLink {
    channel: MemoryChannel,
    failed: Arc<AtomicBool>,
}

impl MemoryNetwork {
    /// Creates a network whose channels reject messages above
    /// `max_message_size`.
    pub fn new(max_message_size: Option<usize>) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                max_message_size,
                ..NetworkInner::default()
            }),
        }
    }

    /// Every remote candidate applied on this network, in order.
    pub fn applied_candidates(&self) -> Vec<String> {
        lock(&self.inner.applied).clone()
    }

    /// Simulates a transport failure on every open channel.
    pub fn fail_all(&self) {
        for link in lock(&self.inner.open).drain(..) {
            link.failed.store(true, Ordering::SeqCst);
            link.channel.close();
        }
    }

    /// Number of channels currently open.
    pub fn open_channels(&self) -> usize {
        let mut open = lock(&self.inner.open);
        open.retain(|l| l.channel.is_open());
        open.len()
    }

    fn open(&self, offerer: TransportEvents, accepted: Accepted) {
        let failed = Arc::new(AtomicBool::new(false));
        lock(&self.inner.open).push(OpenLink {
            channel: accepted.offerer.0.clone(),
            failed: failed.clone(),
        });
        let (chan, inbox) = accepted.offerer;
        open_end(chan, inbox, offerer, failed.clone());
        let (chan, inbox) = accepted.answerer;
        open_end(chan, inbox, accepted.answerer_events, failed);
    }
}

impl TransportFactory for MemoryNetwork {
    fn create(&self, label: &str, events: TransportEvents) -> Arc<dyn PeerTransport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
            label: label.to_owned(),
            events,
            state: Mutex::new(State::default()),
        })
    }
}

/// Announces the channel and forwards everything arriving on it until the
/// pair closes.
fn open_end(
    channel: MemoryChannel,
    mut inbox: MemoryInbox,
    events: TransportEvents,
    failed: Arc<AtomicBool>,
) {
    let channel: Arc<dyn DataChannel> = Arc::new(channel);
    events.emit(TransportEvent::ChannelOpen(channel));
    tokio::spawn(async move {
        while let Some(payload) = inbox.recv().await {
            if !events.emit(TransportEvent::Message(payload)) {
                return;
            }
        }
        let reason = if failed.load(Ordering::SeqCst) {
            CloseReason::Failed
        } else {
            CloseReason::Closed
        };
        events.emit(TransportEvent::Closed(reason));
    });
}

/// One side of a memory connection attempt.
pub struct MemoryTransport {
    network: MemoryNetwork,
    label: String,
    events: TransportEvents,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    token: Option<String>,
    offerer: bool,
    remote_set: bool,
    channel: Option<MemoryChannel>,
    closed: bool,
}

impl MemoryTransport {
    fn description(&self, token: &str) -> String {
        format!("memory {token} {}", self.label)
    }

    fn advertise_candidates(&self, token: &str) {
        for n in 0..LOCAL_CANDIDATES {
            let candidate = IceCandidate {
                candidate: format!("candidate:{n} 1 memory {token} typ host"),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            };
            self.events.emit(TransportEvent::LocalCandidate(candidate));
        }
    }
}

fn token_of(desc: &SessionDescription) -> Result<String, TransportError> {
    let mut parts = desc.sdp.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("memory"), Some(token)) => Ok(token.to_owned()),
        _ => Err(TransportError::UnknownDescription),
    }
}

impl PeerTransport for MemoryTransport {
    fn create_offer(&self) -> TransportFuture<'_, SessionDescription> {
        Box::pin(async move {
            let token = uuid::Uuid::new_v4().simple().to_string();
            {
                let mut state = lock(&self.state);
                if state.closed {
                    return Err(TransportError::Closed);
                }
                if state.token.is_some() {
                    return Err(TransportError::InvalidState("offer already created"));
                }
                state.token = Some(token.clone());
                state.offerer = true;
            }
            lock(&self.network.inner.links).insert(token.clone(), Link::default());
            debug!(%token, label = %self.label, "memory offer created");

            self.advertise_candidates(&token);
            Ok(SessionDescription::offer(self.description(&token)))
        })
    }

    fn accept_offer(&self, offer: SessionDescription) -> TransportFuture<'_, SessionDescription> {
        Box::pin(async move {
            let token = token_of(&offer)?;
            {
                let state = lock(&self.state);
                if state.closed {
                    return Err(TransportError::Closed);
                }
                if state.token.is_some() {
                    return Err(TransportError::InvalidState("remote offer already applied"));
                }
            }

            let (offerer, answerer) = memory_channel_pair(self.network.inner.max_message_size);
            let answerer_channel = answerer.0.clone();
            {
                let mut links = lock(&self.network.inner.links);
                let link = links
                    .get_mut(&token)
                    .ok_or(TransportError::UnknownDescription)?;
                link.accepted = Some(Accepted {
                    offerer,
                    answerer,
                    answerer_events: self.events.clone(),
                });
            }
            {
                let mut state = lock(&self.state);
                state.token = Some(token.clone());
                state.remote_set = true;
                state.channel = Some(answerer_channel);
            }
            debug!(%token, "memory offer accepted");

            self.advertise_candidates(&token);
            Ok(SessionDescription::answer(self.description(&token)))
        })
    }

    fn accept_answer(&self, answer: SessionDescription) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let token = token_of(&answer)?;
            {
                let state = lock(&self.state);
                if state.closed {
                    return Err(TransportError::Closed);
                }
                if !state.offerer || state.token.as_deref() != Some(token.as_str()) {
                    return Err(TransportError::UnknownDescription);
                }
                if state.remote_set {
                    return Err(TransportError::InvalidState("answer already applied"));
                }
            }

            let accepted = lock(&self.network.inner.links)
                .remove(&token)
                .and_then(|l| l.accepted)
                .ok_or(TransportError::UnknownDescription)?;
            {
                let mut state = lock(&self.state);
                state.remote_set = true;
                state.channel = Some(accepted.offerer.0.clone());
            }
            debug!(%token, "memory answer applied, opening channel");

            self.network.open(self.events.clone(), accepted);
            Ok(())
        })
    }

    fn add_remote_candidate(&self, candidate: IceCandidate) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            {
                let state = lock(&self.state);
                if state.closed {
                    return Err(TransportError::Closed);
                }
                if !state.remote_set {
                    return Err(TransportError::NoRemoteDescription);
                }
            }
            lock(&self.network.inner.applied).push(candidate.candidate);
            Ok(())
        })
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.closed = true;
        if let Some(channel) = state.channel.take() {
            channel.close();
        }
        if let Some(token) = &state.token {
            lock(&self.network.inner.links).remove(token);
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use airdelivery_protocol::ChannelPayload;
    use tokio::sync::mpsc;

    type Events = mpsc::UnboundedReceiver<(u64, TransportEvent)>;

    fn transport(network: &MemoryNetwork) -> (Arc<dyn PeerTransport>, Events) {
        let (tx, rx) = mpsc::unbounded_channel();
        (network.create("fileTransfer", TransportEvents::new(1, tx)), rx)
    }

    async fn next(events: &mut Events) -> TransportEvent {
        events.recv().await.expect("events closed").1
    }

    async fn next_open(events: &mut Events) -> Arc<dyn DataChannel> {
        loop {
            if let TransportEvent::ChannelOpen(c) = next(events).await {
                return c;
            }
        }
    }

    #[tokio::test]
    async fn offer_answer_opens_both_ends() {
        let network = MemoryNetwork::default();
        let (a, mut a_events) = transport(&network);
        let (b, mut b_events) = transport(&network);

        let offer = a.create_offer().await.unwrap();
        let answer = b.accept_offer(offer).await.unwrap();
        a.accept_answer(answer).await.unwrap();

        let a_chan = next_open(&mut a_events).await;
        let b_chan = next_open(&mut b_events).await;
        a_chan.send(ChannelPayload::Text("ping".into())).unwrap();
        b_chan.send(ChannelPayload::Text("pong".into())).unwrap();

        assert!(matches!(next(&mut b_events).await, TransportEvent::Message(ChannelPayload::Text(t)) if t == "ping"));
        assert!(matches!(next(&mut a_events).await, TransportEvent::Message(ChannelPayload::Text(t)) if t == "pong"));
        assert_eq!(network.open_channels(), 1);
    }

    #[tokio::test]
    async fn candidates_advertised_and_require_remote_description() {
        let network = MemoryNetwork::default();
        let (a, mut a_events) = transport(&network);

        a.create_offer().await.unwrap();
        assert!(matches!(next(&mut a_events).await, TransportEvent::LocalCandidate(_)));
        assert!(matches!(next(&mut a_events).await, TransportEvent::LocalCandidate(_)));

        let early = a.add_remote_candidate(IceCandidate::new("c0")).await;
        assert!(matches!(early, Err(TransportError::NoRemoteDescription)));
        assert!(network.applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn unknown_offer_is_rejected() {
        let network = MemoryNetwork::default();
        let (b, _events) = transport(&network);
        let result = b.accept_offer(SessionDescription::offer("memory nope x")).await;
        assert!(matches!(result, Err(TransportError::UnknownDescription)));
        let result = b.accept_offer(SessionDescription::offer("v=0")).await;
        assert!(matches!(result, Err(TransportError::UnknownDescription)));
    }

    #[tokio::test]
    async fn close_is_orderly_and_failure_is_reported() {
        let network = MemoryNetwork::default();
        let (a, mut a_events) = transport(&network);
        let (b, mut b_events) = transport(&network);
        let answer = b.accept_offer(a.create_offer().await.unwrap()).await.unwrap();
        a.accept_answer(answer).await.unwrap();
        next_open(&mut a_events).await;
        next_open(&mut b_events).await;

        network.fail_all();
        assert!(matches!(next(&mut a_events).await, TransportEvent::Closed(CloseReason::Failed)));
        assert!(matches!(next(&mut b_events).await, TransportEvent::Closed(CloseReason::Failed)));

        let (c, mut c_events) = transport(&network);
        let (d, mut d_events) = transport(&network);
        let answer = d.accept_offer(c.create_offer().await.unwrap()).await.unwrap();
        c.accept_answer(answer).await.unwrap();
        next_open(&mut c_events).await;
        next_open(&mut d_events).await;

        c.close();
        c.close();
        loop {
            match next(&mut d_events).await {
                TransportEvent::Closed(reason) => {
                    assert_eq!(reason, CloseReason::Closed);
                    break;
                }
                _ => continue,
            }
        }
    }
}
