//! A peer's whole session: signaling, negotiation and the transfer engine
//! driven from one event loop.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use airdelivery_protocol::constants::MessageType;
use airdelivery_protocol::envelope::Message;
use airdelivery_protocol::messages::{
    DescriptionEvent, FlightStartedEvent, FlightUsersEvent, IceCandidateEvent,
    InvitedToFlightEvent, NearbyUsersEvent,
};
use airdelivery_protocol::types::PeerInfo;
use airdelivery_protocol::{ChannelPayload, ControlFrame};
use airdelivery_transfer::{
    ChannelError, CloseReason, DataChannel, EngineConfig, TransferEngine, TransferEvent,
};

use crate::SignalingError;
use crate::negotiator::{Action, Negotiator, NegotiatorConfig};
use crate::signaling::SignalingClient;
use crate::transport::{TransportError, TransportEvent, TransportFactory};

/// Notifications for the application layer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Membership of the current flight changed.
    Roster(FlightUsersEvent),
    /// A direct connect request put this peer into a new flight.
    FlightStarted(FlightStartedEvent),
    Invited(InvitedToFlightEvent),
    Nearby(Vec<PeerInfo>),
    /// The data channel to the other member is open.
    Connected,
    /// The data channel closed; transfers were notified with `reason`.
    Disconnected(CloseReason),
    /// Negotiation failed locally.
    NegotiationFailed(String),
    Transfer(TransferEvent),
    /// The rendezvous connection was lost. An open data channel survives.
    SignalingLost,
}

enum Command {
    Connect(String),
    Reset,
    Disconnect(oneshot::Sender<()>),
}

type ChannelSlot = Arc<Mutex<Option<Arc<dyn DataChannel>>>>;

/// Connected peer: joins flights, negotiates the channel and moves files.
pub struct PeerSession {
    signaling: Arc<SignalingClient>,
    engine: TransferEngine,
    commands: mpsc::UnboundedSender<Command>,
    channel: ChannelSlot,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PeerSession {
    /// Connects to the rendezvous server and starts the session loop.
    pub async fn connect(
        config: NegotiatorConfig,
        engine_config: EngineConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), SignalingError> {
        let (client, pushes) = SignalingClient::connect(&config.signaling_url).await?;
        let signaling = Arc::new(client);

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let engine = TransferEngine::new(engine_config, engine_tx);
        let (negotiator, transport_rx) =
            Negotiator::new(config, signaling.identity().id.clone(), factory);
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel: ChannelSlot = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();

        let session_loop = SessionLoop {
            negotiator,
            signaling: Arc::clone(&signaling),
            engine: engine.clone(),
            channel: Arc::clone(&channel),
            events: events_tx,
        };
        let task = tokio::spawn(session_loop.run(
            commands_rx,
            pushes,
            transport_rx,
            engine_rx,
            cancel.clone(),
        ));

        let session = Self {
            signaling,
            engine,
            commands,
            channel,
            cancel,
            task,
        };
        Ok((session, events_rx))
    }

    pub fn identity(&self) -> &PeerInfo {
        self.signaling.identity()
    }

    /// The transfer engine bound to this session's channel.
    pub fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.channel).as_ref().is_some_and(|c| c.is_open())
    }

    /// Opens a flight owned by this peer. Negotiation starts by itself
    /// once someone joins.
    pub async fn create_flight(&self) -> Result<String, SignalingError> {
        let code = self.signaling.create_flight().await?;
        let _ = self.commands.send(Command::Connect(code.clone()));
        Ok(code)
    }

    /// Joins flight `code`; the owner's offer follows.
    pub async fn join_flight(&self, code: &str) -> Result<(), SignalingError> {
        // A stored offer is replayed before the reply arrives.
        let _ = self.commands.send(Command::Connect(code.to_owned()));
        let result = self.signaling.join_flight(code).await;
        if result.is_err() {
            let _ = self.commands.send(Command::Reset);
        }
        result
    }

    pub async fn invite(&self, target_id: &str, code: &str) -> Result<(), SignalingError> {
        self.signaling.invite(target_id, code).await
    }

    /// Starts a two-member flight with `target_id`, this peer owning it.
    pub async fn request_to_connect(&self, target_id: &str) -> Result<(), SignalingError> {
        self.signaling.request_to_connect(target_id).await
    }

    /// Asks for the nearby list; it arrives as [`SessionEvent::Nearby`].
    pub async fn request_nearby(&self) -> Result<(), SignalingError> {
        self.signaling.request_nearby().await
    }

    /// Sends a control frame over the open data channel.
    pub fn send_control(&self, frame: &ControlFrame) -> Result<(), ChannelError> {
        let channel = lock(&self.channel).clone().ok_or(ChannelError::Closed)?;
        channel.send(ChannelPayload::from(frame))
    }

    /// Closes the channel and leaves the flight. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Disconnects and shuts the session down.
    pub async fn close(&self) {
        self.disconnect().await;
        self.signaling.close().await;
        self.cancel.cancel();
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

struct SessionLoop {
    negotiator: Negotiator,
    signaling: Arc<SignalingClient>,
    engine: TransferEngine,
    channel: ChannelSlot,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut pushes: mpsc::UnboundedReceiver<Message>,
        mut transport_rx: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
        mut engine_rx: mpsc::UnboundedReceiver<TransferEvent>,
        cancel: CancellationToken,
    ) {
        let mut signaling_up = true;
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle_command(cmd).await;
                }

                Some((generation, event)) = transport_rx.recv() => {
                    let actions = self.negotiator.on_transport_event(generation, event);
                    self.execute(actions).await;
                }

                push = pushes.recv(), if signaling_up => {
                    match push {
                        Some(msg) => self.handle_push(msg).await,
                        None => {
                            warn!("lost connection to rendezvous server");
                            signaling_up = false;
                            self.emit(SessionEvent::SignalingLost);
                        }
                    }
                }

                Some(event) = engine_rx.recv() => {
                    self.emit(SessionEvent::Transfer(event));
                }
            }
        }

        // Release engine resources still tied to the channel.
        let actions = self.negotiator.disconnect();
        for action in actions {
            if let Action::ChannelDown(reason) = action {
                self.channel_down(reason).await;
            }
        }
        debug!("session loop stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(code) => {
                let actions = self.negotiator.connect(&code);
                self.execute(actions).await;
            }
            Command::Reset => {
                let actions: Vec<_> = self
                    .negotiator
                    .disconnect()
                    .into_iter()
                    .filter(|a| !matches!(a, Action::Leave))
                    .collect();
                self.execute(actions).await;
            }
            Command::Disconnect(ack) => {
                let actions = self.negotiator.disconnect();
                self.execute(actions).await;
                let _ = ack.send(());
            }
        }
    }

    async fn handle_push(&mut self, msg: Message) {
        let result = match msg.msg_type {
            MessageType::FlightUsers => match payload::<FlightUsersEvent>(&msg) {
                Some(roster) => {
                    let result = self.negotiator.on_roster(&roster).await;
                    self.emit(SessionEvent::Roster(roster));
                    result
                }
                None => Ok(Vec::new()),
            },
            MessageType::FlightStarted => match payload::<FlightStartedEvent>(&msg) {
                Some(started) => {
                    info!(code = %started.code, "flight started");
                    let actions = self.negotiator.connect(&started.code);
                    self.emit(SessionEvent::FlightStarted(started));
                    Ok(actions)
                }
                None => Ok(Vec::new()),
            },
            MessageType::Offer => match payload::<DescriptionEvent>(&msg) {
                Some(offer) => self.negotiator.on_offer(&offer.from, offer.sdp).await,
                None => Ok(Vec::new()),
            },
            MessageType::Answer => match payload::<DescriptionEvent>(&msg) {
                Some(answer) => self
                    .negotiator
                    .on_answer(&answer.from, answer.sdp)
                    .await
                    .map(|()| Vec::new()),
                None => Ok(Vec::new()),
            },
            MessageType::IceCandidate => {
                if let Some(ice) = payload::<IceCandidateEvent>(&msg) {
                    self.negotiator
                        .on_remote_candidate(&ice.from, ice.candidate)
                        .await;
                }
                Ok(Vec::new())
            }
            MessageType::InvitedToFlight => {
                if let Some(invite) = payload::<InvitedToFlightEvent>(&msg) {
                    self.emit(SessionEvent::Invited(invite));
                }
                Ok(Vec::new())
            }
            MessageType::NearbyUsers => {
                if let Some(nearby) = payload::<NearbyUsersEvent>(&msg) {
                    self.emit(SessionEvent::Nearby(nearby.users));
                }
                Ok(Vec::new())
            }
            ref other => {
                debug!(msg_type = ?other, "unhandled push");
                Ok(Vec::new())
            }
        };

        match result {
            Ok(actions) => self.execute(actions).await,
            Err(e) => self.negotiation_failed(e),
        }
    }

    fn negotiation_failed(&self, e: TransportError) {
        warn!("negotiation failed: {e}");
        self.emit(SessionEvent::NegotiationFailed(e.to_string()));
    }

    async fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::SendOffer { code, sdp } => {
                    if let Err(e) = self.signaling.send_offer(&code, sdp).await {
                        warn!(%code, "failed to send offer: {e}");
                    }
                }
                Action::SendAnswer { code, sdp } => {
                    if let Err(e) = self.signaling.send_answer(&code, sdp).await {
                        warn!(%code, "failed to send answer: {e}");
                    }
                }
                Action::SendCandidate {
                    target_id,
                    candidate,
                } => {
                    if let Err(e) = self.signaling.send_candidate(&target_id, candidate).await {
                        debug!(%target_id, "failed to send candidate: {e}");
                    }
                }
                Action::ChannelUp(channel) => {
                    *lock(&self.channel) = Some(Arc::clone(&channel));
                    self.engine.attach_channel(channel);
                    self.emit(SessionEvent::Connected);
                }
                Action::Deliver(payload) => self.engine.handle_message(payload).await,
                Action::ChannelDown(reason) => self.channel_down(reason).await,
                Action::HandshakeFailed(reason) => {
                    warn!(?reason, "transport closed before the data channel opened");
                    self.emit(SessionEvent::NegotiationFailed(format!(
                        "transport closed before the data channel opened ({reason:?})"
                    )));
                    self.emit(SessionEvent::Disconnected(reason));
                }
                Action::Leave => {
                    let signaling = Arc::clone(&self.signaling);
                    tokio::spawn(async move {
                        if let Err(e) = signaling.leave_flight().await {
                            debug!("leave_flight failed: {e}");
                        }
                    });
                }
            }
        }
    }

    async fn channel_down(&self, reason: CloseReason) {
        if let Some(channel) = lock(&self.channel).take() {
            channel.close();
        }
        self.engine.on_channel_closed(reason).await;
        self.emit(SessionEvent::Disconnected(reason));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

fn payload<T: for<'de> serde::Deserialize<'de>>(msg: &Message) -> Option<T> {
    match msg.parse_payload::<T>() {
        Ok(Some(p)) => Some(p),
        Ok(None) => {
            debug!(msg_type = ?msg.msg_type, "push without payload");
            None
        }
        Err(e) => {
            warn!(msg_type = ?msg.msg_type, "bad push payload: {e}");
            None
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
