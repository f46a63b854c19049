//! WebSocket client for the rendezvous server.
//!
//! Requests are correlated with replies by UUID; everything the server
//! pushes unprompted (rosters, relayed descriptions, candidates, invites)
//! is delivered on the channel returned from [`SignalingClient::connect`].

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use airdelivery_protocol::constants::{MessageType, WS_MAX_MESSAGE_SIZE, WS_REQUEST_TIMEOUT};
use airdelivery_protocol::envelope::Message;
use airdelivery_protocol::messages::{
    DescriptionRequest, FlightCreatedResponse, IceCandidateRequest, InviteToFlightRequest,
    JoinFlightRequest, OperationResult, RequestToConnectRequest,
};
use airdelivery_protocol::types::{IceCandidate, PeerInfo, SessionDescription};

use crate::SignalingError;
use crate::pumps;

/// Requests waiting for their reply, keyed by message id.
pub(crate) type PendingRequests = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;

/// Connection to the rendezvous server.
pub struct SignalingClient {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: PendingRequests,
    identity: PeerInfo,
    cancel: CancellationToken,
    read_handle: JoinHandle<()>,
    write_handle: JoinHandle<()>,
    ping_handle: JoinHandle<()>,
}

impl SignalingClient {
    /// Connects and waits for the identity the server assigns.
    ///
    /// Returns the client and the stream of server pushes. The stream ends
    /// when the connection is lost.
    pub async fn connect(
        url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Message>), SignalingError> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel(256);
        let (push_tx, mut push_rx) = mpsc::unbounded_channel();
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(pumps::write::write_pump(write, write_rx, cancel.clone()));
        let read_handle = tokio::spawn(pumps::read::read_pump(
            read,
            pending.clone(),
            push_tx,
            write_tx.clone(),
            cancel.clone(),
        ));
        let ping_handle = tokio::spawn(pumps::ping::ping_pump(write_tx.clone(), cancel.clone()));

        let identity = match wait_for_identity(&mut push_rx).await {
            Ok(identity) => identity,
            Err(e) => {
                cancel.cancel();
                return Err(e);
            }
        };
        info!(peer_id = %identity.id, name = %identity.name, "connected to rendezvous server");

        let client = Self {
            write_tx,
            pending,
            identity,
            cancel,
            read_handle,
            write_handle,
            ping_handle,
        };
        Ok((client, push_rx))
    }

    /// The id and display name the server assigned to this peer.
    pub fn identity(&self) -> &PeerInfo {
        &self.identity
    }

    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Sends a request and waits for its reply.
    pub async fn send_request<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Message, SignalingError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(&id, msg_type, payload)?;
        let json = serde_json::to_string(&msg)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if self
            .write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(SignalingError::Closed);
        }

        let result = tokio::time::timeout(WS_REQUEST_TIMEOUT, rx).await;
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(resp)) => {
                if let Some(err) = &resp.error {
                    return Err(SignalingError::Server {
                        code: err.code,
                        message: err.message.clone(),
                    });
                }
                Ok(resp)
            }
            Ok(Err(_)) => Err(SignalingError::Closed),
            Err(_) => Err(SignalingError::Timeout),
        }
    }

    /// Sends a message that expects no reply.
    pub async fn notify<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: &T,
    ) -> Result<(), SignalingError> {
        let json = serde_json::to_string(&Message::push(msg_type, payload)?)?;
        self.write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .map_err(|_| SignalingError::Closed)
    }

    /// Opens a new flight owned by this peer and returns its code.
    pub async fn create_flight(&self) -> Result<String, SignalingError> {
        let resp = self
            .send_request::<()>(MessageType::CreateFlight, None)
            .await?;
        let created: FlightCreatedResponse = parse(&resp)?;
        Ok(created.code)
    }

    pub async fn join_flight(&self, code: &str) -> Result<(), SignalingError> {
        let req = JoinFlightRequest { code: code.into() };
        let resp = self
            .send_request(MessageType::JoinFlight, Some(&req))
            .await?;
        expect_success(&resp)
    }

    /// Invites `target_id` into the caller's flight `code`.
    pub async fn invite(&self, target_id: &str, code: &str) -> Result<(), SignalingError> {
        let req = InviteToFlightRequest {
            target_id: target_id.into(),
            code: code.into(),
        };
        let resp = self
            .send_request(MessageType::InviteToFlight, Some(&req))
            .await?;
        expect_success(&resp)
    }

    /// Starts a two-member flight with `target_id`. The code arrives in the
    /// `flight_started` push.
    pub async fn request_to_connect(&self, target_id: &str) -> Result<(), SignalingError> {
        let req = RequestToConnectRequest {
            target_id: target_id.into(),
        };
        let resp = self
            .send_request(MessageType::RequestToConnect, Some(&req))
            .await?;
        expect_success(&resp)
    }

    pub async fn leave_flight(&self) -> Result<(), SignalingError> {
        self.send_request::<()>(MessageType::LeaveFlight, None)
            .await
            .map(|_| ())
    }

    /// Asks for a `nearby_users` push.
    pub async fn request_nearby(&self) -> Result<(), SignalingError> {
        self.notify(MessageType::GetNearbyUsers, &serde_json::Value::Null)
            .await
    }

    pub async fn send_offer(
        &self,
        code: &str,
        sdp: SessionDescription,
    ) -> Result<(), SignalingError> {
        let req = DescriptionRequest {
            code: code.into(),
            sdp,
        };
        self.notify(MessageType::Offer, &req).await
    }

    pub async fn send_answer(
        &self,
        code: &str,
        sdp: SessionDescription,
    ) -> Result<(), SignalingError> {
        let req = DescriptionRequest {
            code: code.into(),
            sdp,
        };
        self.notify(MessageType::Answer, &req).await
    }

    pub async fn send_candidate(
        &self,
        target_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        let req = IceCandidateRequest {
            target_id: target_id.into(),
            candidate,
        };
        self.notify(MessageType::IceCandidate, &req).await
    }

    /// Closes the connection. Pending requests fail with
    /// [`SignalingError::Closed`].
    pub async fn close(&self) {
        self.cancel.cancel();
        let _ = self.write_tx.send(tungstenite::Message::Close(None)).await;
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.write_handle.abort();
        self.ping_handle.abort();
    }
}

async fn wait_for_identity(
    pushes: &mut mpsc::UnboundedReceiver<Message>,
) -> Result<PeerInfo, SignalingError> {
    let wait = async {
        while let Some(msg) = pushes.recv().await {
            if msg.msg_type == MessageType::YourName {
                return parse(&msg);
            }
            debug!(msg_type = ?msg.msg_type, "push before identity, ignoring");
        }
        Err(SignalingError::Closed)
    };
    tokio::time::timeout(WS_REQUEST_TIMEOUT, wait)
        .await
        .map_err(|_| SignalingError::Timeout)?
}

fn parse<T: for<'de> serde::Deserialize<'de>>(msg: &Message) -> Result<T, SignalingError> {
    msg.parse_payload::<T>()?
        .ok_or(SignalingError::MissingPayload(msg.msg_type.clone()))
}

fn expect_success(resp: &Message) -> Result<(), SignalingError> {
    let result: OperationResult = parse(resp)?;
    if result.success {
        Ok(())
    } else {
        Err(SignalingError::Rejected(result.message.unwrap_or_default()))
    }
}
