//! Routes decoded signaling messages to the registry and replies.

use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};

use airdelivery_protocol::constants::MessageType;
use airdelivery_protocol::envelope::Message;
use airdelivery_protocol::messages::{
    DescriptionRequest, FlightCreatedResponse, IceCandidateRequest, InviteToFlightRequest,
    JoinFlightRequest, NearbyUsersEvent, OperationResult, RequestToConnectRequest,
};

use crate::connection::Sender;
use crate::registry::SessionRegistry;

/// Error code for malformed or unexpected requests.
const BAD_REQUEST: i32 = 400;

/// Handles one text frame from `peer_id`.
///
/// Requests get exactly one reply; relays and `get_nearby_users` get none.
/// Malformed input is logged (and answered with an error when it carried a
/// request) but never closes the connection.
pub(crate) fn dispatch(registry: &SessionRegistry, peer_id: &str, sender: &Sender, text: &str) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(%peer_id, "failed to parse message: {e}");
            return;
        }
    };
    trace!(%peer_id, msg_type = ?msg.msg_type, id = %msg.id, "received message");

    let reply: Result<Message, String> = match msg.msg_type {
        MessageType::CreateFlight => {
            let code = registry.create_flight(peer_id);
            msg.reply(MessageType::FlightCreated, Some(&FlightCreatedResponse { code }))
                .map_err(|e| e.to_string())
        }
        MessageType::JoinFlight => payload::<JoinFlightRequest>(&msg)
            .and_then(|req| result(&msg, registry.join_flight(peer_id, &req.code).into())),
        MessageType::InviteToFlight => payload::<InviteToFlightRequest>(&msg).and_then(|req| {
            result(&msg, registry.invite(peer_id, &req.target_id, &req.code).into())
        }),
        MessageType::RequestToConnect => {
            payload::<RequestToConnectRequest>(&msg).and_then(|req| {
                let outcome = registry.request_to_connect(peer_id, &req.target_id);
                result(&msg, outcome.map(|_| ()).into())
            })
        }
        MessageType::LeaveFlight => {
            registry.leave(peer_id);
            result(&msg, OperationResult::ok())
        }
        MessageType::GetNearbyUsers => {
            let event = NearbyUsersEvent {
                users: registry.nearby(peer_id),
            };
            if let Err(e) = sender.push(MessageType::NearbyUsers, &event) {
                debug!(%peer_id, "nearby push dropped: {e}");
            }
            return;
        }
        MessageType::Offer => {
            match payload::<DescriptionRequest>(&msg) {
                Ok(req) => {
                    registry.relay_offer(peer_id, &req.code, req.sdp);
                }
                Err(e) => debug!(%peer_id, "bad offer: {e}"),
            }
            return;
        }
        MessageType::Answer => {
            match payload::<DescriptionRequest>(&msg) {
                Ok(req) => {
                    registry.relay_answer(peer_id, &req.code, req.sdp);
                }
                Err(e) => debug!(%peer_id, "bad answer: {e}"),
            }
            return;
        }
        MessageType::IceCandidate => {
            match payload::<IceCandidateRequest>(&msg) {
                Ok(req) => {
                    registry.relay_candidate(peer_id, &req.target_id, req.candidate);
                }
                Err(e) => debug!(%peer_id, "bad candidate: {e}"),
            }
            return;
        }
        ref other => {
            debug!(%peer_id, msg_type = ?other, "unexpected message type");
            Err("unexpected message type".to_owned())
        }
    };

    let reply = reply.unwrap_or_else(|error| msg.reply_error(BAD_REQUEST, error));
    if let Err(e) = sender.send_msg(&reply) {
        debug!(%peer_id, "reply dropped: {e}");
    }
}

fn payload<T: DeserializeOwned>(msg: &Message) -> Result<T, String> {
    match msg.parse_payload::<T>() {
        Ok(Some(p)) => Ok(p),
        Ok(None) => Err("missing payload".to_owned()),
        Err(e) => Err(format!("invalid payload: {e}")),
    }
}

fn result(msg: &Message, outcome: OperationResult) -> Result<Message, String> {
    msg.reply(MessageType::OperationResult, Some(&outcome))
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PeerAddress;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite;
    use tokio_util::sync::CancellationToken;

    struct Client {
        id: String,
        sender: Sender,
        rx: mpsc::Receiver<tungstenite::Message>,
    }

    impl Client {
        fn connect(registry: &SessionRegistry) -> Self {
            let (tx, rx) = mpsc::channel(64);
            let sender = Sender::new(tx, CancellationToken::new());
            let info = registry.connect(PeerAddress::classify("127.0.0.1"), sender.clone());
            let mut client = Self {
                id: info.id,
                sender,
                rx,
            };
            client.drain();
            client
        }

        fn send(&self, registry: &SessionRegistry, json: serde_json::Value) {
            dispatch(registry, &self.id, &self.sender, &json.to_string());
        }

        fn drain(&mut self) -> Vec<Message> {
            let mut out = Vec::new();
            while let Ok(tungstenite::Message::Text(text)) = self.rx.try_recv() {
                out.push(serde_json::from_str(&text).unwrap());
            }
            out
        }

        fn reply_to(&mut self, id: &str) -> Message {
            self.drain()
                .into_iter()
                .find(|m| m.id == id)
                .expect("no reply with that id")
        }
    }

    #[test]
    fn create_flight_replies_with_code() {
        let registry = SessionRegistry::new();
        let mut a = Client::connect(&registry);
        a.send(&registry, serde_json::json!({"id": "1", "type": "create_flight"}));

        let reply = a.reply_to("1");
        assert_eq!(reply.msg_type, MessageType::FlightCreated);
        let created: FlightCreatedResponse = reply.parse_payload().unwrap().unwrap();
        assert!(registry.flight(&created.code).is_some());
    }

    #[test]
    fn join_failure_is_an_operation_result() {
        let registry = SessionRegistry::new();
        let mut a = Client::connect(&registry);
        a.send(
            &registry,
            serde_json::json!({"id": "j", "type": "join_flight", "payload": {"code": "NOPE00"}}),
        );

        let reply = a.reply_to("j");
        assert_eq!(reply.msg_type, MessageType::OperationResult);
        let result: OperationResult = reply.parse_payload().unwrap().unwrap();
        assert!(!result.success);
        assert_eq!(result.message.as_deref(), Some("Flight not found"));
    }

    #[test]
    fn missing_payload_is_an_error_reply() {
        let registry = SessionRegistry::new();
        let mut a = Client::connect(&registry);
        a.send(&registry, serde_json::json!({"id": "x", "type": "join_flight"}));

        let reply = a.reply_to("x");
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(reply.error.unwrap().code, BAD_REQUEST);
    }

    #[test]
    fn server_only_types_are_rejected() {
        let registry = SessionRegistry::new();
        let mut a = Client::connect(&registry);
        a.send(&registry, serde_json::json!({"id": "y", "type": "flight_users"}));
        assert_eq!(a.reply_to("y").msg_type, MessageType::Error);
    }

    #[test]
    fn garbage_is_ignored() {
        let registry = SessionRegistry::new();
        let mut a = Client::connect(&registry);
        dispatch(&registry, &a.id, &a.sender, "{{{ nope");
        assert!(a.drain().is_empty());
    }

    #[test]
    fn nearby_is_pushed_not_replied() {
        let registry = SessionRegistry::new();
        let mut a = Client::connect(&registry);
        let b = Client::connect(&registry);
        a.send(&registry, serde_json::json!({"id": "n", "type": "get_nearby_users"}));

        let msgs = a.drain();
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].is_push());
        let event: NearbyUsersEvent = msgs[0].parse_payload().unwrap().unwrap();
        assert_eq!(event.users.len(), 1);
        assert_eq!(event.users[0].id, b.id);
    }

    #[test]
    fn relays_produce_no_reply() {
        let registry = SessionRegistry::new();
        let mut a = Client::connect(&registry);
        let mut b = Client::connect(&registry);
        let code = registry.create_flight(&a.id);
        registry.join_flight(&b.id, &code).unwrap();
        a.drain();
        b.drain();

        a.send(
            &registry,
            serde_json::json!({
                "id": "o",
                "type": "offer",
                "payload": {"code": code, "sdp": {"type": "offer", "sdp": "v=0"}}
            }),
        );
        assert!(a.drain().is_empty());
        let pushed = b.drain();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].msg_type, MessageType::Offer);
    }
}
