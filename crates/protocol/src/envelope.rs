use serde::{Deserialize, Serialize};

use crate::constants::MessageType;

/// Error details carried by a signaling message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsError {
    pub code: i32,
    pub message: String,
}

/// Envelope for all signaling traffic.
///
/// Requests carry a caller-chosen `id` that the server echoes on the
/// response. Server pushes use an empty `id`. The `payload` is kept as raw
/// JSON so the receiver can pick the concrete type from `msg_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<serde_json::value::RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WsError>,
}

impl Message {
    /// Creates a new message with the given type and payload.
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let raw = match payload {
            Some(p) => Some(serde_json::value::to_raw_value(p)?),
            None => None,
        };
        Ok(Self {
            id: id.into(),
            msg_type,
            payload: raw,
            error: None,
        })
    }

    /// Creates an unsolicited server push (no correlation id).
    pub fn push<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<Self, serde_json::Error> {
        Message::new(String::new(), msg_type, Some(payload))
    }

    /// Returns `true` if this message is a push rather than a response.
    pub fn is_push(&self) -> bool {
        self.id.is_empty()
    }

    /// Deserializes the payload into the given type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.payload {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }

    /// Creates an error message.
    pub fn error(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            msg_type: MessageType::Error,
            payload: None,
            error: Some(WsError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Creates a response message for this request.
    pub fn reply<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Message::new(&self.id, msg_type, payload)
    }

    /// Creates an error response for this request.
    pub fn reply_error(&self, code: i32, message: impl Into<String>) -> Self {
        Message::error(&self.id, code, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{JoinFlightRequest, OperationResult};

    #[test]
    fn message_new_with_payload() {
        let req = JoinFlightRequest {
            code: "AB12CD".into(),
        };
        let msg = Message::new("msg-1", MessageType::JoinFlight, Some(&req)).unwrap();
        assert_eq!(msg.id, "msg-1");
        assert_eq!(msg.msg_type, MessageType::JoinFlight);
        assert!(msg.payload.is_some());
        assert!(msg.error.is_none());
    }

    #[test]
    fn message_parse_payload() {
        let result = OperationResult::failed("Flight is full");
        let msg = Message::new("m1", MessageType::OperationResult, Some(&result)).unwrap();
        let parsed: Option<OperationResult> = msg.parse_payload().unwrap();
        assert_eq!(parsed.unwrap(), result);
    }

    #[test]
    fn message_without_id_is_push() {
        let json = r#"{"type":"nearby_users","payload":{"users":[]}}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert!(msg.is_push());
        assert_eq!(msg.msg_type, MessageType::NearbyUsers);
    }

    #[test]
    fn message_omits_null_fields() {
        let msg = Message::new::<()>("m1", MessageType::LeaveFlight, None).unwrap();
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("payload"));
        assert!(!json.contains("error"));
    }

    #[test]
    fn reply_preserves_id() {
        let original = Message::new::<()>("req-42", MessageType::CreateFlight, None).unwrap();
        let reply = original
            .reply(MessageType::FlightCreated, Some(&serde_json::json!({"code": "X"})))
            .unwrap();
        assert_eq!(reply.id, "req-42");
        assert_eq!(reply.msg_type, MessageType::FlightCreated);
    }

    #[test]
    fn reply_error_preserves_id() {
        let original = Message::new::<()>("req-99", MessageType::Offer, None).unwrap();
        let reply = original.reply_error(400, "missing payload");
        assert_eq!(reply.id, "req-99");
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(reply.error.unwrap().message, "missing payload");
    }
}
