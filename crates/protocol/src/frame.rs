//! Data-channel wire format.
//!
//! Text messages are JSON control frames tagged by `type`. Binary messages
//! are data frames: `[u32 BE id_len][id][u32 BE payload_len][payload]`.

use serde::{Deserialize, Serialize};

use crate::constants::{MAX_CHUNK_SIZE, MAX_TRANSFER_ID_LEN};

/// Largest payload a data frame may declare.
///
/// A compressed chunk can be slightly larger than its input, so the bound
/// leaves room above [`MAX_CHUNK_SIZE`].
pub const MAX_FRAME_PAYLOAD: usize = MAX_CHUNK_SIZE + 4096;

/// Per-transfer control message sent as a text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    #[serde(rename_all = "camelCase")]
    Init {
        transfer_id: String,
        directory_path: String,
        size: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thumbnail: Option<String>,
    },
    /// Advisory notice that data for `transfer_id` follows.
    #[serde(rename_all = "camelCase", alias = "chunk-notice")]
    Chunk { transfer_id: String },
    #[serde(rename_all = "camelCase")]
    Pause { transfer_id: String },
    #[serde(rename_all = "camelCase")]
    Resume { transfer_id: String },
    #[serde(rename_all = "camelCase")]
    Cancel { transfer_id: String },
    #[serde(rename_all = "camelCase")]
    Done { transfer_id: String },
}

impl ControlFrame {
    /// Id of the transfer this frame refers to.
    pub fn transfer_id(&self) -> &str {
        match self {
            ControlFrame::Init { transfer_id, .. }
            | ControlFrame::Chunk { transfer_id }
            | ControlFrame::Pause { transfer_id }
            | ControlFrame::Resume { transfer_id }
            | ControlFrame::Cancel { transfer_id }
            | ControlFrame::Done { transfer_id } => transfer_id,
        }
    }

    pub fn to_json(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(|e| FrameError::InvalidControl(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, FrameError> {
        serde_json::from_str(text).map_err(|e| FrameError::InvalidControl(e.to_string()))
    }
}

/// Binary data frame carrying one compressed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub transfer_id: String,
    pub payload: Vec<u8>,
}

impl DataFrame {
    pub fn new(transfer_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            payload,
        }
    }

    /// Serializes the frame into its wire layout.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let id = self.transfer_id.as_bytes();
        if id.is_empty() || id.len() > MAX_TRANSFER_ID_LEN {
            return Err(FrameError::TransferIdLength(id.len()));
        }
        if self.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }

        let mut buf = Vec::with_capacity(8 + id.len() + self.payload.len());
        buf.extend_from_slice(&(id.len() as u32).to_be_bytes());
        buf.extend_from_slice(id);
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parses a binary message. Trailing bytes after the payload are ignored.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let id_len = read_u32(data, 0)? as usize;
        if id_len == 0 || id_len > MAX_TRANSFER_ID_LEN {
            return Err(FrameError::TransferIdLength(id_len));
        }
        let id_bytes = data.get(4..4 + id_len).ok_or(FrameError::Truncated {
            expected: 4 + id_len,
            got: data.len(),
        })?;
        let transfer_id = std::str::from_utf8(id_bytes)
            .map_err(|_| FrameError::InvalidTransferId)?
            .to_owned();

        let len_at = 4 + id_len;
        let payload_len = read_u32(data, len_at)? as usize;
        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(payload_len));
        }
        let start = len_at + 4;
        let payload = data
            .get(start..start + payload_len)
            .ok_or(FrameError::Truncated {
                expected: start + payload_len,
                got: data.len(),
            })?
            .to_vec();

        Ok(Self {
            transfer_id,
            payload,
        })
    }
}

fn read_u32(data: &[u8], at: usize) -> Result<u32, FrameError> {
    let bytes: [u8; 4] = data
        .get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or(FrameError::Truncated {
            expected: at + 4,
            got: data.len(),
        })?;
    Ok(u32::from_be_bytes(bytes))
}

/// A message as delivered by the data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPayload {
    Text(String),
    Binary(Vec<u8>),
}

impl ChannelPayload {
    pub fn len(&self) -> usize {
        match self {
            ChannelPayload::Text(t) => t.len(),
            ChannelPayload::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&ControlFrame> for ChannelPayload {
    fn from(frame: &ControlFrame) -> Self {
        // Serializing a ControlFrame cannot fail: every field is a string or integer.
        ChannelPayload::Text(serde_json::to_string(frame).unwrap_or_default())
    }
}

/// A decoded data-channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(ControlFrame),
    Data(DataFrame),
}

impl Frame {
    pub fn parse(payload: &ChannelPayload) -> Result<Self, FrameError> {
        match payload {
            ChannelPayload::Text(text) => ControlFrame::from_json(text).map(Frame::Control),
            ChannelPayload::Binary(data) => DataFrame::decode(data).map(Frame::Data),
        }
    }
}

/// Errors from data-channel frame encoding and parsing.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame truncated: need {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("transfer id length {0} out of range")]
    TransferIdLength(usize),

    #[error("transfer id is not valid UTF-8")]
    InvalidTransferId,

    #[error("payload of {0} bytes exceeds frame limit")]
    PayloadTooLarge(usize),

    #[error("invalid control frame: {0}")]
    InvalidControl(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_layout() {
        let frame = DataFrame::new("t1", vec![9, 8, 7]);
        let bytes = frame.encode().unwrap();
        assert_eq!(&bytes[..4], &2u32.to_be_bytes());
        assert_eq!(&bytes[4..6], b"t1");
        assert_eq!(&bytes[6..10], &3u32.to_be_bytes());
        assert_eq!(&bytes[10..], &[9, 8, 7]);
        assert_eq!(DataFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn data_frame_empty_payload() {
        let bytes = DataFrame::new("t", Vec::new()).encode().unwrap();
        let parsed = DataFrame::decode(&bytes).unwrap();
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let mut bytes = DataFrame::new("t1", vec![1, 2, 3, 4]).encode().unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            DataFrame::decode(&bytes),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn decode_rejects_short_header() {
        assert!(matches!(
            DataFrame::decode(&[0, 0]),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn decode_rejects_oversized_id() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&((MAX_TRANSFER_ID_LEN + 1) as u32).to_be_bytes());
        bytes.extend(std::iter::repeat_n(b'a', MAX_TRANSFER_ID_LEN + 1));
        assert!(matches!(
            DataFrame::decode(&bytes),
            Err(FrameError::TransferIdLength(_))
        ));
    }

    #[test]
    fn decode_rejects_oversized_payload_length() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.push(b'x');
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            DataFrame::decode(&bytes),
            Err(FrameError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn encode_rejects_empty_id() {
        assert!(DataFrame::new("", vec![1]).encode().is_err());
    }

    #[test]
    fn init_frame_wire_shape() {
        let frame = ControlFrame::Init {
            transfer_id: "abc".into(),
            directory_path: "photos/cat.png".into(),
            size: 42,
            thumbnail: None,
        };
        let json: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "init");
        assert_eq!(json["transferId"], "abc");
        assert_eq!(json["directoryPath"], "photos/cat.png");
        assert_eq!(json["size"], 42);
        assert!(json.get("thumbnail").is_none());
    }

    #[test]
    fn control_frames_parse_by_tag() {
        let cancel = ControlFrame::from_json(r#"{"type":"cancel","transferId":"x"}"#).unwrap();
        assert_eq!(
            cancel,
            ControlFrame::Cancel {
                transfer_id: "x".into()
            }
        );

        let notice = ControlFrame::from_json(r#"{"type":"chunk-notice","transferId":"y"}"#).unwrap();
        assert_eq!(notice.transfer_id(), "y");
    }

    #[test]
    fn unknown_control_type_is_error() {
        assert!(ControlFrame::from_json(r#"{"type":"explode","transferId":"x"}"#).is_err());
        assert!(ControlFrame::from_json("not json").is_err());
    }

    #[test]
    fn frame_parse_dispatches_on_payload_kind() {
        let text = ChannelPayload::from(&ControlFrame::Done {
            transfer_id: "d".into(),
        });
        assert!(matches!(Frame::parse(&text), Ok(Frame::Control(ControlFrame::Done { .. }))));

        let binary = ChannelPayload::Binary(DataFrame::new("d", vec![1]).encode().unwrap());
        assert!(matches!(Frame::parse(&binary), Ok(Frame::Data(_))));
    }
}
