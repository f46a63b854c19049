use serde::Serialize;

use crate::sink::ReceivedFile;

/// Status of an outgoing transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Queued,
    Sending,
    Paused,
    Done,
    Error,
    Canceled,
}

impl SendStatus {
    /// Returns `true` for statuses no transition may leave.
    pub fn is_terminal(self) -> bool {
        matches!(self, SendStatus::Done | SendStatus::Error | SendStatus::Canceled)
    }
}

/// Status of an incoming transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiveStatus {
    Receiving,
    Paused,
    Done,
    Error,
    Canceled,
}

impl ReceiveStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReceiveStatus::Done | ReceiveStatus::Error | ReceiveStatus::Canceled
        )
    }
}

/// Point-in-time view of an outgoing transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingSnapshot {
    pub transfer_id: String,
    pub relative_path: String,
    pub size: u64,
    pub sent: u64,
    pub progress: u8,
    /// Bytes per second at the last progress tick.
    pub throughput: f64,
    pub status: SendStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

/// Point-in-time view of an incoming transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingSnapshot {
    pub transfer_id: String,
    pub relative_path: String,
    pub size: u64,
    pub received: u64,
    pub progress: u8,
    pub status: ReceiveStatus,
    pub streamed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

/// Running totals across all transfers of an engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub total_sent: u64,
    pub total_received: u64,
    /// Most recent outgoing throughput in bytes per second.
    pub throughput: f64,
}

/// Notifications published by the engine to the application layer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    SendStatusChanged {
        transfer_id: String,
        status: SendStatus,
    },
    SendProgress {
        transfer_id: String,
        sent: u64,
        progress: u8,
        throughput: f64,
    },
    /// A peer announced a new file.
    ReceiveStarted(IncomingSnapshot),
    ReceiveStatusChanged {
        transfer_id: String,
        status: ReceiveStatus,
    },
    ReceiveProgress {
        transfer_id: String,
        received: u64,
        progress: u8,
    },
    /// An incoming file completed.
    Received {
        transfer_id: String,
        relative_path: String,
        file: ReceivedFile,
    },
    /// The channel closed cleanly while this file was still arriving.
    Stalled {
        transfer_id: String,
        received: u64,
        size: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(SendStatus::Done.is_terminal());
        assert!(SendStatus::Canceled.is_terminal());
        assert!(!SendStatus::Paused.is_terminal());
        assert!(ReceiveStatus::Error.is_terminal());
        assert!(!ReceiveStatus::Receiving.is_terminal());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&SendStatus::Canceled).unwrap(), "\"canceled\"");
        assert_eq!(serde_json::to_string(&ReceiveStatus::Receiving).unwrap(), "\"receiving\"");
    }
}
