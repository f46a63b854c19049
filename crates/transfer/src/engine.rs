//! Public facade over the sender and receiver paths.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use airdelivery_protocol::{ChannelPayload, ControlFrame, Frame};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::DataChannel;
use crate::progress::{DEFAULT_PROGRESS_INTERVAL, DEFAULT_PROGRESS_STEP, ProgressThrottle};
use crate::receiver::LiveReceive;
use crate::sender::SendControl;
use crate::sink::Sink;
use crate::source::OutgoingFile;
use crate::types::{
    EngineStats, IncomingSnapshot, OutgoingSnapshot, ReceiveStatus, SendStatus, TransferEvent,
};
use crate::{MEMORY_SINK_LIMIT, TransferError};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Declared size at or above which incoming files stream to disk.
    pub memory_limit: u64,
    /// Directory streamed files are written under.
    pub download_dir: PathBuf,
    pub progress_interval: Duration,
    /// Progress delta in percent that forces a notification.
    pub progress_step: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_limit: MEMORY_SINK_LIMIT,
            download_dir: std::env::temp_dir().join("airdelivery"),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            progress_step: DEFAULT_PROGRESS_STEP,
        }
    }
}

/// Why the data channel went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly close: in-progress receives are reported as stalled.
    Closed,
    /// Transport failure: in-progress receives are aborted.
    Failed,
}

/// Turns a [`DataChannel`] into many independent file transfers.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: EngineConfig,
    events: mpsc::UnboundedSender<TransferEvent>,
    state: Mutex<State>,
}

/// The currently attached channel and the token cancelled when it goes away.
#[derive(Clone)]
pub(crate) struct Link {
    pub(crate) channel: Arc<dyn DataChannel>,
    pub(crate) closed: CancellationToken,
}

#[derive(Default)]
pub(crate) struct State {
    pub(crate) link: Option<Link>,
    pub(crate) outgoing: HashMap<String, Outgoing>,
    pub(crate) outgoing_order: Vec<String>,
    pub(crate) queue: VecDeque<String>,
    pub(crate) active: Option<String>,
    pub(crate) worker_running: bool,
    pub(crate) incoming: HashMap<String, Incoming>,
    pub(crate) incoming_order: Vec<String>,
    pub(crate) next_generation: u64,
    pub(crate) stats: EngineStats,
}

pub(crate) struct Outgoing {
    pub(crate) file: OutgoingFile,
    pub(crate) status: SendStatus,
    pub(crate) sent: u64,
    pub(crate) progress: u8,
    pub(crate) throughput: f64,
    pub(crate) control: Arc<SendControl>,
    pub(crate) init_sent: bool,
    /// `done` is on the wire; a local cancel no longer applies.
    pub(crate) finishing: bool,
}

pub(crate) struct Incoming {
    pub(crate) relative_path: String,
    pub(crate) size: u64,
    pub(crate) thumbnail: Option<String>,
    pub(crate) streamed: bool,
    pub(crate) received: u64,
    pub(crate) progress: u8,
    pub(crate) status: ReceiveStatus,
    /// Present while the transfer can still accept bytes.
    pub(crate) live: Option<LiveReceive>,
}

impl TransferEngine {
    /// Creates an engine publishing its events on `events`.
    pub fn new(config: EngineConfig, events: mpsc::UnboundedSender<TransferEvent>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                events,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Attaches an open channel. Queued sends start immediately.
    pub fn attach_channel(&self, channel: Arc<dyn DataChannel>) {
        {
            let mut state = self.inner.lock();
            if let Some(old) = state.link.take() {
                old.closed.cancel();
            }
            state.link = Some(Link {
                channel,
                closed: CancellationToken::new(),
            });
        }
        info!("data channel attached");
        self.inner.kick();
    }

    /// Returns `true` while a channel is attached.
    pub fn has_channel(&self) -> bool {
        self.inner.lock().link.is_some()
    }

    /// Queues a file for sending and returns its transfer id.
    ///
    /// Returns `None` if a file with the same relative path is already in
    /// the outgoing set.
    pub fn enqueue(&self, file: OutgoingFile) -> Option<String> {
        let id = {
            let mut state = self.inner.lock();
            if state
                .outgoing
                .values()
                .any(|t| t.file.relative_path == file.relative_path)
            {
                debug!(path = %file.relative_path, "skipping duplicate selection");
                return None;
            }

            let id = uuid::Uuid::new_v4().to_string();
            debug!(transfer_id = %id, path = %file.relative_path, size = file.size, "queued");
            state.outgoing.insert(
                id.clone(),
                Outgoing {
                    file,
                    status: SendStatus::Queued,
                    sent: 0,
                    progress: 0,
                    throughput: 0.0,
                    control: Arc::new(SendControl::new()),
                    init_sent: false,
                    finishing: false,
                },
            );
            state.outgoing_order.push(id.clone());
            state.queue.push_back(id.clone());
            self.inner.emit(TransferEvent::SendStatusChanged {
                transfer_id: id.clone(),
                status: SendStatus::Queued,
            });
            id
        };
        self.inner.kick();
        Some(id)
    }

    /// Queues several files, returning the ids of those not skipped.
    pub fn enqueue_all(&self, files: impl IntoIterator<Item = OutgoingFile>) -> Vec<String> {
        files.into_iter().filter_map(|f| self.enqueue(f)).collect()
    }

    /// Pauses a queued or sending transfer.
    pub fn pause(&self, transfer_id: &str) -> Result<(), TransferError> {
        let mut state = self.inner.lock();
        let t = state
            .outgoing
            .get_mut(transfer_id)
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_owned()))?;
        if matches!(t.status, SendStatus::Queued | SendStatus::Sending) {
            t.control.pause();
            self.inner
                .set_send_status(&mut state, transfer_id, SendStatus::Paused);
        }
        Ok(())
    }

    /// Resumes a paused transfer.
    ///
    /// A transfer whose channel went away while it was paused is queued
    /// again from the start.
    pub fn resume(&self, transfer_id: &str) -> Result<(), TransferError> {
        let requeued = {
            let mut state = self.inner.lock();
            let in_flight = state.active.as_deref() == Some(transfer_id)
                || state.queue.iter().any(|q| q == transfer_id);
            let t = state
                .outgoing
                .get_mut(transfer_id)
                .ok_or_else(|| TransferError::NotFound(transfer_id.to_owned()))?;
            if t.status != SendStatus::Paused {
                return Ok(());
            }

            if in_flight {
                t.control.resume();
                let status = if t.sent == 0 {
                    SendStatus::Queued
                } else {
                    SendStatus::Sending
                };
                self.inner.set_send_status(&mut state, transfer_id, status);
                false
            } else {
                t.control = Arc::new(SendControl::new());
                t.sent = 0;
                t.progress = 0;
                t.init_sent = false;
                t.finishing = false;
                state.queue.push_back(transfer_id.to_owned());
                self.inner
                    .set_send_status(&mut state, transfer_id, SendStatus::Queued);
                true
            }
        };
        if requeued {
            self.inner.kick();
        }
        Ok(())
    }

    /// Cancels an outgoing or incoming transfer.
    ///
    /// Always takes effect locally; the peer is notified best-effort.
    pub async fn cancel(&self, transfer_id: &str) -> Result<(), TransferError> {
        if self.inner.cancel_outgoing(transfer_id, true) {
            return Ok(());
        }
        if self.inner.cancel_incoming(transfer_id, true).await {
            return Ok(());
        }
        Err(TransferError::NotFound(transfer_id.to_owned()))
    }

    /// Forgets a transfer that reached a terminal status.
    pub fn remove(&self, transfer_id: &str) -> bool {
        let mut state = self.inner.lock();
        let outgoing_done = state
            .outgoing
            .get(transfer_id)
            .is_some_and(|t| t.status.is_terminal());
        if outgoing_done {
            state.outgoing.remove(transfer_id);
            state.outgoing_order.retain(|id| id != transfer_id);
            return true;
        }
        let incoming_done = state
            .incoming
            .get(transfer_id)
            .is_some_and(|t| t.status.is_terminal());
        if incoming_done {
            state.incoming.remove(transfer_id);
            state.incoming_order.retain(|id| id != transfer_id);
            return true;
        }
        false
    }

    /// Processes one message received on the data channel.
    ///
    /// Malformed frames and frames for unknown transfers are dropped.
    pub async fn handle_message(&self, payload: ChannelPayload) {
        match Frame::parse(&payload) {
            Ok(Frame::Control(frame)) => self.inner.handle_control(frame).await,
            Ok(Frame::Data(frame)) => self.inner.handle_data(frame).await,
            Err(e) => warn!("dropping malformed frame: {e}"),
        }
    }

    /// Detaches the channel after it closed or failed.
    ///
    /// Sending transfers become paused. In-progress receives are reported
    /// as stalled on an orderly close and aborted on failure.
    pub async fn on_channel_closed(&self, reason: CloseReason) {
        let aborted = {
            let mut state = self.inner.lock();
            let Some(link) = state.link.take() else {
                return;
            };
            link.closed.cancel();
            info!(?reason, "data channel detached");

            let sending: Vec<String> = state
                .outgoing
                .iter()
                .filter(|(_, t)| t.status == SendStatus::Sending)
                .map(|(id, _)| id.clone())
                .collect();
            for id in sending {
                self.inner.set_send_status(&mut state, &id, SendStatus::Paused);
            }

            let mut aborted = Vec::new();
            let ids: Vec<String> = state.incoming_order.clone();
            for id in ids {
                let Some(entry) = state.incoming.get_mut(&id) else {
                    continue;
                };
                if entry.status.is_terminal() || entry.live.is_none() {
                    continue;
                }
                match reason {
                    CloseReason::Closed => {
                        let event = TransferEvent::Stalled {
                            transfer_id: id.clone(),
                            received: entry.received,
                            size: entry.size,
                        };
                        self.inner.emit(event);
                    }
                    CloseReason::Failed => {
                        if let Some(sink) = entry.live.take().and_then(|l| l.sink) {
                            aborted.push(sink);
                        }
                        entry.status = ReceiveStatus::Error;
                        self.inner.emit(TransferEvent::ReceiveStatusChanged {
                            transfer_id: id.clone(),
                            status: ReceiveStatus::Error,
                        });
                    }
                }
            }
            aborted
        };
        abort_all(aborted).await;
    }

    /// Cancels every transfer and clears all state and statistics.
    pub async fn reset(&self) {
        let aborted = {
            let mut state = self.inner.lock();
            for t in state.outgoing.values() {
                t.control.cancel();
            }
            state.outgoing.clear();
            state.outgoing_order.clear();
            state.queue.clear();

            let aborted: Vec<Sink> = state
                .incoming
                .drain()
                .filter_map(|(_, entry)| entry.live.and_then(|l| l.sink))
                .collect();
            state.incoming_order.clear();
            state.stats = EngineStats::default();
            aborted
        };
        info!("transfer state reset");
        abort_all(aborted).await;
    }

    /// Outgoing transfers in enqueue order.
    pub fn outgoing(&self) -> Vec<OutgoingSnapshot> {
        let state = self.inner.lock();
        state
            .outgoing_order
            .iter()
            .filter_map(|id| state.outgoing.get(id).map(|t| t.snapshot(id)))
            .collect()
    }

    /// Incoming transfers in arrival order.
    pub fn incoming(&self) -> Vec<IncomingSnapshot> {
        let state = self.inner.lock();
        state
            .incoming_order
            .iter()
            .filter_map(|id| state.incoming.get(id).map(|t| t.snapshot(id)))
            .collect()
    }

    /// Number of incoming transfers still holding a sink or queued chunks.
    pub fn live_receives(&self) -> usize {
        self.inner
            .lock()
            .incoming
            .values()
            .filter(|t| t.live.is_some())
            .count()
    }

    pub fn stats(&self) -> EngineStats {
        self.inner.lock().stats
    }
}

impl Inner {
    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn emit(&self, event: TransferEvent) {
        // The application may have dropped its receiver; the engine keeps working.
        let _ = self.events.send(event);
    }

    pub(crate) fn new_throttle(&self) -> ProgressThrottle {
        ProgressThrottle::new(self.config.progress_interval, self.config.progress_step)
    }

    /// Moves an outgoing transfer to `status` unless it is already terminal.
    pub(crate) fn set_send_status(&self, state: &mut State, id: &str, status: SendStatus) -> bool {
        let Some(t) = state.outgoing.get_mut(id) else {
            return false;
        };
        if t.status == status || t.status.is_terminal() {
            return false;
        }
        t.status = status;
        self.emit(TransferEvent::SendStatusChanged {
            transfer_id: id.to_owned(),
            status,
        });
        true
    }

    /// Moves an incoming transfer to `status` unless it is already terminal.
    pub(crate) fn set_receive_status(
        &self,
        state: &mut State,
        id: &str,
        status: ReceiveStatus,
    ) -> bool {
        let Some(t) = state.incoming.get_mut(id) else {
            return false;
        };
        if t.status == status || t.status.is_terminal() {
            return false;
        }
        t.status = status;
        self.emit(TransferEvent::ReceiveStatusChanged {
            transfer_id: id.to_owned(),
            status,
        });
        true
    }

    /// Sends a control frame on the attached channel, if any.
    pub(crate) fn send_control_best_effort(&self, state: &State, frame: &ControlFrame) {
        if let Some(link) = &state.link {
            if let Err(e) = link.channel.send(ChannelPayload::from(frame)) {
                debug!(transfer_id = %frame.transfer_id(), "control notice not sent: {e}");
            }
        }
    }
}

impl Outgoing {
    fn snapshot(&self, id: &str) -> OutgoingSnapshot {
        OutgoingSnapshot {
            transfer_id: id.to_owned(),
            relative_path: self.file.relative_path.clone(),
            size: self.file.size,
            sent: self.sent,
            progress: self.progress,
            throughput: self.throughput,
            status: self.status,
            thumbnail: self.file.thumbnail.clone(),
        }
    }
}

impl Incoming {
    pub(crate) fn snapshot(&self, id: &str) -> IncomingSnapshot {
        IncomingSnapshot {
            transfer_id: id.to_owned(),
            relative_path: self.relative_path.clone(),
            size: self.size,
            received: self.received,
            progress: self.progress,
            status: self.status,
            streamed: self.streamed,
            thumbnail: self.thumbnail.clone(),
        }
    }
}

pub(crate) async fn abort_all(sinks: Vec<Sink>) {
    for sink in sinks {
        sink.abort().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_after_done_sent_is_ignored() {
        let (tx, _events) = mpsc::unbounded_channel();
        let engine = TransferEngine::new(EngineConfig::default(), tx);
        let id = engine
            .enqueue(OutgoingFile::from_bytes("a.txt", b"abc".to_vec()))
            .unwrap();

        // Worker state right after the `done` frame went out.
        let control = {
            let mut state = engine.inner.lock();
            state.active = Some(id.clone());
            state.queue.clear();
            let t = state.outgoing.get_mut(&id).unwrap();
            t.status = SendStatus::Sending;
            t.init_sent = true;
            t.finishing = true;
            Arc::clone(&t.control)
        };

        engine.cancel(&id).await.unwrap();
        assert!(!control.is_canceled());
        assert_eq!(engine.outgoing()[0].status, SendStatus::Sending);
    }

    #[tokio::test]
    async fn cancel_before_done_still_wins() {
        let (tx, _events) = mpsc::unbounded_channel();
        let engine = TransferEngine::new(EngineConfig::default(), tx);
        let id = engine
            .enqueue(OutgoingFile::from_bytes("a.txt", b"abc".to_vec()))
            .unwrap();

        engine.cancel(&id).await.unwrap();
        assert_eq!(engine.outgoing()[0].status, SendStatus::Canceled);
    }
}
