//! Outgoing path: a single worker streams queued files one at a time.

use std::sync::Arc;

use airdelivery_protocol::{ChannelPayload, ControlFrame, DataFrame};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::ChannelError;
use crate::chunked::ChunkReader;
use crate::compress::compress_chunk;
use crate::engine::{Inner, Link};
use crate::source::OutgoingFile;
use crate::types::{SendStatus, TransferEvent};
use crate::{TransferError, buffer_threshold, chunk_size_for};

/// Pause and cancel signals for one outgoing transfer.
pub(crate) struct SendControl {
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl SendControl {
    pub(crate) fn new() -> Self {
        Self {
            paused: watch::Sender::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub(crate) fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Blocks until resumed. Returns `false` if canceled instead, including
    /// a cancel issued while already waiting.
    pub(crate) async fn wait_resumed(&self) -> bool {
        let mut rx = self.paused.subscribe();
        let resumed = async {
            let _ = rx.wait_for(|paused| !*paused).await;
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = resumed => true,
        }
    }
}

/// How a single send ended.
enum Outcome {
    Done(u64),
    Canceled,
    /// The channel went away mid-transfer.
    Detached,
}

impl Inner {
    /// Starts the send worker if there is queued work, an open channel and
    /// no worker already running.
    pub(crate) fn kick(self: &Arc<Self>) {
        let mut state = self.lock();
        if state.worker_running || state.queue.is_empty() {
            return;
        }
        if !state.link.as_ref().is_some_and(|l| l.channel.is_open()) {
            return;
        }
        state.worker_running = true;
        drop(state);
        tokio::spawn(Arc::clone(self).run_worker());
    }

    async fn run_worker(self: Arc<Self>) {
        loop {
            let next = {
                let mut state = self.lock();
                let link = state
                    .link
                    .clone()
                    .filter(|l| l.channel.is_open() && !l.closed.is_cancelled());
                let next = match link {
                    Some(link) => loop {
                        match state.queue.pop_front() {
                            Some(id) => {
                                if state
                                    .outgoing
                                    .get(&id)
                                    .is_some_and(|t| !t.status.is_terminal())
                                {
                                    break Some((id, link));
                                }
                            }
                            None => break None,
                        }
                    },
                    None => None,
                };
                match &next {
                    Some((id, _)) => state.active = Some(id.clone()),
                    None => {
                        state.active = None;
                        state.worker_running = false;
                    }
                }
                next
            };

            let Some((id, link)) = next else {
                break;
            };
            self.send_one(&link, &id).await;
        }
    }

    async fn send_one(&self, link: &Link, id: &str) {
        let (file, control) = {
            let mut state = self.lock();
            let Some(t) = state.outgoing.get(id) else {
                return;
            };
            let file = t.file.clone();
            let control = Arc::clone(&t.control);
            if !control.is_paused() {
                self.set_send_status(&mut state, id, SendStatus::Sending);
            }
            (file, control)
        };

        info!(transfer_id = %id, path = %file.relative_path, size = file.size, "sending");
        let result = self.stream_file(link, id, &file, &control).await;

        let mut state = self.lock();
        match result {
            Ok(Outcome::Done(sent)) => {
                if let Some(t) = state.outgoing.get_mut(id) {
                    t.progress = 100;
                }
                state.stats.total_sent += sent;
                self.emit(TransferEvent::SendProgress {
                    transfer_id: id.to_owned(),
                    sent,
                    progress: 100,
                    throughput: state.stats.throughput,
                });
                self.set_send_status(&mut state, id, SendStatus::Done);
                info!(transfer_id = %id, bytes = sent, "send complete");
            }
            Ok(Outcome::Canceled) => {
                let frame = ControlFrame::Cancel {
                    transfer_id: id.to_owned(),
                };
                if let Err(e) = link.channel.send(ChannelPayload::from(&frame)) {
                    debug!(transfer_id = %id, "cancel notice not sent: {e}");
                }
                self.set_send_status(&mut state, id, SendStatus::Canceled);
                info!(transfer_id = %id, "send canceled");
            }
            Ok(Outcome::Detached) | Err(TransferError::Channel(ChannelError::Closed)) => {
                self.set_send_status(&mut state, id, SendStatus::Paused);
                info!(transfer_id = %id, "channel closed during send");
            }
            Err(e) if link.closed.is_cancelled() => {
                debug!(transfer_id = %id, "send interrupted by channel close: {e}");
                self.set_send_status(&mut state, id, SendStatus::Paused);
            }
            Err(e) => {
                warn!(transfer_id = %id, "send failed: {e}");
                self.set_send_status(&mut state, id, SendStatus::Error);
            }
        }
    }

    async fn stream_file(
        &self,
        link: &Link,
        id: &str,
        file: &OutgoingFile,
        control: &SendControl,
    ) -> Result<Outcome, TransferError> {
        let channel = &link.channel;
        let chunk_size = chunk_size_for(channel.max_message_size());
        let threshold = buffer_threshold(chunk_size);

        let init = ControlFrame::Init {
            transfer_id: id.to_owned(),
            directory_path: file.relative_path.clone(),
            size: file.size,
            thumbnail: file.thumbnail.clone(),
        };
        channel.send(ChannelPayload::from(&init))?;
        if let Some(t) = self.lock().outgoing.get_mut(id) {
            t.init_sent = true;
        }

        let mut reader = ChunkReader::new(file.open().await?, file.size, chunk_size);
        let mut throttle = self.new_throttle();
        let mut sent: u64 = 0;

        while let Some(chunk) = reader.next_chunk().await? {
            if control.is_canceled() {
                return Ok(Outcome::Canceled);
            }

            if control.is_paused() {
                channel.send(ChannelPayload::from(&ControlFrame::Pause {
                    transfer_id: id.to_owned(),
                }))?;
                debug!(transfer_id = %id, "paused");
                tokio::select! {
                    resumed = control.wait_resumed() => {
                        if !resumed {
                            return Ok(Outcome::Canceled);
                        }
                    }
                    _ = link.closed.cancelled() => return Ok(Outcome::Detached),
                }
                channel.send(ChannelPayload::from(&ControlFrame::Resume {
                    transfer_id: id.to_owned(),
                }))?;
                let mut state = self.lock();
                self.set_send_status(&mut state, id, SendStatus::Sending);
                debug!(transfer_id = %id, "resumed");
            }

            if channel.buffered_amount() > threshold {
                tokio::select! {
                    _ = channel.buffered_amount_low(threshold) => {}
                    _ = control.cancel.cancelled() => return Ok(Outcome::Canceled),
                    _ = link.closed.cancelled() => return Ok(Outcome::Detached),
                }
            }

            let packed = compress_chunk(&chunk)?;
            let frame = DataFrame::new(id, packed).encode()?;
            channel.send(ChannelPayload::Binary(frame))?;
            sent += chunk.len() as u64;

            let mut state = self.lock();
            if let Some(t) = state.outgoing.get_mut(id) {
                t.sent = sent;
                if let Some(tick) = throttle.update(sent, file.size) {
                    t.progress = tick.percent;
                    t.throughput = tick.throughput;
                    state.stats.throughput = tick.throughput;
                    self.emit(TransferEvent::SendProgress {
                        transfer_id: id.to_owned(),
                        sent,
                        progress: tick.percent,
                        throughput: tick.throughput,
                    });
                }
            }
        }

        // The cancel check and the `done` frame go out under one lock so a
        // concurrent cancel either wins outright or is refused.
        let mut state = self.lock();
        if control.is_canceled() {
            return Ok(Outcome::Canceled);
        }
        let done = channel.send(ChannelPayload::from(&ControlFrame::Done {
            transfer_id: id.to_owned(),
        }));
        if let Some(t) = state.outgoing.get_mut(id) {
            t.finishing = done.is_ok();
        }
        done?;
        Ok(Outcome::Done(sent))
    }

    /// Cancels an outgoing transfer. Returns `false` if the id is unknown.
    ///
    /// The active transfer's worker emits the cancel notice itself; a
    /// transfer that already announced itself but is no longer active gets
    /// the notice here when `notify` is set.
    pub(crate) fn cancel_outgoing(&self, id: &str, notify: bool) -> bool {
        let mut state = self.lock();
        let active = state.active.as_deref() == Some(id);
        let Some(t) = state.outgoing.get(id) else {
            return false;
        };
        if t.status.is_terminal() {
            return true;
        }
        if t.finishing {
            debug!(transfer_id = %id, "cancel ignored: send already finished");
            return true;
        }
        t.control.cancel();
        let announce = notify && !active && t.init_sent;

        state.queue.retain(|q| q != id);
        self.set_send_status(&mut state, id, SendStatus::Canceled);
        if announce {
            self.send_control_best_effort(
                &state,
                &ControlFrame::Cancel {
                    transfer_id: id.to_owned(),
                },
            );
        }
        debug!(transfer_id = %id, "outgoing canceled");
        true
    }
}
