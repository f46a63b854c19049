//! Incoming path: demultiplexes data frames by transfer id and drains each
//! transfer's chunk queue into its own sink.

use std::collections::VecDeque;
use std::sync::Arc;

use airdelivery_protocol::{ControlFrame, DataFrame};
use tracing::{debug, info, warn};

use crate::compress::decompress_chunk;
use crate::engine::{Incoming, Inner};
use crate::progress::ProgressThrottle;
use crate::sink::Sink;
use crate::types::{ReceiveStatus, TransferEvent};
use crate::TransferError;

/// Write-side state of an incoming transfer that can still accept bytes.
pub(crate) struct LiveReceive {
    /// Distinguishes this receive from a later one reusing the same id.
    generation: u64,
    queue: VecDeque<Vec<u8>>,
    /// A drain task owns the queue head.
    writing: bool,
    /// Taken by the drain task for the duration of a write.
    pub(crate) sink: Option<Sink>,
    throttle: ProgressThrottle,
    /// The sender's `done` arrived while a write was in flight.
    done_seen: bool,
}

enum AfterWrite {
    Continue,
    Abort(Sink),
    Finish(Sink),
}

impl Inner {
    pub(crate) async fn handle_control(self: &Arc<Self>, frame: ControlFrame) {
        match frame {
            ControlFrame::Init {
                transfer_id,
                directory_path,
                size,
                thumbnail,
            } => {
                self.start_incoming(transfer_id, directory_path, size, thumbnail)
                    .await
            }
            ControlFrame::Chunk { transfer_id } => {
                debug!(transfer_id = %transfer_id, "chunk notice");
            }
            ControlFrame::Pause { transfer_id } => {
                let mut state = self.lock();
                if state
                    .incoming
                    .get(&transfer_id)
                    .is_some_and(|t| t.status == ReceiveStatus::Receiving)
                {
                    self.set_receive_status(&mut state, &transfer_id, ReceiveStatus::Paused);
                }
            }
            ControlFrame::Resume { transfer_id } => {
                let mut state = self.lock();
                if state
                    .incoming
                    .get(&transfer_id)
                    .is_some_and(|t| t.status == ReceiveStatus::Paused)
                {
                    self.set_receive_status(&mut state, &transfer_id, ReceiveStatus::Receiving);
                }
            }
            ControlFrame::Cancel { transfer_id } => {
                if !self.cancel_incoming(&transfer_id, false).await
                    && !self.cancel_outgoing(&transfer_id, false)
                {
                    debug!(transfer_id = %transfer_id, "cancel for unknown transfer");
                }
            }
            ControlFrame::Done { transfer_id } => self.sender_done(&transfer_id).await,
        }
    }

    async fn start_incoming(
        &self,
        id: String,
        relative_path: String,
        size: u64,
        thumbnail: Option<String>,
    ) {
        let stale = {
            let mut state = self.lock();
            state
                .incoming
                .remove(&id)
                .and_then(|old| old.live)
                .and_then(|live| live.sink)
        };
        if let Some(sink) = stale {
            debug!(transfer_id = %id, "replacing stale receive");
            sink.abort().await;
        }

        let opened = Sink::open(
            size,
            self.config.memory_limit,
            &self.config.download_dir,
            &relative_path,
        )
        .await;

        let mut state = self.lock();
        let generation = state.next_generation;
        state.next_generation += 1;

        let mut entry = Incoming {
            relative_path,
            size,
            thumbnail,
            streamed: matches!(&opened, Ok(sink) if sink.is_streaming()),
            received: 0,
            progress: 0,
            status: ReceiveStatus::Receiving,
            live: None,
        };
        self.emit(TransferEvent::ReceiveStarted(entry.snapshot(&id)));
        info!(transfer_id = %id, path = %entry.relative_path, size, streamed = entry.streamed, "receiving");

        let failed = match opened {
            Ok(sink) => {
                entry.live = Some(LiveReceive {
                    generation,
                    queue: VecDeque::new(),
                    writing: false,
                    sink: Some(sink),
                    throttle: self.new_throttle(),
                    done_seen: false,
                });
                false
            }
            Err(e) => {
                warn!(transfer_id = %id, "cannot open sink: {e}");
                true
            }
        };

        if !state.incoming_order.contains(&id) {
            state.incoming_order.push(id.clone());
        }
        state.incoming.insert(id.clone(), entry);
        if failed {
            self.set_receive_status(&mut state, &id, ReceiveStatus::Error);
            self.send_control_best_effort(&state, &ControlFrame::Cancel { transfer_id: id });
        }
    }

    pub(crate) async fn handle_data(self: &Arc<Self>, frame: DataFrame) {
        let id = frame.transfer_id;
        let known = self
            .lock()
            .incoming
            .get(&id)
            .is_some_and(|t| t.live.is_some());
        if !known {
            debug!(transfer_id = %id, "dropping data for unknown transfer");
            return;
        }

        let chunk = match decompress_chunk(&frame.payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.fail_incoming(&id, e).await;
                return;
            }
        };

        let start = {
            let mut state = self.lock();
            let Some(live) = state.incoming.get_mut(&id).and_then(|t| t.live.as_mut()) else {
                return;
            };
            live.queue.push_back(chunk);
            if live.writing {
                None
            } else {
                live.writing = true;
                Some(live.generation)
            }
        };
        if let Some(generation) = start {
            tokio::spawn(Arc::clone(self).drain(id, generation));
        }
    }

    /// Writes queued chunks in arrival order until the queue empties or the
    /// declared size is reached.
    async fn drain(self: Arc<Self>, id: String, generation: u64) {
        loop {
            // `Err(true)`: queue drained after the sender's `done`.
            let head = {
                let mut state = self.lock();
                match state
                    .incoming
                    .get_mut(&id)
                    .and_then(|t| t.live.as_mut())
                    .filter(|l| l.generation == generation)
                {
                    None => Err(false),
                    Some(live) => match (live.queue.pop_front(), live.sink.take()) {
                        (Some(chunk), Some(sink)) => Ok((chunk, sink)),
                        (chunk, sink) => {
                            live.writing = false;
                            if let Some(chunk) = chunk {
                                live.queue.push_front(chunk);
                            }
                            live.sink = sink;
                            Err(live.done_seen && live.queue.is_empty())
                        }
                    },
                }
            };
            let (chunk, mut sink) = match head {
                Ok(head) => head,
                Err(true) => {
                    self.sender_done(&id).await;
                    return;
                }
                Err(false) => return,
            };

            let len = chunk.len() as u64;
            let written = sink.write(chunk).await;

            let next = {
                let mut state = self.lock();
                match state.incoming.get_mut(&id) {
                    Some(entry)
                        if entry
                            .live
                            .as_ref()
                            .is_some_and(|l| l.generation == generation) =>
                    {
                        match written {
                            Err(e) => {
                                warn!(transfer_id = %id, "write failed: {e}");
                                entry.live = None;
                                self.set_receive_status(&mut state, &id, ReceiveStatus::Error);
                                AfterWrite::Abort(sink)
                            }
                            Ok(()) => {
                                entry.received += len;
                                let (received, size) = (entry.received, entry.size);
                                let tick = entry
                                    .live
                                    .as_mut()
                                    .and_then(|l| l.throttle.update(received, size));
                                if let Some(tick) = tick {
                                    entry.progress = tick.percent;
                                    self.emit(TransferEvent::ReceiveProgress {
                                        transfer_id: id.clone(),
                                        received,
                                        progress: tick.percent,
                                    });
                                }

                                if received >= size {
                                    entry.live = None;
                                    AfterWrite::Finish(sink)
                                } else {
                                    if let Some(live) = entry.live.as_mut() {
                                        live.sink = Some(sink);
                                    }
                                    AfterWrite::Continue
                                }
                            }
                        }
                    }
                    // Canceled, failed or reset while the write was in flight.
                    _ => AfterWrite::Abort(sink),
                }
            };

            match next {
                AfterWrite::Continue => {}
                AfterWrite::Abort(sink) => {
                    sink.abort().await;
                    return;
                }
                AfterWrite::Finish(sink) => {
                    self.finish_incoming(&id, sink).await;
                    return;
                }
            }
        }
    }

    /// Handles the sender's `done`: completes transfers with nothing left to
    /// write, including empty files that never carried a data frame.
    async fn sender_done(&self, id: &str) {
        let ready = {
            let mut state = self.lock();
            let Some(entry) = state.incoming.get_mut(id) else {
                return;
            };
            let idle = entry
                .live
                .as_ref()
                .is_some_and(|l| !l.writing && l.queue.is_empty());
            if !idle {
                // The drain task settles it once the queue empties.
                if let Some(live) = entry.live.as_mut() {
                    live.done_seen = true;
                }
                return;
            }
            let complete = entry.received >= entry.size;
            let sink = entry.live.take().and_then(|l| l.sink);
            if !complete {
                warn!(transfer_id = %id, received = entry.received, size = entry.size, "sender finished short");
                self.set_receive_status(&mut state, id, ReceiveStatus::Error);
                sink.map(Err)
            } else {
                sink.map(Ok)
            }
        };

        match ready {
            Some(Ok(sink)) => self.finish_incoming(id, sink).await,
            Some(Err(sink)) => sink.abort().await,
            None => {}
        }
    }

    async fn finish_incoming(&self, id: &str, sink: Sink) {
        let closed = sink.close().await;

        let mut state = self.lock();
        match closed {
            Ok(file) => {
                let Some(entry) = state.incoming.get_mut(id) else {
                    return;
                };
                entry.progress = 100;
                let received = entry.received;
                let relative_path = entry.relative_path.clone();
                state.stats.total_received += received;

                self.emit(TransferEvent::ReceiveProgress {
                    transfer_id: id.to_owned(),
                    received,
                    progress: 100,
                });
                self.set_receive_status(&mut state, id, ReceiveStatus::Done);
                self.emit(TransferEvent::Received {
                    transfer_id: id.to_owned(),
                    relative_path,
                    file,
                });
                info!(transfer_id = %id, bytes = received, "receive complete");
            }
            Err(e) => {
                warn!(transfer_id = %id, "failed to finalize: {e}");
                self.set_receive_status(&mut state, id, ReceiveStatus::Error);
            }
        }
    }

    async fn fail_incoming(&self, id: &str, error: TransferError) {
        warn!(transfer_id = %id, "receive failed: {error}");
        let sink = {
            let mut state = self.lock();
            let sink = state
                .incoming
                .get_mut(id)
                .and_then(|t| t.live.take())
                .and_then(|l| l.sink);
            self.set_receive_status(&mut state, id, ReceiveStatus::Error);
            sink
        };
        if let Some(sink) = sink {
            sink.abort().await;
        }
    }

    /// Cancels an incoming transfer. Returns `false` if the id is unknown.
    pub(crate) async fn cancel_incoming(&self, id: &str, notify: bool) -> bool {
        let sink = {
            let mut state = self.lock();
            let Some(entry) = state.incoming.get_mut(id) else {
                return false;
            };
            if entry.status.is_terminal() {
                return true;
            }
            let Some(live) = entry.live.take() else {
                // Already finalizing.
                return true;
            };
            self.set_receive_status(&mut state, id, ReceiveStatus::Canceled);
            if notify {
                self.send_control_best_effort(
                    &state,
                    &ControlFrame::Cancel {
                        transfer_id: id.to_owned(),
                    },
                );
            }
            debug!(transfer_id = %id, queued = live.queue.len(), "incoming canceled");
            live.sink
        };
        if let Some(sink) = sink {
            sink.abort().await;
        }
        true
    }
}
