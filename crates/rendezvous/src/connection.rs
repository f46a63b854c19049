//! Per-connection plumbing: outbound handle and the read/write/ping pumps.

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use airdelivery_protocol::constants::{MessageType, WS_PING_PERIOD, WS_PONG_WAIT};
use airdelivery_protocol::envelope::Message;

/// Failure to queue an outbound message.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,

    #[error("send buffer full")]
    Full,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Cloneable handle for queueing messages to one connected peer.
///
/// Sends never block: a full buffer drops the message and reports
/// [`SendError::Full`].
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
}

impl Sender {
    pub(crate) fn new(tx: mpsc::Sender<tungstenite::Message>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Queues a signaling message.
    pub fn send_msg(&self, msg: &Message) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        let json = serde_json::to_string(msg)?;
        self.tx
            .try_send(tungstenite::Message::Text(json.into()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::Full,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            })
    }

    /// Queues an unsolicited push.
    pub fn push<T: Serialize>(&self, msg_type: MessageType, payload: &T) -> Result<(), SendError> {
        self.send_msg(&Message::push(msg_type, payload)?)
    }

    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tx.is_closed()
    }

    /// Stops all pumps of this connection.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Writes queued messages to the socket until canceled or the queue closes.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = write_rx.recv() => {
                match msg {
                    Some(m) => {
                        if let Err(e) = write.send(m).await {
                            error!("WebSocket write error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = write.send(tungstenite::Message::Close(None)).await;
}

/// Sends keepalive pings every [`WS_PING_PERIOD`].
pub(crate) async fn ping_pump(
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(WS_PING_PERIOD);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let ping = tungstenite::Message::Ping(vec![].into());
                if write_tx.send(ping).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Reads frames and hands every text message to `on_text`.
///
/// Any inbound frame resets the [`WS_PONG_WAIT`] deadline; silence past it
/// ends the loop.
pub(crate) async fn read_pump<S, F>(
    mut read: S,
    mut on_text: F,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    F: FnMut(&str),
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                warn!("pong timeout, closing connection");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);
                        match msg {
                            tungstenite::Message::Text(text) => on_text(text.as_str()),
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = write_tx.try_send(tungstenite::Message::Pong(data));
                            }
                            tungstenite::Message::Pong(_) => trace!("received pong"),
                            tungstenite::Message::Close(_) => {
                                debug!("received close frame");
                                break;
                            }
                            _ => debug!("ignoring non-text frame"),
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{sink, stream};
    use std::time::Duration;

    #[test]
    fn send_reports_full_and_closed() {
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let sender = Sender::new(tx, cancel.clone());

        let msg = Message::new::<()>("1", MessageType::LeaveFlight, None).unwrap();
        sender.send_msg(&msg).unwrap();
        assert!(matches!(sender.send_msg(&msg), Err(SendError::Full)));

        let queued = rx.try_recv().unwrap();
        assert!(matches!(queued, tungstenite::Message::Text(t) if t.contains("leave_flight")));

        sender.close();
        assert!(!sender.is_connected());
        assert!(matches!(sender.send_msg(&msg), Err(SendError::Closed)));
    }

    #[tokio::test]
    async fn write_pump_sends_close_on_cancel() {
        let (sink_tx, mut sink_rx) = mpsc::channel::<tungstenite::Message>(16);
        let cancel = CancellationToken::new();
        let sink = Box::pin(sink::unfold(sink_tx, |tx, msg: tungstenite::Message| async move {
            let _ = tx.send(msg).await;
            Ok::<_, tungstenite::Error>(tx)
        }));

        let (_write_tx, write_rx) = mpsc::channel(16);
        let handle = tokio::spawn(write_pump(sink, write_rx, cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");

        assert!(matches!(sink_rx.recv().await, Some(tungstenite::Message::Close(_))));
    }

    #[tokio::test]
    async fn ping_pump_stops_on_cancel() {
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ping_pump(tx, cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");
    }

    #[tokio::test]
    async fn read_pump_delivers_text_and_answers_ping() {
        let frames = stream::iter(vec![
            Ok(tungstenite::Message::Text("hello".into())),
            Ok(tungstenite::Message::Ping(vec![7].into())),
            Ok(tungstenite::Message::Close(None)),
            Ok(tungstenite::Message::Text("after close".into())),
        ]);
        let (write_tx, mut write_rx) = mpsc::channel(16);
        let mut seen = Vec::new();

        read_pump(frames, |t| seen.push(t.to_owned()), write_tx, CancellationToken::new()).await;

        assert_eq!(seen, vec!["hello".to_owned()]);
        assert!(matches!(write_rx.try_recv(), Ok(tungstenite::Message::Pong(p)) if p.to_vec() == vec![7u8]));
    }

    #[tokio::test]
    async fn read_pump_times_out_on_silence() {
        tokio::time::pause();
        let (write_tx, _write_rx) = mpsc::channel(16);
        let silent = stream::pending::<Result<tungstenite::Message, tungstenite::Error>>();
        // Returns once the paused clock auto-advances past the deadline.
        read_pump(silent, |_| {}, write_tx, CancellationToken::new()).await;
    }
}
