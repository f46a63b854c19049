//! Read pump: routes replies to waiting requests and forwards pushes.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use airdelivery_protocol::constants::WS_PONG_WAIT;
use airdelivery_protocol::envelope::Message;

use crate::signaling::PendingRequests;

/// Reads the socket until it closes, is canceled, or stays silent longer
/// than [`WS_PONG_WAIT`]. Dropping `pushes` on exit tells the owner the
/// connection is gone.
pub(crate) async fn read_pump<S>(
    mut read: S,
    pending: PendingRequests,
    pushes: mpsc::UnboundedSender<Message>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                warn!("no traffic from rendezvous server, closing");
                break;
            }

            msg = read.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!("signaling read error: {e}");
                        break;
                    }
                    None => {
                        debug!("signaling stream ended");
                        break;
                    }
                };
                pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                match msg {
                    tungstenite::Message::Text(text) => {
                        handle_text(text.as_str(), &pending, &pushes).await;
                    }
                    tungstenite::Message::Ping(data) => {
                        let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                    }
                    tungstenite::Message::Close(_) => {
                        debug!("rendezvous server closed the connection");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // Fail every outstanding request instead of letting it time out.
    pending.lock().await.clear();
    cancel.cancel();
}

async fn handle_text(
    text: &str,
    pending: &PendingRequests,
    pushes: &mpsc::UnboundedSender<Message>,
) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse signaling message: {e}");
            return;
        }
    };
    trace!(msg_type = ?msg.msg_type, id = %msg.id, "received message");

    if !msg.is_push() {
        if let Some(tx) = pending.lock().await.remove(&msg.id) {
            let _ = tx.send(msg);
            return;
        }
        debug!(id = %msg.id, "reply for unknown request");
        return;
    }

    if pushes.send(msg).is_err() {
        trace!("push dropped, nobody listening");
    }
}
