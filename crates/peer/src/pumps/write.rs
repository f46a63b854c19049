//! Write pump: serialises outbound signaling messages.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Writes queued messages to the socket, closing it on the way out.
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
                let Some(m) = msg else { break };
                if let Err(e) = write.send(m).await {
                    error!("signaling write error: {e}");
                    break;
                }
            }
        }
    }

    let _ = write.send(tungstenite::Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::sink;

    fn capture_sink(
        tx: mpsc::Sender<tungstenite::Message>,
    ) -> impl SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin {
        Box::pin(sink::unfold(tx, |tx, msg: tungstenite::Message| async move {
            let _ = tx.send(msg).await;
            Ok::<_, tungstenite::Error>(tx)
        }))
    }

    #[tokio::test]
    async fn forwards_queued_messages_then_closes() {
        let (sink_tx, mut sink_rx) = mpsc::channel(16);
        let (write_tx, write_rx) = mpsc::channel(16);
        let handle = tokio::spawn(write_pump(
            capture_sink(sink_tx),
            write_rx,
            CancellationToken::new(),
        ));

        write_tx
            .send(tungstenite::Message::Text("hello".into()))
            .await
            .unwrap();
        drop(write_tx);
        handle.await.unwrap();

        assert!(matches!(sink_rx.recv().await, Some(tungstenite::Message::Text(t)) if t.as_str() == "hello"));
        assert!(matches!(sink_rx.recv().await, Some(tungstenite::Message::Close(None))));
    }

    #[tokio::test]
    async fn stops_on_cancel() {
        let (sink_tx, _sink_rx) = mpsc::channel(16);
        let (_write_tx, write_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(write_pump(capture_sink(sink_tx), write_rx, cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");
    }
}
