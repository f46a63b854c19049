//! Ping pump: periodic keepalive towards the rendezvous server.

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use airdelivery_protocol::constants::WS_PING_PERIOD;

pub(crate) async fn ping_pump(
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(WS_PING_PERIOD);
    interval.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if write_tx.send(tungstenite::Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn pings_every_period() {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ping_pump(tx, cancel.clone()));

        tokio::time::sleep(WS_PING_PERIOD * 2 + std::time::Duration::from_millis(10)).await;
        assert!(matches!(rx.try_recv(), Ok(tungstenite::Message::Ping(_))));
        assert!(matches!(rx.try_recv(), Ok(tungstenite::Message::Ping(_))));
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        handle.await.unwrap();
    }
}
