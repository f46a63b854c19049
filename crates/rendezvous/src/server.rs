//! Rendezvous WebSocket server.
//!
//! Every accepted TCP connection is either a plain `GET /health` probe,
//! answered inline, or upgraded to WebSocket and registered as a peer for
//! as long as the socket stays up.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use airdelivery_protocol::constants::{FLIGHT_SWEEP_INTERVAL, WS_MAX_MESSAGE_SIZE};

use crate::address::PeerAddress;
use crate::connection::{self, Sender};
use crate::registry::SessionRegistry;
use crate::{SEND_BUFFER_SIZE, ServerError, handler};

/// How long to wait for the first request bytes before assuming a
/// WebSocket client.
const PEEK_TIMEOUT: Duration = Duration::from_secs(5);

const HEALTH_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Period of the inactive-flight sweep.
    pub sweep_interval: Duration,
    /// Largest accepted WebSocket message in bytes.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 5500,
            sweep_interval: FLIGHT_SWEEP_INTERVAL,
            max_message_size: WS_MAX_MESSAGE_SIZE,
        }
    }
}

/// The rendezvous server.
pub struct RendezvousServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl RendezvousServer {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Returns the bound address. Only available once [`run`] has bound
    /// the socket.
    ///
    /// [`run`]: Self::run
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Stops the accept loop, the sweeper and every open connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        info!("rendezvous server listening on {local_addr}");

        let sweeper = self.spawn_sweeper();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    debug!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => error!("accept error: {e}"),
                    }
                }
            }
        }

        let _ = sweeper.await;
        Ok(())
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let cancel = self.cancel.clone();
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = registry.sweep();
                        if removed > 0 {
                            info!(removed, "swept inactive flights");
                        }
                    }
                }
            }
        })
    }

    async fn handle_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        if is_health_probe(&stream).await {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await?;
            stream.write_all(HEALTH_RESPONSE).await?;
            stream.shutdown().await?;
            debug!(%peer_addr, "answered health probe");
            return Ok(());
        }

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);
        ws_config.max_frame_size = Some(self.config.max_message_size);

        let mut headers = HeaderMap::new();
        let capture = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            headers = req.headers().clone();
            Ok(resp)
        };
        let ws_stream = accept_hdr_async_with_config(stream, capture, Some(ws_config)).await?;
        let (write, read) = ws_stream.split();

        let cancel = self.cancel.child_token();
        let (write_tx, write_rx) = mpsc::channel(SEND_BUFFER_SIZE);
        let sender = Sender::new(write_tx.clone(), cancel.clone());
        tokio::spawn(connection::write_pump(write, write_rx, cancel.clone()));
        tokio::spawn(connection::ping_pump(write_tx.clone(), cancel.clone()));

        let address = PeerAddress::from_request(&headers, peer_addr);
        let me = self.registry.connect(address, sender.clone());

        let registry = Arc::clone(&self.registry);
        connection::read_pump(
            read,
            |text| handler::dispatch(&registry, &me.id, &sender, text),
            write_tx,
            cancel.clone(),
        )
        .await;

        self.registry.disconnect(&me.id);
        cancel.cancel();
        Ok(())
    }
}

/// Peeks at the request line without consuming it.
async fn is_health_probe(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 32];
    match tokio::time::timeout(PEEK_TIMEOUT, stream.peek(&mut buf)).await {
        Ok(Ok(n)) => {
            let line = &buf[..n];
            line.starts_with(b"GET /health ") || line.starts_with(b"GET /health?")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> ServerConfig {
        ServerConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..ServerConfig::default()
        }
    }

    async fn start(config: ServerConfig) -> (Arc<RendezvousServer>, JoinHandle<()>) {
        let server = RendezvousServer::new(config);
        let runner = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            runner.run().await.unwrap();
        });
        for _ in 0..100 {
            if server.port().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        (server, handle)
    }

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 5500);
        assert_eq!(config.sweep_interval, Duration::from_secs(120));
        assert_eq!(config.max_message_size, 1024 * 1024);
    }

    #[tokio::test]
    async fn binds_dynamic_port_and_shuts_down() {
        let (server, handle) = start(local_config()).await;
        assert!(server.port().await > 0);
        server.shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("run should return")
            .unwrap();
    }

    #[tokio::test]
    async fn health_probe_gets_ok() {
        let (server, handle) = start(local_config()).await;
        let addr = server.local_addr().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("OK"));
        assert_eq!(server.registry().peer_count(), 0);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn sweeper_reclaims_abandoned_flights() {
        let (server, handle) = start(ServerConfig {
            sweep_interval: Duration::from_millis(20),
            ..local_config()
        })
        .await;

        let registry = server.registry();
        let (tx, _rx) = mpsc::channel(16);
        let owner = registry.connect(
            PeerAddress::classify("127.0.0.1"),
            Sender::new(tx, CancellationToken::new()),
        );
        let (tx, _rx2) = mpsc::channel(16);
        let member = registry.connect(
            PeerAddress::classify("127.0.0.1"),
            Sender::new(tx, CancellationToken::new()),
        );
        let code = registry.create_flight(&owner.id);
        registry.join_flight(&member.id, &code).unwrap();
        registry.leave(&owner.id);
        assert!(registry.flight(&code).is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.flight(&code).is_none());

        server.shutdown();
        handle.await.unwrap();
    }
}
