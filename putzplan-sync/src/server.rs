//! WebSocket relay for household change feeds.
//!
//! Architecture:
//! ```text
//! MemoryRemote ── publish ──► ChannelRegistry ──┬── HouseholdChannel (h1) ──┬── Client A
//!   (or any writer)                             │                           └── Client B
//!                                               └── HouseholdChannel (h2) ───── Client C
//! ```
//!
//! Connection lifecycle:
//! 1. client sends `Subscribe { household_id }` as its first binary frame;
//! 2. server acks with `Subscribed` carrying the channel's last sequence;
//! 3. server forwards every frame published on the household channel and
//!    answers `Ping` with `Pong` until either side closes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::ChannelRegistry;
use crate::protocol::{FeedMessage, MessageType};

type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Connections beyond this per household are closed after the handshake
    pub max_subscribers_per_household: usize,
    /// How long a new connection may take to send `Subscribe`
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_subscribers_per_household: 100,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_forwarded: u64,
    pub bytes_forwarded: u64,
    pub rejected_connections: u64,
}

pub struct FeedServer {
    config: ServerConfig,
    channels: Arc<ChannelRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl FeedServer {
    pub fn new(config: ServerConfig, channels: Arc<ChannelRegistry>) -> Self {
        Self {
            config,
            channels,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Feed server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let channels = self.channels.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, channels, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        channels: Arc<ChannelRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> ConnectionResult {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        stats.write().await.total_connections += 1;

        // First frame must be a Subscribe.
        let household_id = match tokio::time::timeout(config.handshake_timeout, ws_receiver.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => match FeedMessage::decode(&data) {
                Ok(msg) if msg.msg_type == MessageType::Subscribe => msg.household_id,
                Ok(msg) => {
                    log::warn!("Expected Subscribe from {addr}, got {:?}", msg.msg_type);
                    return Self::reject(ws_sender, &stats).await;
                }
                Err(e) => {
                    log::warn!("Undecodable handshake from {addr}: {e}");
                    return Self::reject(ws_sender, &stats).await;
                }
            },
            Ok(_) => {
                log::debug!("Connection from {addr} closed before subscribing");
                return Ok(());
            }
            Err(_) => {
                log::warn!("Handshake timeout from {addr}");
                return Self::reject(ws_sender, &stats).await;
            }
        };

        let channel = channels.get_or_create(household_id).await;
        if channel.subscriber_count().await >= config.max_subscribers_per_household {
            log::warn!("Household {household_id} is full, rejecting {addr}");
            channels.remove_if_empty(&household_id).await;
            return Self::reject(ws_sender, &stats).await;
        }

        let subscriber_id = Uuid::new_v4();
        let mut frames = channel.add_subscriber(subscriber_id).await;
        stats.write().await.active_connections += 1;

        let ack = FeedMessage::subscribed(household_id, channel.last_sequence()).encode()?;
        let result = async {
            ws_sender.send(Message::Binary(ack.into())).await?;
            log::info!("Client {addr} subscribed to household {household_id}");

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => match FeedMessage::decode(&data) {
                                Ok(msg) if msg.msg_type == MessageType::Ping => {
                                    let pong = FeedMessage::pong(household_id).encode()?;
                                    ws_sender.send(Message::Binary(pong.into())).await?;
                                }
                                Ok(msg) => {
                                    log::debug!("Ignoring {:?} from {addr}", msg.msg_type);
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                }
                            },
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    frame = frames.recv() => {
                        match frame {
                            Ok(data) => {
                                let len = data.len() as u64;
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                                let mut s = stats.write().await;
                                s.frames_forwarded += 1;
                                s.bytes_forwarded += len;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Client {addr} lagged by {n} changes");
                                channel.record_lag(n);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            ConnectionResult::Ok(())
        }
        .await;

        channel.remove_subscriber(&subscriber_id).await;
        if channels.remove_if_empty(&household_id).await {
            log::debug!("Channel for household {household_id} removed (empty)");
        }
        stats.write().await.active_connections -= 1;
        result
    }

    async fn reject<S>(mut ws_sender: S, stats: &RwLock<ServerStats>) -> ConnectionResult
    where
        S: Sink<Message> + Unpin,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        stats.write().await.rejected_connections += 1;
        ws_sender.send(Message::Close(None)).await?;
        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }
}
