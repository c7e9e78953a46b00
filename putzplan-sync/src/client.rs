//! [`RealtimeFeed`] over a WebSocket connection to a [`FeedServer`](crate::server::FeedServer).
//!
//! Each subscription owns one connection and one reader task. The reader
//! decodes `Change` frames and forwards their events on the subscription's
//! channel; it stops when the server closes, the subscriber drops the
//! receiver, or `unsubscribe` asks it to.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{FeedMessage, MessageType};
use crate::realtime::{FeedError, RealtimeFeed, Subscription, SubscriptionHandle};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Events buffered between the reader task and the merge loop
    pub event_buffer: usize,
    /// Connect + Subscribe/Subscribed round trip
    pub handshake_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            event_buffer: 256,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

struct Connection {
    shutdown: oneshot::Sender<()>,
    reader: JoinHandle<()>,
}

pub struct WsFeed {
    url: String,
    config: ClientConfig,
    connections: Mutex<HashMap<SubscriptionHandle, Connection>>,
}

impl WsFeed {
    pub fn new(url: impl Into<String>, config: ClientConfig) -> Self {
        Self {
            url: url.into(),
            config,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn active_subscriptions(&self) -> usize {
        self.connections.lock().await.len()
    }
}

#[async_trait]
impl RealtimeFeed for WsFeed {
    async fn subscribe(&self, household_id: Uuid) -> Result<Subscription, FeedError> {
        let handshake = async {
            let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
                .await
                .map_err(|e| FeedError::Connection(e.to_string()))?;
            let (mut writer, mut reader) = ws_stream.split();

            let hello = FeedMessage::subscribe(household_id)
                .encode()
                .map_err(|e| FeedError::Handshake(e.to_string()))?;
            writer
                .send(Message::Binary(hello.into()))
                .await
                .map_err(|e| FeedError::Connection(e.to_string()))?;

            loop {
                match reader.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        let msg = FeedMessage::decode(&data).map_err(|e| FeedError::Handshake(e.to_string()))?;
                        if msg.msg_type != MessageType::Subscribed {
                            return Err(FeedError::Handshake(format!("unexpected {:?}", msg.msg_type)));
                        }
                        return Ok::<_, FeedError>((writer, reader, msg.sequence));
                    }
                    Some(Ok(Message::Close(_))) | None => return Err(FeedError::Closed),
                    Some(Err(e)) => return Err(FeedError::Connection(e.to_string())),
                    Some(Ok(_)) => continue,
                }
            }
        };

        let (mut writer, mut reader, sequence) = tokio::time::timeout(self.config.handshake_timeout, handshake)
            .await
            .map_err(|_| FeedError::Timeout)??;
        log::info!("Subscribed to {} for household {household_id} at sequence {sequence}", self.url);

        let (tx, events) = mpsc::channel(self.config.event_buffer.max(1));
        let (shutdown, mut shutdown_rx) = oneshot::channel();

        let reader_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        let _ = writer.send(Message::Close(None)).await;
                        break;
                    }
                    msg = reader.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let msg = match FeedMessage::decode(&data) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    log::warn!("Undecodable feed frame: {e}");
                                    continue;
                                }
                            };
                            if msg.msg_type != MessageType::Change || msg.household_id != household_id {
                                continue;
                            }
                            match msg.change_event() {
                                Ok(event) => {
                                    if tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => log::warn!("Malformed change {}: {e}", msg.sequence),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = writer.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Feed for household {household_id} closed by server");
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("Feed connection error for household {household_id}: {e}");
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        });

        let handle = SubscriptionHandle::new();
        self.connections.lock().await.insert(
            handle,
            Connection {
                shutdown,
                reader: reader_task,
            },
        );
        Ok(Subscription { handle, events })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let Some(mut connection) = self.connections.lock().await.remove(&handle) else {
            return;
        };
        let _ = connection.shutdown.send(());
        if tokio::time::timeout(Duration::from_secs(1), &mut connection.reader).await.is_err() {
            connection.reader.abort();
        }
    }
}
