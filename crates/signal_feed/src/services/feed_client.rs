use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    time,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use common::{
    actors::{Actor, ActorType, ControlMessage},
    config::FeedConfig,
    models::SignalBatch,
};

use crate::remote::signal_response::parse_signal_message;

/// Shared wiring of the feed subscription. Each call to `client` yields a
/// fresh actor instance so the supervisor can restart it.
#[derive(Clone)]
pub struct SignalFeed {
    config: FeedConfig,
    batch_tx: mpsc::Sender<SignalBatch>,
    close_rx: watch::Receiver<bool>,
    closed_tx: Arc<watch::Sender<bool>>,
}

/// Lets the owner close the subscription and observe when it is closed.
pub struct FeedHandle {
    close_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl FeedHandle {
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Requests the close and waits until the client has let go of the socket.
    pub async fn close(&self) {
        let _ = self.close_tx.send(true);
        let mut closed = self.closed_rx.clone();
        while !*closed.borrow_and_update() {
            if closed.changed().await.is_err() {
                break;
            }
        }
        info!("Signal feed closed");
    }
}

impl SignalFeed {
    pub fn new(config: FeedConfig, batch_tx: mpsc::Sender<SignalBatch>) -> (Self, FeedHandle) {
        let (close_tx, close_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);

        let feed = Self {
            config,
            batch_tx,
            close_rx,
            closed_tx: Arc::new(closed_tx),
        };
        (
            feed,
            FeedHandle {
                close_tx,
                closed_rx,
            },
        )
    }

    pub fn client(&self) -> SignalFeedClient {
        SignalFeedClient {
            id: Uuid::new_v4(),
            feed: self.clone(),
        }
    }
}

pub struct SignalFeedClient {
    id: Uuid,
    feed: SignalFeed,
}

enum Disconnect {
    Dropped,
    CloseRequested,
    ConsumerGone,
}

#[async_trait]
impl Actor for SignalFeedClient {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> ActorType {
        ActorType::SignalFeedActor
    }

    async fn run(&mut self, supervisor_tx: mpsc::Sender<ControlMessage>) -> anyhow::Result<()> {
        let heartbeat = self.spawn_heartbeat(supervisor_tx.clone());
        let mut close_rx = self.feed.close_rx.clone();
        let url = self.feed.config.url.clone();
        let max_attempts = self.feed.config.max_attempts;
        let mut attempts = 0u32;

        loop {
            if *close_rx.borrow() {
                break;
            }
            attempts += 1;
            info!(
                "Connecting to signal feed: {} (attempt {}/{})",
                url, attempts, max_attempts
            );

            let connected = tokio::select! {
                res = tokio_tungstenite::connect_async(url.as_str()) => res,
                _ = close_rx.changed() => break,
            };

            match connected {
                Ok((ws_stream, _)) => {
                    info!("Connected!");
                    attempts = 0;

                    match self.pump(ws_stream, &mut close_rx).await {
                        Disconnect::Dropped => info!("Closed!"),
                        Disconnect::CloseRequested => break,
                        Disconnect::ConsumerGone => {
                            drop(heartbeat);
                            self.feed.closed_tx.send_replace(true);
                            bail!("Signal consumer dropped, feed has nowhere to forward");
                        }
                    }
                }
                Err(e) => {
                    error!("Connection failed: {}", e);
                    supervisor_tx
                        .send(ControlMessage::Error(
                            self.id,
                            format!("Connection failed: {}", e),
                        ))
                        .await?;
                }
            }

            if attempts >= max_attempts {
                warn!("Stop attempting! Feed unreachable after {} attempts", attempts);
                break;
            }

            info!("Reconnecting in {:?}...", self.feed.config.reconnect_delay);
            tokio::select! {
                _ = time::sleep(self.feed.config.reconnect_delay) => {}
                _ = close_rx.changed() => break,
            }
        }

        drop(heartbeat);
        self.feed.closed_tx.send_replace(true);
        let _ = supervisor_tx.send(ControlMessage::Shutdown(self.id)).await;
        Ok(())
    }
}

impl SignalFeedClient {
    async fn pump(
        &self,
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        close_rx: &mut watch::Receiver<bool>,
    ) -> Disconnect {
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                _ = close_rx.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Disconnect::CloseRequested;
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !self.forward(text.as_str()).await {
                            return Disconnect::ConsumerGone;
                        }
                    }
                    Some(Ok(Message::Ping(pg))) => {
                        let _ = write.send(Message::Pong(pg)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return Disconnect::Dropped,
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        return Disconnect::Dropped;
                    }
                    Some(Ok(_)) => continue,
                }
            }
        }
    }

    /// Returns `false` once nobody is listening for batches anymore.
    async fn forward(&self, text: &str) -> bool {
        match parse_signal_message(text) {
            Ok(batch) => self.feed.batch_tx.send(batch).await.is_ok(),
            Err(e) => {
                debug!("Ignoring feed payload: {}", e);
                true
            }
        }
    }
}
