/// WebSocket transport for the shared pub/sub connection, speaking the
/// relay's op-tagged JSON frames
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::EVENT_CHANNEL_CAPACITY;
use crate::{ConnectionEvent, ConnectionStatus, PubSubConnection, Result, SyncError};

/// One frame on the relay wire. Clients send subscribe, unsubscribe and
/// publish; the relay fans publishes back out as message frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RelayFrame {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Publish { channel: String, payload: String },
    Message { channel: String, payload: String },
}

struct WsShared {
    status: Mutex<ConnectionStatus>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Pub/sub connection over a WebSocket to the relay. One writer task owns
/// the sink; one reader task turns incoming frames into connection events.
/// The event channel outlives individual sockets, so subscribers keep
/// their receivers across reconnects.
pub struct WsConnection {
    url: String,
    shared: Arc<WsShared>,
}

impl WsConnection {
    pub fn new(url: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            url: url.into(),
            shared: Arc::new(WsShared {
                status: Mutex::new(ConnectionStatus::Disconnected),
                outbound: Mutex::new(None),
                reader: Mutex::new(None),
                writer: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn send_frame(&self, frame: &RelayFrame) -> Result<()> {
        if *self.shared.status.lock() != ConnectionStatus::Ready {
            return Err(SyncError::ConnectionError(
                "websocket is not connected".into(),
            ));
        }
        let json = serde_json::to_string(frame)?;
        match &*self.shared.outbound.lock() {
            Some(tx) => tx
                .send(Message::Text(json))
                .map_err(|_| SyncError::ConnectionError("websocket writer is gone".into())),
            None => Err(SyncError::ConnectionError(
                "websocket is not connected".into(),
            )),
        }
    }
}

#[async_trait::async_trait]
impl PubSubConnection for WsConnection {
    fn status(&self) -> ConnectionStatus {
        *self.shared.status.lock()
    }

    async fn connect(&self) -> Result<()> {
        {
            let mut status = self.shared.status.lock();
            match *status {
                ConnectionStatus::Ready | ConnectionStatus::Connecting => return Ok(()),
                _ => *status = ConnectionStatus::Connecting,
            }
        }

        let stream = match tokio_tungstenite::connect_async(&self.url).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                *self.shared.status.lock() = ConnectionStatus::Disconnected;
                return Err(SyncError::ConnectionError(format!(
                    "failed to connect to {}: {}",
                    self.url, e
                )));
            }
        };
        info!("websocket connected to {}", self.url);

        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    error!("websocket send failed: {}", e);
                    break;
                }
            }
        });

        let shared = Arc::clone(&self.shared);
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RelayFrame>(&text) {
                        Ok(RelayFrame::Message { channel, payload }) => {
                            let _ = shared
                                .events
                                .send(ConnectionEvent::Message { channel, payload });
                        }
                        Ok(other) => warn!("unexpected frame from relay: {:?}", other),
                        Err(e) => warn!("undecodable frame from relay: {}", e),
                    },
                    Ok(Message::Ping(data)) => {
                        if let Some(tx) = &*shared.outbound.lock() {
                            let _ = tx.send(Message::Pong(data));
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("relay closed the websocket");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = shared.events.send(ConnectionEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            let closed_now = {
                let mut status = shared.status.lock();
                if *status != ConnectionStatus::Closed {
                    *status = ConnectionStatus::Closed;
                    true
                } else {
                    false
                }
            };
            if closed_now {
                let _ = shared.events.send(ConnectionEvent::Closed);
            }
        });

        *self.shared.outbound.lock() = Some(tx);
        if let Some(old) = self.shared.writer.lock().replace(writer) {
            old.abort();
        }
        if let Some(old) = self.shared.reader.lock().replace(reader) {
            old.abort();
        }

        *self.shared.status.lock() = ConnectionStatus::Ready;
        let _ = self.shared.events.send(ConnectionEvent::Ready);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<()> {
        self.send_frame(&RelayFrame::Subscribe {
            channel: channel.to_string(),
        })
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.send_frame(&RelayFrame::Unsubscribe {
            channel: channel.to_string(),
        })
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        if *self.shared.status.lock() != ConnectionStatus::Ready {
            return Err(SyncError::PublishError(format!(
                "cannot publish to {} while disconnected",
                channel
            )));
        }
        self.send_frame(&RelayFrame::Publish {
            channel: channel.to_string(),
            payload,
        })
    }

    async fn quit(&self) -> Result<()> {
        {
            let mut status = self.shared.status.lock();
            if *status == ConnectionStatus::Closed {
                return Ok(());
            }
            *status = ConnectionStatus::Closed;
        }
        if let Some(tx) = self.shared.outbound.lock().take() {
            let _ = tx.send(Message::Close(None));
        }
        // The writer drains the close frame and exits once its channel
        // sender is gone. The reader ends with the socket.
        if let Some(reader) = self.shared.reader.lock().take() {
            reader.abort();
        }
        let _ = self.shared.events.send(ConnectionEvent::Closed);
        info!("websocket to {} closed", self.url);
        Ok(())
    }

    fn force_disconnect(&self) {
        *self.shared.status.lock() = ConnectionStatus::Closed;
        self.shared.outbound.lock().take();
        if let Some(reader) = self.shared.reader.lock().take() {
            reader.abort();
        }
        if let Some(writer) = self.shared.writer.lock().take() {
            writer.abort();
        }
        warn!("websocket to {} force disconnected", self.url);
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }
}
