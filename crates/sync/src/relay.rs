/// Channel relay: accepts WebSocket clients, tracks their channel
/// subscriptions and fans published payloads out to everyone else
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{RelayFrame, Result, SyncError};

type ClientTx = mpsc::UnboundedSender<Message>;

/// Identifier for one relay client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// In-memory channel registry: channel name to subscribed clients.
#[derive(Default)]
pub struct RelayHub {
    channels: Mutex<HashMap<String, HashMap<ClientId, ClientTx>>>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the client to a channel. Subscribing twice is a no-op.
    pub fn subscribe(&self, channel: &str, client: ClientId, tx: ClientTx) {
        let mut channels = self.channels.lock();
        channels
            .entry(channel.to_string())
            .or_default()
            .insert(client, tx);
        debug!("client {} subscribed to {}", client, channel);
    }

    pub fn unsubscribe(&self, channel: &str, client: ClientId) {
        let mut channels = self.channels.lock();
        if let Some(members) = channels.get_mut(channel) {
            members.remove(&client);
            if members.is_empty() {
                channels.remove(channel);
            }
        }
    }

    /// Fans a payload out to every channel member except the publisher.
    /// Returns how many clients the frame was handed to.
    pub fn publish(&self, channel: &str, payload: &str, publisher: ClientId) -> usize {
        let frame = RelayFrame::Message {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                error!("failed to encode message frame: {}", e);
                return 0;
            }
        };

        let channels = self.channels.lock();
        let members = match channels.get(channel) {
            Some(members) => members,
            None => return 0,
        };

        let mut delivered = 0;
        for (client, tx) in members {
            if *client == publisher {
                continue;
            }
            if tx.send(Message::Text(json.clone())).is_ok() {
                delivered += 1;
            } else {
                warn!("dropping frame for gone client {}", client);
            }
        }
        delivered
    }

    /// Removes the client from every channel it joined.
    pub fn disconnect(&self, client: ClientId) {
        let mut channels = self.channels.lock();
        channels.retain(|_, members| {
            members.remove(&client);
            !members.is_empty()
        });
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.lock().get(channel).map_or(0, |m| m.len())
    }
}

/// The relay server. Owns the hub and the accept loop.
pub struct RelayServer {
    bind_addr: String,
    hub: Arc<RelayHub>,
}

impl RelayServer {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            hub: Arc::new(RelayHub::new()),
        }
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }

    /// Binds the listener and reports the bound address. Binding port 0
    /// picks a free port, which tests rely on.
    pub async fn bind(&self) -> Result<(TcpListener, SocketAddr)> {
        let listener = TcpListener::bind(&self.bind_addr).await.map_err(|e| {
            SyncError::ConnectionError(format!("failed to bind {}: {}", self.bind_addr, e))
        })?;
        let addr = listener
            .local_addr()
            .map_err(|e| SyncError::ConnectionError(e.to_string()))?;
        info!("relay listening on {}", addr);
        Ok((listener, addr))
    }

    /// Binds and runs the accept loop until the listener fails.
    pub async fn run(self) -> Result<()> {
        let (listener, _addr) = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| SyncError::ConnectionError(format!("accept failed: {}", e)))?;
            debug!("new connection from {}", addr);
            let hub = Arc::clone(&self.hub);
            tokio::spawn(handle_client(stream, addr, hub));
        }
    }
}

async fn handle_client(stream: TcpStream, addr: SocketAddr, hub: Arc<RelayHub>) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("websocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let client = ClientId::new();
    info!("client {} connected from {}", client, addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    // Task to send frames to this client
    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = ws_sender.send(message).await {
                error!("failed to send to client: {}", e);
                break;
            }
        }
    });

    while let Some(message) = ws_receiver.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                warn!("error receiving from client {}: {}", client, e);
                break;
            }
        };

        match message {
            Message::Text(text) => match serde_json::from_str::<RelayFrame>(&text) {
                Ok(RelayFrame::Subscribe { channel }) => {
                    hub.subscribe(&channel, client, tx.clone());
                }
                Ok(RelayFrame::Unsubscribe { channel }) => {
                    hub.unsubscribe(&channel, client);
                }
                Ok(RelayFrame::Publish { channel, payload }) => {
                    let delivered = hub.publish(&channel, &payload, client);
                    debug!(
                        "client {} published to {}, {} delivered",
                        client, channel, delivered
                    );
                }
                Ok(RelayFrame::Message { .. }) => {
                    warn!("client {} sent a server-only frame", client);
                }
                Err(e) => warn!("undecodable frame from client {}: {}", client, e),
            },
            Message::Ping(data) => {
                let _ = tx.send(Message::Pong(data));
            }
            Message::Close(_) => {
                debug!("client {} requested close", client);
                break;
            }
            _ => {}
        }
    }

    hub.disconnect(client);
    send_task.abort();
    info!("client {} disconnected", client);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member() -> (ClientId, ClientTx, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientId::new(), tx, rx)
    }

    fn decode(message: Message) -> RelayFrame {
        match message {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn publish_skips_the_publisher() {
        let hub = RelayHub::new();
        let (alice, alice_tx, mut alice_rx) = member();
        let (bob, bob_tx, mut bob_rx) = member();
        hub.subscribe("note:doc", alice, alice_tx);
        hub.subscribe("note:doc", bob, bob_tx);

        let delivered = hub.publish("note:doc", "payload", alice);
        assert_eq!(delivered, 1);

        let frame = decode(bob_rx.recv().await.unwrap());
        assert_eq!(
            frame,
            RelayFrame::Message {
                channel: "note:doc".to_string(),
                payload: "payload".to_string(),
            }
        );
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_reaches_only_the_named_channel() {
        let hub = RelayHub::new();
        let (bob, bob_tx, mut bob_rx) = member();
        hub.subscribe("cursor:doc", bob, bob_tx);

        assert_eq!(hub.publish("note:doc", "payload", ClientId::new()), 0);
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_removes_the_client_everywhere() {
        let hub = RelayHub::new();
        let (alice, alice_tx, _alice_rx) = member();
        hub.subscribe("note:doc", alice, alice_tx.clone());
        hub.subscribe("typing", alice, alice_tx);
        assert_eq!(hub.subscriber_count("note:doc"), 1);

        hub.disconnect(alice);
        assert_eq!(hub.subscriber_count("note:doc"), 0);
        assert_eq!(hub.subscriber_count("typing"), 0);
    }

    #[tokio::test]
    async fn unsubscribe_leaves_other_members_in_place() {
        let hub = RelayHub::new();
        let (alice, alice_tx, _alice_rx) = member();
        let (bob, bob_tx, mut bob_rx) = member();
        hub.subscribe("typing", alice, alice_tx);
        hub.subscribe("typing", bob, bob_tx);

        hub.unsubscribe("typing", alice);
        assert_eq!(hub.subscriber_count("typing"), 1);

        hub.publish("typing", "still here", ClientId::new());
        assert!(bob_rx.recv().await.is_some());
    }
}
