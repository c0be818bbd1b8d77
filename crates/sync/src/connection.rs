/// Transport seam for the pub/sub substrate: one shared duplex connection
/// behind an object-safe trait, with a broadcast fan-out of its events
use std::collections::HashSet;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::{Result, SyncError};

/// Buffer size of the shared event fan-out.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Ready,
    Closed,
}

/// Events fanned out to every subscription sharing the connection. Each
/// subscription filters `Message` events for its own channel.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Ready,
    Message { channel: String, payload: String },
    Error(String),
    Closed,
}

#[async_trait::async_trait]
pub trait PubSubConnection: Send + Sync {
    fn status(&self) -> ConnectionStatus;

    /// Establishes (or re-establishes) the transport. A no-op when already
    /// ready.
    async fn connect(&self) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<()>;

    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// Graceful shutdown.
    async fn quit(&self) -> Result<()>;

    /// Forced teardown for when the graceful path fails.
    fn force_disconnect(&self);

    /// A fresh receiver on the shared event stream.
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;
}

/// In-process transport: a publish loops straight back to every in-process
/// subscriber of the channel. Backs tests and single-process deployments.
pub struct LoopbackConnection {
    status: Mutex<ConnectionStatus>,
    subscribed: Mutex<HashSet<String>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl LoopbackConnection {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            status: Mutex::new(ConnectionStatus::Disconnected),
            subscribed: Mutex::new(HashSet::new()),
            events,
        }
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscribed.lock().contains(channel)
    }
}

impl Default for LoopbackConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PubSubConnection for LoopbackConnection {
    fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    async fn connect(&self) -> Result<()> {
        *self.status.lock() = ConnectionStatus::Ready;
        let _ = self.events.send(ConnectionEvent::Ready);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<()> {
        if self.status() != ConnectionStatus::Ready {
            return Err(SyncError::ConnectionError("not connected".into()));
        }
        self.subscribed.lock().insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.subscribed.lock().remove(channel);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        if self.status() != ConnectionStatus::Ready {
            return Err(SyncError::PublishError("not connected".into()));
        }
        if self.subscribed.lock().contains(channel) {
            let _ = self.events.send(ConnectionEvent::Message {
                channel: channel.to_string(),
                payload,
            });
        }
        Ok(())
    }

    async fn quit(&self) -> Result<()> {
        *self.status.lock() = ConnectionStatus::Closed;
        let _ = self.events.send(ConnectionEvent::Closed);
        Ok(())
    }

    fn force_disconnect(&self) {
        *self.status.lock() = ConnectionStatus::Closed;
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}
