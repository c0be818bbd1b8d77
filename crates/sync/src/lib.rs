/// Real-time synchronization engine for collaborative note editing:
/// tree diffing, operation batching, presence, and resilient pub/sub delivery
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod operations;
pub use operations::*;

mod diff;
pub use diff::*;

mod batcher;
pub use batcher::*;

mod presence;
pub use presence::*;

mod typing;
pub use typing::*;

mod queue;
pub use queue::*;

mod connection;
pub use connection::*;

mod ws;
pub use ws::*;

mod subscription;
pub use subscription::*;

mod envelope;
pub use envelope::*;

mod relay;
pub use relay::*;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("connection not ready after {0}ms")]
    ConnectionTimeout(u64),

    #[error("subscription error: {0}")]
    SubscriptionError(String),

    #[error("publish error: {0}")]
    PublishError(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("document error: {0}")]
    DocumentError(#[from] document::DocumentError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// User identifier carried by presence, typing, and subscription state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub uuid::Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Note identifier, used to derive per-document channel names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NoteId(pub uuid::Uuid);

impl NoteId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for NoteId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
