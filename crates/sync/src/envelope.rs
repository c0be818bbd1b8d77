/// Wire envelopes and channel names shared by every sync surface
use serde::{Deserialize, Serialize};

use crate::{NoteId, Operation, UserId};
use document::DocumentNode;

/// Channel carrying typing indicators for every friend pair.
pub const TYPING_CHANNEL: &str = "typing";

/// Channel carrying document updates for one note.
pub fn note_channel(note_id: NoteId) -> String {
    format!("note:{}", note_id)
}

/// Channel carrying cursor presence for one note.
pub fn cursor_channel(note_id: NoteId) -> String {
    format!("cursor:{}", note_id)
}

/// Envelope published on a note channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NoteEnvelope {
    Note { update: NoteUpdate },
}

/// Either an incremental operation script or a full document snapshot.
/// Operations decode first: their tagged objects never parse as nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NoteUpdate {
    Operations(Vec<Operation>),
    Snapshot(Vec<DocumentNode>),
}

impl NoteEnvelope {
    pub fn operations(ops: Vec<Operation>) -> Self {
        NoteEnvelope::Note {
            update: NoteUpdate::Operations(ops),
        }
    }

    pub fn snapshot(nodes: Vec<DocumentNode>) -> Self {
        NoteEnvelope::Note {
            update: NoteUpdate::Snapshot(nodes),
        }
    }
}

/// Typing indicator exchanged between friends on the shared typing channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEnvelope {
    pub user_id: UserId,
    pub friend_id: UserId,
    pub is_typing: bool,
}

impl TypingEnvelope {
    /// Whether this indicator is addressed to `me`.
    pub fn is_for(&self, me: UserId) -> bool {
        self.friend_id == me
    }
}
