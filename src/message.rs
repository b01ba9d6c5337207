use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a message was received or sent by us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A single message as observed on the messaging surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub conversation_id: String,
}

impl ChatMessage {
    pub fn is_outgoing(&self) -> bool {
        self.direction == Direction::Outbound
    }

    /// Dedup identity of this message within its conversation.
    pub fn key(&self) -> MessageKey {
        MessageKey {
            content: self.content.clone(),
            timestamp: self.timestamp,
            direction: self.direction,
        }
    }
}

/// Identity key for ledger deduplication: (content, timestamp, direction).
///
/// Sender and conversation are excluded: both are implied by the
/// conversation the snapshot came from, and the same text at distinct
/// timestamps is legitimate. Two distinct messages with identical text in
/// the same second and direction will collide; the channel adapter exposes
/// no per-message sequence number that would let us widen the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
}
