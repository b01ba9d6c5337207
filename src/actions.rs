//! Scheduled side effects produced by the response pipeline.

use chrono::{DateTime, Utc};

use crate::message::ChatMessage;

/// Double newline marks a multi-segment reply that should go out as
/// separate messages.
pub const SEGMENT_SEPARATOR: &str = "\n\n";

/// A typed side effect awaiting dispatch. Every variant carries the
/// conversation it belongs to and the instant it becomes due.
#[derive(Debug, Clone)]
pub enum Action {
    SendMessage {
        conversation_id: String,
        content: String,
        scheduled_at: DateTime<Utc>,
    },
    React {
        conversation_id: String,
        target: ChatMessage,
        emoji: String,
        scheduled_at: DateTime<Utc>,
    },
    SendImage {
        conversation_id: String,
        prompt: String,
        count: usize,
        model: String,
        filename: String,
        scheduled_at: DateTime<Utc>,
    },
    SendGif {
        conversation_id: String,
        search_term: String,
        confirm: bool,
        scheduled_at: DateTime<Utc>,
    },
}

impl Action {
    pub fn conversation_id(&self) -> &str {
        match self {
            Action::SendMessage {
                conversation_id, ..
            }
            | Action::React {
                conversation_id, ..
            }
            | Action::SendImage {
                conversation_id, ..
            }
            | Action::SendGif {
                conversation_id, ..
            } => conversation_id,
        }
    }

    pub fn scheduled_at(&self) -> DateTime<Utc> {
        match self {
            Action::SendMessage { scheduled_at, .. }
            | Action::React { scheduled_at, .. }
            | Action::SendImage { scheduled_at, .. }
            | Action::SendGif { scheduled_at, .. } => *scheduled_at,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at() <= now
    }

    /// Split a multi-segment text reply into one action per segment. Segments
    /// inherit the original fire time and conversation, so they dispatch in
    /// enqueue order within the same tick. Non-text actions pass through.
    pub fn into_segments(self) -> Vec<Action> {
        match self {
            Action::SendMessage {
                conversation_id,
                content,
                scheduled_at,
            } if content.contains(SEGMENT_SEPARATOR) => content
                .split(SEGMENT_SEPARATOR)
                .map(str::trim)
                .filter(|segment| !segment.is_empty())
                .map(|segment| Action::SendMessage {
                    conversation_id: conversation_id.clone(),
                    content: segment.to_string(),
                    scheduled_at,
                })
                .collect(),
            other => vec![other],
        }
    }
}
