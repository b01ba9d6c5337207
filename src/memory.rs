//! Long-term conversation memory and its threshold-driven compaction.
//!
//! Each conversation carries a free-text summary of durable facts plus a
//! watermark: the last message already folded into that summary. Messages
//! accrue against a counter, and once enough have piled up the compactor asks
//! the generator to fold the backlog in.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::database::ChatStore;
use crate::llm_client::{MemoryUpdate, ResponseGenerator};
use crate::message::ChatMessage;

/// Persistent per-conversation memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationMemory {
    /// Free-text summary of durable facts about the conversation partner.
    pub summary_text: String,
    /// Last message already folded into the summary. `None` until the first
    /// successful compaction.
    pub watermark: Option<ChatMessage>,
}

/// Folds accumulated messages into each conversation's summary once the
/// pending count crosses `threshold`.
pub struct MemoryCompactor {
    store: Arc<dyn ChatStore>,
    threshold: usize,
    pending: HashMap<String, usize>,
}

impl MemoryCompactor {
    pub fn new(store: Arc<dyn ChatStore>, threshold: usize) -> Self {
        Self {
            store,
            threshold,
            pending: HashMap::new(),
        }
    }

    /// Current memory for a conversation, defaulting to empty.
    pub fn memory(&self, conversation: &str) -> Result<ConversationMemory> {
        Ok(self.store.load_memory(conversation)?.unwrap_or_default())
    }

    /// Count `new_count` freshly recorded messages against the conversation
    /// and compact if the threshold has been reached.
    ///
    /// The counter only resets after a successful compaction; a generator or
    /// store failure leaves it intact so the next cycle retries. `history` is
    /// the full recorded log for the conversation; the compaction window is
    /// everything after the watermark's position in it (the whole log when no
    /// watermark is set or the watermark is no longer found).
    pub async fn maybe_compact(
        &mut self,
        generator: &dyn ResponseGenerator,
        conversation: &str,
        new_count: usize,
        history: &[ChatMessage],
    ) -> Result<bool> {
        let counter = self.pending.entry(conversation.to_string()).or_insert(0);
        *counter += new_count;
        if *counter < self.threshold {
            return Ok(false);
        }

        let mut memory = self.memory(conversation)?;

        let window = match memory
            .watermark
            .as_ref()
            .and_then(|mark| history.iter().rposition(|m| m.key() == mark.key()))
        {
            Some(pos) => &history[pos + 1..],
            None => history,
        };

        if window.is_empty() {
            self.pending.insert(conversation.to_string(), 0);
            return Ok(false);
        }

        let update = generator
            .generate_memory_update(&memory.summary_text, window)
            .await?;

        match update {
            MemoryUpdate::Updated(summary) => {
                tracing::info!("Updated memory for conversation {}", conversation);
                memory.summary_text = summary;
            }
            // The watermark still advances: these messages were considered
            // and found unremarkable.
            MemoryUpdate::Unchanged => {
                tracing::debug!("Memory unchanged for conversation {}", conversation);
            }
        }

        if let Some(last) = window.last() {
            memory.watermark = Some(last.clone());
        }
        self.store.save_memory(conversation, &memory)?;
        self.pending.insert(conversation.to_string(), 0);
        Ok(true)
    }

    pub fn reset(&mut self, conversation: &str) {
        self.pending.remove(conversation);
    }
}
