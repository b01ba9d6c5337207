//! Append-only, deduplicated message history per conversation, plus the
//! reconciliation that turns a re-polled snapshot into a "what is new" delta.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;

use crate::database::ChatStore;
use crate::message::{ChatMessage, MessageKey};

struct ConversationLedger {
    messages: Vec<ChatMessage>,
    keys: HashSet<MessageKey>,
}

impl ConversationLedger {
    fn from_messages(messages: Vec<ChatMessage>) -> Self {
        let keys = messages.iter().map(ChatMessage::key).collect();
        Self { messages, keys }
    }
}

/// Source of truth for "have we seen this message before".
///
/// Conversations are loaded lazily from the store on first touch and grow
/// monotonically; new entries are persisted before the in-memory view is
/// updated, so a store failure never silently forgets dedup history.
pub struct MessageLedger {
    store: Arc<dyn ChatStore>,
    lookback: usize,
    conversations: HashMap<String, ConversationLedger>,
}

impl MessageLedger {
    pub fn open(store: Arc<dyn ChatStore>, lookback: usize) -> Self {
        Self {
            store,
            lookback,
            conversations: HashMap::new(),
        }
    }

    fn entry(&mut self, conversation: &str) -> Result<&mut ConversationLedger> {
        match self.conversations.entry(conversation.to_string()) {
            Entry::Occupied(occupied) => Ok(occupied.into_mut()),
            Entry::Vacant(vacant) => {
                let messages = self.store.load_messages(conversation)?;
                Ok(vacant.insert(ConversationLedger::from_messages(messages)))
            }
        }
    }

    /// Record every not-yet-seen message in `snapshot`, preserving snapshot
    /// order among the new entries. Interleaving with previously stored
    /// messages follows arrival order, not timestamp order. Returns how many
    /// messages were newly recorded.
    pub fn record(&mut self, conversation: &str, snapshot: &[ChatMessage]) -> Result<usize> {
        let store = Arc::clone(&self.store);
        let ledger = self.entry(conversation)?;

        let mut fresh: Vec<ChatMessage> = Vec::new();
        for message in snapshot {
            let key = message.key();
            if ledger.keys.contains(&key) {
                continue;
            }
            if fresh.iter().any(|m| m.key() == key) {
                continue;
            }
            fresh.push(message.clone());
        }

        if fresh.is_empty() {
            return Ok(0);
        }

        store.append_messages(conversation, &fresh)?;

        let recorded = fresh.len();
        for message in fresh {
            ledger.keys.insert(message.key());
            ledger.messages.push(message);
        }
        tracing::debug!(
            "Recorded {} new message(s) for conversation {}",
            recorded,
            conversation
        );
        Ok(recorded)
    }

    pub fn contains(&mut self, conversation: &str, key: &MessageKey) -> Result<bool> {
        Ok(self.entry(conversation)?.keys.contains(key))
    }

    /// The `n` most recently recorded messages, oldest first.
    pub fn tail(&mut self, conversation: &str, n: usize) -> Result<Vec<ChatMessage>> {
        let ledger = self.entry(conversation)?;
        let start = ledger.messages.len().saturating_sub(n);
        Ok(ledger.messages[start..].to_vec())
    }

    pub fn len(&mut self, conversation: &str) -> Result<usize> {
        Ok(self.entry(conversation)?.messages.len())
    }

    pub fn is_empty(&mut self, conversation: &str) -> Result<bool> {
        Ok(self.entry(conversation)?.messages.is_empty())
    }

    /// Subset of `snapshot` not yet recorded, in snapshot order.
    ///
    /// Membership is checked against the identity keys of the ledger tail
    /// (bounded lookback) to bound comparison cost; the polled snapshot is
    /// bounded similarly by the caller. With `after_last_outgoing`, the
    /// result is truncated to the suffix strictly after its own last
    /// outbound element; when no outbound element is present the whole
    /// filtered list is returned. Read-only: callers record the snapshot
    /// afterwards whatever happens downstream.
    pub fn delta(
        &mut self,
        conversation: &str,
        snapshot: &[ChatMessage],
        after_last_outgoing: bool,
    ) -> Result<Vec<ChatMessage>> {
        let lookback = self.lookback;
        let ledger = self.entry(conversation)?;

        let start = ledger.messages.len().saturating_sub(lookback);
        let recent: HashSet<MessageKey> =
            ledger.messages[start..].iter().map(ChatMessage::key).collect();

        let mut filtered: Vec<ChatMessage> = snapshot
            .iter()
            .filter(|m| !recent.contains(&m.key()))
            .cloned()
            .collect();

        if after_last_outgoing {
            if let Some(pos) = filtered.iter().rposition(ChatMessage::is_outgoing) {
                filtered = filtered.split_off(pos + 1);
            }
        }

        Ok(filtered)
    }

    /// Explicit reset: clears both the in-memory view and the stored log.
    pub fn reset(&mut self, conversation: &str) -> Result<()> {
        self.store.clear_conversation(conversation)?;
        self.conversations.remove(conversation);
        Ok(())
    }
}
