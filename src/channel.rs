//! Channel adapter seam.
//!
//! Everything that touches the messaging surface itself (opening a chat,
//! scraping visible messages, typing into the composer) lives behind this
//! trait. The engine only ever sees snapshots of currently visible messages
//! and boolean send outcomes; how the adapter obtains them is its own
//! business.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use crate::message::ChatMessage;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Open the named conversation. Returns false when it cannot be found.
    async fn select(&self, conversation: &str) -> Result<bool>;

    /// Snapshot of the most recent messages currently visible in the open
    /// conversation, oldest first, at most `limit` entries. Re-polling may
    /// return overlapping windows; callers reconcile via the ledger.
    async fn poll_visible(&self, conversation: &str, limit: usize) -> Result<Vec<ChatMessage>>;

    async fn send_text(&self, conversation: &str, text: &str) -> Result<bool>;

    async fn react(&self, conversation: &str, target: &ChatMessage, emoji: &str) -> Result<bool>;

    async fn send_media(&self, conversation: &str, files: &[PathBuf]) -> Result<bool>;

    async fn send_gif(&self, conversation: &str, search_term: &str) -> Result<bool>;
}
