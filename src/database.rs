//! Durable state: the per-conversation message log and memory store.
//!
//! Both live behind the [`ChatStore`] trait so the persistence backend is
//! swappable without touching reconciliation logic. The default backend is a
//! single SQLite database opened once at startup.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::memory::ConversationMemory;
use crate::message::{ChatMessage, Direction};

/// Read/write access to durable conversation state, keyed by conversation id.
///
/// The ledger and the memory compactor are the only writers; each owns its
/// half of the store exclusively.
pub trait ChatStore: Send + Sync {
    /// All recorded messages for a conversation, in arrival order.
    fn load_messages(&self, conversation: &str) -> Result<Vec<ChatMessage>>;

    /// Append already-deduplicated messages in the given order.
    fn append_messages(&self, conversation: &str, messages: &[ChatMessage]) -> Result<()>;

    fn load_memory(&self, conversation: &str) -> Result<Option<ConversationMemory>>;

    fn save_memory(&self, conversation: &str, memory: &ConversationMemory) -> Result<()>;

    /// Drop all recorded state for a conversation (explicit reset only).
    fn clear_conversation(&self, conversation: &str) -> Result<()>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open the database at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// In-memory database, useful for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS message_log (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                is_outgoing INTEGER NOT NULL,
                recorded_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_message_log_conversation ON message_log(conversation_id)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS chat_memory (
                conversation_id TEXT PRIMARY KEY,
                summary_text TEXT NOT NULL,
                watermark_sender TEXT,
                watermark_content TEXT,
                watermark_timestamp TEXT,
                watermark_is_outgoing INTEGER,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        Ok(())
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("Invalid stored timestamp: {}", raw))
}

fn direction_from_flag(is_outgoing: bool) -> Direction {
    if is_outgoing {
        Direction::Outbound
    } else {
        Direction::Inbound
    }
}

impl ChatStore for SqliteStore {
    fn load_messages(&self, conversation: &str) -> Result<Vec<ChatMessage>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT sender, content, timestamp, is_outgoing
             FROM message_log
             WHERE conversation_id = ?1
             ORDER BY rowid ASC",
        )?;

        let rows = stmt
            .query_map([conversation], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut messages = Vec::with_capacity(rows.len());
        for (sender, content, timestamp, is_outgoing) in rows {
            messages.push(ChatMessage {
                sender,
                content,
                timestamp: parse_timestamp(&timestamp)?,
                direction: direction_from_flag(is_outgoing),
                conversation_id: conversation.to_string(),
            });
        }
        Ok(messages)
    }

    fn append_messages(&self, conversation: &str, messages: &[ChatMessage]) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        for message in messages {
            tx.execute(
                "INSERT INTO message_log (id, conversation_id, sender, content, timestamp, is_outgoing, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    conversation,
                    message.sender,
                    message.content,
                    message.timestamp.to_rfc3339(),
                    message.is_outgoing(),
                    now,
                ],
            )?;
        }
        tx.commit()
            .with_context(|| format!("Failed to append messages for {}", conversation))?;
        Ok(())
    }

    fn load_memory(&self, conversation: &str) -> Result<Option<ConversationMemory>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT summary_text, watermark_sender, watermark_content, watermark_timestamp, watermark_is_outgoing
                 FROM chat_memory
                 WHERE conversation_id = ?1",
                [conversation],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<bool>>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((summary_text, sender, content, timestamp, is_outgoing)) = row else {
            return Ok(None);
        };

        let watermark = match (sender, content, timestamp, is_outgoing) {
            (Some(sender), Some(content), Some(timestamp), Some(is_outgoing)) => {
                Some(ChatMessage {
                    sender,
                    content,
                    timestamp: parse_timestamp(&timestamp)?,
                    direction: direction_from_flag(is_outgoing),
                    conversation_id: conversation.to_string(),
                })
            }
            _ => None,
        };

        Ok(Some(ConversationMemory {
            summary_text,
            watermark,
        }))
    }

    fn save_memory(&self, conversation: &str, memory: &ConversationMemory) -> Result<()> {
        let conn = self.lock_conn()?;
        let watermark = memory.watermark.as_ref();
        conn.execute(
            "INSERT OR REPLACE INTO chat_memory
                 (conversation_id, summary_text, watermark_sender, watermark_content,
                  watermark_timestamp, watermark_is_outgoing, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conversation,
                memory.summary_text,
                watermark.map(|m| m.sender.clone()),
                watermark.map(|m| m.content.clone()),
                watermark.map(|m| m.timestamp.to_rfc3339()),
                watermark.map(|m| m.is_outgoing()),
                Utc::now().to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to save memory for {}", conversation))?;
        Ok(())
    }

    fn clear_conversation(&self, conversation: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "DELETE FROM message_log WHERE conversation_id = ?1",
            [conversation],
        )?;
        conn.execute(
            "DELETE FROM chat_memory WHERE conversation_id = ?1",
            [conversation],
        )?;
        Ok(())
    }
}
