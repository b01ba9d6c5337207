//! Delayed action queue and dispatch.
//!
//! Actions sit in an in-memory queue until their fire time arrives. Dispatch
//! is at-most-once: an action leaves the queue the moment it is attempted,
//! and a failed send is logged rather than retried, so a flaky adapter can
//! never replay half-sent replies.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::actions::Action;
use crate::channel::ChannelAdapter;
use crate::image_gen::ImageGenerator;

#[derive(Default)]
pub struct ActionScheduler {
    queue: Vec<Action>,
}

impl ActionScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an action, splitting multi-segment replies so each segment goes
    /// out as its own message. Insertion order is dispatch order for actions
    /// due in the same tick.
    pub fn enqueue(&mut self, action: Action) {
        for segment in action.into_segments() {
            tracing::debug!(
                "Queued action for {} at {}",
                segment.conversation_id(),
                segment.scheduled_at()
            );
            self.queue.push(segment);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn has_pending(&self, conversation: &str) -> bool {
        self.queue
            .iter()
            .any(|a| a.conversation_id() == conversation)
    }

    /// Drop every queued action for a conversation.
    pub fn cancel_conversation(&mut self, conversation: &str) {
        self.queue.retain(|a| a.conversation_id() != conversation);
    }

    /// Dispatch everything due at `now`, in insertion order. Returns how
    /// many actions were attempted.
    pub async fn tick(
        &mut self,
        now: DateTime<Utc>,
        adapter: &dyn ChannelAdapter,
        image_gen: Option<&ImageGenerator>,
    ) -> usize {
        let mut due = Vec::new();
        let mut remaining = Vec::with_capacity(self.queue.len());
        for action in self.queue.drain(..) {
            if action.is_due(now) {
                due.push(action);
            } else {
                remaining.push(action);
            }
        }
        self.queue = remaining;

        let mut selected: Option<String> = None;
        for action in &due {
            let conversation = action.conversation_id();
            if selected.as_deref() != Some(conversation) {
                match adapter.select(conversation).await {
                    Ok(true) => selected = Some(conversation.to_string()),
                    Ok(false) => {
                        tracing::warn!("Conversation {} not found, dropping action", conversation);
                        selected = None;
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to open {}: {:#}", conversation, e);
                        selected = None;
                        continue;
                    }
                }
            }

            if let Err(e) = self.dispatch(action, adapter, image_gen).await {
                tracing::warn!("Action dispatch failed for {}: {:#}", conversation, e);
            }
        }

        due.len()
    }

    async fn dispatch(
        &self,
        action: &Action,
        adapter: &dyn ChannelAdapter,
        image_gen: Option<&ImageGenerator>,
    ) -> Result<()> {
        match action {
            Action::SendMessage {
                conversation_id,
                content,
                ..
            } => {
                if !adapter.send_text(conversation_id, content).await? {
                    anyhow::bail!("Adapter declined to send text");
                }
                tracing::info!("Sent message to {}", conversation_id);
            }
            Action::React {
                conversation_id,
                target,
                emoji,
                ..
            } => {
                if !adapter.react(conversation_id, target, emoji).await? {
                    anyhow::bail!("Adapter declined to react");
                }
                tracing::info!("Reacted '{}' in {}", emoji, conversation_id);
            }
            Action::SendImage {
                conversation_id,
                prompt,
                count,
                model,
                filename,
                ..
            } => {
                let Some(image_gen) = image_gen else {
                    anyhow::bail!("Image generation is not configured");
                };
                let files = image_gen.generate(prompt, *count, model, filename).await?;
                if !adapter.send_media(conversation_id, &files).await? {
                    anyhow::bail!("Adapter declined to send media");
                }
                tracing::info!("Sent {} image(s) to {}", files.len(), conversation_id);
            }
            Action::SendGif {
                conversation_id,
                search_term,
                confirm,
                ..
            } => {
                if !confirm {
                    tracing::info!("Dropping unconfirmed GIF for {}", conversation_id);
                    return Ok(());
                }
                if !adapter.send_gif(conversation_id, search_term).await? {
                    anyhow::bail!("Adapter declined to send GIF");
                }
                tracing::info!("Sent GIF '{}' to {}", search_term, conversation_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ChatMessage, Direction};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Adapter that records every call, optionally failing all sends.
    struct RecordingAdapter {
        ops: Mutex<Vec<String>>,
        fail_sends: bool,
    }

    impl RecordingAdapter {
        fn new() -> Self {
            Self {
                ops: Mutex::new(Vec::new()),
                fail_sends: false,
            }
        }

        fn failing() -> Self {
            Self {
                ops: Mutex::new(Vec::new()),
                fail_sends: true,
            }
        }

        fn ops(&self) -> Vec<String> {
            self.ops.lock().expect("lock").clone()
        }

        fn push(&self, op: String) {
            self.ops.lock().expect("lock").push(op);
        }
    }

    #[async_trait]
    impl ChannelAdapter for RecordingAdapter {
        async fn select(&self, conversation: &str) -> Result<bool> {
            self.push(format!("select:{}", conversation));
            Ok(true)
        }

        async fn poll_visible(
            &self,
            _conversation: &str,
            _limit: usize,
        ) -> Result<Vec<ChatMessage>> {
            Ok(Vec::new())
        }

        async fn send_text(&self, conversation: &str, text: &str) -> Result<bool> {
            if self.fail_sends {
                anyhow::bail!("send failed");
            }
            self.push(format!("text:{}:{}", conversation, text));
            Ok(true)
        }

        async fn react(
            &self,
            conversation: &str,
            target: &ChatMessage,
            emoji: &str,
        ) -> Result<bool> {
            self.push(format!("react:{}:{}:{}", conversation, target.content, emoji));
            Ok(true)
        }

        async fn send_media(&self, conversation: &str, files: &[PathBuf]) -> Result<bool> {
            self.push(format!("media:{}:{}", conversation, files.len()));
            Ok(true)
        }

        async fn send_gif(&self, conversation: &str, search_term: &str) -> Result<bool> {
            self.push(format!("gif:{}:{}", conversation, search_term));
            Ok(true)
        }
    }

    fn send_at(content: &str, at: DateTime<Utc>) -> Action {
        Action::SendMessage {
            conversation_id: "Reuben".to_string(),
            content: content.to_string(),
            scheduled_at: at,
        }
    }

    #[tokio::test]
    async fn only_due_actions_fire() {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let adapter = RecordingAdapter::new();
        let mut scheduler = ActionScheduler::new();
        scheduler.enqueue(send_at("due", base + Duration::seconds(5)));
        scheduler.enqueue(send_at("later", base + Duration::seconds(50)));

        let fired = scheduler
            .tick(base + Duration::seconds(10), &adapter, None)
            .await;
        assert_eq!(fired, 1);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(
            adapter.ops(),
            vec!["select:Reuben".to_string(), "text:Reuben:due".to_string()]
        );

        // The late action fires once its time comes.
        let fired = scheduler
            .tick(base + Duration::seconds(60), &adapter, None)
            .await;
        assert_eq!(fired, 1);
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn segments_dispatch_in_order_within_one_tick() {
        let now = Utc::now();
        let adapter = RecordingAdapter::new();
        let mut scheduler = ActionScheduler::new();
        scheduler.enqueue(send_at("one\n\ntwo\n\nthree", now));
        assert_eq!(scheduler.len(), 3);

        scheduler.tick(now, &adapter, None).await;
        assert_eq!(
            adapter.ops(),
            vec![
                "select:Reuben".to_string(),
                "text:Reuben:one".to_string(),
                "text:Reuben:two".to_string(),
                "text:Reuben:three".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn failed_dispatch_is_not_retried() {
        let now = Utc::now();
        let adapter = RecordingAdapter::failing();
        let mut scheduler = ActionScheduler::new();
        scheduler.enqueue(send_at("lost", now));

        assert_eq!(scheduler.tick(now, &adapter, None).await, 1);
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.tick(now, &adapter, None).await, 0);
    }

    #[tokio::test]
    async fn reactions_and_gifs_route_to_the_adapter() {
        let now = Utc::now();
        let adapter = RecordingAdapter::new();
        let mut scheduler = ActionScheduler::new();
        scheduler.enqueue(Action::React {
            conversation_id: "Reuben".to_string(),
            target: ChatMessage {
                sender: "Reuben".to_string(),
                content: "got the job!!".to_string(),
                timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                direction: Direction::Inbound,
                conversation_id: "Reuben".to_string(),
            },
            emoji: "party".to_string(),
            scheduled_at: now,
        });
        scheduler.enqueue(Action::SendGif {
            conversation_id: "Reuben".to_string(),
            search_term: "celebration".to_string(),
            confirm: true,
            scheduled_at: now,
        });

        scheduler.tick(now, &adapter, None).await;
        let ops = adapter.ops();
        assert!(ops.contains(&"react:Reuben:got the job!!:party".to_string()));
        assert!(ops.contains(&"gif:Reuben:celebration".to_string()));
        // One select covers consecutive actions for the same conversation.
        assert_eq!(ops.iter().filter(|op| op.starts_with("select:")).count(), 1);
    }

    #[tokio::test]
    async fn cancel_conversation_drops_pending_actions() {
        let mut scheduler = ActionScheduler::new();
        scheduler.enqueue(send_at("pending", Utc::now() + Duration::seconds(50)));
        assert!(scheduler.has_pending("Reuben"));

        scheduler.cancel_conversation("Reuben");
        assert!(!scheduler.has_pending("Reuben"));
        assert!(scheduler.is_empty());
    }
}
