//! The conversation engine: round-robin polling, reconciliation, response
//! generation and action dispatch, one cycle at a time.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use crate::channel::ChannelAdapter;
use crate::config::BanterConfig;
use crate::database::ChatStore;
use crate::image_gen::ImageGenerator;
use crate::ledger::MessageLedger;
use crate::llm_client::ResponseGenerator;
use crate::memory::MemoryCompactor;
use crate::pipeline::ResponsePipeline;
use crate::scheduler::ActionScheduler;

/// Observable engine lifecycle events, for a UI or log tail.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    BacklogMarked { conversation: String, count: usize },
    DeltaObserved { conversation: String, count: usize },
    ActionsQueued { conversation: String, count: usize },
    ActionsDispatched { count: usize },
    MemoryCompacted { conversation: String },
    ConversationError { conversation: String, message: String },
}

pub struct ChatEngine {
    config: BanterConfig,
    adapter: Arc<dyn ChannelAdapter>,
    generator: Arc<dyn ResponseGenerator>,
    ledger: MessageLedger,
    compactor: MemoryCompactor,
    pipeline: ResponsePipeline,
    scheduler: ActionScheduler,
    image_gen: Option<ImageGenerator>,
    event_tx: flume::Sender<EngineEvent>,
    event_rx: flume::Receiver<EngineEvent>,
    shutdown_tx: flume::Sender<()>,
    shutdown_rx: flume::Receiver<()>,
}

impl ChatEngine {
    pub fn new(
        config: BanterConfig,
        store: Arc<dyn ChatStore>,
        adapter: Arc<dyn ChannelAdapter>,
        generator: Arc<dyn ResponseGenerator>,
    ) -> Self {
        let ledger = MessageLedger::open(Arc::clone(&store), config.dedup_lookback);
        let compactor = MemoryCompactor::new(store, config.compaction_threshold);
        let pipeline = ResponsePipeline::new(
            Arc::clone(&generator),
            Duration::from_millis(config.monitor_interval_ms),
            (config.reply_delay_min_secs, config.reply_delay_max_secs),
            config.default_reaction.clone(),
            config.poll_limit,
        );
        let image_gen = if config.image_gen.enabled {
            Some(ImageGenerator::new(
                config.image_gen.api_url.clone(),
                config.image_gen.api_key.clone(),
                config.image_gen.output_dir.clone().into(),
            ))
        } else {
            None
        };
        let (event_tx, event_rx) = flume::unbounded();
        let (shutdown_tx, shutdown_rx) = flume::bounded(1);

        Self {
            config,
            adapter,
            generator,
            ledger,
            compactor,
            pipeline,
            scheduler: ActionScheduler::new(),
            image_gen,
            event_tx,
            event_rx,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Receiver for engine lifecycle events. Can be cloned freely.
    pub fn events(&self) -> flume::Receiver<EngineEvent> {
        self.event_rx.clone()
    }

    /// Handle that stops `run_loop` after the current cycle.
    pub fn shutdown_handle(&self) -> flume::Sender<()> {
        self.shutdown_tx.clone()
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Record whatever is currently visible in every watched conversation
    /// without responding, so pre-existing backlog is never replied to.
    pub async fn mark_backlog_seen(&mut self) -> Result<()> {
        let conversations = self.config.conversations.clone();
        for conversation in conversations {
            if !self.adapter.select(&conversation).await? {
                tracing::warn!("Conversation {} not found at startup", conversation);
                continue;
            }
            let snapshot = self
                .adapter
                .poll_visible(&conversation, self.config.startup_poll_limit)
                .await?;
            let recorded = self.ledger.record(&conversation, &snapshot)?;
            tracing::info!(
                "Marked {} backlog message(s) seen in {}",
                recorded,
                conversation
            );
            self.emit(EngineEvent::BacklogMarked {
                conversation,
                count: recorded,
            });
        }
        Ok(())
    }

    /// Poll-reconcile-respond forever, until a shutdown signal arrives.
    pub async fn run_loop(&mut self) -> Result<()> {
        self.mark_backlog_seen().await?;
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        let shutdown = self.shutdown_rx.clone();

        loop {
            self.run_cycle().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.recv_async() => {
                    tracing::info!("Shutdown requested, stopping engine loop");
                    return Ok(());
                }
            }
        }
    }

    /// One pass over every watched conversation plus an action tick. A
    /// failure in one conversation never blocks the others.
    pub async fn run_cycle(&mut self) {
        let conversations = self.config.conversations.clone();
        for conversation in conversations {
            if let Err(e) = self.process_conversation(&conversation).await {
                tracing::error!("Cycle failed for {}: {:#}", conversation, e);
                self.emit(EngineEvent::ConversationError {
                    conversation,
                    message: format!("{:#}", e),
                });
            }
        }

        let dispatched = self
            .scheduler
            .tick(Utc::now(), self.adapter.as_ref(), self.image_gen.as_ref())
            .await;
        if dispatched > 0 {
            self.emit(EngineEvent::ActionsDispatched { count: dispatched });
        }
    }

    async fn process_conversation(&mut self, conversation: &str) -> Result<()> {
        if !self.adapter.select(conversation).await? {
            tracing::warn!("Conversation {} not found, skipping", conversation);
            return Ok(());
        }

        // Transient poll failures skip the cycle rather than killing it.
        let snapshot = match self
            .adapter
            .poll_visible(conversation, self.config.poll_limit)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("Poll failed for {}: {:#}", conversation, e);
                return Ok(());
            }
        };

        let delta = self.ledger.delta(
            conversation,
            &snapshot,
            self.config.reply_after_last_outgoing,
        )?;
        let recorded = self.ledger.record(conversation, &snapshot)?;

        if recorded > 0 {
            let history = self.ledger.tail(conversation, usize::MAX)?;
            match self
                .compactor
                .maybe_compact(self.generator.as_ref(), conversation, recorded, &history)
                .await
            {
                Ok(true) => self.emit(EngineEvent::MemoryCompacted {
                    conversation: conversation.to_string(),
                }),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Memory compaction failed for {}: {:#}", conversation, e);
                }
            }
        }

        if delta.is_empty() || !delta.iter().any(|m| !m.is_outgoing()) {
            return Ok(());
        }

        self.emit(EngineEvent::DeltaObserved {
            conversation: conversation.to_string(),
            count: delta.len(),
        });

        // The conversation moved on before a queued reply fired; that reply
        // answers a stale context, so regenerate against the fuller one.
        if self.scheduler.has_pending(conversation) {
            tracing::info!("Superseding queued actions for {}", conversation);
            self.scheduler.cancel_conversation(conversation);
        }

        let memory = self.compactor.memory(conversation)?;
        let actions = self
            .pipeline
            .respond(
                self.adapter.as_ref(),
                conversation,
                delta,
                &memory.summary_text,
                &mut self.ledger,
            )
            .await?;

        let queued = actions.len();
        for action in actions {
            self.scheduler.enqueue(action);
        }
        if queued > 0 {
            self.emit(EngineEvent::ActionsQueued {
                conversation: conversation.to_string(),
                count: queued,
            });
        }
        Ok(())
    }

    /// Forget everything about a conversation: stored log, memory, counters
    /// and queued actions.
    pub fn reset_conversation(&mut self, conversation: &str) -> Result<()> {
        self.scheduler.cancel_conversation(conversation);
        self.compactor.reset(conversation);
        self.ledger.reset(conversation)?;
        tracing::info!("Reset conversation {}", conversation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqliteStore;
    use crate::llm_client::{MemoryUpdate, ReplyDecision};
    use crate::message::{ChatMessage, Direction};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn inbound(content: &str, secs: i64) -> ChatMessage {
        ChatMessage {
            sender: "Reuben".to_string(),
            content: content.to_string(),
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            direction: Direction::Inbound,
            conversation_id: "Reuben".to_string(),
        }
    }

    /// Adapter that steps through scripted snapshots (repeating the last one)
    /// and records every outbound call.
    struct FakeAdapter {
        snapshots: Mutex<Vec<Vec<ChatMessage>>>,
        sent: Mutex<Vec<String>>,
    }

    impl FakeAdapter {
        fn new(snapshots: Vec<Vec<ChatMessage>>) -> Self {
            Self {
                snapshots: Mutex::new(snapshots),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl ChannelAdapter for FakeAdapter {
        async fn select(&self, _conversation: &str) -> Result<bool> {
            Ok(true)
        }

        async fn poll_visible(
            &self,
            _conversation: &str,
            _limit: usize,
        ) -> Result<Vec<ChatMessage>> {
            let mut snapshots = self.snapshots.lock().expect("lock");
            if snapshots.len() > 1 {
                Ok(snapshots.remove(0))
            } else {
                Ok(snapshots.first().cloned().unwrap_or_default())
            }
        }

        async fn send_text(&self, _conversation: &str, text: &str) -> Result<bool> {
            self.sent.lock().expect("lock").push(text.to_string());
            Ok(true)
        }

        async fn react(
            &self,
            _conversation: &str,
            target: &ChatMessage,
            emoji: &str,
        ) -> Result<bool> {
            self.sent
                .lock()
                .expect("lock")
                .push(format!("react:{}:{}", target.content, emoji));
            Ok(true)
        }

        async fn send_media(&self, _conversation: &str, _files: &[PathBuf]) -> Result<bool> {
            Ok(true)
        }

        async fn send_gif(&self, _conversation: &str, search_term: &str) -> Result<bool> {
            self.sent
                .lock()
                .expect("lock")
                .push(format!("gif:{}", search_term));
            Ok(true)
        }
    }

    struct CannedGenerator {
        reply: String,
    }

    #[async_trait]
    impl ResponseGenerator for CannedGenerator {
        async fn generate_reply(
            &self,
            _history: &[ChatMessage],
            _memory_summary: &str,
        ) -> Result<ReplyDecision> {
            Ok(ReplyDecision::Message(self.reply.clone()))
        }

        async fn generate_memory_update(
            &self,
            _prior_summary: &str,
            _new_messages: &[ChatMessage],
        ) -> Result<MemoryUpdate> {
            Ok(MemoryUpdate::Unchanged)
        }
    }

    fn test_config() -> BanterConfig {
        BanterConfig {
            conversations: vec!["Reuben".to_string()],
            reply_delay_min_secs: 0,
            reply_delay_max_secs: 0,
            monitor_interval_ms: 10,
            ..BanterConfig::default()
        }
    }

    fn engine_with(adapter: Arc<FakeAdapter>) -> (ChatEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(
            SqliteStore::new(dir.path().join("banter.db")).expect("store init"),
        ) as Arc<dyn ChatStore>;
        let engine = ChatEngine::new(
            test_config(),
            store,
            adapter,
            Arc::new(CannedGenerator {
                reply: "hey, just saw this".to_string(),
            }),
        );
        (engine, dir)
    }

    #[tokio::test]
    async fn backlog_is_marked_seen_and_never_answered() {
        let adapter = Arc::new(FakeAdapter::new(vec![vec![inbound("old news", 0)]]));
        let (mut engine, _dir) = engine_with(Arc::clone(&adapter));

        engine.mark_backlog_seen().await.expect("backlog");
        engine.run_cycle().await;

        assert!(adapter.sent().is_empty());
    }

    #[tokio::test]
    async fn new_message_after_startup_gets_a_reply() {
        let backlog = vec![inbound("old news", 0)];
        let mut updated = backlog.clone();
        updated.push(inbound("you there?", 10));

        // First poll is the startup snapshot, everything after sees the new
        // message.
        let adapter = Arc::new(FakeAdapter::new(vec![backlog, updated]));
        let (mut engine, _dir) = engine_with(Arc::clone(&adapter));

        engine.mark_backlog_seen().await.expect("backlog");
        engine.run_cycle().await;

        assert_eq!(adapter.sent(), vec!["hey, just saw this".to_string()]);

        // Nothing new on the next cycle, so nothing more goes out.
        engine.run_cycle().await;
        assert_eq!(adapter.sent().len(), 1);
    }

    #[tokio::test]
    async fn reset_forgets_history_so_backlog_reappears_as_new() {
        let snapshot = vec![inbound("hello", 0)];
        let adapter = Arc::new(FakeAdapter::new(vec![snapshot.clone()]));
        let (mut engine, _dir) = engine_with(Arc::clone(&adapter));

        engine.mark_backlog_seen().await.expect("backlog");
        engine.reset_conversation("Reuben").expect("reset");

        engine.run_cycle().await;
        assert_eq!(adapter.sent(), vec!["hey, just saw this".to_string()]);
    }
}
