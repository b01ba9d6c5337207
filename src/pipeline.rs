//! Response generation under the cancel-and-restart rule.
//!
//! While a reply is being generated the conversation stays under watch. If
//! another message lands mid-generation, the in-flight task is cooperatively
//! canceled and generation restarts against the extended delta, so the reply
//! that finally goes out always answers everything said so far.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::actions::Action;
use crate::channel::ChannelAdapter;
use crate::ledger::MessageLedger;
use crate::llm_client::{ReplyDecision, ResponseGenerator};
use crate::message::ChatMessage;

enum GenerationOutcome {
    Completed(Result<ReplyDecision>),
    Canceled,
}

pub struct ResponsePipeline {
    generator: Arc<dyn ResponseGenerator>,
    monitor_interval: Duration,
    reply_delay_secs: (u64, u64),
    default_reaction: String,
    poll_limit: usize,
}

impl ResponsePipeline {
    pub fn new(
        generator: Arc<dyn ResponseGenerator>,
        monitor_interval: Duration,
        reply_delay_secs: (u64, u64),
        default_reaction: String,
        poll_limit: usize,
    ) -> Self {
        Self {
            generator,
            monitor_interval,
            reply_delay_secs,
            default_reaction,
            poll_limit,
        }
    }

    fn spawn_generation(
        &self,
        history: Vec<ChatMessage>,
        memory_summary: String,
    ) -> (watch::Sender<bool>, JoinHandle<GenerationOutcome>) {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let generator = Arc::clone(&self.generator);

        let handle = tokio::spawn(async move {
            tokio::select! {
                result = generator.generate_reply(&history, &memory_summary) => {
                    GenerationOutcome::Completed(result)
                }
                _ = cancel_rx.changed() => GenerationOutcome::Canceled,
            }
        });

        (cancel_tx, handle)
    }

    /// Generate a response to `delta`, restarting whenever the conversation
    /// moves on underneath us.
    ///
    /// `delta` must already be recorded in the ledger; messages observed while
    /// monitoring are recorded here as they arrive, extend the working delta,
    /// and preempt the in-flight generation. Returns the actions the final
    /// decision maps to (possibly none).
    pub async fn respond(
        &self,
        adapter: &dyn ChannelAdapter,
        conversation: &str,
        delta: Vec<ChatMessage>,
        memory_summary: &str,
        ledger: &mut MessageLedger,
    ) -> Result<Vec<Action>> {
        // Outbound-only deltas never engage the generator.
        if !delta.iter().any(|m| !m.is_outgoing()) {
            return Ok(Vec::new());
        }

        let mut delta = delta;
        let (mut cancel, mut handle) =
            self.spawn_generation(delta.clone(), memory_summary.to_string());

        loop {
            tokio::select! {
                joined = &mut handle => {
                    let outcome = joined
                        .map_err(|e| anyhow::anyhow!("Generation task failed: {}", e))?;
                    match outcome {
                        GenerationOutcome::Completed(result) => {
                            let decision = result?;
                            return Ok(self.decision_to_actions(conversation, &delta, decision));
                        }
                        // Only the arm below cancels, and it always consumes
                        // the handle before respawning.
                        GenerationOutcome::Canceled => {
                            return Ok(Vec::new());
                        }
                    }
                }
                _ = tokio::time::sleep(self.monitor_interval) => {
                    let snapshot = match adapter.poll_visible(conversation, self.poll_limit).await {
                        Ok(snapshot) => snapshot,
                        Err(e) => {
                            tracing::warn!(
                                "Mid-generation poll failed for {}: {:#}",
                                conversation,
                                e
                            );
                            continue;
                        }
                    };

                    let newer = ledger.delta(conversation, &snapshot, false)?;
                    if newer.is_empty() {
                        continue;
                    }
                    ledger.record(conversation, &snapshot)?;

                    tracing::info!(
                        "{} new message(s) in {} mid-generation, restarting",
                        newer.len(),
                        conversation
                    );
                    let _ = cancel.send(true);
                    let _ = (&mut handle).await;

                    delta.extend(newer);
                    let (next_cancel, next_handle) =
                        self.spawn_generation(delta.clone(), memory_summary.to_string());
                    cancel = next_cancel;
                    handle = next_handle;
                }
            }
        }
    }

    fn decision_to_actions(
        &self,
        conversation: &str,
        delta: &[ChatMessage],
        decision: ReplyDecision,
    ) -> Vec<Action> {
        match decision {
            ReplyDecision::Message(content) => vec![Action::SendMessage {
                conversation_id: conversation.to_string(),
                content,
                scheduled_at: self.humanized_fire_time(),
            }],
            ReplyDecision::Reaction { target_text, emoji } => {
                match resolve_reaction_target(delta, &target_text) {
                    Some(target) => vec![Action::React {
                        conversation_id: conversation.to_string(),
                        target,
                        emoji,
                        scheduled_at: self.humanized_fire_time(),
                    }],
                    None => {
                        tracing::info!(
                            "No inbound message in {} matches reaction target '{}', dropping",
                            conversation,
                            target_text
                        );
                        Vec::new()
                    }
                }
            }
            ReplyDecision::Gif { search_term } => vec![Action::SendGif {
                conversation_id: conversation.to_string(),
                search_term,
                confirm: true,
                scheduled_at: self.humanized_fire_time(),
            }],
            ReplyDecision::Skip => {
                if self.default_reaction.is_empty() {
                    return Vec::new();
                }
                match delta.iter().rev().find(|m| !m.is_outgoing()) {
                    Some(target) => vec![Action::React {
                        conversation_id: conversation.to_string(),
                        target: target.clone(),
                        emoji: self.default_reaction.clone(),
                        scheduled_at: self.humanized_fire_time(),
                    }],
                    None => Vec::new(),
                }
            }
            ReplyDecision::Error(reason) => {
                tracing::warn!("Discarding unusable decision for {}: {}", conversation, reason);
                Vec::new()
            }
        }
    }

    /// A fire time a short random interval from now, so replies do not land
    /// with machine-perfect timing.
    fn humanized_fire_time(&self) -> chrono::DateTime<Utc> {
        let (min, max) = self.reply_delay_secs;
        let delay = if min >= max {
            min
        } else {
            rand::rng().random_range(min..=max)
        };
        Utc::now() + chrono::Duration::seconds(delay as i64)
    }
}

/// Find the inbound message the generator is reacting to. The generator
/// quotes the target loosely, so we accept any inbound message whose content
/// appears inside the quoted text, most recent first. No match means no
/// reaction; the quoted wording may be hallucinated.
fn resolve_reaction_target(delta: &[ChatMessage], target_text: &str) -> Option<ChatMessage> {
    let quoted = target_text.to_lowercase();
    delta
        .iter()
        .rev()
        .find(|m| !m.is_outgoing() && !m.content.is_empty() && quoted.contains(&m.content.to_lowercase()))
        .cloned()
}
