//! Response generator seam plus the default OpenAI-compatible client.
//!
//! The engine only depends on [`ResponseGenerator`]; [`LlmClient`] is the
//! shipped implementation speaking the chat-completions API (Ollama,
//! LM Studio, vLLM, OpenAI, etc.), asking the model for a small JSON decision
//! object and mapping it onto [`ReplyDecision`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::message::ChatMessage;

/// What the generator decided to do with a message delta.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyDecision {
    /// Send a text reply.
    Message(String),
    /// React to the message whose text the generator quotes.
    Reaction { target_text: String, emoji: String },
    /// Answer with a GIF found by search term.
    Gif { search_term: String },
    /// Deliberately say nothing.
    Skip,
    /// The model produced nothing usable.
    Error(String),
}

/// Outcome of a memory compaction request.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryUpdate {
    Updated(String),
    /// Nothing worth remembering; the watermark still advances.
    Unchanged,
}

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Decide how to respond to `history` (the reconciled delta), given the
    /// conversation's running memory summary.
    async fn generate_reply(
        &self,
        history: &[ChatMessage],
        memory_summary: &str,
    ) -> Result<ReplyDecision>;

    /// Fold `new_messages` into `prior_summary`, or report that nothing
    /// changed.
    async fn generate_memory_update(
        &self,
        prior_summary: &str,
        new_messages: &[ChatMessage],
    ) -> Result<MemoryUpdate>;
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: Option<String>,
    model: String,
    user_name: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<PromptMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PromptMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: PromptMessage,
}

#[derive(Debug, Deserialize)]
struct DecisionPayload {
    action: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    target_message: Option<String>,
    #[serde(default)]
    emoji: Option<String>,
    #[serde(default)]
    search_term: Option<String>,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: Option<String>, model: String, user_name: String) -> Self {
        Self {
            api_url,
            api_key,
            model,
            user_name,
            client: reqwest::Client::new(),
        }
    }

    /// Generate a completion using the OpenAI API format.
    async fn generate(&self, messages: Vec<PromptMessage>) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url);

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(0.7),
            max_tokens: Some(1000),
        };

        let mut req = self.client.post(&url).json(&request);

        // API key header is optional (not needed for local models).
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))?;

        Ok(content)
    }

    fn history_as_prompt(&self, history: &[ChatMessage]) -> Vec<PromptMessage> {
        history
            .iter()
            .map(|m| PromptMessage {
                role: if m.is_outgoing() {
                    "assistant".to_string()
                } else {
                    "user".to_string()
                },
                content: format!("{}: {}", m.sender, m.content),
            })
            .collect()
    }

    fn reply_system_prompt(&self, conversation: &str, memory_summary: &str) -> String {
        format!(
            "The current date is {now}. You are {user}, replying on a chat app in a conversation with {friend}.\n\
             - Emulate the style of your previous messages as closely as possible.\n\
             - Each line includes the speaker for context, but only output the message itself.\n\
             - Be brief and informal; avoid multi-paragraph messages. Use a blank line between \
             messages if you want to send more than one.\n\
             <key_facts>{memory}</key_facts>\n\
             Respond with a single JSON object, nothing else:\n\
             {{\"action\": \"message\" | \"react\" | \"gif\" | \"skip\",\n  \
             \"text\": \"reply text (action=message)\",\n  \
             \"target_message\": \"exact text of the message to react to (action=react)\",\n  \
             \"emoji\": \"short emoji search term like 'thumbs up' (action=react)\",\n  \
             \"search_term\": \"GIF search term (action=gif)\"}}",
            now = Utc::now().to_rfc3339(),
            user = self.user_name,
            friend = conversation,
            memory = memory_summary,
        )
    }

    fn parse_decision(&self, raw: &str) -> ReplyDecision {
        let payload = match serde_json::from_str::<DecisionPayload>(extract_json(raw)) {
            Ok(payload) => payload,
            Err(e) => {
                return ReplyDecision::Error(format!(
                    "Unparseable decision ({}): {}",
                    e,
                    raw.chars().take(200).collect::<String>()
                ))
            }
        };

        match payload.action.trim().to_ascii_lowercase().as_str() {
            "message" => match payload.text {
                Some(text) if !text.trim().is_empty() => {
                    ReplyDecision::Message(text.trim().to_string())
                }
                _ => ReplyDecision::Error("message action without text".to_string()),
            },
            "react" => match (payload.target_message, payload.emoji) {
                (Some(target), Some(emoji)) if !target.trim().is_empty() => {
                    ReplyDecision::Reaction {
                        target_text: target,
                        emoji,
                    }
                }
                _ => ReplyDecision::Error("react action without target or emoji".to_string()),
            },
            "gif" => match payload.search_term {
                Some(term) if !term.trim().is_empty() => ReplyDecision::Gif { search_term: term },
                _ => ReplyDecision::Error("gif action without search term".to_string()),
            },
            "skip" => ReplyDecision::Skip,
            other => ReplyDecision::Error(format!("Unknown action kind: {}", other)),
        }
    }
}

/// Pull a JSON object out of a model response that may wrap it in markdown
/// fences or prose.
fn extract_json(response: &str) -> &str {
    let response = response.trim();
    if let Some(start) = response.find("```json") {
        let after = &response[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = response.find('{') {
        // rfind may land before the opening brace when prose contains a
        // stray closing one.
        if let Some(end) = response.rfind('}').filter(|&end| end >= start) {
            return &response[start..=end];
        }
    }
    response
}

const MEMORY_SKIP_MARKER: &str = "SKIP";

#[async_trait]
impl ResponseGenerator for LlmClient {
    async fn generate_reply(
        &self,
        history: &[ChatMessage],
        memory_summary: &str,
    ) -> Result<ReplyDecision> {
        let conversation = history
            .first()
            .map(|m| m.conversation_id.as_str())
            .unwrap_or("unknown");

        let mut messages = vec![PromptMessage {
            role: "system".to_string(),
            content: self.reply_system_prompt(conversation, memory_summary),
        }];
        messages.extend(self.history_as_prompt(history));

        let raw = self.generate(messages).await?;
        Ok(self.parse_decision(&raw))
    }

    async fn generate_memory_update(
        &self,
        prior_summary: &str,
        new_messages: &[ChatMessage],
    ) -> Result<MemoryUpdate> {
        let transcript = new_messages
            .iter()
            .map(|m| format!("[{}] {}: {}", m.timestamp.to_rfc3339(), m.sender, m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let system = format!(
            "The current date is {now}. You are an assistant representing {user}, keeping track \
             of key facts about the person they are chatting with. Based on the new messages, \
             only update the long-term notes if there is new important information. If facts are \
             date dependent include specific day or time references.\n\
             <current_state>{prior}</current_state>\n\
             <new_messages>{transcript}</new_messages>",
            now = Utc::now().to_rfc3339(),
            user = self.user_name,
            prior = prior_summary,
            transcript = transcript,
        );
        let user = format!(
            "Return a concise updated state without any additional commentary, or reply with \
             exactly {} if nothing has changed.",
            MEMORY_SKIP_MARKER
        );

        let raw = self
            .generate(vec![
                PromptMessage {
                    role: "system".to_string(),
                    content: system,
                },
                PromptMessage {
                    role: "user".to_string(),
                    content: user,
                },
            ])
            .await?;

        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case(MEMORY_SKIP_MARKER) || trimmed.is_empty() {
            Ok(MemoryUpdate::Unchanged)
        } else {
            Ok(MemoryUpdate::Updated(trimmed.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> LlmClient {
        LlmClient::new(
            "http://127.0.0.1:11434/v1".to_string(),
            None,
            "test-model".to_string(),
            "Ben".to_string(),
        )
    }

    #[test]
    fn extract_json_handles_fences_and_prose() {
        assert_eq!(
            extract_json("```json\n{\"action\": \"skip\"}\n```"),
            "{\"action\": \"skip\"}"
        );
        assert_eq!(
            extract_json("Sure! Here you go: {\"action\": \"skip\"} hope that helps"),
            "{\"action\": \"skip\"}"
        );
    }

    #[test]
    fn parses_message_decision() {
        let decision = client().parse_decision(r#"{"action": "message", "text": "hey!"}"#);
        assert_eq!(decision, ReplyDecision::Message("hey!".to_string()));
    }

    #[test]
    fn parses_react_decision() {
        let decision = client().parse_decision(
            r#"{"action": "react", "target_message": "It's my birthday", "emoji": "party"}"#,
        );
        assert_eq!(
            decision,
            ReplyDecision::Reaction {
                target_text: "It's my birthday".to_string(),
                emoji: "party".to_string(),
            }
        );
    }

    #[test]
    fn parses_skip_and_gif_decisions() {
        assert_eq!(
            client().parse_decision(r#"{"action": "skip"}"#),
            ReplyDecision::Skip
        );
        assert_eq!(
            client().parse_decision(r#"{"action": "gif", "search_term": "celebration"}"#),
            ReplyDecision::Gif {
                search_term: "celebration".to_string()
            }
        );
    }

    #[test]
    fn extract_json_survives_reversed_braces() {
        assert_eq!(extract_json("oops} {"), "oops} {");
        assert!(matches!(
            client().parse_decision("oops} {"),
            ReplyDecision::Error(_)
        ));
    }

    #[test]
    fn malformed_decisions_become_error_kind() {
        assert!(matches!(
            client().parse_decision("I refuse to answer in JSON"),
            ReplyDecision::Error(_)
        ));
        assert!(matches!(
            client().parse_decision(r#"{"action": "react"}"#),
            ReplyDecision::Error(_)
        ));
    }
}
