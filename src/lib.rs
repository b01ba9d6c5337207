//! Banter is the core of a conversational automation agent: it watches a set
//! of chat conversations through a pluggable channel adapter, reconciles each
//! re-polled message feed into "what is new since we last looked", generates
//! replies through an LLM under a cancel-and-restart preemption rule, and
//! dispatches the resulting typed actions after a humanized delay.
//!
//! The crate is transport-agnostic. Implement [`channel::ChannelAdapter`] for
//! whatever messaging surface you automate, hand it to [`engine::ChatEngine`]
//! together with a [`database::ChatStore`] and a
//! [`llm_client::ResponseGenerator`], and call
//! [`engine::ChatEngine::run_loop`].

pub mod actions;
pub mod channel;
pub mod config;
pub mod database;
pub mod engine;
pub mod image_gen;
pub mod ledger;
pub mod llm_client;
pub mod memory;
pub mod message;
pub mod pipeline;
pub mod scheduler;

pub use actions::Action;
pub use channel::ChannelAdapter;
pub use config::BanterConfig;
pub use database::{ChatStore, SqliteStore};
pub use engine::{ChatEngine, EngineEvent};
pub use llm_client::{LlmClient, MemoryUpdate, ReplyDecision, ResponseGenerator};
pub use message::{ChatMessage, Direction, MessageKey};
