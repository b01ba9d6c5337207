use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    // OpenAI-compatible endpoint (Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub api_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: default_llm_url(),
            model: default_llm_model(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGenConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_image_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_image_model")]
    pub model: String,
    #[serde(default = "default_image_output_dir")]
    pub output_dir: String,
}

fn default_image_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_image_model() -> String {
    "gpt-image-1".to_string()
}

fn default_image_output_dir() -> String {
    "generated_images".to_string()
}

impl Default for ImageGenConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: default_image_url(),
            api_key: None,
            model: default_image_model(),
            output_dir: default_image_output_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanterConfig {
    // Whose messages we speak as
    #[serde(default = "default_user_name")]
    pub user_name: String,

    // Conversations the engine watches, in round-robin order
    #[serde(default)]
    pub conversations: Vec<String>,

    // Polling and reconciliation
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_poll_limit")]
    pub poll_limit: usize,
    #[serde(default = "default_startup_poll_limit")]
    pub startup_poll_limit: usize,
    #[serde(default = "default_dedup_lookback")]
    pub dedup_lookback: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_reply_after_last_outgoing")]
    pub reply_after_last_outgoing: bool,

    // Response timing
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    #[serde(default = "default_reply_delay_min")]
    pub reply_delay_min_secs: u64,
    #[serde(default = "default_reply_delay_max")]
    pub reply_delay_max_secs: u64,
    // Emoji search term used when the generator decides not to reply.
    // Empty disables the acknowledgement reaction.
    #[serde(default = "default_reaction")]
    pub default_reaction: String,

    // Memory
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: usize,

    // Storage
    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub image_gen: ImageGenConfig,
}

fn default_user_name() -> String {
    "Ben".to_string()
}

fn default_poll_interval() -> u64 {
    5
}

fn default_poll_limit() -> usize {
    20
}

fn default_startup_poll_limit() -> usize {
    10
}

fn default_dedup_lookback() -> usize {
    30
}

fn default_history_limit() -> usize {
    30
}

fn default_reply_after_last_outgoing() -> bool {
    true
}

fn default_monitor_interval_ms() -> u64 {
    500
}

fn default_reply_delay_min() -> u64 {
    3
}

fn default_reply_delay_max() -> u64 {
    10
}

fn default_reaction() -> String {
    "clown".to_string()
}

fn default_compaction_threshold() -> usize {
    10
}

fn default_database_path() -> String {
    "banter.db".to_string()
}

impl Default for BanterConfig {
    fn default() -> Self {
        Self {
            user_name: default_user_name(),
            conversations: Vec::new(),
            poll_interval_secs: default_poll_interval(),
            poll_limit: default_poll_limit(),
            startup_poll_limit: default_startup_poll_limit(),
            dedup_lookback: default_dedup_lookback(),
            history_limit: default_history_limit(),
            reply_after_last_outgoing: default_reply_after_last_outgoing(),
            monitor_interval_ms: default_monitor_interval_ms(),
            reply_delay_min_secs: default_reply_delay_min(),
            reply_delay_max_secs: default_reply_delay_max(),
            default_reaction: default_reaction(),
            compaction_threshold: default_compaction_threshold(),
            database_path: default_database_path(),
            llm: LlmConfig::default(),
            image_gen: ImageGenConfig::default(),
        }
    }
}

impl BanterConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("banter_config.toml")
    }

    /// Load config from banter_config.toml next to the executable, falling
    /// back to defaults plus environment variables.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<BanterConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = env::var("BANTER_USER_NAME") {
            config.user_name = name;
        }

        if let Ok(list) = env::var("BANTER_CONVERSATIONS") {
            config.conversations = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Ok(url) = env::var("LLM_API_URL") {
            config.llm.api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm.model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            config.llm.api_key = Some(key);
        }

        if let Ok(interval) = env::var("BANTER_POLL_INTERVAL") {
            if let Ok(seconds) = interval.parse() {
                config.poll_interval_secs = seconds;
            }
        }

        if let Ok(path) = env::var("BANTER_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: BanterConfig = toml::from_str("").expect("parse");
        assert_eq!(config.user_name, "Ben");
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.compaction_threshold, 10);
        assert_eq!(config.default_reaction, "clown");
        assert!(config.reply_after_last_outgoing);
        assert!(!config.image_gen.enabled);
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let config: BanterConfig = toml::from_str(
            r#"
            user_name = "Sam"
            conversations = ["Reuben", "Matthew"]

            [llm]
            model = "qwen3"
            "#,
        )
        .expect("parse");
        assert_eq!(config.user_name, "Sam");
        assert_eq!(config.conversations, vec!["Reuben", "Matthew"]);
        assert_eq!(config.llm.model, "qwen3");
        assert_eq!(config.llm.api_url, "http://localhost:11434/v1");
        assert_eq!(config.reply_delay_min_secs, 3);
        assert_eq!(config.reply_delay_max_secs, 10);
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let mut config = BanterConfig::default();
        config.conversations = vec!["Reuben".to_string()];
        config.image_gen.enabled = true;

        let serialized = toml::to_string_pretty(&config).expect("serialize");
        let parsed: BanterConfig = toml::from_str(&serialized).expect("parse");
        assert_eq!(parsed.conversations, vec!["Reuben"]);
        assert!(parsed.image_gen.enabled);
    }
}
