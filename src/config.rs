//! TOML configuration parsing and validation.
//!
//! The configuration is deserialised into a typed [`Config`] and validated
//! once by [`load_config`] (or [`Config::validate`] for configs built in
//! code). Invalid or missing fields fail fast with
//! [`Error::Configuration`] instead of surfacing on first use.
//!
//! ```toml
//! documents_dir = "./docs"
//! vector_db_dir = "./data"
//!
//! [embeddings]
//! provider = "local"
//! model = "all-minilm-l6-v2"
//!
//! [openAI]
//! model = "gpt-3.5-turbo"
//! chat_persona = "You are a helpful assistant."
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::models::Role;

/// File name of the SQLite database inside `vector_db_dir`.
pub const DB_FILE_NAME: &str = "docchat.sqlite";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub documents_dir: PathBuf,
    pub vector_db_dir: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_exclude_globs")]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub embeddings: EmbeddingConfig,
    #[serde(rename = "openAI")]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub tokenizer: TokenizerConfig,
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    20
}
fn default_exclude_globs() -> Vec<String> {
    vec!["**/.*".to_string(), "**/.git/**".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            url: None,
        }
    }
}

fn default_provider() -> String {
    "local".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenAiConfig {
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub chat_persona: Option<String>,
    #[serde(default)]
    pub chat_cost_per_1000_tokens: f64,
    #[serde(default = "default_chat_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Request timeout. Unset means the call may block for as long as the provider takes.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    512
}
fn default_chat_retries() -> u32 {
    3
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

/// Which roles `recall` may return.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecallRole {
    Assistant,
    User,
    System,
    Any,
}

impl RecallRole {
    /// The role filter to apply, or `None` for all roles.
    pub fn role(&self) -> Option<Role> {
        match self {
            RecallRole::Assistant => Some(Role::Assistant),
            RecallRole::User => Some(Role::User),
            RecallRole::System => Some(Role::System),
            RecallRole::Any => None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub document_k: usize,
    #[serde(default = "default_k")]
    pub memory_k: usize,
    #[serde(default = "default_recall_role")]
    pub recall_role: RecallRole,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            document_k: default_k(),
            memory_k: default_k(),
            recall_role: default_recall_role(),
            max_context_chars: default_max_context_chars(),
        }
    }
}

fn default_k() -> usize {
    2
}
fn default_recall_role() -> RecallRole {
    RecallRole::Assistant
}
fn default_max_context_chars() -> usize {
    12_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_conversation")]
    pub conversation: String,
    #[serde(default = "default_exit_phrases")]
    pub exit_phrases: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            conversation: default_conversation(),
            exit_phrases: default_exit_phrases(),
        }
    }
}

fn default_conversation() -> String {
    "default".to_string()
}
fn default_exit_phrases() -> Vec<String> {
    vec!["exit".to_string(), "quit".to_string()]
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TokenizerConfig {
    /// Path to a Hugging Face `tokenizer.json` (feature `hf-tokenizer`).
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Config {
    /// Path of the SQLite database holding both indexes.
    pub fn db_path(&self) -> PathBuf {
        self.vector_db_dir.join(DB_FILE_NAME)
    }

    /// Check every invariant `load_config` enforces.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(config_err("chunk_size must be > 0"));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(config_err(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }

        if self.openai.model.trim().is_empty() {
            return Err(config_err("openAI.model must not be empty"));
        }
        if !(0.0..=2.0).contains(&self.openai.temperature) {
            return Err(config_err("openAI.temperature must be in [0.0, 2.0]"));
        }
        if self.openai.max_tokens == 0 {
            return Err(config_err("openAI.max_tokens must be > 0"));
        }
        if !self.openai.chat_cost_per_1000_tokens.is_finite()
            || self.openai.chat_cost_per_1000_tokens < 0.0
        {
            return Err(config_err(
                "openAI.chat_cost_per_1000_tokens must be a non-negative number",
            ));
        }

        if self.session.conversation.trim().is_empty() {
            return Err(config_err("session.conversation must not be empty"));
        }

        if self.embeddings.batch_size == 0 {
            return Err(config_err("embeddings.batch_size must be > 0"));
        }

        match self.embeddings.provider.as_str() {
            "hash" | "openai" | "ollama" => {
                if self.embeddings.dims.is_none() || self.embeddings.dims == Some(0) {
                    return Err(config_err(format!(
                        "embeddings.dims must be > 0 when provider is '{}'",
                        self.embeddings.provider
                    )));
                }
                if self.embeddings.provider != "hash" && self.embeddings.model.is_none() {
                    return Err(config_err(format!(
                        "embeddings.model must be specified when provider is '{}'",
                        self.embeddings.provider
                    )));
                }
            }
            "local" | "disabled" => {}
            other => {
                return Err(config_err(format!(
                    "Unknown embedding provider: '{}'. Must be hash, openai, ollama, local, or disabled.",
                    other
                )))
            }
        }

        Ok(())
    }
}

fn config_err(msg: impl Into<String>) -> Error {
    Error::Configuration(msg.into())
}

/// Read, parse, and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        config_err(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    parse_config(&content)
}

/// Parse and validate configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)
        .map_err(|e| config_err(format!("Failed to parse config file: {}", e)))?;
    config.validate()?;
    Ok(config)
}
