//! Environment-driven configuration for the RAG service.
//!
//! Every knob has a typed default except the database URL, which has none
//! worth guessing at — see [`RagConfig::from_env`].

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DATABASE_URL is not set")]
    MissingDatabaseUrl,
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct RagConfig {
    pub database_url: String,

    pub model_gateway_url: String,
    pub embed_model: String,
    pub chat_model: String,
    pub summarize_model: String,
    pub triage_model: String,
    pub ollama_timeout: Duration,

    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub max_evidence_chars_per_email: usize,
    pub new_content_max_chars: usize,
    pub quoted_max_lines: usize,
    pub quoted_max_chars: usize,
    pub attachment_max_chars: usize,
    pub max_attachments: usize,
    pub summarize_max_input_chars: usize,
    pub quoted_context_summarize: bool,
    pub attachment_summarize: bool,

    pub query_rewrite: bool,
    pub include_unrehydrated_metadata: bool,
    pub default_mode: String,

    pub pending_query_ttl: Duration,
    pub session_idle_ttl: Duration,
    pub tail_max: usize,
    pub keep_recent: usize,
    pub history_max_chars: usize,
}

fn env_or<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(default),
    }
}

fn env_str_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl RagConfig {
    /// Load configuration from the process environment, matching defaults
    /// named in SPEC_FULL.md §10.4.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;

        let chat_model = env_str_or("CHAT_MODEL", "llama3.1");
        let summarize_model = std::env::var("SUMMARIZE_MODEL").unwrap_or_else(|_| chat_model.clone());
        let triage_model = std::env::var("TRIAGE_MODEL").unwrap_or_else(|_| chat_model.clone());

        Ok(Self {
            database_url,
            model_gateway_url: env_str_or("MODEL_GATEWAY_URL", "http://localhost:11434"),
            embed_model: env_str_or("EMBED_MODEL", "nomic-embed-text"),
            chat_model,
            summarize_model,
            triage_model,
            ollama_timeout: Duration::from_secs(env_or("OLLAMA_TIMEOUT_SECONDS", 300u64)?),

            chunk_size: env_or("CHUNK_SIZE", 1200usize)?,
            chunk_overlap: env_or("CHUNK_OVERLAP", 150usize)?,
            max_evidence_chars_per_email: env_or("MAX_EVIDENCE_CHARS_PER_EMAIL", 6000usize)?,
            new_content_max_chars: env_or("NEW_CONTENT_MAX_CHARS", 4000usize)?,
            quoted_max_lines: env_or("QUOTED_MAX_LINES", 40usize)?,
            quoted_max_chars: env_or("QUOTED_MAX_CHARS", 2000usize)?,
            attachment_max_chars: env_or("ATTACHMENT_MAX_CHARS", 1500usize)?,
            max_attachments: env_or("MAX_ATTACHMENTS", 5usize)?,
            summarize_max_input_chars: env_or("SUMMARIZE_MAX_INPUT_CHARS", 8000usize)?,
            quoted_context_summarize: env_or("QUOTED_CONTEXT_SUMMARIZE", true)?,
            attachment_summarize: env_or("ATTACHMENT_SUMMARIZE", true)?,

            query_rewrite: env_or("QUERY_REWRITE", true)?,
            include_unrehydrated_metadata: env_or("INCLUDE_UNREHYDRATED_METADATA", false)?,
            default_mode: env_str_or("DEFAULT_MODE", "assistive"),

            pending_query_ttl: Duration::from_secs(env_or("PENDING_QUERY_TTL_SECONDS", 600u64)?),
            session_idle_ttl: Duration::from_secs(env_or("SESSION_IDLE_TTL_SECONDS", 86400u64)?),
            tail_max: env_or("TAIL_MAX", 24usize)?,
            keep_recent: env_or("KEEP_RECENT", 8usize)?,
            history_max_chars: env_or("HISTORY_MAX_CHARS", 8000usize)?,
        })
    }
}
