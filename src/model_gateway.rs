//! Wraps the external embedding/chat provider. Enforces a per-request
//! timeout and exposes `embed`, `chat`, and the higher-level
//! `summarize_to_fit` compression loop (spec.md §4.6).

use crate::normalize::l2_normalize;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

const MAX_RETRIES: usize = 3;
const RETRY_BACKOFF_MS: u64 = 750;
const RETRY_BACKOFF_FACTOR: u64 = 2;

/// Lower bound of the convergence band: a summarization pass that shrinks
/// the input by less than this fraction is treated as non-progressing.
const CONVERGENCE_MIN_RATIO: f64 = 0.50;
/// Upper bound: a pass that shrinks by more than this fraction has its
/// target raised for the next pass, to avoid losing information.
const CONVERGENCE_MAX_RATIO: f64 = 0.75;

#[derive(Debug, Error)]
pub enum ModelGatewayError {
    #[error("model gateway HTTP error: {0}")]
    Http(reqwest::Error),
    #[error("model gateway returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("embedding response did not include any vectors")]
    EmptyEmbedding,
    #[error("chat response did not include a message")]
    EmptyChat,
    #[error("model gateway request timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

/// What kind of text is being summarized; parameterises the prompt used by
/// `summarize_to_fit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarizeKind {
    NewContent,
    Quoted,
    Attachment,
    Evidence,
    History,
}

impl SummarizeKind {
    fn instruction(self) -> &'static str {
        match self {
            SummarizeKind::NewContent => {
                "Summarize the following email content, preserving all concrete facts, dates, and action items."
            }
            SummarizeKind::Quoted => {
                "Summarize the following quoted/forwarded email thread context concisely."
            }
            SummarizeKind::Attachment => {
                "Summarize the following attachment text, preserving key facts and figures."
            }
            SummarizeKind::Evidence => {
                "Summarize the following email, preserving every fact relevant to answering questions about it."
            }
            SummarizeKind::History => {
                "Summarize the following conversation history, preserving the topics and conclusions discussed."
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelGateway {
    base_url: String,
    http: Client,
    timeout: Duration,
}

impl ModelGateway {
    pub fn new(base_url: impl Into<String>, http: Client, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            timeout,
        }
    }

    /// Embed `text` with `model`, L2-normalize the result, fail on an
    /// empty response.
    pub async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, ModelGatewayError> {
        let raw = self.with_retries(|| self.dispatch_embed(model, text)).await?;
        if raw.is_empty() {
            return Err(ModelGatewayError::EmptyEmbedding);
        }
        Ok(l2_normalize(&raw))
    }

    /// Call the provider's chat endpoint with `stream=false`; return the
    /// assistant message content.
    pub async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<String, ModelGatewayError> {
        self.with_retries(|| self.dispatch_chat(model, messages)).await
    }

    /// Compress `text` toward `target_chars`, looping with the convergence
    /// band as a guard (spec.md §4.6). Terminates because every pass
    /// either reduces length toward the target or is declared
    /// non-progressing and returned as-is.
    pub async fn summarize_to_fit(
        &self,
        model: &str,
        kind: SummarizeKind,
        text: &str,
        target_chars: usize,
        max_input_chars: usize,
    ) -> Result<String, ModelGatewayError> {
        if text.chars().count() <= target_chars {
            return Ok(text.to_string());
        }

        let mut current = text.to_string();
        let mut pass_target = target_chars;

        loop {
            let before_len = current.chars().count();
            if before_len <= target_chars {
                return Ok(current);
            }

            let segments = split_into_segments(&current, max_input_chars);
            let mut summarized_segments = Vec::with_capacity(segments.len());
            for segment in &segments {
                let summary = self
                    .summarize_segment(model, kind, segment, pass_target / segments.len().max(1))
                    .await?;
                summarized_segments.push(summary);
            }
            let after = summarized_segments.join("\n\n");
            let after_len = after.chars().count();

            if before_len == 0 {
                return Ok(after);
            }

            // shrink_fraction is how much the pass removed: 0.3 means the
            // pass cut 30% of the text. The convergence band requires each
            // pass to cut between 25% and 50% of its input.
            let shrink_fraction = 1.0 - (after_len as f64 / before_len as f64);
            let min_progress = 1.0 - CONVERGENCE_MAX_RATIO;

            if shrink_fraction < min_progress {
                // Non-progressing pass: stop and return the pre-pass text.
                return Ok(current);
            }

            current = after;
            if shrink_fraction > (1.0 - CONVERGENCE_MIN_RATIO) {
                // Shrank by more than 50%: raise the target for the next
                // pass so later passes don't over-compress.
                pass_target = ((pass_target as f64) * 1.25) as usize;
            }

            if current.chars().count() <= target_chars {
                return Ok(current);
            }
        }
    }

    async fn summarize_segment(
        &self,
        model: &str,
        kind: SummarizeKind,
        segment: &str,
        target_chars: usize,
    ) -> Result<String, ModelGatewayError> {
        let prompt = format!(
            "{} Target length: approximately {} characters.\n\n{}",
            kind.instruction(),
            target_chars.max(1),
            segment
        );
        self.chat(model, &[ChatMessage::user(prompt)]).await
    }

    async fn with_retries<F, Fut, T>(&self, make_request: F) -> Result<T, ModelGatewayError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ModelGatewayError>>,
    {
        let mut backoff_ms = RETRY_BACKOFF_MS;
        for attempt in 1..=MAX_RETRIES {
            debug!("model gateway: attempt {} of {}", attempt, MAX_RETRIES);
            match timeout(self.timeout, make_request()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => {
                    warn!("model gateway: attempt {} failed: {}", attempt, err);
                    if attempt == MAX_RETRIES {
                        return Err(err);
                    }
                }
                Err(_) => {
                    warn!("model gateway: attempt {} timed out after {:?}", attempt, self.timeout);
                    if attempt == MAX_RETRIES {
                        return Err(ModelGatewayError::Timeout(self.timeout));
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = backoff_ms.saturating_mul(RETRY_BACKOFF_FACTOR);
        }
        Err(ModelGatewayError::Timeout(self.timeout))
    }

    async fn dispatch_embed(&self, model: &str, text: &str) -> Result<Vec<f32>, ModelGatewayError> {
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            prompt: &'a str,
        }
        #[derive(Deserialize)]
        struct Resp {
            #[serde(default)]
            embedding: Vec<f32>,
        }

        let url = format!("{}/api/embeddings", self.base_url);
        let response = self
            .http
            .post(url)
            .json(&Req { model, prompt: text })
            .send()
            .await
            .map_err(ModelGatewayError::Http)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelGatewayError::Status { status, body });
        }

        let parsed: Resp = response.json().await.map_err(ModelGatewayError::Http)?;
        Ok(parsed.embedding)
    }

    async fn dispatch_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<String, ModelGatewayError> {
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: &'a [ChatMessage],
            stream: bool,
        }
        #[derive(Deserialize)]
        struct RespMessage {
            #[serde(default)]
            content: String,
        }
        #[derive(Deserialize)]
        struct Resp {
            message: Option<RespMessage>,
        }

        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .http
            .post(url)
            .json(&Req { model, messages, stream: false })
            .send()
            .await
            .map_err(ModelGatewayError::Http)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelGatewayError::Status { status, body });
        }

        let parsed: Resp = response.json().await.map_err(ModelGatewayError::Http)?;
        parsed
            .message
            .map(|m| m.content)
            .filter(|c| !c.is_empty())
            .ok_or(ModelGatewayError::EmptyChat)
    }
}

fn split_into_segments(text: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 {
        return vec![text.to_string()];
    }
    crate::normalize::chunk_text(text, max_chars, 0)
}
