//! Turns raw RFC822 bytes into an indexed email row plus embedded chunks
//! (spec.md §4.7). Atomic per `doc_id`: any transient failure (embed, chat)
//! aborts before the store is touched.

use crate::body_extractor;
use crate::config::RagConfig;
use crate::mime_parser::{self, MimeParseError, ParsedMessage};
use crate::model_gateway::{ChatMessage, ModelGateway, ModelGatewayError, SummarizeKind};
use crate::normalize;
use crate::vector_store::{NewChunk, UpsertEmail, VectorStore, VectorStoreError};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to parse message: {0}")]
    Parse(#[from] MimeParseError),
    #[error(transparent)]
    ModelGateway(#[from] ModelGatewayError),
    #[error(transparent)]
    VectorStore(#[from] VectorStoreError),
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub doc_id: String,
    pub chunks_indexed: usize,
}

#[derive(Debug, Deserialize, Default)]
struct TriageResult {
    action_score: Option<i16>,
    importance_score: Option<i16>,
    reply_by: Option<String>,
}

/// Run the full ingestion pipeline for one message. `thunderbird_message_id`
/// is the `X-Thunderbird-Message-Id` header value, used as a `doc_id`
/// fallback when the message carries no `Message-Id`.
pub async fn ingest_message(
    gateway: &ModelGateway,
    store: &VectorStore,
    config: &RagConfig,
    raw: &[u8],
    thunderbird_message_id: Option<&str>,
) -> Result<IngestOutcome, IngestError> {
    let message = mime_parser::parse_message(raw)?;
    let doc_id = compute_doc_id(&message, thunderbird_message_id, raw);

    let body = body_extractor::extract_body(&message, raw);
    let attachments: Vec<String> = message
        .attachments()
        .filter_map(|leaf| leaf.filename.clone())
        .take(config.max_attachments)
        .collect();

    let new_text = shrink_new_content(gateway, config, &body.new_text).await?;
    let quoted_summary = shrink_quoted_content(gateway, config, &body.quoted_text).await?;
    let attachment_summaries =
        shrink_attachments(gateway, config, &message, config.max_attachments).await?;

    let text_for_index = build_text_for_index(
        &message,
        &doc_id,
        &attachments,
        &new_text,
        &quoted_summary,
        &attachment_summaries,
    );

    let triage = run_triage(gateway, config, &text_for_index).await?;

    let chunks = normalize::chunk_text(&text_for_index, config.chunk_size, config.chunk_overlap);
    let mut new_chunks = Vec::with_capacity(chunks.len());
    for (index, chunk_text) in chunks.iter().enumerate() {
        let embedding = gateway.embed(&config.embed_model, chunk_text).await?;
        new_chunks.push(NewChunk {
            chunk_index: index as i32,
            chunk_text: chunk_text.clone(),
            embedding,
        });
    }

    let email_date = parse_email_date(message.header("date"));

    store
        .upsert_email(&UpsertEmail {
            doc_id: doc_id.clone(),
            sender: message.header("from").unwrap_or_default().to_string(),
            recipient: message.header("to").unwrap_or_default().to_string(),
            cc: message.header("cc").unwrap_or_default().to_string(),
            bcc: message.header("bcc").unwrap_or_default().to_string(),
            subject: message.header("subject").unwrap_or_default().to_string(),
            email_date,
            attachments: attachments.clone(),
            action_score: triage.action_score,
            importance_score: triage.importance_score,
            reply_by: triage.reply_by,
            embed_model: config.embed_model.clone(),
            triage_model: config.triage_model.clone(),
        })
        .await?;

    store.replace_chunks(&doc_id, &new_chunks).await?;

    Ok(IngestOutcome {
        doc_id,
        chunks_indexed: new_chunks.len(),
    })
}

fn compute_doc_id(
    message: &ParsedMessage,
    thunderbird_message_id: Option<&str>,
    raw: &[u8],
) -> String {
    if let Some(message_id) = message.header("message-id") {
        let trimmed = message_id.trim().trim_start_matches('<').trim_end_matches('>');
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    if let Some(override_id) = thunderbird_message_id {
        if !override_id.trim().is_empty() {
            return override_id.trim().to_string();
        }
    }
    let mut hasher = Sha256::new();
    hasher.update(raw);
    format!("sha256:{:x}", hasher.finalize())
}

fn parse_email_date(header: Option<&str>) -> DateTime<Utc> {
    header
        .and_then(|value| dateparser::parse(value).ok())
        .unwrap_or_else(Utc::now)
}

async fn shrink_new_content(
    gateway: &ModelGateway,
    config: &RagConfig,
    new_text: &str,
) -> Result<String, ModelGatewayError> {
    if new_text.chars().count() <= config.new_content_max_chars {
        return Ok(new_text.to_string());
    }
    gateway
        .summarize_to_fit(
            &config.summarize_model,
            SummarizeKind::NewContent,
            new_text,
            config.new_content_max_chars,
            config.summarize_max_input_chars,
        )
        .await
}

async fn shrink_quoted_content(
    gateway: &ModelGateway,
    config: &RagConfig,
    quoted_text: &str,
) -> Result<String, ModelGatewayError> {
    if !config.quoted_context_summarize || quoted_text.trim().is_empty() {
        return Ok(String::new());
    }
    let truncated = truncate_lines_and_chars(quoted_text, config.quoted_max_lines, config.quoted_max_chars);
    gateway
        .summarize_to_fit(
            &config.summarize_model,
            SummarizeKind::Quoted,
            &truncated,
            config.quoted_max_chars,
            config.summarize_max_input_chars,
        )
        .await
}

fn truncate_lines_and_chars(text: &str, max_lines: usize, max_chars: usize) -> String {
    let by_lines: String = text.lines().take(max_lines).collect::<Vec<_>>().join("\n");
    by_lines.chars().take(max_chars).collect()
}

async fn shrink_attachments(
    gateway: &ModelGateway,
    config: &RagConfig,
    message: &ParsedMessage,
    max_attachments: usize,
) -> Result<Vec<(String, String)>, ModelGatewayError> {
    if !config.attachment_summarize {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for leaf in message.attachments().take(max_attachments) {
        if leaf.body.trim().is_empty() {
            continue;
        }
        let summary = gateway
            .summarize_to_fit(
                &config.summarize_model,
                SummarizeKind::Attachment,
                &leaf.body,
                config.attachment_max_chars,
                config.summarize_max_input_chars,
            )
            .await?;
        let name = leaf.filename.clone().unwrap_or_else(|| "attachment".to_string());
        out.push((name, summary));
    }
    Ok(out)
}

fn build_text_for_index(
    message: &ParsedMessage,
    doc_id: &str,
    attachments: &[String],
    new_text: &str,
    quoted_summary: &str,
    attachment_summaries: &[(String, String)],
) -> String {
    let mut out = String::new();
    out.push_str(&format!("From: {}\n", message.header("from").unwrap_or_default()));
    out.push_str(&format!("To: {}\n", message.header("to").unwrap_or_default()));
    out.push_str(&format!("Subject: {}\n", message.header("subject").unwrap_or_default()));
    out.push_str(&format!("Date: {}\n", message.header("date").unwrap_or_default()));
    if !attachments.is_empty() {
        out.push_str(&format!("Attachments: {}\n", attachments.join(", ")));
    }
    out.push_str(&format!("doc_id: {}\n\n", doc_id));
    out.push_str(new_text.trim());

    if !quoted_summary.trim().is_empty() {
        out.push_str("\n\nQuoted context: ");
        out.push_str(quoted_summary.trim());
    }

    for (name, summary) in attachment_summaries {
        out.push_str(&format!("\n\nAttachment {}: {}", name, summary.trim()));
    }

    out
}

async fn run_triage(
    gateway: &ModelGateway,
    config: &RagConfig,
    text_for_index: &str,
) -> Result<TriageResult, ModelGatewayError> {
    let prompt = format!(
        "Read the following email and respond with ONLY a JSON object \
         {{\"action_score\": 0-100, \"importance_score\": 0-100, \"reply_by\": \"ISO 8601 date or 'none'\"}}. \
         action_score is how urgently the recipient must act; importance_score is overall significance.\n\n{}",
        text_for_index
    );
    let response = gateway.chat(&config.triage_model, &[ChatMessage::user(prompt)]).await?;
    Ok(parse_triage_response(&response))
}

fn parse_triage_response(response: &str) -> TriageResult {
    let json_slice = extract_json_object(response).unwrap_or(response);
    serde_json::from_str(json_slice).unwrap_or_default()
}

fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_doc_id_prefers_message_id() {
        let message = mime_parser::parse_message(
            b"Message-Id: <abc@example.com>\r\nSubject: hi\r\n\r\nbody\r\n",
        )
        .unwrap();
        assert_eq!(compute_doc_id(&message, Some("fallback"), b"raw"), "abc@example.com");
    }

    #[test]
    fn compute_doc_id_falls_back_to_override_header() {
        let message = mime_parser::parse_message(b"Subject: hi\r\n\r\nbody\r\n").unwrap();
        assert_eq!(compute_doc_id(&message, Some("tb-123"), b"raw"), "tb-123");
    }

    #[test]
    fn compute_doc_id_falls_back_to_digest() {
        let message = mime_parser::parse_message(b"Subject: hi\r\n\r\nbody\r\n").unwrap();
        let doc_id = compute_doc_id(&message, None, b"raw bytes");
        assert!(doc_id.starts_with("sha256:"));
    }

    #[test]
    fn extract_json_object_strips_surrounding_prose() {
        let text = "Sure, here you go:\n{\"action_score\": 10, \"importance_score\": 20, \"reply_by\": \"none\"}\nlet me know!";
        let extracted = extract_json_object(text).unwrap();
        let triage: TriageResult = serde_json::from_str(extracted).unwrap();
        assert_eq!(triage.action_score, Some(10));
        assert_eq!(triage.reply_by.as_deref(), Some("none"));
    }

    #[test]
    fn parse_triage_response_defaults_on_malformed_json() {
        let triage = parse_triage_response("not json at all");
        assert_eq!(triage.action_score, None);
    }

    #[test]
    fn truncate_lines_and_chars_respects_both_bounds() {
        let text = (0..10).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n");
        let truncated = truncate_lines_and_chars(&text, 3, 1000);
        assert_eq!(truncated.lines().count(), 3);
    }
}
