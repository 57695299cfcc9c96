//! Query Orchestrator (spec.md §4.8): the three-phase retrieval protocol.
//! Owns `PendingQuery` records keyed by `request_id`, mirroring the
//! `DashMap`-of-`Mutex` shape `session.rs` uses for per-record exclusion —
//! no outbound call is ever made while a pending-query's own lock is held.

use crate::config::RagConfig;
use crate::mime_parser;
use crate::model_gateway::{ChatMessage, ModelGateway, ModelGatewayError, SummarizeKind};
use crate::session::{Role, SessionManager, SourceRecap, TailTurn};
use crate::sql_validator::{self, FragmentKind, SqlValidationError};
use crate::{body_extractor, vector_store};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    #[default]
    Assistive,
    Grounded,
}

impl QueryMode {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.to_ascii_lowercase()) {
            Some(ref v) if v == "grounded" => QueryMode::Grounded,
            _ => QueryMode::Assistive,
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("request_id {0} not found")]
    UnknownRequest(String),
    #[error("session_id mismatch for request_id {0}")]
    SessionMismatch(String),
    #[error("missing evidence for: {0:?}")]
    MissingEvidence(Vec<String>),
    #[error(transparent)]
    ModelGateway(#[from] ModelGatewayError),
    #[error(transparent)]
    VectorStore(#[from] vector_store::VectorStoreError),
    #[error(transparent)]
    Validation(#[from] SqlValidationError),
}

/// A single retrieved candidate, merged across the question/rewrite/HyDE
/// variants and carried through to Phase 3 as the evidence index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedSource {
    pub doc_id: String,
    pub score: f64,
    pub subject: String,
    pub sender: String,
    pub email_date: DateTime<Utc>,
}

/// Process-local record tracking one in-flight three-phase request.
#[derive(Debug, Clone)]
pub struct PendingQuery {
    pub request_id: String,
    pub session_id: String,
    pub question: String,
    pub resolved_question: String,
    pub mode: QueryMode,
    pub chat_model: Option<String>,
    pub expected_message_ids: HashSet<String>,
    pub received_evidence: HashMap<String, Vec<u8>>,
    pub retrieved_sources: Vec<RetrievedSource>,
    pub created_at: DateTime<Utc>,
}

impl PendingQuery {
    fn missing_ids(&self) -> Vec<String> {
        self.expected_message_ids
            .iter()
            .filter(|id| !self.received_evidence.contains_key(*id))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryOrchestrator {
    pending: Arc<DashMap<String, Arc<Mutex<PendingQuery>>>>,
}

/// Best-effort parse of the query-rewrite chat response. Missing or
/// malformed keys fall back to sentinel defaults rather than failing the
/// whole Phase 1 request (spec.md §9 Design Notes: heterogeneous JSON).
#[derive(Debug, Clone, Default, Deserialize)]
struct RewriteResult {
    #[serde(default)]
    resolved_question: Option<String>,
    #[serde(default)]
    rewrite: Option<String>,
    #[serde(default)]
    hypothetical: Option<String>,
}

pub struct Phase1Outcome {
    pub request_id: String,
    pub status: &'static str,
    pub message_ids: Vec<String>,
    pub sources: Vec<RetrievedSource>,
    /// Literal SQL text executed by `knn_search`, surfaced for debugging
    /// when the caller supplied a validated `filter`/`score_expr` (spec.md
    /// §6 response shape: `retrieval_sql?`).
    pub retrieval_sql: Option<String>,
}

pub struct Phase3Outcome {
    pub answer: String,
    pub sources: Vec<RetrievedSource>,
}

impl QueryOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Phase 1 (`/query`): rewrite (optional), embed variants, kNN, merge,
    /// allocate a `request_id`, store the pending record.
    #[allow(clippy::too_many_arguments)]
    pub async fn start_query(
        &self,
        sessions: &SessionManager,
        gateway: &ModelGateway,
        store: &vector_store::VectorStore,
        config: &RagConfig,
        session_id: &str,
        question: &str,
        top_k: i64,
        mode: QueryMode,
        user_name: Option<&str>,
        chat_model: Option<String>,
        filter: Option<&str>,
        score_expr: Option<&str>,
    ) -> Result<Phase1Outcome, OrchestratorError> {
        if session_id.trim().is_empty() {
            return Err(OrchestratorError::BadRequest("session_id must not be empty".to_string()));
        }
        if question.trim().is_empty() {
            return Err(OrchestratorError::BadRequest("question must not be empty".to_string()));
        }

        let filter = filter
            .map(|f| sql_validator::validate_fragment(f, FragmentKind::Filter))
            .transpose()?;
        let score_expr = score_expr
            .map(|e| sql_validator::validate_fragment(e, FragmentKind::ScoreExpr))
            .transpose()?;

        let session_lock = sessions.get_or_create(session_id);
        let (last_sources_recap, history_summary) = {
            let mut record = session_lock.lock().await;
            record.set_user_name_if_unset(user_name);
            (record.last_sources_recap.clone(), record.history_summary.clone())
        };

        let rewrite = if config.query_rewrite {
            self.rewrite_question(gateway, config, question, &last_sources_recap, &history_summary)
                .await
        } else {
            None
        };

        let resolved_question = rewrite
            .as_ref()
            .and_then(|r| r.resolved_question.clone())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| question.to_string());

        let mut variants = vec![question.to_string()];
        if let Some(r) = &rewrite {
            if let Some(rw) = &r.rewrite {
                if !rw.trim().is_empty() {
                    variants.push(rw.clone());
                }
            }
            if let Some(hyde) = &r.hypothetical {
                if !hyde.trim().is_empty() {
                    variants.push(hyde.clone());
                }
            }
        }
        variants.sort();
        variants.dedup();
        variants.retain(|v| !v.trim().is_empty());

        let mut merged: HashMap<String, RetrievedSource> = HashMap::new();
        for variant in &variants {
            let embedding = gateway.embed(&config.embed_model, variant).await?;
            let hits = store
                .knn_search(&embedding, top_k, filter.as_deref(), score_expr.as_deref())
                .await?;
            for hit in hits {
                let entry = merged
                    .entry(hit.doc_id.clone())
                    .or_insert_with(|| RetrievedSource {
                        doc_id: hit.doc_id.clone(),
                        score: hit.score,
                        subject: hit.subject.clone(),
                        sender: hit.sender.clone(),
                        email_date: hit.email_date,
                    });
                if hit.score > entry.score {
                    entry.score = hit.score;
                }
            }
        }

        let mut sources: Vec<RetrievedSource> = merged.into_values().collect();
        sources.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        sources.truncate(top_k.max(0) as usize);

        let request_id = uuid::Uuid::new_v4().to_string();
        let message_ids: Vec<String> = sources.iter().map(|s| s.doc_id.clone()).collect();
        let status = if sources.is_empty() { "no_retrieval" } else { "need_messages" };
        let retrieval_sql = if filter.is_some() || score_expr.is_some() {
            Some(vector_store::VectorStore::build_knn_sql(filter.as_deref(), score_expr.as_deref()))
        } else {
            None
        };

        let pending = PendingQuery {
            request_id: request_id.clone(),
            session_id: session_id.to_string(),
            question: question.to_string(),
            resolved_question,
            mode,
            chat_model,
            expected_message_ids: message_ids.iter().cloned().collect(),
            received_evidence: HashMap::new(),
            retrieved_sources: sources.clone(),
            created_at: Utc::now(),
        };
        self.pending
            .insert(request_id.clone(), Arc::new(Mutex::new(pending)));

        Ok(Phase1Outcome { request_id, status, message_ids, sources, retrieval_sql })
    }

    async fn rewrite_question(
        &self,
        gateway: &ModelGateway,
        config: &RagConfig,
        question: &str,
        last_sources: &[SourceRecap],
        history_summary: &str,
    ) -> Option<RewriteResult> {
        let recap = last_sources
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. {} (from {}, {})", i + 1, s.subject, s.sender, s.doc_id))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "You resolve references in a follow-up question about a personal email \
             archive and produce search variants. Respond with ONLY a JSON object: \
             {{\"resolved_question\": string, \"rewrite\": string, \"hypothetical\": string}}.\n\
             - resolved_question: the question with relative references (\"the second \
             email\", \"that one\") bound to concrete identifiers from the sources below.\n\
             - rewrite: a self-contained search query incorporating conversation context. \
             Leave empty if this is the first turn in the session.\n\
             - hypothetical: a fake email in a realistic indexed format that would likely \
             answer the question (for retrieval only, never shown to the user).\n\n\
             HISTORY SUMMARY: {}\n\
             PRIOR SOURCES:\n{}\n\n\
             QUESTION: {}",
            if history_summary.is_empty() { "(none)" } else { history_summary },
            if recap.is_empty() { "(none)" } else { &recap },
            question,
        );

        match gateway.chat(&config.chat_model, &[ChatMessage::user(prompt)]).await {
            Ok(response) => Some(parse_rewrite_response(&response)),
            Err(err) => {
                log::warn!("query rewrite failed, proceeding with raw question: {}", err);
                None
            }
        }
    }

    /// Phase 2 (`/query/evidence`): record raw bytes for `message_id` under
    /// `request_id`. Accepts evidence for ids outside the expected set
    /// without rejecting the request (spec.md §4.8).
    pub async fn submit_evidence(
        &self,
        request_id: &str,
        message_id: &str,
        raw: Vec<u8>,
    ) -> Result<(), OrchestratorError> {
        let entry = self
            .pending
            .get(request_id)
            .ok_or_else(|| OrchestratorError::UnknownRequest(request_id.to_string()))?
            .clone();
        let mut pending = entry.lock().await;
        pending.received_evidence.insert(message_id.to_string(), raw);
        Ok(())
    }

    /// Phase 3 (`/query/complete`). On success the pending record is
    /// discarded; on missing evidence it is left alive for a retry; on
    /// upstream chat failure it is ALSO left alive (DESIGN.md Open
    /// Question 1) so the client can retry without re-uploading evidence.
    pub async fn complete(
        &self,
        sessions: &SessionManager,
        gateway: &ModelGateway,
        store: &vector_store::VectorStore,
        config: &RagConfig,
        request_id: &str,
        session_id: &str,
        chat_model_override: Option<&str>,
    ) -> Result<Phase3Outcome, OrchestratorError> {
        let entry = self
            .pending
            .get(request_id)
            .ok_or_else(|| OrchestratorError::UnknownRequest(request_id.to_string()))?
            .clone();

        let snapshot = {
            let pending = entry.lock().await;
            if pending.session_id != session_id {
                return Err(OrchestratorError::SessionMismatch(request_id.to_string()));
            }
            let missing = pending.missing_ids();
            if !missing.is_empty() {
                return Err(OrchestratorError::MissingEvidence(missing));
            }
            pending.clone()
        };

        let evidence = self
            .build_evidence(gateway, store, config, &snapshot)
            .await?;

        let session_lock = sessions.get_or_create(session_id);
        let (tail, history_summary) = {
            let record = session_lock.lock().await;
            (record.tail.clone(), record.history_summary.clone())
        };

        let model = chat_model_override
            .map(|s| s.to_string())
            .or_else(|| snapshot.chat_model.clone())
            .unwrap_or_else(|| config.chat_model.clone());

        let messages = build_messages(&snapshot, &tail, &history_summary, &evidence, config);
        let answer_raw = gateway.chat(&model, &messages).await?;
        let answer = strip_boilerplate(&answer_raw);

        let referenced_sources: Vec<SourceRecap> = snapshot
            .retrieved_sources
            .iter()
            .map(|s| SourceRecap {
                doc_id: s.doc_id.clone(),
                subject: s.subject.clone(),
                sender: s.sender.clone(),
                email_date: s.email_date,
            })
            .collect();

        {
            let mut record = session_lock.lock().await;
            crate::session::record_completed_turn(
                &mut record,
                gateway,
                config,
                snapshot.question.clone(),
                answer.clone(),
                referenced_sources.clone(),
            )
            .await?;
            record.last_sources_recap = referenced_sources;
        }

        self.pending.remove(request_id);

        Ok(Phase3Outcome { answer, sources: snapshot.retrieved_sources })
    }

    async fn build_evidence(
        &self,
        gateway: &ModelGateway,
        store: &vector_store::VectorStore,
        config: &RagConfig,
        pending: &PendingQuery,
    ) -> Result<Vec<EvidenceEmail>, OrchestratorError> {
        let mut out = Vec::with_capacity(pending.retrieved_sources.len());
        for source in &pending.retrieved_sources {
            let Some(raw) = pending.received_evidence.get(&source.doc_id) else {
                continue;
            };
            let detail = store.get_detail(&source.doc_id).await?;
            let body = mime_parser::parse_message(raw)
                .ok()
                .map(|message| body_extractor::extract_body(&message, raw))
                .unwrap_or_default();

            let combined = if body.quoted_text.trim().is_empty() {
                body.new_text.clone()
            } else {
                format!("{}\n\nQuoted context: {}", body.new_text, body.quoted_text)
            };

            let summarized = gateway
                .summarize_to_fit(
                    &config.summarize_model,
                    SummarizeKind::Evidence,
                    &combined,
                    config.max_evidence_chars_per_email,
                    config.summarize_max_input_chars,
                )
                .await?;

            out.push(EvidenceEmail {
                doc_id: source.doc_id.clone(),
                subject: source.subject.clone(),
                sender: source.sender.clone(),
                email_date: source.email_date,
                detail,
                body: summarized,
            });
        }
        Ok(out)
    }

    /// Sweep pending records older than `ttl`, discarding them silently
    /// (state machine: `EvidenceAwaited -> Abandoned` on reaper timeout).
    pub fn reap_expired(&self, ttl: chrono::Duration) {
        let cutoff = Utc::now() - ttl;
        let stale: Vec<String> = self
            .pending
            .iter()
            .filter_map(|entry| {
                // try_lock: a record mid-mutation is, by definition, not
                // abandoned.
                entry
                    .value()
                    .try_lock()
                    .ok()
                    .filter(|record| record.created_at < cutoff)
                    .map(|_| entry.key().clone())
            })
            .collect();
        for request_id in stale {
            self.pending.remove(&request_id);
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvidenceEmail {
    pub doc_id: String,
    pub subject: String,
    pub sender: String,
    pub email_date: DateTime<Utc>,
    pub detail: Option<vector_store::EmailDetail>,
    pub body: String,
}

fn parse_rewrite_response(response: &str) -> RewriteResult {
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

/// Strip conversational boilerplate ("Sure!", "Happy to help!", greetings)
/// from the front of a chat response.
fn strip_boilerplate(text: &str) -> String {
    const PREFIXES: &[&str] = &[
        "sure!", "sure,", "sure.", "happy to help!", "happy to help,",
        "certainly!", "of course!", "absolutely!", "great question!",
    ];
    let mut trimmed = text.trim();
    loop {
        let lower = trimmed.to_ascii_lowercase();
        let mut stripped_any = false;
        for prefix in PREFIXES {
            if lower.starts_with(prefix) {
                trimmed = trimmed[prefix.len()..].trim_start();
                stripped_any = true;
                break;
            }
        }
        if !stripped_any {
            break;
        }
    }
    trimmed.to_string()
}

/// Pure function of `(session tail/history, pending, evidence, config)`:
/// the Phase 3 message-list builder (spec.md §6 Prompt assembly; SPEC_FULL
/// §13). Every branch — history present/absent, evidence present/absent,
/// mode grounded/assistive — is exercised by the tests below.
pub fn build_messages(
    pending: &PendingQuery,
    tail: &[TailTurn],
    history_summary: &str,
    evidence: &[EvidenceEmail],
    config: &RagConfig,
) -> Vec<ChatMessage> {
    let mut messages = Vec::new();

    let mut preamble = format!(
        "You are an email research assistant. The current local time is {}. \
         Each cited email carries an action_score and importance_score from 0-100 \
         (how urgently the recipient must act, and how significant the email is \
         overall) and a `processed` flag indicating whether the user has already \
         dealt with it. Cite every fact you draw from an email as [Email N], where \
         N is that email's 1-based index in the EMAILS THAT MAY BE RELEVANT list below.",
        Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Seconds, true)
    );
    if pending.mode == QueryMode::Grounded {
        preamble.push_str(
            " If the evidence does not answer the question, say so and do not speculate.",
        );
    }
    messages.push(ChatMessage::system(preamble));

    if !history_summary.trim().is_empty() {
        messages.push(ChatMessage::system(format!("HISTORY SUMMARY: {}", history_summary)));
    }

    for turn in tail {
        let content = match turn.role {
            Role::User => turn.content.clone(),
            Role::Assistant => {
                if turn.referenced_sources.is_empty() {
                    turn.content.clone()
                } else {
                    let index = turn
                        .referenced_sources
                        .iter()
                        .enumerate()
                        .map(|(i, s)| format!("{}. {} (from {})", i + 1, s.subject, s.sender))
                        .collect::<Vec<_>>()
                        .join("\n");
                    format!(
                        "{}\n\nEMAILS REFERENCED ABOVE:\n{}",
                        turn.content, index
                    )
                }
            }
        };
        let message = match turn.role {
            Role::User => ChatMessage::user(content),
            Role::Assistant => ChatMessage::assistant(content),
        };
        messages.push(message);
    }

    if !evidence.is_empty() {
        let mut blocks = String::from("EMAILS THAT MAY BE RELEVANT:\n");
        for (i, email) in evidence.iter().enumerate() {
            let detail = email.detail.as_ref();
            blocks.push_str(&format!(
                "[Email {}] Subject: {}\nFrom: {}\nDate: {}\n",
                i + 1,
                email.subject,
                email.sender,
                email.email_date.to_rfc3339_opts(chrono::SecondsFormat::Seconds, true),
            ));
            if let Some(detail) = detail {
                if !detail.attachments.is_empty() {
                    blocks.push_str(&format!("Attachments: {}\n", detail.attachments.join(", ")));
                }
                blocks.push_str(&format!(
                    "Triage: action_score={:?} importance_score={:?} reply_by={:?} processed={}\n",
                    detail.action_score, detail.importance_score, detail.reply_by, detail.processed
                ));
            }
            blocks.push_str(&format!("Body:\n{}\n\n", email.body));
        }
        messages.push(ChatMessage::system(blocks));
    }

    let citation_instruction = if config.include_unrehydrated_metadata {
        "Cite every source you rely on as [Email N]. Include any triage metadata relevant to the answer."
    } else {
        "Cite every source you rely on as [Email N]."
    };
    messages.push(ChatMessage::user(format!(
        "{}\n\n{}",
        pending.resolved_question, citation_instruction
    )));

    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;

    fn config() -> RagConfig {
        RagConfig {
            database_url: "postgres://".to_string(),
            model_gateway_url: "http://localhost".to_string(),
            embed_model: "embed".to_string(),
            chat_model: "chat".to_string(),
            summarize_model: "chat".to_string(),
            triage_model: "chat".to_string(),
            ollama_timeout: std::time::Duration::from_secs(300),
            chunk_size: 1200,
            chunk_overlap: 150,
            max_evidence_chars_per_email: 6000,
            new_content_max_chars: 4000,
            quoted_max_lines: 40,
            quoted_max_chars: 2000,
            attachment_max_chars: 1500,
            max_attachments: 5,
            summarize_max_input_chars: 8000,
            quoted_context_summarize: true,
            attachment_summarize: true,
            query_rewrite: true,
            include_unrehydrated_metadata: false,
            default_mode: "assistive".to_string(),
            pending_query_ttl: std::time::Duration::from_secs(600),
            session_idle_ttl: std::time::Duration::from_secs(86400),
            tail_max: 24,
            keep_recent: 8,
            history_max_chars: 8000,
        }
    }

    fn pending(mode: QueryMode) -> PendingQuery {
        PendingQuery {
            request_id: "r1".to_string(),
            session_id: "s1".to_string(),
            question: "when is the launch?".to_string(),
            resolved_question: "When is the Project Falcon launch date?".to_string(),
            mode,
            chat_model: None,
            expected_message_ids: HashSet::new(),
            received_evidence: HashMap::new(),
            retrieved_sources: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn grounded_mode_adds_no_speculation_clause() {
        let messages = build_messages(&pending(QueryMode::Grounded), &[], "", &[], &config());
        assert!(messages[0].content.contains("do not speculate"));
    }

    #[test]
    fn assistive_mode_omits_no_speculation_clause() {
        let messages = build_messages(&pending(QueryMode::Assistive), &[], "", &[], &config());
        assert!(!messages[0].content.contains("do not speculate"));
    }

    #[test]
    fn history_summary_present_adds_system_message() {
        let messages = build_messages(&pending(QueryMode::Assistive), &[], "prior topic", &[], &config());
        assert!(messages.iter().any(|m| m.content.contains("HISTORY SUMMARY: prior topic")));
    }

    #[test]
    fn history_summary_absent_skips_system_message() {
        let messages = build_messages(&pending(QueryMode::Assistive), &[], "", &[], &config());
        assert!(!messages.iter().any(|m| m.content.starts_with("HISTORY SUMMARY")));
    }

    #[test]
    fn evidence_present_adds_relevant_block_with_citation_index() {
        let evidence = vec![EvidenceEmail {
            doc_id: "a@x".to_string(),
            subject: "Launch date".to_string(),
            sender: "alice@example.com".to_string(),
            email_date: Utc::now(),
            detail: None,
            body: "March 15".to_string(),
        }];
        let messages = build_messages(&pending(QueryMode::Assistive), &[], "", &evidence, &config());
        let relevant = messages.iter().find(|m| m.content.contains("EMAILS THAT MAY BE RELEVANT")).unwrap();
        assert!(relevant.content.contains("[Email 1]"));
        assert!(relevant.content.contains("March 15"));
    }

    #[test]
    fn evidence_absent_skips_relevant_block() {
        let messages = build_messages(&pending(QueryMode::Assistive), &[], "", &[], &config());
        assert!(!messages.iter().any(|m| m.content.contains("EMAILS THAT MAY BE RELEVANT")));
    }

    #[test]
    fn assistant_turn_with_references_gets_index_appended() {
        let tail = vec![TailTurn {
            role: Role::Assistant,
            content: "The launch is in March [Email 1]".to_string(),
            referenced_sources: vec![SourceRecap {
                doc_id: "a@x".to_string(),
                subject: "Launch date".to_string(),
                sender: "alice@example.com".to_string(),
                email_date: Utc::now(),
            }],
        }];
        let messages = build_messages(&pending(QueryMode::Assistive), &tail, "", &[], &config());
        let assistant_msg = messages.iter().find(|m| m.role == "assistant").unwrap();
        assert!(assistant_msg.content.contains("EMAILS REFERENCED ABOVE"));
    }

    #[test]
    fn strip_boilerplate_removes_common_prefixes() {
        assert_eq!(strip_boilerplate("Sure! Here's the answer."), "Here's the answer.");
        assert_eq!(strip_boilerplate("Happy to help! The date is March 15."), "The date is March 15.");
        assert_eq!(strip_boilerplate("March 15."), "March 15.");
    }

    #[test]
    fn parse_rewrite_response_best_effort_defaults() {
        let result = parse_rewrite_response("not json");
        assert!(result.resolved_question.is_none());
    }

    #[test]
    fn parse_rewrite_response_extracts_fields() {
        let response = r#"Sure, here: {"resolved_question": "q", "rewrite": "r", "hypothetical": "h"}"#;
        let result = parse_rewrite_response(response);
        assert_eq!(result.resolved_question.as_deref(), Some("q"));
        assert_eq!(result.rewrite.as_deref(), Some("r"));
        assert_eq!(result.hypothetical.as_deref(), Some("h"));
    }
}
