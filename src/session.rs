//! Process-local conversational session state (spec.md §4.9). Sessions are
//! never persisted; the outer map is a `DashMap` for concurrent
//! insertion/lookup, and every mutation to a single record's `tail`,
//! `history_summary`, or `last_sources_recap` happens under that record's
//! own lock, matching the per-record exclusion the session map needs
//! without serialising unrelated sessions against each other.

use crate::config::RagConfig;
use crate::model_gateway::{ModelGateway, ModelGatewayError, SummarizeKind};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailTurn {
    pub role: Role,
    pub content: String,
    /// Present on assistant turns only: the `EMAILS REFERENCED ABOVE` index
    /// so later `[Email N]` citations in this turn remain resolvable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub referenced_sources: Vec<SourceRecap>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecap {
    pub doc_id: String,
    pub subject: String,
    pub sender: String,
    pub email_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_name: Option<String>,
    pub tail: Vec<TailTurn>,
    pub history_summary: String,
    pub last_sources_recap: Vec<SourceRecap>,
    #[serde(skip)]
    pub last_activity: DateTime<Utc>,
}

impl SessionRecord {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            user_name: None,
            tail: Vec::new(),
            history_summary: String::new(),
            last_sources_recap: Vec::new(),
            last_activity: Utc::now(),
        }
    }

    /// First-write-wins: an already-set `user_name` is never overwritten.
    pub fn set_user_name_if_unset(&mut self, user_name: Option<&str>) {
        if self.user_name.is_none() {
            if let Some(name) = user_name {
                if !name.trim().is_empty() {
                    self.user_name = Some(name.to_string());
                }
            }
        }
    }

    pub fn push_turn(&mut self, turn: TailTurn, tail_max: usize) {
        self.tail.push(turn);
        if self.tail.len() > tail_max {
            let overflow = self.tail.len() - tail_max;
            self.tail.drain(0..overflow);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionManager {
    sessions: Arc<DashMap<String, Arc<Mutex<SessionRecord>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self { sessions: Arc::new(DashMap::new()) }
    }

    /// Fetch the session's lock, creating an empty record on first use.
    pub fn get_or_create(&self, session_id: &str) -> Arc<Mutex<SessionRecord>> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionRecord::new(session_id.to_string()))))
            .clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Mutex<SessionRecord>>> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    pub fn reset(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// Remove sessions whose last activity is older than `idle_ttl`. Run
    /// periodically from an `on_liftoff` background task.
    pub async fn evict_idle(&self, idle_ttl: chrono::Duration) {
        let cutoff = Utc::now() - idle_ttl;
        let mut stale = Vec::new();
        for entry in self.sessions.iter() {
            let record = entry.value().lock().await;
            if record.last_activity < cutoff {
                stale.push(entry.key().clone());
            }
        }
        for session_id in stale {
            self.sessions.remove(&session_id);
        }
    }
}

/// Append the completed turn to `record.tail`, touch `last_activity`, and
/// fold the oldest turns into `history_summary` if the combined history has
/// grown past the compression trigger (80% of `HISTORY_MAX_CHARS`).
pub async fn record_completed_turn(
    record: &mut SessionRecord,
    gateway: &ModelGateway,
    config: &RagConfig,
    question: String,
    answer: String,
    referenced_sources: Vec<SourceRecap>,
) -> Result<(), ModelGatewayError> {
    record.last_activity = Utc::now();
    record.push_turn(TailTurn { role: Role::User, content: question, referenced_sources: Vec::new() }, config.tail_max);
    record.push_turn(
        TailTurn { role: Role::Assistant, content: answer, referenced_sources },
        config.tail_max,
    );

    let combined_len = record.history_summary.chars().count()
        + record.tail.iter().map(|t| t.content.chars().count()).sum::<usize>();
    let trigger = (config.history_max_chars as f64 * 0.8) as usize;

    if combined_len > trigger && record.tail.len() > config.keep_recent {
        let fold_count = record.tail.len() - config.keep_recent;
        let folded: Vec<TailTurn> = record.tail.drain(0..fold_count).collect();
        let folded_text = folded
            .iter()
            .map(|t| format!("{:?}: {}", t.role, t.content))
            .collect::<Vec<_>>()
            .join("\n");

        let combined = if record.history_summary.is_empty() {
            folded_text
        } else {
            format!("{}\n{}", record.history_summary, folded_text)
        };

        record.history_summary = gateway
            .summarize_to_fit(
                &config.summarize_model,
                SummarizeKind::History,
                &combined,
                trigger / 2,
                config.summarize_max_input_chars,
            )
            .await?;
    }

    Ok(())
}
