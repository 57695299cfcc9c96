//! Owns the connection pool and schema for email metadata and chunk
//! embeddings (spec.md §4.4). All text inputs are bound parameters; the
//! only dynamic SQL is the caller-supplied `filter`/`score_expr`, which
//! MUST already have passed [`crate::sql_validator::validate_fragment`]
//! before reaching this module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct UpsertEmail {
    pub doc_id: String,
    pub sender: String,
    pub recipient: String,
    pub cc: String,
    pub bcc: String,
    pub subject: String,
    pub email_date: DateTime<Utc>,
    pub attachments: Vec<String>,
    pub action_score: Option<i16>,
    pub importance_score: Option<i16>,
    pub reply_by: Option<String>,
    pub embed_model: String,
    pub triage_model: String,
}

#[derive(Debug, Clone)]
pub struct NewChunk {
    pub chunk_index: i32,
    pub chunk_text: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailDetail {
    pub doc_id: String,
    pub sender: String,
    pub recipient: String,
    pub cc: String,
    pub bcc: String,
    pub subject: String,
    pub email_date: DateTime<Utc>,
    pub attachments: Vec<String>,
    pub action_score: Option<i16>,
    pub importance_score: Option<i16>,
    pub reply_by: Option<String>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub ingested_at: DateTime<Utc>,
    pub embed_model: String,
    pub triage_model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredSource {
    pub doc_id: String,
    pub score: f64,
    pub subject: String,
    pub sender: String,
    pub email_date: DateTime<Utc>,
}

fn vector_literal(embedding: &[f32]) -> String {
    let mut out = String::with_capacity(embedding.len() * 8 + 2);
    out.push('[');
    for (i, v) in embedding.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&v.to_string());
    }
    out.push(']');
    out
}

#[derive(Debug, Clone)]
pub struct VectorStore {
    pool: PgPool,
}

impl VectorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert or update by `doc_id`. `processed`/`processed_at` are left
    /// untouched on conflict — re-ingestion must not silently clear a
    /// user's existing triage intent (see DESIGN.md Open Question 2).
    pub async fn upsert_email(&self, email: &UpsertEmail) -> Result<(), VectorStoreError> {
        let attachments_json = serde_json::to_value(&email.attachments).unwrap_or_default();
        sqlx::query(
            r#"
            INSERT INTO emails (
                doc_id, sender, recipient, cc, bcc, subject, email_date,
                attachments, action_score, importance_score, reply_by,
                processed, processed_at, ingested_at, embed_model, triage_model
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, false, NULL, now(), $12, $13
            )
            ON CONFLICT (doc_id) DO UPDATE SET
                sender = EXCLUDED.sender,
                recipient = EXCLUDED.recipient,
                cc = EXCLUDED.cc,
                bcc = EXCLUDED.bcc,
                subject = EXCLUDED.subject,
                email_date = EXCLUDED.email_date,
                attachments = EXCLUDED.attachments,
                action_score = EXCLUDED.action_score,
                importance_score = EXCLUDED.importance_score,
                reply_by = EXCLUDED.reply_by,
                ingested_at = now(),
                embed_model = EXCLUDED.embed_model,
                triage_model = EXCLUDED.triage_model
            "#,
        )
        .bind(&email.doc_id)
        .bind(&email.sender)
        .bind(&email.recipient)
        .bind(&email.cc)
        .bind(&email.bcc)
        .bind(&email.subject)
        .bind(email.email_date)
        .bind(attachments_json)
        .bind(email.action_score)
        .bind(email.importance_score)
        .bind(&email.reply_by)
        .bind(&email.embed_model)
        .bind(&email.triage_model)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete existing chunks for `doc_id` and insert `chunks`, in a single
    /// transaction.
    pub async fn replace_chunks(
        &self,
        doc_id: &str,
        chunks: &[NewChunk],
    ) -> Result<(), VectorStoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM email_chunks WHERE doc_id = $1")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            let literal = vector_literal(&chunk.embedding);
            sqlx::query(
                "INSERT INTO email_chunks (doc_id, chunk_index, chunk_text, embedding) \
                 VALUES ($1, $2, $3, $4::vector)",
            )
            .bind(doc_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.chunk_text)
            .bind(literal)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Cascade-delete an email and all its chunks. Returns the number of
    /// chunks removed.
    pub async fn delete_email(&self, doc_id: &str) -> Result<u64, VectorStoreError> {
        let mut tx = self.pool.begin().await?;
        let chunks_deleted = sqlx::query("DELETE FROM email_chunks WHERE doc_id = $1")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM emails WHERE doc_id = $1")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(chunks_deleted)
    }

    /// Returns `(ingested_ids, processed_ids)` among `ids`.
    pub async fn batch_ingested_status(
        &self,
        ids: &[String],
    ) -> Result<(Vec<String>, Vec<String>), VectorStoreError> {
        let rows = sqlx::query("SELECT doc_id, processed FROM emails WHERE doc_id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;

        let mut ingested = Vec::new();
        let mut processed = Vec::new();
        for row in rows {
            let doc_id: String = row.try_get("doc_id")?;
            let is_processed: bool = row.try_get("processed")?;
            if is_processed {
                processed.push(doc_id.clone());
            }
            ingested.push(doc_id);
        }
        Ok((ingested, processed))
    }

    pub async fn get_detail(&self, doc_id: &str) -> Result<Option<EmailDetail>, VectorStoreError> {
        let row = sqlx::query(
            "SELECT doc_id, sender, recipient, cc, bcc, subject, email_date, attachments, \
             action_score, importance_score, reply_by, processed, processed_at, ingested_at, \
             embed_model, triage_model FROM emails WHERE doc_id = $1",
        )
        .bind(doc_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let attachments_json: serde_json::Value = row.try_get("attachments")?;
        let attachments: Vec<String> = serde_json::from_value(attachments_json).unwrap_or_default();

        Ok(Some(EmailDetail {
            doc_id: row.try_get("doc_id")?,
            sender: row.try_get("sender")?,
            recipient: row.try_get("recipient")?,
            cc: row.try_get("cc")?,
            bcc: row.try_get("bcc")?,
            subject: row.try_get("subject")?,
            email_date: row.try_get("email_date")?,
            attachments,
            action_score: row.try_get("action_score")?,
            importance_score: row.try_get("importance_score")?,
            reply_by: row.try_get("reply_by")?,
            processed: row.try_get("processed")?,
            processed_at: row.try_get("processed_at")?,
            ingested_at: row.try_get("ingested_at")?,
            embed_model: row.try_get("embed_model")?,
            triage_model: row.try_get("triage_model")?,
        }))
    }

    /// Toggle `processed`; stamps `processed_at` when set to true, clears
    /// it when set to false.
    pub async fn set_processed(&self, doc_id: &str, processed: bool) -> Result<bool, VectorStoreError> {
        let result = if processed {
            sqlx::query(
                "UPDATE emails SET processed = true, processed_at = now() WHERE doc_id = $1",
            )
            .bind(doc_id)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                "UPDATE emails SET processed = false, processed_at = NULL WHERE doc_id = $1",
            )
            .bind(doc_id)
            .execute(&self.pool)
            .await?
        };
        Ok(result.rows_affected() > 0)
    }

    /// Builds the literal SQL text `knn_search` executes, for callers that
    /// want to surface it for debugging/audit (e.g. Phase 1's
    /// `retrieval_sql` response field) without re-running the query.
    pub fn build_knn_sql(filter: Option<&str>, score_expr: Option<&str>) -> String {
        let score_clause = match score_expr {
            Some(expr) => format!("({}) DESC", expr),
            None => "ec.embedding <=> $1::vector ASC".to_string(),
        };
        let where_clause = match filter {
            Some(f) => format!("WHERE ({})", f),
            None => String::new(),
        };

        // DISTINCT ON (e.doc_id) keeps only each email's best-matching chunk
        // before LIMIT is applied, so one email with many chunks can't crowd
        // out other emails in the top_k slots. The dedup subquery is aliased
        // back to `e` so a caller-supplied `score_expr` over `emails` columns
        // still resolves in the outer ORDER BY.
        format!(
            "SELECT e.doc_id, e.subject, e.sender, e.email_date, e.score FROM (\
             SELECT DISTINCT ON (e.doc_id) e.*, 1 - (ec.embedding <=> $1::vector) AS score \
             FROM emails e JOIN email_chunks ec ON ec.doc_id = e.doc_id \
             {} ORDER BY e.doc_id, {} \
             ) e ORDER BY {} LIMIT $2",
            where_clause, score_clause, score_clause
        )
    }

    /// kNN search. `filter` and `score_expr`, if supplied, MUST already
    /// have been validated by the SQL Fragment Validator — this method
    /// performs no validation of its own and will happily execute
    /// whatever SQL text it is handed.
    pub async fn knn_search(
        &self,
        embedding: &[f32],
        top_k: i64,
        filter: Option<&str>,
        score_expr: Option<&str>,
    ) -> Result<Vec<ScoredSource>, VectorStoreError> {
        let literal = vector_literal(embedding);
        let sql = Self::build_knn_sql(filter, score_expr);

        let rows = sqlx::query(&sql)
            .bind(literal)
            .bind(top_k)
            .fetch_all(&self.pool)
            .await?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            results.push(ScoredSource {
                doc_id: row.try_get("doc_id")?,
                score: row.try_get::<f64, _>("score")?,
                subject: row.try_get("subject")?,
                sender: row.try_get("sender")?,
                email_date: row.try_get("email_date")?,
            });
        }
        Ok(results)
    }

    pub async fn reset(&self) -> Result<(), VectorStoreError> {
        sqlx::query("TRUNCATE TABLE email_chunks, emails").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn counts(&self) -> Result<DatabaseCounts, VectorStoreError> {
        let email_count: i64 = sqlx::query_scalar("SELECT count(*) FROM emails")
            .fetch_one(&self.pool)
            .await?;
        let chunk_count: i64 = sqlx::query_scalar("SELECT count(*) FROM email_chunks")
            .fetch_one(&self.pool)
            .await?;
        let (oldest_ingested_at, newest_ingested_at): (
            Option<DateTime<Utc>>,
            Option<DateTime<Utc>>,
        ) = sqlx::query_as("SELECT min(ingested_at), max(ingested_at) FROM emails")
            .fetch_one(&self.pool)
            .await?;
        Ok(DatabaseCounts { email_count, chunk_count, oldest_ingested_at, newest_ingested_at })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DatabaseCounts {
    pub email_count: i64,
    pub chunk_count: i64,
    pub oldest_ingested_at: Option<DateTime<Utc>>,
    pub newest_ingested_at: Option<DateTime<Utc>>,
}
