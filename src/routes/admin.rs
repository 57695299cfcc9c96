//! Administrative and diagnostic endpoints (spec.md §6, SPEC_FULL §11.2).
//! No authentication guard: user auth is an explicit non-goal of this
//! service, which is meant to run behind a trusted internal boundary.

use crate::error::ApiError;
use crate::session::{SessionManager, SessionRecord};
use crate::vector_store::{EmailDetail, VectorStore};
use chrono::{DateTime, Utc};
use rocket::serde::json::Json;
use rocket::State;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct DocIdRequest {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub ok: bool,
    pub chunks_deleted: u64,
}

#[post("/admin/delete", data = "<body>")]
pub async fn delete_email(
    body: Json<DocIdRequest>,
    store: &State<VectorStore>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let chunks_deleted = store.delete_email(&body.id).await?;
    Ok(Json(DeleteResponse { ok: true, chunks_deleted }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

#[post("/admin/reset")]
pub async fn reset_index(store: &State<VectorStore>) -> Result<Json<StatusResponse>, ApiError> {
    store.reset().await?;
    Ok(Json(StatusResponse { status: "ok" }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[post("/admin/mark_processed", data = "<body>")]
pub async fn mark_processed(
    body: Json<DocIdRequest>,
    store: &State<VectorStore>,
) -> Result<Json<OkResponse>, ApiError> {
    let ok = store.set_processed(&body.id, true).await?;
    Ok(Json(OkResponse { ok }))
}

#[post("/admin/mark_unprocessed", data = "<body>")]
pub async fn mark_unprocessed(
    body: Json<DocIdRequest>,
    store: &State<VectorStore>,
) -> Result<Json<OkResponse>, ApiError> {
    let ok = store.set_processed(&body.id, false).await?;
    Ok(Json(OkResponse { ok }))
}

#[derive(Debug, Deserialize)]
pub struct IngestedStatusRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestedStatusResponse {
    pub ingested: Vec<String>,
    pub processed: Vec<String>,
}

#[post("/admin/ingested_status", data = "<body>")]
pub async fn ingested_status(
    body: Json<IngestedStatusRequest>,
    store: &State<VectorStore>,
) -> Result<Json<IngestedStatusResponse>, ApiError> {
    let (ingested, processed) = store.batch_ingested_status(&body.ids).await?;
    Ok(Json(IngestedStatusResponse { ingested, processed }))
}

/// Everything about an indexed email besides the identity/model fields that
/// sit at the top level of `IngestedDetailResponse` (spec.md §6).
#[derive(Debug, Serialize)]
pub struct IngestedDetailMetadata {
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
}

#[derive(Debug, Serialize)]
pub struct IngestedDetailResponse {
    pub doc_id: String,
    pub embed_model: String,
    pub triage_model: String,
    pub metadata: IngestedDetailMetadata,
}

impl From<EmailDetail> for IngestedDetailResponse {
    fn from(d: EmailDetail) -> Self {
        IngestedDetailResponse {
            doc_id: d.doc_id,
            embed_model: d.embed_model,
            triage_model: d.triage_model,
            metadata: IngestedDetailMetadata {
                sender: d.sender,
                recipient: d.recipient,
                cc: d.cc,
                bcc: d.bcc,
                subject: d.subject,
                email_date: d.email_date,
                attachments: d.attachments,
                action_score: d.action_score,
                importance_score: d.importance_score,
                reply_by: d.reply_by,
                processed: d.processed,
                processed_at: d.processed_at,
                ingested_at: d.ingested_at,
            },
        }
    }
}

#[post("/admin/ingested_detail", data = "<body>")]
pub async fn ingested_detail(
    body: Json<DocIdRequest>,
    store: &State<VectorStore>,
) -> Result<Json<IngestedDetailResponse>, ApiError> {
    store
        .get_detail(&body.id)
        .await?
        .map(|detail| Json(IngestedDetailResponse::from(detail)))
        .ok_or_else(|| ApiError::NotFound(format!("no email indexed for doc_id {}", body.id)))
}

#[derive(Debug, Deserialize)]
pub struct SessionIdRequest {
    pub session_id: String,
}

#[post("/admin/session/debug", data = "<body>")]
pub async fn session_debug(
    body: Json<SessionIdRequest>,
    sessions: &State<SessionManager>,
) -> Result<Json<SessionRecord>, ApiError> {
    let session = sessions
        .get(&body.session_id)
        .ok_or_else(|| ApiError::NotFound(format!("no session {}", body.session_id)))?;
    let record = session.lock().await.clone();
    Ok(Json(record))
}

#[post("/admin/session/reset", data = "<body>")]
pub async fn session_reset(
    body: Json<SessionIdRequest>,
    sessions: &State<SessionManager>,
) -> Json<StatusResponse> {
    sessions.reset(&body.session_id);
    Json(StatusResponse { status: "ok" })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseStatusResponse {
    pub email_count: i64,
    pub chunk_count: i64,
    pub oldest_ingested_at: Option<DateTime<Utc>>,
    pub newest_ingested_at: Option<DateTime<Utc>>,
}

#[get("/admin/database/status")]
pub async fn database_status(
    store: &State<VectorStore>,
) -> Result<Json<DatabaseStatusResponse>, ApiError> {
    let counts = store.counts().await?;
    Ok(Json(DatabaseStatusResponse {
        email_count: counts.email_count,
        chunk_count: counts.chunk_count,
        oldest_ingested_at: counts.oldest_ingested_at,
        newest_ingested_at: counts.newest_ingested_at,
    }))
}
