//! The three-phase query protocol (spec.md §6): `POST /query` resolves and
//! retrieves, `POST /query/evidence` collects the raw messages the client
//! already has locally, `POST /query/complete` assembles the prompt and
//! returns the chat answer.

use crate::config::RagConfig;
use crate::error::ApiError;
use crate::model_gateway::ModelGateway;
use crate::orchestrator::{QueryMode, QueryOrchestrator, RetrievedSource};
use crate::session::SessionManager;
use crate::vector_store::VectorStore;
use rocket::data::{Data, ToByteUnit};
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome};
use rocket::serde::json::Json;
use rocket::{Request, State};
use serde::{Deserialize, Serialize};

const MAX_EVIDENCE_BYTES: u64 = 25 * 1024 * 1024;
const DEFAULT_TOP_K: i64 = 8;

pub struct RequestIdHeader(pub String);
pub struct MessageIdHeader(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RequestIdHeader {
    type Error = ApiError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match request.headers().get_one("X-RAG-Request-Id") {
            Some(value) if !value.trim().is_empty() => {
                Outcome::Success(RequestIdHeader(value.to_string()))
            }
            _ => Outcome::Error((
                Status::BadRequest,
                ApiError::BadRequest("missing X-RAG-Request-Id header".to_string()),
            )),
        }
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for MessageIdHeader {
    type Error = ApiError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match request.headers().get_one("X-Thunderbird-Message-Id") {
            Some(value) if !value.trim().is_empty() => {
                Outcome::Success(MessageIdHeader(value.to_string()))
            }
            _ => Outcome::Error((
                Status::BadRequest,
                ApiError::BadRequest("missing X-Thunderbird-Message-Id header".to_string()),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StartQueryRequest {
    pub session_id: String,
    pub question: String,
    #[serde(default)]
    pub top_k: Option<i64>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub chat_model: Option<String>,
    /// Validator-checked `WHERE` predicate, e.g. `"e.processed = false"`.
    #[serde(default)]
    pub filter: Option<String>,
    /// Validator-checked `ORDER BY` expression replacing the default
    /// cosine-distance ranking.
    #[serde(default)]
    pub score_expr: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartQueryResponse {
    pub request_id: String,
    pub status: &'static str,
    pub message_ids: Vec<String>,
    pub sources: Vec<RetrievedSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval_sql: Option<String>,
}

#[post("/query", data = "<body>")]
pub async fn start_query(
    body: Json<StartQueryRequest>,
    sessions: &State<SessionManager>,
    orchestrator: &State<QueryOrchestrator>,
    gateway: &State<ModelGateway>,
    store: &State<VectorStore>,
    config: &State<RagConfig>,
) -> Result<Json<StartQueryResponse>, ApiError> {
    let top_k = body.top_k.unwrap_or(DEFAULT_TOP_K);
    let mode = QueryMode::parse(body.mode.as_deref().or(Some(&config.default_mode)));

    let outcome = orchestrator
        .start_query(
            sessions,
            gateway,
            store,
            config,
            &body.session_id,
            &body.question,
            top_k,
            mode,
            body.user_name.as_deref(),
            body.chat_model.clone(),
            body.filter.as_deref(),
            body.score_expr.as_deref(),
        )
        .await?;

    Ok(Json(StartQueryResponse {
        request_id: outcome.request_id,
        status: outcome.status,
        message_ids: outcome.message_ids,
        sources: outcome.sources,
        retrieval_sql: outcome.retrieval_sql,
    }))
}

#[derive(Debug, Serialize)]
pub struct EvidenceResponse {
    pub ok: bool,
}

#[post("/query/evidence", data = "<body>")]
pub async fn submit_evidence(
    body: Data<'_>,
    request_id: RequestIdHeader,
    message_id: MessageIdHeader,
    orchestrator: &State<QueryOrchestrator>,
) -> Result<Json<EvidenceResponse>, ApiError> {
    let raw = body
        .open(MAX_EVIDENCE_BYTES.bytes())
        .into_bytes()
        .await
        .map_err(|err| ApiError::BadRequest(format!("failed to read request body: {err}")))?;

    if !raw.is_complete() {
        return Err(ApiError::BadRequest(format!(
            "evidence body exceeds the {MAX_EVIDENCE_BYTES} byte limit"
        )));
    }

    orchestrator
        .submit_evidence(&request_id.0, &message_id.0, raw.value)
        .await?;

    Ok(Json(EvidenceResponse { ok: true }))
}

#[derive(Debug, Deserialize)]
pub struct CompleteQueryRequest {
    pub request_id: String,
    pub session_id: String,
    #[serde(default)]
    pub chat_model: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompleteQueryResponse {
    pub answer: String,
    pub sources: Vec<RetrievedSource>,
}

#[post("/query/complete", data = "<body>")]
pub async fn complete_query(
    body: Json<CompleteQueryRequest>,
    sessions: &State<SessionManager>,
    orchestrator: &State<QueryOrchestrator>,
    gateway: &State<ModelGateway>,
    store: &State<VectorStore>,
    config: &State<RagConfig>,
) -> Result<Json<CompleteQueryResponse>, ApiError> {
    let outcome = orchestrator
        .complete(
            sessions,
            gateway,
            store,
            config,
            &body.request_id,
            &body.session_id,
            body.chat_model.as_deref(),
        )
        .await?;

    Ok(Json(CompleteQueryResponse { answer: outcome.answer, sources: outcome.sources }))
}
