//! A single `ApiError` enum implementing Rocket's `Responder`, rendering an
//! RFC 7807-style `ProblemDetails` JSON body (spec.md §7).

use crate::model_gateway::ModelGatewayError;
use crate::sql_validator::SqlValidationError;
use chrono::Utc;
use rocket::http::Status;
use rocket::response::{self, Responder};
use rocket::{Request, Response};
use serde::Serialize;
use std::io::Cursor;

#[derive(Debug)]
pub enum ApiError {
    DatabaseError(sqlx::Error),
    NotFound(String),
    BadRequest(String),
    /// Phase 3 completeness check failed; carries the still-missing ids.
    MissingEvidence(Vec<String>),
    /// Embed/chat provider or vector store op failed upstream.
    UpstreamFailure(String),
    Timeout(String),
    /// SQL Fragment Validator rejected a filter/score expression.
    ValidationRejected(String),
    InternalError(String),
}

/// RFC 7807-style problem details payload.
#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<Vec<String>>,
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        let mut missing = None;
        let (status, title, detail, problem_type) = match self {
            ApiError::DatabaseError(e) => {
                log::error!("database error: {}", e);
                (
                    Status::InternalServerError,
                    "Internal Server Error",
                    "An internal database error occurred".to_string(),
                    "https://docs.nexus-rag/errors/internal",
                )
            }
            ApiError::NotFound(msg) => {
                log::debug!("not found: {}", msg);
                (
                    Status::NotFound,
                    "Resource Not Found",
                    msg,
                    "https://docs.nexus-rag/errors/not-found",
                )
            }
            ApiError::BadRequest(msg) => {
                log::debug!("bad request: {}", msg);
                (
                    Status::BadRequest,
                    "Bad Request",
                    msg,
                    "https://docs.nexus-rag/errors/bad-request",
                )
            }
            ApiError::MissingEvidence(ids) => {
                log::debug!("missing evidence for {} message(s)", ids.len());
                missing = Some(ids);
                (
                    Status::BadRequest,
                    "Missing Evidence",
                    "evidence has not been uploaded for every expected message".to_string(),
                    "https://docs.nexus-rag/errors/missing-evidence",
                )
            }
            ApiError::UpstreamFailure(detail) => {
                log::error!("upstream failure: {}", detail);
                (
                    Status::BadGateway,
                    "Upstream Failure",
                    detail,
                    "https://docs.nexus-rag/errors/upstream",
                )
            }
            ApiError::Timeout(detail) => {
                log::warn!("upstream timeout: {}", detail);
                (
                    Status::GatewayTimeout,
                    "Upstream Timeout",
                    detail,
                    "https://docs.nexus-rag/errors/timeout",
                )
            }
            ApiError::ValidationRejected(reason) => {
                log::warn!("SQL fragment rejected: {}", reason);
                (
                    Status::BadRequest,
                    "Validation Rejected",
                    reason,
                    "https://docs.nexus-rag/errors/validation-rejected",
                )
            }
            ApiError::InternalError(msg) => {
                log::error!("internal error: {}", msg);
                (
                    Status::InternalServerError,
                    "Internal Server Error",
                    "An internal server error occurred".to_string(),
                    "https://docs.nexus-rag/errors/internal",
                )
            }
        };

        let body = ProblemDetails {
            problem_type: problem_type.to_string(),
            title: title.to_string(),
            status: status.code,
            detail,
            instance: None,
            timestamp: Some(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
            missing,
        };

        let json = serde_json::to_string(&body).unwrap_or_else(|_| {
            r#"{"type":"about:blank","title":"Internal Server Error","status":500,"detail":"Failed to serialize error"}"#
                .to_string()
        });

        Response::build()
            .status(status)
            .header(rocket::http::ContentType::JSON)
            .sized_body(json.len(), Cursor::new(json))
            .ok()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound("resource not found".to_string()),
            other => ApiError::DatabaseError(other),
        }
    }
}

impl From<crate::vector_store::VectorStoreError> for ApiError {
    fn from(err: crate::vector_store::VectorStoreError) -> Self {
        let crate::vector_store::VectorStoreError::Database(sqlx_err) = err;
        ApiError::from(sqlx_err)
    }
}

impl From<ModelGatewayError> for ApiError {
    fn from(err: ModelGatewayError) -> Self {
        match err {
            ModelGatewayError::Timeout(duration) => {
                ApiError::Timeout(format!("model gateway timed out after {:?}", duration))
            }
            other => ApiError::UpstreamFailure(format!("model gateway: {other}")),
        }
    }
}

impl From<SqlValidationError> for ApiError {
    fn from(err: SqlValidationError) -> Self {
        ApiError::ValidationRejected(err.to_string())
    }
}

impl From<crate::mime_parser::MimeParseError> for ApiError {
    fn from(err: crate::mime_parser::MimeParseError) -> Self {
        ApiError::BadRequest(format!("malformed message: {err}"))
    }
}

impl From<crate::ingest::IngestError> for ApiError {
    fn from(err: crate::ingest::IngestError) -> Self {
        match err {
            crate::ingest::IngestError::Parse(e) => ApiError::from(e),
            crate::ingest::IngestError::ModelGateway(e) => ApiError::from(e),
            crate::ingest::IngestError::VectorStore(e) => ApiError::from(e),
        }
    }
}

impl From<crate::orchestrator::OrchestratorError> for ApiError {
    fn from(err: crate::orchestrator::OrchestratorError) -> Self {
        use crate::orchestrator::OrchestratorError;
        match err {
            OrchestratorError::BadRequest(msg) => ApiError::BadRequest(msg),
            OrchestratorError::UnknownRequest(id) => {
                ApiError::NotFound(format!("unknown request_id {id}"))
            }
            OrchestratorError::SessionMismatch(id) => {
                ApiError::BadRequest(format!("session_id does not match request {id}"))
            }
            OrchestratorError::MissingEvidence(ids) => ApiError::MissingEvidence(ids),
            OrchestratorError::ModelGateway(e) => ApiError::from(e),
            OrchestratorError::VectorStore(e) => ApiError::from(e),
            OrchestratorError::Validation(e) => ApiError::from(e),
        }
    }
}
