//! `POST /ingest`: accept a raw RFC822 message and run it through the
//! ingestion pipeline (spec.md §4.7).

use crate::config::RagConfig;
use crate::error::ApiError;
use crate::ingest;
use crate::model_gateway::ModelGateway;
use crate::vector_store::VectorStore;
use rocket::data::{Data, ToByteUnit};
use rocket::request::{FromRequest, Outcome};
use rocket::serde::json::Json;
use rocket::{Request, State};
use serde::{Deserialize, Serialize};

const MAX_MESSAGE_BYTES: u64 = 25 * 1024 * 1024;

/// The `X-Thunderbird-Message-Id` header, used as a `doc_id` fallback when
/// the message itself carries no `Message-Id`.
pub struct ThunderbirdMessageId(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ThunderbirdMessageId {
    type Error = std::convert::Infallible;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(ThunderbirdMessageId(
            request
                .headers()
                .get_one("X-Thunderbird-Message-Id")
                .map(|s| s.to_string()),
        ))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub ok: bool,
    pub doc_id: String,
    pub chunks_indexed: usize,
}

#[post("/ingest", data = "<body>")]
pub async fn ingest(
    body: Data<'_>,
    message_id: ThunderbirdMessageId,
    gateway: &State<ModelGateway>,
    store: &State<VectorStore>,
    config: &State<RagConfig>,
) -> Result<Json<IngestResponse>, ApiError> {
    let raw = body
        .open(MAX_MESSAGE_BYTES.bytes())
        .into_bytes()
        .await
        .map_err(|err| ApiError::BadRequest(format!("failed to read request body: {err}")))?;

    if !raw.is_complete() {
        return Err(ApiError::BadRequest(format!(
            "message body exceeds the {MAX_MESSAGE_BYTES} byte limit"
        )));
    }

    let outcome = ingest::ingest_message(
        gateway,
        store,
        config,
        raw.value.as_slice(),
        message_id.0.as_deref(),
    )
    .await?;

    Ok(Json(IngestResponse {
        ok: true,
        doc_id: outcome.doc_id,
        chunks_indexed: outcome.chunks_indexed,
    }))
}
