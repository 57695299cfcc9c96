//! Lightweight service health endpoint used for readiness checks and tests.

use rocket::serde::json::Json;
use rocket_db_pools::{Connection, sqlx};
use serde::Serialize;

use crate::db::RagDb;
use crate::error::ApiError;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[get("/health/live")]
pub fn live_health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok".to_string() })
}

#[get("/health/ready")]
pub async fn ready_health(mut db: Connection<RagDb>) -> Result<Json<HealthResponse>, ApiError> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&mut **db)
        .await
        .map_err(|err| ApiError::InternalError(format!("readiness check failed: {err}")))?;

    Ok(Json(HealthResponse { status: "ok".to_string() }))
}
