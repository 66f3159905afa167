use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::services::jobs::{self, JobKind};
use crate::services::rate_limit::PgFixedWindowLimiter;
use crate::services::state_machine::Applied;
use crate::services::{handover, scheduler};
use crate::state::AppState;

/// Operational endpoints for the portal backend and ops tooling. Everything
/// here is guarded by the shared internal key; tenant-facing traffic never
/// reaches these paths.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/internal/sweeps/daily", post(run_daily_sweeps))
        .route("/internal/sweeps/payments", post(run_payment_sweep))
        .route("/internal/jobs/process", post(process_jobs))
        .route("/internal/contracts/{id}/checkin", post(record_checkin))
        .route("/internal/contracts/{id}/checkout", post(record_checkout))
        .route(
            "/internal/handovers/{id}/acknowledge",
            post(acknowledge_handover),
        )
        .route("/internal/handovers/{id}/dispute", post(dispute_handover))
        .route("/internal/payments/{id}/sync", post(queue_payment_sync))
}

async fn run_daily_sweeps(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    authorize(&state, &headers)?;
    let pool = state.pool()?;
    let enqueued = scheduler::enqueue_daily_sweeps(pool, &state.config).await?;
    Ok(Json(json!({ "enqueued": enqueued })))
}

async fn run_payment_sweep(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    authorize(&state, &headers)?;
    let pool = state.pool()?;
    let enqueued = scheduler::enqueue_payment_sweep(pool).await?;
    Ok(Json(json!({ "enqueued": enqueued })))
}

async fn process_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    authorize(&state, &headers)?;
    let pool = state.pool()?;
    let limiter = PgFixedWindowLimiter::new(pool.clone());
    let summary = jobs::process_pending(&state, &limiter, 50).await?;
    Ok(Json(serde_json::to_value(summary).unwrap_or_default()))
}

#[derive(Debug, Deserialize, Default)]
struct HandoverBody {
    notes: Option<String>,
    reason: Option<String>,
}

async fn record_checkin(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(contract_id): Path<Uuid>,
    body: Option<Json<HandoverBody>>,
) -> AppResult<impl IntoResponse> {
    authorize(&state, &headers)?;
    let pool = state.pool()?;
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let handover = handover::record_checkin(
        pool,
        contract_id,
        body.notes.as_deref(),
        &state.config.billing(),
    )
    .await?;
    Ok(Json(serde_json::to_value(&handover).unwrap_or_default()))
}

async fn record_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(contract_id): Path<Uuid>,
    body: Option<Json<HandoverBody>>,
) -> AppResult<impl IntoResponse> {
    authorize(&state, &headers)?;
    let pool = state.pool()?;
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let handover = handover::record_checkout(
        pool,
        contract_id,
        body.notes.as_deref(),
        &state.config.billing(),
    )
    .await?;
    Ok(Json(serde_json::to_value(&handover).unwrap_or_default()))
}

async fn acknowledge_handover(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(handover_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    authorize(&state, &headers)?;
    let pool = state.pool()?;
    let applied = handover::acknowledge(pool, handover_id, &state.config.billing()).await?;
    Ok(Json(applied_json(applied)))
}

async fn dispute_handover(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(handover_id): Path<Uuid>,
    body: Option<Json<HandoverBody>>,
) -> AppResult<impl IntoResponse> {
    authorize(&state, &headers)?;
    let pool = state.pool()?;
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let applied = handover::dispute(
        pool,
        handover_id,
        body.reason.as_deref(),
        &state.config.billing(),
    )
    .await?;
    Ok(Json(applied_json(applied)))
}

async fn queue_payment_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(payment_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    authorize(&state, &headers)?;
    let pool = state.pool()?;
    let key = jobs::sync_dedupe_key(payment_id, Utc::now());
    let enqueued = jobs::enqueue(
        pool,
        JobKind::SyncPayment,
        jobs::payment_payload(payment_id),
        Some(&key),
        Utc::now(),
    )
    .await?;
    Ok(Json(json!({ "enqueued": enqueued })))
}

fn applied_json(applied: Applied) -> Value {
    match applied {
        Applied::Transitioned { from, to } => json!({
            "transitioned": true,
            "from": from.as_str(),
            "to": to.as_str(),
        }),
        Applied::Skipped => json!({ "transitioned": false }),
    }
}

fn authorize(state: &AppState, headers: &HeaderMap) -> AppResult<()> {
    let provided = headers
        .get("x-internal-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    validate_internal_api_key(
        state.config.is_production(),
        state.config.internal_api_key.as_deref(),
        provided,
    )
}

fn validate_internal_api_key(
    is_production: bool,
    expected_key: Option<&str>,
    provided_key: &str,
) -> AppResult<()> {
    let expected = expected_key.map(str::trim).unwrap_or_default();

    if is_production && expected.is_empty() {
        return Err(AppError::Dependency(
            "INTERNAL_API_KEY must be set in production".to_string(),
        ));
    }

    if !expected.is_empty() && provided_key != expected {
        return Err(AppError::Unauthorized(
            "Invalid or missing API key.".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::validate_internal_api_key;

    #[test]
    fn production_requires_a_configured_key() {
        assert!(validate_internal_api_key(true, None, "anything").is_err());
        assert!(validate_internal_api_key(true, Some("  "), "anything").is_err());
        assert!(validate_internal_api_key(true, Some("secret"), "secret").is_ok());
        assert!(validate_internal_api_key(true, Some("secret"), "wrong").is_err());
    }

    #[test]
    fn development_without_a_key_is_open() {
        assert!(validate_internal_api_key(false, None, "").is_ok());
        assert!(validate_internal_api_key(false, Some("secret"), "wrong").is_err());
    }
}
