use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::repository::payments;
use crate::services::jobs::{self, JobKind};
use crate::services::midtrans;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/webhooks/midtrans", post(midtrans_notification))
}

/// Midtrans HTTP notification. The notification is treated as a hint only:
/// after signature verification it enqueues a gateway poll, and the poll
/// result is what mutates payment state. Unknown references are logged and
/// acknowledged so the gateway stops retrying them.
async fn midtrans_notification(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> AppResult<impl IntoResponse> {
    let pool = state.pool()?;

    let order_id = field(&payload, "order_id");
    let status_code = field(&payload, "status_code");
    let gross_amount = field(&payload, "gross_amount");
    let signature_key = field(&payload, "signature_key");

    let Some(server_key) = state.config.midtrans_server_key.as_deref() else {
        return Err(AppError::Dependency(
            "MIDTRANS_SERVER_KEY is not configured".to_string(),
        ));
    };

    if !midtrans::verify_signature(order_id, status_code, gross_amount, server_key, signature_key)
    {
        tracing::warn!(order_id, "Midtrans notification with invalid signature rejected");
        return Err(AppError::Unauthorized(
            "invalid notification signature".to_string(),
        ));
    }

    let payment = match payments::find_by_reference(pool, order_id).await? {
        Some(payment) => Some(payment),
        None => match parse_synthesized_order_id(order_id) {
            Some(payment_id) => payments::get(pool, payment_id).await?,
            None => None,
        },
    };

    let Some(payment) = payment else {
        tracing::warn!(
            order_id,
            transaction_status = payload.get("transaction_status").and_then(serde_json::Value::as_str),
            "Midtrans notification for unknown payment; acknowledged without action"
        );
        return Ok(Json(json!({ "status": "ignored" })));
    };

    let key = jobs::sync_dedupe_key(payment.id, Utc::now());
    let enqueued = jobs::enqueue(
        pool,
        JobKind::SyncPayment,
        jobs::payment_payload(payment.id),
        Some(&key),
        Utc::now(),
    )
    .await?;

    tracing::info!(
        order_id,
        payment_id = %payment.id,
        enqueued,
        "Midtrans notification accepted; sync queued"
    );

    Ok(Json(json!({ "status": "ok" })))
}

fn field<'a>(payload: &'a Value, key: &str) -> &'a str {
    payload.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn parse_synthesized_order_id(order_id: &str) -> Option<Uuid> {
    order_id
        .strip_prefix("PAY-")
        .and_then(|raw| Uuid::parse_str(raw).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_synthesized_order_ids_only() {
        let id = Uuid::new_v4();
        assert_eq!(parse_synthesized_order_id(&format!("PAY-{id}")), Some(id));
        assert_eq!(parse_synthesized_order_id("ORDER-123"), None);
        assert_eq!(parse_synthesized_order_id("PAY-not-a-uuid"), None);
    }
}
