use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

/// Append a structured audit event. Best-effort: a failed insert is logged
/// and swallowed so it can never roll back or block a financial transition.
pub async fn write_audit_log(
    pool: &PgPool,
    entity_type: &str,
    entity_id: Uuid,
    action: &str,
    reason: &str,
    meta: Value,
) {
    let result = sqlx::query(
        "INSERT INTO audit_logs (id, entity_type, entity_id, action, reason, meta, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, now())",
    )
    .bind(Uuid::new_v4())
    .bind(entity_type)
    .bind(entity_id)
    .bind(action)
    .bind(reason)
    .bind(&meta)
    .execute(pool)
    .await;

    if let Err(e) = result {
        tracing::warn!(
            entity_type,
            entity_id = %entity_id,
            action,
            error = %e,
            "failed to write audit log"
        );
    }
}
