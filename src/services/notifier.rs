use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

/// Queue an in-app notification for a user. Best-effort: failures are logged
/// and swallowed; a notification must never abort a financial transition.
pub async fn notify_user(
    pool: &PgPool,
    user_id: Uuid,
    title: &str,
    message: &str,
    action_url: Option<&str>,
    meta: Value,
) {
    let result = sqlx::query(
        "INSERT INTO user_notifications (id, user_id, title, message, action_url, meta, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, now())",
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(title)
    .bind(message)
    .bind(action_url)
    .bind(&meta)
    .execute(pool)
    .await;

    if let Err(e) = result {
        tracing::warn!(user_id = %user_id, title, error = %e, "failed to queue notification");
    }
}
