use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{HandoverKind, HandoverStatus, RoomHandover};

const COLUMNS: &str = "id, contract_id, kind, status, notes, recorded_at, resolved_at";

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<RoomHandover>, AppError> {
    let handover = sqlx::query_as::<_, RoomHandover>(&format!(
        "SELECT {COLUMNS} FROM room_handovers WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(handover)
}

pub async fn insert<'e, E>(
    executor: E,
    contract_id: Uuid,
    kind: HandoverKind,
    status: HandoverStatus,
    notes: Option<&str>,
) -> Result<RoomHandover, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    let handover = sqlx::query_as::<_, RoomHandover>(&format!(
        "INSERT INTO room_handovers (id, contract_id, kind, status, notes, recorded_at)
         VALUES ($1, $2, $3, $4, $5, now())
         RETURNING {COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(contract_id)
    .bind(kind.as_str())
    .bind(status.as_str())
    .bind(notes)
    .fetch_one(executor)
    .await?;
    Ok(handover)
}

pub async fn set_status<'e, E>(
    executor: E,
    id: Uuid,
    status: HandoverStatus,
    resolved_at: Option<DateTime<Utc>>,
) -> Result<(), AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query("UPDATE room_handovers SET status = $2, resolved_at = $3 WHERE id = $1")
        .bind(id)
        .bind(status.as_str())
        .bind(resolved_at)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn latest_for_contract(
    pool: &PgPool,
    contract_id: Uuid,
    kind: HandoverKind,
) -> Result<Option<RoomHandover>, AppError> {
    let handover = sqlx::query_as::<_, RoomHandover>(&format!(
        "SELECT {COLUMNS} FROM room_handovers
         WHERE contract_id = $1 AND kind = $2
         ORDER BY recorded_at DESC
         LIMIT 1"
    ))
    .bind(contract_id)
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(handover)
}
