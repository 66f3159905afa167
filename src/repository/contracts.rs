use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{Contract, ContractStatus, NewContract};

const COLUMNS: &str = "id, tenant_id, room_id, status, billing_period, duration_count, \
     start_date, end_date, rent_amount, deposit_amount, auto_renew, paid_in_full_at, \
     notes, created_at, updated_at";

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<Contract>, AppError> {
    let contract = sqlx::query_as::<_, Contract>(&format!(
        "SELECT {COLUMNS} FROM contracts WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(contract)
}

pub async fn set_status<'e, E>(
    executor: E,
    id: Uuid,
    status: ContractStatus,
) -> Result<(), AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query("UPDATE contracts SET status = $2, updated_at = now() WHERE id = $1")
        .bind(id)
        .bind(status.as_str())
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn insert<'e, E>(executor: E, new: &NewContract) -> Result<Contract, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    let contract = sqlx::query_as::<_, Contract>(&format!(
        "INSERT INTO contracts (
            id, tenant_id, room_id, status, billing_period, duration_count,
            start_date, end_date, rent_amount, deposit_amount, auto_renew, notes
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
         RETURNING {COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(new.tenant_id)
    .bind(new.room_id)
    .bind(new.status.as_str())
    .bind(new.billing_period.as_str())
    .bind(new.duration_count)
    .bind(new.start_date)
    .bind(new.end_date)
    .bind(new.rent_amount)
    .bind(new.deposit_amount)
    .bind(new.auto_renew)
    .bind(new.notes.as_deref())
    .fetch_one(executor)
    .await?;
    Ok(contract)
}

/// Contracts for the same (tenant, room) starting on/after `from`, in any
/// state that blocks creating another successor.
pub async fn future_for_room(
    pool: &PgPool,
    tenant_id: Uuid,
    room_id: Uuid,
    from: NaiveDate,
) -> Result<Vec<Contract>, AppError> {
    let rows = sqlx::query_as::<_, Contract>(&format!(
        "SELECT {COLUMNS} FROM contracts
         WHERE tenant_id = $1 AND room_id = $2
           AND status IN ('pending_payment', 'booked', 'active')
           AND start_date >= $3
         ORDER BY start_date"
    ))
    .bind(tenant_id)
    .bind(room_id)
    .bind(from)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Whether any successor contract exists that starts after `after`.
/// Used by the completion path to decide if the room should be freed.
pub async fn successor_exists(
    pool: &PgPool,
    tenant_id: Uuid,
    room_id: Uuid,
    after: NaiveDate,
) -> Result<bool, AppError> {
    let exists: Option<(i64,)> = sqlx::query_as(
        "SELECT 1 FROM contracts
         WHERE tenant_id = $1 AND room_id = $2
           AND status IN ('pending_payment', 'booked', 'active')
           AND start_date > $3
         LIMIT 1",
    )
    .bind(tenant_id)
    .bind(room_id)
    .bind(after)
    .fetch_optional(pool)
    .await?;
    Ok(exists.is_some())
}

pub async fn due_for_activation(pool: &PgPool, today: NaiveDate) -> Result<Vec<Uuid>, AppError> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM contracts
         WHERE status IN ('pending_payment', 'booked') AND start_date <= $1
         ORDER BY start_date
         LIMIT 500",
    )
    .bind(today)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Unactivated contracts created before `cutoff` (booking grace expired).
pub async fn stale_unpaid(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Uuid>, AppError> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM contracts
         WHERE status IN ('pending_payment', 'booked') AND created_at <= $1
         ORDER BY created_at
         LIMIT 500",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Active contracts carrying at least one pending invoice past its due date.
pub async fn with_past_due_invoices(
    pool: &PgPool,
    today: NaiveDate,
) -> Result<Vec<Uuid>, AppError> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT DISTINCT c.id FROM contracts c
         JOIN invoices i ON i.contract_id = c.id
         WHERE c.status = 'active' AND i.status = 'pending' AND i.due_date < $1
         LIMIT 500",
    )
    .bind(today)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Active contracts whose term has ended, with their auto_renew flag.
pub async fn ended(pool: &PgPool, today: NaiveDate) -> Result<Vec<(Uuid, bool)>, AppError> {
    let rows: Vec<(Uuid, bool)> = sqlx::query_as(
        "SELECT id, auto_renew FROM contracts
         WHERE status = 'active' AND end_date < $1
         ORDER BY end_date
         LIMIT 500",
    )
    .bind(today)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Monthly contracts that still accrue periodic invoices.
pub async fn monthly_billable(pool: &PgPool) -> Result<Vec<Uuid>, AppError> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM contracts
         WHERE status IN ('active', 'overdue') AND billing_period = 'monthly'
         ORDER BY start_date
         LIMIT 1000",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}
