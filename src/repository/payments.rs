use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{Payment, PaymentStatus};

const COLUMNS: &str = "id, invoice_id, method, status, amount, provider, reference, meta, \
     paid_at, virtual_account_number, virtual_account_expiry, created_at";

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<Payment>, AppError> {
    let payment = sqlx::query_as::<_, Payment>(&format!(
        "SELECT {COLUMNS} FROM payments WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(payment)
}

pub async fn find_by_reference(
    pool: &PgPool,
    reference: &str,
) -> Result<Option<Payment>, AppError> {
    let payment = sqlx::query_as::<_, Payment>(&format!(
        "SELECT {COLUMNS} FROM payments WHERE reference = $1 LIMIT 1"
    ))
    .bind(reference)
    .fetch_optional(pool)
    .await?;
    Ok(payment)
}

/// Gateway-initiated payments still awaiting a final provider verdict.
pub async fn awaiting_gateway_verdict(pool: &PgPool) -> Result<Vec<Uuid>, AppError> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM payments
         WHERE status IN ('pending', 'review') AND provider IS NOT NULL
         ORDER BY created_at
         LIMIT 500",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Apply the outcome of one gateway poll. `meta` replaces the whole opaque
/// blob; callers append to the poll history before passing it in.
pub async fn apply_sync_result<'e, E>(
    executor: E,
    id: Uuid,
    status: PaymentStatus,
    paid_at: Option<DateTime<Utc>>,
    va_number: Option<&str>,
    va_expiry: Option<DateTime<Utc>>,
    meta: &Value,
) -> Result<(), AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        "UPDATE payments
         SET status = $2,
             paid_at = COALESCE($3, paid_at),
             virtual_account_number = COALESCE($4, virtual_account_number),
             virtual_account_expiry = COALESCE($5, virtual_account_expiry),
             meta = $6
         WHERE id = $1",
    )
    .bind(id)
    .bind(status.as_str())
    .bind(paid_at)
    .bind(va_number)
    .bind(va_expiry)
    .bind(meta)
    .execute(executor)
    .await?;
    Ok(())
}

/// Cancel other still-open payments on an invoice once one completes, so a
/// tenant's abandoned checkout attempts stop being polled.
pub async fn void_open_for_invoice<'e, E>(
    executor: E,
    invoice_id: Uuid,
    except: Uuid,
    reason: &str,
) -> Result<u64, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        "UPDATE payments
         SET status = 'cancelled',
             meta = meta || jsonb_build_object('void_reason', $3::text, 'voided_at', now()::text)
         WHERE invoice_id = $1 AND id <> $2 AND status IN ('pending', 'review')",
    )
    .bind(invoice_id)
    .bind(except)
    .bind(reason)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

/// Sum of COMPLETED payment amounts for an invoice.
pub async fn completed_total_for_invoice<'e, E>(
    executor: E,
    invoice_id: Uuid,
) -> Result<i64, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    let (total,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(amount), 0)::bigint FROM payments
         WHERE invoice_id = $1 AND status = 'completed'",
    )
    .bind(invoice_id)
    .fetch_one(executor)
    .await?;
    Ok(total)
}
