use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{Invoice, InvoiceStatus};

const COLUMNS: &str = "id, contract_id, number, period_start, period_end, due_date, \
     amount, status, line_items, issued_at, paid_at";

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<Invoice>, AppError> {
    let invoice = sqlx::query_as::<_, Invoice>(&format!(
        "SELECT {COLUMNS} FROM invoices WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(invoice)
}

/// All non-cancelled invoices of a contract, ordered by period. This is the
/// input to the duplicate-period guard, so cancelled invoices never block
/// regeneration of a period.
pub async fn list_non_cancelled(
    pool: &PgPool,
    contract_id: Uuid,
) -> Result<Vec<Invoice>, AppError> {
    let rows = sqlx::query_as::<_, Invoice>(&format!(
        "SELECT {COLUMNS} FROM invoices
         WHERE contract_id = $1 AND status <> 'cancelled'
         ORDER BY period_start"
    ))
    .bind(contract_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub struct NewInvoice {
    pub contract_id: Uuid,
    pub number: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub due_date: NaiveDate,
    pub amount: i64,
    pub line_items: Value,
}

pub async fn insert<'e, E>(executor: E, new: &NewInvoice) -> Result<Invoice, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    let invoice = sqlx::query_as::<_, Invoice>(&format!(
        "INSERT INTO invoices (
            id, contract_id, number, period_start, period_end, due_date,
            amount, status, line_items, issued_at
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, now())
         RETURNING {COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(new.contract_id)
    .bind(&new.number)
    .bind(new.period_start)
    .bind(new.period_end)
    .bind(new.due_date)
    .bind(new.amount)
    .bind(&new.line_items)
    .fetch_one(executor)
    .await?;
    Ok(invoice)
}

pub async fn set_status<'e, E>(
    executor: E,
    id: Uuid,
    status: InvoiceStatus,
    paid_at: Option<DateTime<Utc>>,
) -> Result<(), AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    let status_str = match status {
        InvoiceStatus::Pending => "pending",
        InvoiceStatus::Overdue => "overdue",
        InvoiceStatus::Paid => "paid",
        InvoiceStatus::Cancelled => "cancelled",
    };
    sqlx::query("UPDATE invoices SET status = $2, paid_at = $3 WHERE id = $1")
        .bind(id)
        .bind(status_str)
        .bind(paid_at)
        .execute(executor)
        .await?;
    Ok(())
}

/// Flip a contract's pending invoices past their due date to overdue.
pub async fn mark_overdue_due_before<'e, E>(
    executor: E,
    contract_id: Uuid,
    today: NaiveDate,
) -> Result<u64, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        "UPDATE invoices SET status = 'overdue'
         WHERE contract_id = $1 AND status = 'pending' AND due_date < $2",
    )
    .bind(contract_id)
    .bind(today)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

/// Cancel still-open invoices of a contract (used when the contract itself
/// is cancelled before activation).
pub async fn cancel_open_for_contract<'e, E>(
    executor: E,
    contract_id: Uuid,
) -> Result<u64, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        "UPDATE invoices SET status = 'cancelled'
         WHERE contract_id = $1 AND status IN ('pending', 'overdue')",
    )
    .bind(contract_id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

pub async fn has_pending_due_before(
    pool: &PgPool,
    contract_id: Uuid,
    today: NaiveDate,
) -> Result<bool, AppError> {
    let exists: Option<(i64,)> = sqlx::query_as(
        "SELECT 1 FROM invoices
         WHERE contract_id = $1 AND status = 'pending' AND due_date < $2
         LIMIT 1",
    )
    .bind(contract_id)
    .bind(today)
    .fetch_optional(pool)
    .await?;
    Ok(exists.is_some())
}

/// Total amount of still-open (pending/overdue) invoices for a contract.
pub async fn open_amount_total(pool: &PgPool, contract_id: Uuid) -> Result<i64, AppError> {
    let (total,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(amount), 0)::bigint FROM invoices
         WHERE contract_id = $1 AND status IN ('pending', 'overdue')",
    )
    .bind(contract_id)
    .fetch_one(pool)
    .await?;
    Ok(total)
}

/// Whether the contract still carries unpaid arrears: any overdue invoice,
/// or any pending invoice already past due.
pub async fn arrears_exist(
    pool: &PgPool,
    contract_id: Uuid,
    today: NaiveDate,
) -> Result<bool, AppError> {
    let exists: Option<(i64,)> = sqlx::query_as(
        "SELECT 1 FROM invoices
         WHERE contract_id = $1
           AND (status = 'overdue' OR (status = 'pending' AND due_date < $2))
         LIMIT 1",
    )
    .bind(contract_id)
    .bind(today)
    .fetch_optional(pool)
    .await?;
    Ok(exists.is_some())
}
