use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Value};
use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;

use crate::dates::parse_year_month;
use crate::error::AppError;
use crate::services::payment_sync::SyncOutcome;
use crate::services::rate_limit::SharedRateLimiter;
use crate::services::state_machine::LifecycleEvent;
use crate::services::{invoice_generator, payment_sync, renewal, state_machine};
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Activate,
    MarkOverdue,
    CancelOverdue,
    CompleteEnded,
    GenerateMonthlyInvoices,
    AutoRenew,
    SyncPayment,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Activate => "activate",
            Self::MarkOverdue => "mark_overdue",
            Self::CancelOverdue => "cancel_overdue",
            Self::CompleteEnded => "complete_ended",
            Self::GenerateMonthlyInvoices => "generate_monthly_invoices",
            Self::AutoRenew => "auto_renew",
            Self::SyncPayment => "sync_payment",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "activate" => Some(Self::Activate),
            "mark_overdue" => Some(Self::MarkOverdue),
            "cancel_overdue" => Some(Self::CancelOverdue),
            "complete_ended" => Some(Self::CompleteEnded),
            "generate_monthly_invoices" => Some(Self::GenerateMonthlyInvoices),
            "auto_renew" => Some(Self::AutoRenew),
            "sync_payment" => Some(Self::SyncPayment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub kind: String,
    pub payload: Value,
    pub dedupe_key: Option<String>,
    pub status: String,
    pub attempts: i32,
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

const JOB_COLUMNS: &str =
    "id, kind, payload, dedupe_key, status, attempts, run_at, last_error, created_at";

/// Dedupe key for a per-entity daily sweep job. The date bucket keeps
/// tomorrow's sweep from being swallowed by today's completed job.
pub fn daily_dedupe_key(kind: JobKind, entity_id: Uuid, day: NaiveDate) -> String {
    format!("{}:{}:{}", kind.as_str(), entity_id, day.format("%Y%m%d"))
}

/// Dedupe key for month-scoped work.
pub fn monthly_dedupe_key(kind: JobKind, entity_id: Uuid, month: NaiveDate) -> String {
    format!("{}:{}:{}", kind.as_str(), entity_id, month.format("%Y%m"))
}

/// Dedupe key for a payment sync. The hour bucket bounds how long any stuck
/// open job can shadow fresh sync requests for the same payment.
pub fn sync_dedupe_key(payment_id: Uuid, now: DateTime<Utc>) -> String {
    format!(
        "{}:{}:{}",
        JobKind::SyncPayment.as_str(),
        payment_id,
        now.format("%Y%m%d%H")
    )
}

/// Queue a job. A conflicting dedupe key means an equivalent job is already
/// queued or running; the insert silently drops and the caller moves on.
/// Finished jobs release their key, so periodic sweeps can re-enqueue.
pub async fn enqueue<'e, E>(
    executor: E,
    kind: JobKind,
    payload: Value,
    dedupe_key: Option<&str>,
    run_at: DateTime<Utc>,
) -> Result<bool, AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        "INSERT INTO jobs (id, kind, payload, dedupe_key, status, attempts, run_at, created_at)
         VALUES ($1, $2, $3, $4, 'queued', 0, $5, now())
         ON CONFLICT (dedupe_key) WHERE status IN ('queued', 'running') DO NOTHING",
    )
    .bind(Uuid::new_v4())
    .bind(kind.as_str())
    .bind(&payload)
    .bind(dedupe_key)
    .bind(run_at)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// A running job older than this was claimed by a worker that died before
/// finishing; it becomes claimable again.
const STALE_CLAIM_SECS: f64 = 900.0;

/// Claim a batch of due jobs. `FOR UPDATE SKIP LOCKED` lets concurrent
/// workers drain the queue without claiming the same row twice; the attempt
/// counter increments at claim time so a crash mid-handler still counts.
/// Stale running rows are reclaimed alongside queued ones, so a worker crash
/// between claim and completion never strands a job (or its dedupe key).
pub async fn claim_batch(pool: &PgPool, limit: i64) -> Result<Vec<Job>, AppError> {
    let jobs = sqlx::query_as::<_, Job>(&format!(
        "UPDATE jobs SET status = 'running', attempts = attempts + 1, claimed_at = now()
         WHERE id IN (
             SELECT id FROM jobs
             WHERE (status = 'queued' AND run_at <= now())
                OR (status = 'running' AND claimed_at < now() - make_interval(secs => $2))
             ORDER BY run_at
             LIMIT $1
             FOR UPDATE SKIP LOCKED
         )
         RETURNING {JOB_COLUMNS}"
    ))
    .bind(limit)
    .bind(STALE_CLAIM_SECS)
    .fetch_all(pool)
    .await?;
    Ok(jobs)
}

/// Delete terminal job rows past the retention horizon. Open jobs are never
/// touched; their dedupe keys still guard against duplicates.
pub async fn purge_finished(pool: &PgPool, older_than: Duration) -> Result<u64, AppError> {
    let result = sqlx::query(
        "DELETE FROM jobs
         WHERE status IN ('done', 'failed')
           AND created_at < now() - make_interval(secs => $1)",
    )
    .bind(older_than.as_secs_f64())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

async fn mark_done(pool: &PgPool, id: Uuid) -> Result<(), AppError> {
    sqlx::query("UPDATE jobs SET status = 'done', last_error = NULL WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Requeue without consuming an attempt. Used for rate-limit denials,
/// which are flow control rather than failures.
async fn reschedule(pool: &PgPool, id: Uuid, delay: Duration) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE jobs
         SET status = 'queued',
             attempts = GREATEST(attempts - 1, 0),
             run_at = now() + make_interval(secs => $2)
         WHERE id = $1",
    )
    .bind(id)
    .bind(delay.as_secs_f64())
    .execute(pool)
    .await?;
    Ok(())
}

async fn mark_failed_or_retry(
    pool: &PgPool,
    job: &Job,
    error: &AppError,
    max_attempts: i32,
) -> Result<(), AppError> {
    if job.attempts >= max_attempts {
        tracing::error!(
            job_id = %job.id,
            kind = %job.kind,
            attempts = job.attempts,
            error = %error,
            "job exhausted its attempts; marking failed"
        );
        sqlx::query("UPDATE jobs SET status = 'failed', last_error = $2 WHERE id = $1")
            .bind(job.id)
            .bind(error.to_string())
            .execute(pool)
            .await?;
    } else {
        let delay = retry_backoff(job.attempts);
        tracing::warn!(
            job_id = %job.id,
            kind = %job.kind,
            attempts = job.attempts,
            retry_in_seconds = delay.as_secs(),
            error = %error,
            "job failed; will retry"
        );
        sqlx::query(
            "UPDATE jobs
             SET status = 'queued',
                 last_error = $2,
                 run_at = now() + make_interval(secs => $3)
             WHERE id = $1",
        )
        .bind(job.id)
        .bind(error.to_string())
        .bind(delay.as_secs_f64())
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Exponential backoff: 30s, 60s, 120s, ... capped at 30 minutes.
fn retry_backoff(attempts: i32) -> Duration {
    let exponent = attempts.clamp(1, 6) as u32 - 1;
    Duration::from_secs((30u64 << exponent).min(1800))
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ProcessSummary {
    pub claimed: u32,
    pub succeeded: u32,
    pub rescheduled: u32,
    pub failed: u32,
}

enum Verdict {
    Done,
    Reschedule(Duration),
}

/// Drain one batch of due jobs. Handlers are individually idempotent, so a
/// job redelivered after a crash converges instead of double-applying.
pub async fn process_pending<L: SharedRateLimiter>(
    state: &AppState,
    limiter: &L,
    batch_size: i64,
) -> Result<ProcessSummary, AppError> {
    let pool = state.pool()?;
    let jobs = claim_batch(pool, batch_size).await?;
    let mut summary = ProcessSummary {
        claimed: jobs.len() as u32,
        ..Default::default()
    };

    for job in &jobs {
        match dispatch(state, limiter, job).await {
            Ok(Verdict::Done) => {
                mark_done(pool, job.id).await?;
                summary.succeeded += 1;
            }
            Ok(Verdict::Reschedule(delay)) => {
                reschedule(pool, job.id, delay).await?;
                summary.rescheduled += 1;
            }
            Err(error) => {
                mark_failed_or_retry(pool, job, &error, state.config.job_max_attempts).await?;
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}

async fn dispatch<L: SharedRateLimiter>(
    state: &AppState,
    limiter: &L,
    job: &Job,
) -> Result<Verdict, AppError> {
    let pool = state.pool()?;
    let cfg = state.config.billing();

    let Some(kind) = JobKind::parse(&job.kind) else {
        return Err(AppError::Invalid(format!("unknown job kind '{}'", job.kind)));
    };

    match kind {
        JobKind::Activate => {
            let contract_id = payload_uuid(&job.payload, "contract_id")?;
            state_machine::apply(
                pool,
                contract_id,
                LifecycleEvent::StartDateReached {
                    as_of: Utc::now().date_naive(),
                },
                &cfg,
            )
            .await?;
            Ok(Verdict::Done)
        }
        JobKind::MarkOverdue => {
            let contract_id = payload_uuid(&job.payload, "contract_id")?;
            state_machine::apply(pool, contract_id, LifecycleEvent::InvoiceOverdue, &cfg).await?;
            Ok(Verdict::Done)
        }
        JobKind::CancelOverdue => {
            let contract_id = payload_uuid(&job.payload, "contract_id")?;
            state_machine::apply(
                pool,
                contract_id,
                LifecycleEvent::GraceElapsed {
                    reason: "payment not received within the booking grace period".to_string(),
                    grace_days: cfg.grace_days,
                    min_outstanding: cfg.cancellation_min_outstanding,
                },
                &cfg,
            )
            .await?;
            Ok(Verdict::Done)
        }
        JobKind::CompleteEnded => {
            let contract_id = payload_uuid(&job.payload, "contract_id")?;
            renewal::complete_ended(pool, contract_id, &cfg).await?;
            Ok(Verdict::Done)
        }
        JobKind::GenerateMonthlyInvoices => {
            let contract_id = payload_uuid(&job.payload, "contract_id")?;
            let target_month = payload_month(&job.payload, "target_month")
                .unwrap_or_else(|| Utc::now().date_naive());
            invoice_generator::generate_monthly_invoices(pool, contract_id, target_month, &cfg)
                .await?;
            Ok(Verdict::Done)
        }
        JobKind::AutoRenew => {
            // Runs through the same composition as CompleteEnded so a retry
            // after a crash between successor insert and completion still
            // ends the old term.
            let contract_id = payload_uuid(&job.payload, "contract_id")?;
            renewal::complete_ended(pool, contract_id, &cfg).await?;
            Ok(Verdict::Done)
        }
        JobKind::SyncPayment => {
            let payment_id = payload_uuid(&job.payload, "payment_id")?;
            let server_key = state.config.midtrans_server_key.as_deref().ok_or_else(|| {
                AppError::Dependency("MIDTRANS_SERVER_KEY is not configured".to_string())
            })?;
            let outcome = payment_sync::sync_payment(
                pool,
                &state.http_client,
                limiter,
                payment_id,
                &state.config.midtrans_base_url,
                server_key,
                &cfg,
            )
            .await?;
            match outcome {
                SyncOutcome::Rescheduled { retry_after } => Ok(Verdict::Reschedule(retry_after)),
                _ => Ok(Verdict::Done),
            }
        }
    }
}

fn payload_uuid(payload: &Value, key: &str) -> Result<Uuid, AppError> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .ok_or_else(|| AppError::Invalid(format!("job payload missing uuid field '{key}'")))
}

fn payload_month(payload: &Value, key: &str) -> Option<NaiveDate> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .and_then(parse_year_month)
}

/// Payload for contract-scoped jobs.
pub fn contract_payload(contract_id: Uuid) -> Value {
    json!({ "contract_id": contract_id })
}

/// Payload for a month-scoped invoice generation job.
pub fn invoice_payload(contract_id: Uuid, target_month: NaiveDate) -> Value {
    json!({
        "contract_id": contract_id,
        "target_month": target_month.format("%Y-%m").to_string(),
    })
}

/// Payload for a payment sync job.
pub fn payment_payload(payment_id: Uuid) -> Value {
    json!({ "payment_id": payment_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn kind_round_trips_through_text() {
        for kind in [
            JobKind::Activate,
            JobKind::MarkOverdue,
            JobKind::CancelOverdue,
            JobKind::CompleteEnded,
            JobKind::GenerateMonthlyInvoices,
            JobKind::AutoRenew,
            JobKind::SyncPayment,
        ] {
            assert_eq!(JobKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(JobKind::parse("collect_garbage"), None);
    }

    #[test]
    fn dedupe_keys_bucket_by_date() {
        let id = Uuid::nil();
        assert_eq!(
            daily_dedupe_key(JobKind::Activate, id, d(2024, 6, 1)),
            "activate:00000000-0000-0000-0000-000000000000:20240601"
        );
        assert_eq!(
            monthly_dedupe_key(JobKind::GenerateMonthlyInvoices, id, d(2024, 6, 15)),
            "generate_monthly_invoices:00000000-0000-0000-0000-000000000000:202406"
        );
        // Same entity, different day: distinct keys.
        assert_ne!(
            daily_dedupe_key(JobKind::Activate, id, d(2024, 6, 1)),
            daily_dedupe_key(JobKind::Activate, id, d(2024, 6, 2))
        );
    }

    #[test]
    fn sync_keys_roll_over_hourly() {
        let id = Uuid::nil();
        let at = |h, min| d(2024, 6, 1).and_hms_opt(h, min, 0).unwrap().and_utc();
        assert_eq!(
            sync_dedupe_key(id, at(9, 5)),
            "sync_payment:00000000-0000-0000-0000-000000000000:2024060109"
        );
        // Same payment a few minutes later dedupes; the next hour does not,
        // so a stranded open job cannot block the payment indefinitely.
        assert_eq!(sync_dedupe_key(id, at(9, 5)), sync_dedupe_key(id, at(9, 55)));
        assert_ne!(sync_dedupe_key(id, at(9, 55)), sync_dedupe_key(id, at(10, 5)));
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(retry_backoff(1), Duration::from_secs(30));
        assert_eq!(retry_backoff(2), Duration::from_secs(60));
        assert_eq!(retry_backoff(3), Duration::from_secs(120));
        assert_eq!(retry_backoff(6), Duration::from_secs(960));
        assert_eq!(retry_backoff(50), Duration::from_secs(960));
    }

    #[test]
    fn payload_helpers_round_trip() {
        let id = Uuid::new_v4();
        let payload = invoice_payload(id, d(2024, 3, 15));
        assert_eq!(payload_uuid(&payload, "contract_id").unwrap(), id);
        assert_eq!(payload_month(&payload, "target_month"), Some(d(2024, 3, 1)));
        assert!(payload_uuid(&payload, "payment_id").is_err());
    }
}
