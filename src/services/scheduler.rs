use std::time::Duration;

use chrono::{NaiveDate, Timelike, Utc};
use sqlx::PgPool;
use tokio::time::Instant;

use crate::config::AppConfig;
use crate::dates::month_start;
use crate::error::AppError;
use crate::repository::{contracts, payments};
use crate::services::jobs::{self, JobKind};
use crate::services::rate_limit::PgFixedWindowLimiter;
use crate::state::AppState;

const JOB_BATCH_SIZE: i64 = 50;

/// How long done and failed job rows stay queryable before the daily purge.
const FINISHED_JOB_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Background loop driving the whole billing lifecycle: drains the job
/// queue every tick, enqueues payment polls on the sweep interval, and
/// fans out the daily lifecycle sweeps once per UTC day.
pub async fn run_background_scheduler(state: AppState) {
    let Some(pool) = state.db_pool.clone() else {
        tracing::warn!("background scheduler disabled; no database configured");
        return;
    };

    let limiter = PgFixedWindowLimiter::new(pool.clone());
    let tick = Duration::from_secs(state.config.worker_poll_interval_seconds.max(1));
    let payment_sweep_every =
        Duration::from_secs(state.config.payment_sweep_interval_minutes.max(1) * 60);

    let mut last_payment_sweep: Option<Instant> = None;
    let mut last_daily_sweep: Option<NaiveDate> = None;

    tracing::info!(
        tick_seconds = tick.as_secs(),
        payment_sweep_minutes = state.config.payment_sweep_interval_minutes,
        daily_sweep_hour_utc = state.config.daily_sweep_hour_utc,
        "background scheduler started"
    );

    loop {
        match jobs::process_pending(&state, &limiter, JOB_BATCH_SIZE).await {
            Ok(summary) if summary.claimed > 0 => {
                tracing::info!(
                    claimed = summary.claimed,
                    succeeded = summary.succeeded,
                    rescheduled = summary.rescheduled,
                    failed = summary.failed,
                    "job batch processed"
                );
            }
            Ok(_) => {}
            Err(error) => {
                tracing::error!(error = %error, "job batch processing failed");
            }
        }

        if last_payment_sweep.is_none_or(|at| at.elapsed() >= payment_sweep_every) {
            match enqueue_payment_sweep(&pool).await {
                Ok(enqueued) if enqueued > 0 => {
                    tracing::info!(enqueued, "payment sync sweep enqueued");
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::error!(error = %error, "payment sync sweep failed");
                }
            }
            last_payment_sweep = Some(Instant::now());
        }

        let now = Utc::now();
        let today = now.date_naive();
        if now.hour() >= state.config.daily_sweep_hour_utc && last_daily_sweep != Some(today) {
            match enqueue_daily_sweeps(&pool, &state.config).await {
                Ok(enqueued) => {
                    tracing::info!(enqueued, date = %today, "daily lifecycle sweeps enqueued");
                    last_daily_sweep = Some(today);
                }
                Err(error) => {
                    tracing::error!(error = %error, "daily lifecycle sweep failed");
                }
            }

            // Housekeeping piggybacks on the daily sweep: finished job rows
            // and rolled-over limiter windows are dead weight after that.
            match jobs::purge_finished(&pool, FINISHED_JOB_RETENTION).await {
                Ok(purged) if purged > 0 => {
                    tracing::info!(purged, "purged finished job rows");
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(error = %error, "finished job purge failed");
                }
            }
            let gateway_window =
                Duration::from_secs(state.config.billing().gateway_rate_limit_window_seconds);
            match limiter.purge_expired(gateway_window).await {
                Ok(purged) if purged > 0 => {
                    tracing::info!(purged, "purged expired rate limit windows");
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(error = %error, "rate limit window purge failed");
                }
            }
        }

        tokio::time::sleep(tick).await;
    }
}

/// Queue a gateway poll for every payment still awaiting a verdict. Dedupe
/// keys make re-running the sweep harmless while a poll is still queued.
pub async fn enqueue_payment_sweep(pool: &PgPool) -> Result<u32, AppError> {
    let now = Utc::now();
    let mut enqueued = 0u32;
    for payment_id in payments::awaiting_gateway_verdict(pool).await? {
        let key = jobs::sync_dedupe_key(payment_id, now);
        if jobs::enqueue(
            pool,
            JobKind::SyncPayment,
            jobs::payment_payload(payment_id),
            Some(&key),
            now,
        )
        .await?
        {
            enqueued += 1;
        }
    }
    Ok(enqueued)
}

/// Fan out the once-a-day lifecycle work as individual per-contract jobs:
/// activation, grace cancellation, overdue marking, monthly invoice
/// catch-up, renewal, and completion.
pub async fn enqueue_daily_sweeps(pool: &PgPool, config: &AppConfig) -> Result<u32, AppError> {
    let now = Utc::now();
    let today = now.date_naive();
    let target_month = month_start(today);
    let mut enqueued = 0u32;

    for contract_id in contracts::due_for_activation(pool, today).await? {
        let key = jobs::daily_dedupe_key(JobKind::Activate, contract_id, today);
        if jobs::enqueue(
            pool,
            JobKind::Activate,
            jobs::contract_payload(contract_id),
            Some(&key),
            now,
        )
        .await?
        {
            enqueued += 1;
        }
    }

    let grace_cutoff = now - chrono::Duration::days(config.booking_grace_days);
    for contract_id in contracts::stale_unpaid(pool, grace_cutoff).await? {
        let key = jobs::daily_dedupe_key(JobKind::CancelOverdue, contract_id, today);
        if jobs::enqueue(
            pool,
            JobKind::CancelOverdue,
            jobs::contract_payload(contract_id),
            Some(&key),
            now,
        )
        .await?
        {
            enqueued += 1;
        }
    }

    for contract_id in contracts::with_past_due_invoices(pool, today).await? {
        let key = jobs::daily_dedupe_key(JobKind::MarkOverdue, contract_id, today);
        if jobs::enqueue(
            pool,
            JobKind::MarkOverdue,
            jobs::contract_payload(contract_id),
            Some(&key),
            now,
        )
        .await?
        {
            enqueued += 1;
        }
    }

    for contract_id in contracts::monthly_billable(pool).await? {
        let key = jobs::monthly_dedupe_key(
            JobKind::GenerateMonthlyInvoices,
            contract_id,
            target_month,
        );
        if jobs::enqueue(
            pool,
            JobKind::GenerateMonthlyInvoices,
            jobs::invoice_payload(contract_id, target_month),
            Some(&key),
            now,
        )
        .await?
        {
            enqueued += 1;
        }
    }

    for (contract_id, auto_renew) in contracts::ended(pool, today).await? {
        let kind = if auto_renew {
            JobKind::AutoRenew
        } else {
            JobKind::CompleteEnded
        };
        let key = jobs::daily_dedupe_key(kind, contract_id, today);
        if jobs::enqueue(pool, kind, jobs::contract_payload(contract_id), Some(&key), now).await? {
            enqueued += 1;
        }
    }

    Ok(enqueued)
}
