use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::PgPool;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Granted,
    /// The window is exhausted; retry once it rolls over. Denial is flow
    /// control, not an error.
    Denied { retry_after: Duration },
}

/// Fixed-window counter shared by all workers polling the gateway. The
/// production implementation must be backed by a store every worker can
/// see; per-process memory only suffices for tests and single-node runs.
pub trait SharedRateLimiter: Send + Sync {
    fn try_acquire(
        &self,
        key: &str,
        window: Duration,
        limit: i64,
    ) -> impl Future<Output = Result<RateDecision, AppError>> + Send;
}

fn window_bounds(now_epoch: i64, window: Duration) -> (i64, Duration) {
    let window_secs = window.as_secs().max(1) as i64;
    let window_start = now_epoch - now_epoch.rem_euclid(window_secs);
    let remaining = (window_start + window_secs - now_epoch).max(1) as u64;
    (window_start, Duration::from_secs(remaining))
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Newest `window_start` that is safely dead: windows older than the cutoff
/// can never be consulted again and may be deleted.
fn expired_cutoff(now_epoch: i64, window: Duration) -> i64 {
    let window_secs = window.as_secs().max(1) as i64;
    now_epoch - now_epoch.rem_euclid(window_secs) - window_secs
}

/// Cross-process limiter backed by an atomically upserted counter row.
#[derive(Clone)]
pub struct PgFixedWindowLimiter {
    pool: PgPool,
}

impl PgFixedWindowLimiter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Drop counter rows for windows that have fully rolled over. Run
    /// opportunistically; the table otherwise grows one row per window.
    pub async fn purge_expired(&self, window: Duration) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM rate_limit_windows WHERE window_start < $1")
            .bind(expired_cutoff(now_epoch(), window))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

impl SharedRateLimiter for PgFixedWindowLimiter {
    async fn try_acquire(
        &self,
        key: &str,
        window: Duration,
        limit: i64,
    ) -> Result<RateDecision, AppError> {
        let (window_start, retry_after) = window_bounds(now_epoch(), window);

        let (count,): (i64,) = sqlx::query_as(
            "INSERT INTO rate_limit_windows (key, window_start, count)
             VALUES ($1, $2, 1)
             ON CONFLICT (key, window_start)
             DO UPDATE SET count = rate_limit_windows.count + 1
             RETURNING count",
        )
        .bind(key)
        .bind(window_start)
        .fetch_one(&self.pool)
        .await?;

        if count > limit {
            Ok(RateDecision::Denied { retry_after })
        } else {
            Ok(RateDecision::Granted)
        }
    }
}

/// In-memory fixed window with identical semantics, for tests and
/// single-process deployments.
#[derive(Default)]
pub struct InMemoryFixedWindowLimiter {
    windows: Mutex<HashMap<(String, i64), i64>>,
}

impl InMemoryFixedWindowLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire_at(
        &self,
        key: &str,
        window: Duration,
        limit: i64,
        now_epoch: i64,
    ) -> RateDecision {
        let (window_start, retry_after) = window_bounds(now_epoch, window);
        let mut windows = self.windows.lock().expect("limiter lock poisoned");
        // Old windows are never consulted again.
        windows.retain(|(_, start), _| *start >= window_start);
        let count = windows
            .entry((key.to_string(), window_start))
            .and_modify(|c| *c += 1)
            .or_insert(1);

        if *count > limit {
            RateDecision::Denied { retry_after }
        } else {
            RateDecision::Granted
        }
    }
}

impl SharedRateLimiter for InMemoryFixedWindowLimiter {
    async fn try_acquire(
        &self,
        key: &str,
        window: Duration,
        limit: i64,
    ) -> Result<RateDecision, AppError> {
        Ok(self.acquire_at(key, window, limit, now_epoch()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn grants_up_to_limit_then_denies() {
        let limiter = InMemoryFixedWindowLimiter::new();
        let now = 1_700_000_000;
        for _ in 0..3 {
            assert_eq!(
                limiter.acquire_at("midtrans", WINDOW, 3, now),
                RateDecision::Granted
            );
        }
        assert!(matches!(
            limiter.acquire_at("midtrans", WINDOW, 3, now),
            RateDecision::Denied { .. }
        ));
    }

    #[test]
    fn denial_reports_time_to_window_rollover() {
        let limiter = InMemoryFixedWindowLimiter::new();
        // 20 seconds into a 60-second window.
        let now = 1_700_000_000 - 1_700_000_000 % 60 + 20;
        let _ = limiter.acquire_at("midtrans", WINDOW, 1, now);
        match limiter.acquire_at("midtrans", WINDOW, 1, now) {
            RateDecision::Denied { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(40));
            }
            RateDecision::Granted => panic!("expected denial"),
        }
    }

    #[test]
    fn new_window_resets_the_counter() {
        let limiter = InMemoryFixedWindowLimiter::new();
        let now = 1_700_000_040;
        let _ = limiter.acquire_at("midtrans", WINDOW, 1, now);
        assert!(matches!(
            limiter.acquire_at("midtrans", WINDOW, 1, now),
            RateDecision::Denied { .. }
        ));
        assert_eq!(
            limiter.acquire_at("midtrans", WINDOW, 1, now + 60),
            RateDecision::Granted
        );
    }

    #[test]
    fn cutoff_spares_current_and_previous_window() {
        // 20 seconds into the window starting at the epoch-aligned mark.
        let now = 1_700_000_000 - 1_700_000_000 % 60 + 20;
        let cutoff = expired_cutoff(now, WINDOW);
        let current_start = now - now % 60;
        // The in-flight window and the one that just ended stay; rows
        // starting strictly before the cutoff are unreachable.
        assert_eq!(cutoff, current_start - 60);
    }

    #[test]
    fn keys_are_isolated() {
        let limiter = InMemoryFixedWindowLimiter::new();
        let now = 1_700_000_000;
        let _ = limiter.acquire_at("a", WINDOW, 1, now);
        assert_eq!(limiter.acquire_at("b", WINDOW, 1, now), RateDecision::Granted);
    }
}
