use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::AppError;
use crate::models::{InvoiceStatus, PaymentStatus};
use crate::repository::{contracts, invoices, payments};
use crate::services::midtrans;
use crate::services::rate_limit::{RateDecision, SharedRateLimiter};
use crate::services::state_machine::{self, LifecycleEvent};
use crate::services::{audit, notifier};

pub const GATEWAY_LIMITER_KEY: &str = "midtrans";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Updated { status: PaymentStatus },
    Unchanged,
    /// The shared gateway budget is exhausted. Nothing was written; the
    /// caller requeues the job to run after the window rolls over.
    Rescheduled { retry_after: Duration },
    Skipped,
}

/// Poll the gateway for one payment's verdict and reconcile local state.
///
/// The rate limit check happens before any read of the gateway and before
/// any write, so a denied poll leaves no trace other than the requeue.
pub async fn sync_payment<L: SharedRateLimiter>(
    pool: &PgPool,
    http: &reqwest::Client,
    limiter: &L,
    payment_id: Uuid,
    base_url: &str,
    server_key: &str,
    cfg: &BillingConfig,
) -> Result<SyncOutcome, AppError> {
    let Some(payment) = payments::get(pool, payment_id).await? else {
        tracing::warn!(
            payment_id = %payment_id,
            missing_entity = true,
            "payment not found for sync; treating as already handled"
        );
        return Ok(SyncOutcome::Skipped);
    };

    // Terminal payments short-circuit before the limiter so they never
    // consume a slot of the shared gateway budget.
    let gate = if payment.status.is_terminal() {
        PollGate::Settled
    } else {
        let window = Duration::from_secs(cfg.gateway_rate_limit_window_seconds);
        let decision = limiter
            .try_acquire(GATEWAY_LIMITER_KEY, window, cfg.gateway_rate_limit_max_calls)
            .await?;
        poll_gate(payment.status, decision)
    };

    match gate {
        PollGate::Settled => {
            tracing::debug!(
                payment_id = %payment_id,
                status = payment.status.as_str(),
                "payment already settled; no-op"
            );
            return Ok(SyncOutcome::Unchanged);
        }
        PollGate::Defer { retry_after } => {
            tracing::info!(
                payment_id = %payment_id,
                retry_after_seconds = retry_after.as_secs(),
                "gateway poll budget exhausted; rescheduling"
            );
            return Ok(SyncOutcome::Rescheduled { retry_after });
        }
        PollGate::Proceed => {}
    }

    let order_id = payment
        .reference
        .clone()
        .unwrap_or_else(|| midtrans::synthesize_order_id(payment.id));

    let raw = midtrans::fetch_status(http, base_url, server_key, &order_id).await?;

    let Some(mapped) = midtrans::map_status(&raw) else {
        tracing::warn!(
            payment_id = %payment_id,
            order_id,
            transaction_status = raw.get("transaction_status").and_then(serde_json::Value::as_str),
            "unrecognized gateway transaction status; leaving payment untouched"
        );
        return Ok(SyncOutcome::Unchanged);
    };

    let status_changed = mapped.status != payment.status;
    let newly_completed = status_changed && mapped.status == PaymentStatus::Completed;

    // Every poll is recorded, even when the verdict did not move.
    let meta = append_history(&payment.meta, &raw, Utc::now());

    let mut became_paid = false;
    let mut tx = pool.begin().await?;

    payments::apply_sync_result(
        &mut *tx,
        payment.id,
        mapped.status,
        mapped.paid_at,
        mapped.va_number.as_deref(),
        mapped.va_expiry,
        &meta,
    )
    .await?;

    if newly_completed {
        let voided = payments::void_open_for_invoice(
            &mut *tx,
            payment.invoice_id,
            payment.id,
            "superseded by completed payment",
        )
        .await?;
        if voided > 0 {
            tracing::debug!(
                invoice_id = %payment.invoice_id,
                voided,
                "voided superseded open payments"
            );
        }
    }

    // Re-derive the invoice status from the completed-payment total rather
    // than trusting the single verdict that arrived.
    let invoice = invoices::get(pool, payment.invoice_id).await?;
    if let Some(invoice) = &invoice {
        if !matches!(invoice.status, InvoiceStatus::Cancelled) {
            let completed_total =
                payments::completed_total_for_invoice(&mut *tx, invoice.id).await?;
            let today = Utc::now().date_naive();
            let derived =
                derive_invoice_status(invoice.amount, completed_total, invoice.due_date, today);

            if derived != invoice.status {
                let paid_at = (derived == InvoiceStatus::Paid)
                    .then(|| mapped.paid_at.unwrap_or_else(Utc::now));
                invoices::set_status(&mut *tx, invoice.id, derived, paid_at).await?;
                became_paid = derived == InvoiceStatus::Paid;
            }

            if completed_total > invoice.amount {
                tracing::warn!(
                    invoice_id = %invoice.id,
                    amount = invoice.amount,
                    completed_total,
                    "invoice overpaid; recording full total"
                );
            }
        }
    }

    tx.commit().await?;

    if status_changed {
        audit::write_audit_log(
            pool,
            "payment",
            payment.id,
            "payment_synced",
            "gateway poll",
            json!({
                "invoice_id": payment.invoice_id,
                "from": payment.status.as_str(),
                "to": mapped.status.as_str(),
                "order_id": order_id,
            }),
        )
        .await;
    }

    if became_paid {
        if let Some(invoice) = &invoice {
            if let Some(contract) = contracts::get(pool, invoice.contract_id).await? {
                notifier::notify_user(
                    pool,
                    contract.tenant_id,
                    "Payment received",
                    &format!("Invoice {} is paid in full.", invoice.number),
                    Some("/tenant/invoices"),
                    json!({ "invoice_id": invoice.id, "payment_id": payment.id }),
                )
                .await;
                // Clearing the last arrears may bring an overdue contract
                // back to active. No-op otherwise.
                state_machine::apply(pool, contract.id, LifecycleEvent::ArrearsCleared, cfg)
                    .await?;
            }
        }
    }

    if status_changed {
        tracing::info!(
            payment_id = %payment.id,
            from = payment.status.as_str(),
            to = mapped.status.as_str(),
            invoice_paid = became_paid,
            "payment reconciled"
        );
        Ok(SyncOutcome::Updated {
            status: mapped.status,
        })
    } else {
        Ok(SyncOutcome::Unchanged)
    }
}

/// Whether a poll may touch the gateway and local state.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PollGate {
    /// Already settled; never polled again.
    Settled,
    /// Budget exhausted; requeue after the window rolls over, write nothing.
    Defer { retry_after: Duration },
    Proceed,
}

fn poll_gate(status: PaymentStatus, decision: RateDecision) -> PollGate {
    if status.is_terminal() {
        return PollGate::Settled;
    }
    match decision {
        RateDecision::Denied { retry_after } => PollGate::Defer { retry_after },
        RateDecision::Granted => PollGate::Proceed,
    }
}

/// Append one raw gateway response to the payment's `meta.history` array.
/// Existing meta keys and prior history entries are preserved; the trail
/// only ever grows.
fn append_history(meta: &Value, raw: &Value, polled_at: DateTime<Utc>) -> Value {
    let mut map = match meta {
        Value::Object(existing) => existing.clone(),
        _ => serde_json::Map::new(),
    };

    let entry = json!({
        "polled_at": polled_at.to_rfc3339(),
        "response": raw,
    });

    match map.get_mut("history").and_then(Value::as_array_mut) {
        Some(history) => history.push(entry),
        None => {
            map.insert("history".to_string(), json!([entry]));
        }
    }
    Value::Object(map)
}

/// Invoice status implied by the completed-payment total. Overpayment still
/// counts as paid; partial payment leaves the invoice open.
fn derive_invoice_status(
    amount: i64,
    completed_total: i64,
    due_date: NaiveDate,
    today: NaiveDate,
) -> InvoiceStatus {
    if completed_total >= amount {
        InvoiceStatus::Paid
    } else if due_date < today {
        InvoiceStatus::Overdue
    } else {
        InvoiceStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn history_starts_from_empty_meta() {
        let meta = append_history(&json!({}), &json!({"transaction_status": "pending"}), Utc::now());
        let history = meta["history"].as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(
            history[0]["response"]["transaction_status"],
            json!("pending")
        );
        assert!(history[0]["polled_at"].is_string());
    }

    #[test]
    fn history_appends_without_clobbering() {
        let existing = json!({
            "checkout_url": "https://pay.example/abc",
            "history": [{"polled_at": "2024-06-01T00:00:00Z", "response": {"transaction_status": "pending"}}],
        });
        let meta = append_history(
            &existing,
            &json!({"transaction_status": "settlement"}),
            Utc::now(),
        );
        assert_eq!(meta["checkout_url"], json!("https://pay.example/abc"));
        let history = meta["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(
            history[0]["response"]["transaction_status"],
            json!("pending")
        );
        assert_eq!(
            history[1]["response"]["transaction_status"],
            json!("settlement")
        );
    }

    #[test]
    fn non_object_meta_is_replaced_with_a_fresh_trail() {
        let meta = append_history(&Value::Null, &json!({"transaction_status": "deny"}), Utc::now());
        assert_eq!(meta["history"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn denied_budget_defers_instead_of_polling() {
        // Denial carries the window rollover; the caller requeues with it
        // and no payment or invoice row is touched.
        let retry_after = Duration::from_secs(42);
        assert_eq!(
            poll_gate(PaymentStatus::Pending, RateDecision::Denied { retry_after }),
            PollGate::Defer { retry_after }
        );
        assert_eq!(
            poll_gate(PaymentStatus::Review, RateDecision::Granted),
            PollGate::Proceed
        );
    }

    #[test]
    fn settled_payments_are_never_polled() {
        for status in [
            PaymentStatus::Completed,
            PaymentStatus::Failed,
            PaymentStatus::Rejected,
            PaymentStatus::Cancelled,
        ] {
            assert_eq!(
                poll_gate(status, RateDecision::Granted),
                PollGate::Settled
            );
        }
    }

    #[test]
    fn full_payment_marks_paid_regardless_of_due_date() {
        assert_eq!(
            derive_invoice_status(1_500_000, 1_500_000, d(2024, 1, 1), d(2024, 6, 1)),
            InvoiceStatus::Paid
        );
        // Overpayment still settles the invoice.
        assert_eq!(
            derive_invoice_status(1_500_000, 2_000_000, d(2024, 1, 1), d(2024, 6, 1)),
            InvoiceStatus::Paid
        );
    }

    #[test]
    fn partial_payment_leaves_invoice_open() {
        assert_eq!(
            derive_invoice_status(1_500_000, 500_000, d(2024, 6, 10), d(2024, 6, 1)),
            InvoiceStatus::Pending
        );
        assert_eq!(
            derive_invoice_status(1_500_000, 500_000, d(2024, 5, 1), d(2024, 6, 1)),
            InvoiceStatus::Overdue
        );
    }
}
