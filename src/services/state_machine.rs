use chrono::{NaiveDate, Utc};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::AppError;
use crate::models::{Contract, ContractStatus, HandoverKind, HandoverStatus, RoomStatus};
use crate::repository::{contracts, handovers, invoices, rooms};
use crate::services::{audit, notifier};

/// Events that may advance (or, for the two dispute compensations, rewind)
/// a contract's lifecycle. Every handler goes through [`apply`]; nothing
/// else writes `contracts.status` or the coupled room status.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// Scheduled activation once the start date is reached.
    StartDateReached { as_of: NaiveDate },
    /// Booking never activated within the grace window.
    GraceElapsed {
        reason: String,
        grace_days: i64,
        min_outstanding: i64,
    },
    /// A pending invoice slipped past its due date.
    InvoiceOverdue,
    /// The term ended without a checkout dispute in flight.
    TermEnded,
    /// A checkout handover was confirmed (or auto-confirmed).
    CheckoutConfirmed,
    /// All arrears settled; an overdue contract recovers.
    ArrearsCleared,
    /// Compensating transition: an auto-confirmed checkout was disputed
    /// after it completed the contract.
    CheckoutDisputeReverted,
    /// Compensating transition: an auto-confirmed checkin was disputed
    /// after it activated the contract.
    CheckinDisputeReverted,
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartDateReached { .. } => "start_date_reached",
            Self::GraceElapsed { .. } => "grace_elapsed",
            Self::InvoiceOverdue => "invoice_overdue",
            Self::TermEnded => "term_ended",
            Self::CheckoutConfirmed => "checkout_confirmed",
            Self::ArrearsCleared => "arrears_cleared",
            Self::CheckoutDisputeReverted => "checkout_dispute_reverted",
            Self::CheckinDisputeReverted => "checkin_dispute_reverted",
        }
    }
}

/// The transition table. `None` means the event does not apply to the
/// current state; callers treat that as an idempotent no-op, never an
/// error, so redelivered jobs converge instead of failing.
pub fn next_status(current: ContractStatus, event: &LifecycleEvent) -> Option<ContractStatus> {
    use ContractStatus::*;
    use LifecycleEvent::*;

    match (current, event) {
        (PendingPayment | Booked, StartDateReached { .. }) => Some(Active),
        (PendingPayment | Booked, GraceElapsed { .. }) => Some(Cancelled),
        (Active, InvoiceOverdue) => Some(Overdue),
        (Active, TermEnded) => Some(Completed),
        (Active | Overdue, CheckoutConfirmed) => Some(Completed),
        (Overdue, ArrearsCleared) => Some(Active),
        // The single sanctioned exit from a terminal state.
        (Completed, CheckoutDisputeReverted) => Some(Active),
        (Active, CheckinDisputeReverted) => Some(Booked),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Transitioned {
        from: ContractStatus,
        to: ContractStatus,
    },
    /// Precondition no longer holds (already transitioned, guard false,
    /// or the contract is gone). Success for at-least-once delivery.
    Skipped,
}

/// Evaluate the guard and apply the transition transactionally: contract
/// status, coupled room status, and dependent invoice flips land in one
/// transaction. Audit and notification run after commit, best-effort.
/// The config snapshot decides whether handover acknowledgment gates the
/// activation and completion guards.
pub async fn apply(
    pool: &PgPool,
    contract_id: Uuid,
    event: LifecycleEvent,
    cfg: &BillingConfig,
) -> Result<Applied, AppError> {
    let Some(contract) = contracts::get(pool, contract_id).await? else {
        tracing::warn!(
            contract_id = %contract_id,
            event = event.name(),
            missing_entity = true,
            "contract not found; treating as already handled"
        );
        return Ok(Applied::Skipped);
    };

    let Some(target) = next_status(contract.status, &event) else {
        tracing::debug!(
            contract_id = %contract_id,
            status = contract.status.as_str(),
            event = event.name(),
            "event does not apply to current status; no-op"
        );
        return Ok(Applied::Skipped);
    };

    if !guard_holds(pool, &contract, &event, cfg).await? {
        tracing::debug!(
            contract_id = %contract_id,
            event = event.name(),
            "guard not satisfied; no-op"
        );
        return Ok(Applied::Skipped);
    }

    let from = contract.status;
    let mut flipped_invoices = 0u64;

    let mut tx = pool.begin().await?;
    contracts::set_status(&mut *tx, contract.id, target).await?;

    match &event {
        LifecycleEvent::StartDateReached { .. } => {
            rooms::set_status(&mut *tx, contract.room_id, RoomStatus::Occupied).await?;
        }
        LifecycleEvent::GraceElapsed { .. } => {
            rooms::set_status(&mut *tx, contract.room_id, RoomStatus::Vacant).await?;
            invoices::cancel_open_for_contract(&mut *tx, contract.id).await?;
        }
        LifecycleEvent::InvoiceOverdue => {
            flipped_invoices =
                invoices::mark_overdue_due_before(&mut *tx, contract.id, Utc::now().date_naive())
                    .await?;
        }
        LifecycleEvent::TermEnded | LifecycleEvent::CheckoutConfirmed => {
            // A successor (renewal) keeps the tenant in place; only free the
            // room when nothing follows.
            let has_successor = contracts::successor_exists(
                pool,
                contract.tenant_id,
                contract.room_id,
                contract.start_date,
            )
            .await?;
            if !has_successor {
                rooms::set_status(&mut *tx, contract.room_id, RoomStatus::Vacant).await?;
            }
        }
        LifecycleEvent::ArrearsCleared => {}
        LifecycleEvent::CheckoutDisputeReverted => {
            rooms::set_status(&mut *tx, contract.room_id, RoomStatus::Occupied).await?;
        }
        LifecycleEvent::CheckinDisputeReverted => {
            rooms::set_status(&mut *tx, contract.room_id, RoomStatus::Reserved).await?;
        }
    }

    tx.commit().await?;

    let reason = match &event {
        LifecycleEvent::GraceElapsed { reason, .. } => reason.clone(),
        _ => event.name().to_string(),
    };
    audit::write_audit_log(
        pool,
        "contract",
        contract.id,
        event.name(),
        &reason,
        json!({ "from": from.as_str(), "to": target.as_str() }),
    )
    .await;

    notify_tenant(pool, &contract, &event, flipped_invoices).await;

    tracing::info!(
        contract_id = %contract.id,
        from = from.as_str(),
        to = target.as_str(),
        event = event.name(),
        "contract transitioned"
    );

    Ok(Applied::Transitioned { from, to: target })
}

/// Re-check the event's precondition against freshly loaded state.
async fn guard_holds(
    pool: &PgPool,
    contract: &Contract,
    event: &LifecycleEvent,
    cfg: &BillingConfig,
) -> Result<bool, AppError> {
    let today = Utc::now().date_naive();
    match event {
        LifecycleEvent::StartDateReached { as_of } => {
            if contract.start_date > *as_of {
                return Ok(false);
            }
            let latest =
                handovers::latest_for_contract(pool, contract.id, HandoverKind::Checkin).await?;
            Ok(handover_permits(
                latest.map(|h| h.status),
                cfg.require_checkin_ack,
            ))
        }
        LifecycleEvent::GraceElapsed {
            grace_days,
            min_outstanding,
            ..
        } => {
            let elapsed = (Utc::now() - contract.created_at).num_days();
            if elapsed < *grace_days {
                return Ok(false);
            }
            if *min_outstanding > 0 {
                let open = invoices::open_amount_total(pool, contract.id).await?;
                return Ok(open >= *min_outstanding);
            }
            Ok(true)
        }
        LifecycleEvent::InvoiceOverdue => {
            invoices::has_pending_due_before(pool, contract.id, today).await
        }
        LifecycleEvent::TermEnded => {
            if contract.end_date >= today {
                return Ok(false);
            }
            let latest =
                handovers::latest_for_contract(pool, contract.id, HandoverKind::Checkout).await?;
            Ok(handover_permits(
                latest.map(|h| h.status),
                cfg.require_checkout_ack,
            ))
        }
        LifecycleEvent::CheckoutConfirmed => {
            let latest =
                handovers::latest_for_contract(pool, contract.id, HandoverKind::Checkout).await?;
            Ok(matches!(
                latest.map(|h| h.status),
                Some(HandoverStatus::Acknowledged) | Some(HandoverStatus::AutoConfirmed)
            ))
        }
        LifecycleEvent::ArrearsCleared => {
            Ok(!invoices::arrears_exist(pool, contract.id, today).await?)
        }
        LifecycleEvent::CheckoutDisputeReverted => {
            let latest =
                handovers::latest_for_contract(pool, contract.id, HandoverKind::Checkout).await?;
            Ok(matches!(latest.map(|h| h.status), Some(HandoverStatus::Disputed)))
        }
        LifecycleEvent::CheckinDisputeReverted => {
            let latest =
                handovers::latest_for_contract(pool, contract.id, HandoverKind::Checkin).await?;
            Ok(matches!(latest.map(|h| h.status), Some(HandoverStatus::Disputed)))
        }
    }
}

/// Whether the latest handover of the gating kind permits the coupled
/// transition. An unresolved (pending or disputed) handover always blocks.
/// With acknowledgment required, the absence of any handover record blocks
/// too; otherwise handovers are informational and absence permits.
fn handover_permits(latest: Option<HandoverStatus>, require_ack: bool) -> bool {
    match latest {
        Some(HandoverStatus::Disputed) | Some(HandoverStatus::Pending) => false,
        Some(HandoverStatus::Acknowledged) | Some(HandoverStatus::AutoConfirmed) => true,
        None => !require_ack,
    }
}

async fn notify_tenant(
    pool: &PgPool,
    contract: &Contract,
    event: &LifecycleEvent,
    flipped_invoices: u64,
) {
    let (title, message) = match event {
        LifecycleEvent::InvoiceOverdue => (
            "Payment overdue".to_string(),
            format!(
                "You have {flipped_invoices} overdue invoice(s) on your rental contract. \
                 Please settle them to keep your contract in good standing."
            ),
        ),
        LifecycleEvent::GraceElapsed { reason, .. } => (
            "Booking cancelled".to_string(),
            format!("Your booking was cancelled: {reason}"),
        ),
        LifecycleEvent::ArrearsCleared => (
            "Contract restored".to_string(),
            "All outstanding invoices are settled; your contract is active again.".to_string(),
        ),
        _ => return,
    };

    notifier::notify_user(
        pool,
        contract.tenant_id,
        &title,
        &message,
        Some("/tenant/invoices"),
        json!({ "contract_id": contract.id, "event": event.name() }),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContractStatus::*;

    fn start_event() -> LifecycleEvent {
        LifecycleEvent::StartDateReached {
            as_of: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        }
    }

    fn grace_event() -> LifecycleEvent {
        LifecycleEvent::GraceElapsed {
            reason: "unpaid".to_string(),
            grace_days: 3,
            min_outstanding: 0,
        }
    }

    #[test]
    fn activation_from_both_initial_states() {
        assert_eq!(next_status(PendingPayment, &start_event()), Some(Active));
        assert_eq!(next_status(Booked, &start_event()), Some(Active));
    }

    #[test]
    fn activation_is_idempotent_on_redelivery() {
        // Second delivery finds the contract already active: no transition.
        assert_eq!(next_status(Active, &start_event()), None);
        assert_eq!(next_status(Completed, &start_event()), None);
    }

    #[test]
    fn grace_cancellation_only_before_activation() {
        assert_eq!(next_status(PendingPayment, &grace_event()), Some(Cancelled));
        assert_eq!(next_status(Booked, &grace_event()), Some(Cancelled));
        assert_eq!(next_status(Active, &grace_event()), None);
    }

    #[test]
    fn overdue_flip_and_recovery() {
        assert_eq!(next_status(Active, &LifecycleEvent::InvoiceOverdue), Some(Overdue));
        assert_eq!(next_status(Overdue, &LifecycleEvent::InvoiceOverdue), None);
        assert_eq!(next_status(Overdue, &LifecycleEvent::ArrearsCleared), Some(Active));
        assert_eq!(next_status(Active, &LifecycleEvent::ArrearsCleared), None);
    }

    #[test]
    fn completion_paths() {
        assert_eq!(next_status(Active, &LifecycleEvent::TermEnded), Some(Completed));
        assert_eq!(next_status(Overdue, &LifecycleEvent::TermEnded), None);
        assert_eq!(
            next_status(Active, &LifecycleEvent::CheckoutConfirmed),
            Some(Completed)
        );
        assert_eq!(
            next_status(Overdue, &LifecycleEvent::CheckoutConfirmed),
            Some(Completed)
        );
    }

    #[test]
    fn terminal_states_stay_terminal_except_checkout_dispute() {
        for event in [
            start_event(),
            grace_event(),
            LifecycleEvent::InvoiceOverdue,
            LifecycleEvent::TermEnded,
            LifecycleEvent::CheckoutConfirmed,
            LifecycleEvent::ArrearsCleared,
        ] {
            assert_eq!(next_status(Completed, &event), None);
            assert_eq!(next_status(Cancelled, &event), None);
        }
        // The one sanctioned compensating transition out of COMPLETED.
        assert_eq!(
            next_status(Completed, &LifecycleEvent::CheckoutDisputeReverted),
            Some(Active)
        );
        assert_eq!(
            next_status(Cancelled, &LifecycleEvent::CheckoutDisputeReverted),
            None
        );
    }

    #[test]
    fn required_ack_blocks_without_a_handover_record() {
        // With acknowledgment required, a contract whose checkin (or
        // checkout) was never recorded must not transition automatically.
        assert!(!handover_permits(None, true));
        assert!(handover_permits(None, false));
    }

    #[test]
    fn unresolved_handovers_block_regardless_of_config() {
        for require_ack in [true, false] {
            assert!(!handover_permits(Some(HandoverStatus::Pending), require_ack));
            assert!(!handover_permits(Some(HandoverStatus::Disputed), require_ack));
        }
    }

    #[test]
    fn resolved_handovers_permit_regardless_of_config() {
        for require_ack in [true, false] {
            assert!(handover_permits(
                Some(HandoverStatus::Acknowledged),
                require_ack
            ));
            assert!(handover_permits(
                Some(HandoverStatus::AutoConfirmed),
                require_ack
            ));
        }
    }

    #[test]
    fn checkin_dispute_rewinds_activation() {
        assert_eq!(
            next_status(Active, &LifecycleEvent::CheckinDisputeReverted),
            Some(Booked)
        );
        assert_eq!(
            next_status(Booked, &LifecycleEvent::CheckinDisputeReverted),
            None
        );
    }
}
