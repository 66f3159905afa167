use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::AppError;
use crate::models::{HandoverKind, HandoverStatus, RoomHandover};
use crate::repository::handovers;
use crate::services::audit;
use crate::services::state_machine::{self, Applied, LifecycleEvent};

/// Record a checkin handover. When acknowledgement is not required the
/// handover auto-confirms and activation proceeds immediately; otherwise
/// activation waits for [`acknowledge`].
pub async fn record_checkin(
    pool: &PgPool,
    contract_id: Uuid,
    notes: Option<&str>,
    cfg: &BillingConfig,
) -> Result<RoomHandover, AppError> {
    let status = if cfg.require_checkin_ack {
        HandoverStatus::Pending
    } else {
        HandoverStatus::AutoConfirmed
    };
    let handover =
        handovers::insert(pool, contract_id, HandoverKind::Checkin, status, notes).await?;

    audit_handover(pool, &handover, "handover_recorded").await;

    if status == HandoverStatus::AutoConfirmed {
        state_machine::apply(
            pool,
            contract_id,
            LifecycleEvent::StartDateReached {
                as_of: Utc::now().date_naive(),
            },
            cfg,
        )
        .await?;
    }

    Ok(handover)
}

/// Record a checkout handover. Auto-confirmation completes the contract on
/// the spot; a required acknowledgement leaves completion to [`acknowledge`]
/// or to the scheduled term-end sweep.
pub async fn record_checkout(
    pool: &PgPool,
    contract_id: Uuid,
    notes: Option<&str>,
    cfg: &BillingConfig,
) -> Result<RoomHandover, AppError> {
    let status = if cfg.require_checkout_ack {
        HandoverStatus::Pending
    } else {
        HandoverStatus::AutoConfirmed
    };
    let handover =
        handovers::insert(pool, contract_id, HandoverKind::Checkout, status, notes).await?;

    audit_handover(pool, &handover, "handover_recorded").await;

    if status == HandoverStatus::AutoConfirmed {
        state_machine::apply(pool, contract_id, LifecycleEvent::CheckoutConfirmed, cfg).await?;
    }

    Ok(handover)
}

/// Acknowledge a pending handover and drive the coupled transition.
pub async fn acknowledge(
    pool: &PgPool,
    handover_id: Uuid,
    cfg: &BillingConfig,
) -> Result<Applied, AppError> {
    let Some(handover) = handovers::get(pool, handover_id).await? else {
        return Err(AppError::NotFound("handover not found".to_string()));
    };

    if handover.status != HandoverStatus::Pending {
        tracing::debug!(
            handover_id = %handover_id,
            status = ?handover.status,
            "handover not pending; acknowledgement is a no-op"
        );
        return Ok(Applied::Skipped);
    }

    handovers::set_status(pool, handover.id, HandoverStatus::Acknowledged, Some(Utc::now()))
        .await?;
    audit_handover(pool, &handover, "handover_acknowledged").await;

    match handover.kind {
        HandoverKind::Checkin => {
            state_machine::apply(
                pool,
                handover.contract_id,
                LifecycleEvent::StartDateReached {
                    as_of: Utc::now().date_naive(),
                },
                cfg,
            )
            .await
        }
        HandoverKind::Checkout => {
            state_machine::apply(
                pool,
                handover.contract_id,
                LifecycleEvent::CheckoutConfirmed,
                cfg,
            )
            .await
        }
    }
}

/// Dispute a handover. Disputing an auto-confirmed handover reverts the
/// transition it drove; disputing a pending one simply blocks it.
pub async fn dispute(
    pool: &PgPool,
    handover_id: Uuid,
    reason: Option<&str>,
    cfg: &BillingConfig,
) -> Result<Applied, AppError> {
    let Some(handover) = handovers::get(pool, handover_id).await? else {
        return Err(AppError::NotFound("handover not found".to_string()));
    };

    if handover.status == HandoverStatus::Disputed {
        tracing::debug!(handover_id = %handover_id, "handover already disputed; no-op");
        return Ok(Applied::Skipped);
    }

    let was_confirmed = matches!(
        handover.status,
        HandoverStatus::AutoConfirmed | HandoverStatus::Acknowledged
    );

    handovers::set_status(pool, handover.id, HandoverStatus::Disputed, Some(Utc::now())).await?;
    audit::write_audit_log(
        pool,
        "room_handover",
        handover.id,
        "handover_disputed",
        reason.unwrap_or("disputed by tenant"),
        json!({ "contract_id": handover.contract_id, "kind": handover.kind.as_str() }),
    )
    .await;

    if !was_confirmed {
        return Ok(Applied::Skipped);
    }

    match handover.kind {
        HandoverKind::Checkin => {
            state_machine::apply(
                pool,
                handover.contract_id,
                LifecycleEvent::CheckinDisputeReverted,
                cfg,
            )
            .await
        }
        HandoverKind::Checkout => {
            state_machine::apply(
                pool,
                handover.contract_id,
                LifecycleEvent::CheckoutDisputeReverted,
                cfg,
            )
            .await
        }
    }
}

async fn audit_handover(pool: &PgPool, handover: &RoomHandover, action: &str) {
    audit::write_audit_log(
        pool,
        "room_handover",
        handover.id,
        action,
        handover.kind.as_str(),
        json!({
            "contract_id": handover.contract_id,
            "kind": handover.kind.as_str(),
            "status": handover.status.as_str(),
        }),
    )
    .await;
}
