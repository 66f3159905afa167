use chrono::{Days, NaiveDate};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::dates::{add_months, days_inclusive};
use crate::error::AppError;
use crate::models::{BillingPeriod, Contract, ContractStatus, NewContract};
use crate::repository::contracts;
use crate::services::state_machine::{self, Applied, LifecycleEvent};
use crate::services::{audit, notifier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    Renewed { successor_id: Uuid },
    Skipped,
}

/// What the renewal engine should do for a contract, decided against the
/// contract's own row and the future contracts already on its (tenant,
/// room). Creating the successor is separate from completing the old term,
/// so a retry after a partial failure re-plans from current state.
#[derive(Debug, Clone, PartialEq)]
pub enum RenewalPlan {
    /// Not active, or auto-renewal disabled.
    NotEligible,
    /// A successor already exists; repeated sweeps must not stack chains.
    AlreadyRenewed,
    Create(NewContract),
}

pub fn plan_renewal(
    contract: &Contract,
    future: &[Contract],
    deposit_rollover: bool,
) -> RenewalPlan {
    if contract.status != ContractStatus::Active || !contract.auto_renew {
        return RenewalPlan::NotEligible;
    }

    let renewal_start = contract.end_date + Days::new(1);
    if future.iter().any(|c| c.start_date >= renewal_start) {
        return RenewalPlan::AlreadyRenewed;
    }

    // Re-measure the old term in its own cadence instead of copying
    // duration_count, so irregular original terms renew to a regular span.
    let duration = derive_duration(
        contract.billing_period,
        contract.start_date,
        contract.end_date,
    );
    let new_end = term_end(contract.billing_period, renewal_start, duration);

    let deposit_amount = if deposit_rollover {
        // Deposit carried over from the old contract.
        0
    } else {
        contract.deposit_amount
    };

    RenewalPlan::Create(NewContract {
        tenant_id: contract.tenant_id,
        room_id: contract.room_id,
        status: ContractStatus::Booked,
        billing_period: contract.billing_period,
        duration_count: duration,
        start_date: renewal_start,
        end_date: new_end,
        rent_amount: contract.rent_amount,
        deposit_amount,
        auto_renew: contract.auto_renew,
        notes: Some(format!("auto-renewal of contract {}", contract.id)),
    })
}

/// Create a successor contract for an expiring auto-renew contract. This
/// only creates the successor; completing the old contract is owned by
/// [`complete_ended`], so a crash between the two converges on retry.
pub async fn auto_renew(
    pool: &PgPool,
    contract_id: Uuid,
    cfg: &BillingConfig,
) -> Result<RenewalOutcome, AppError> {
    let Some(contract) = contracts::get(pool, contract_id).await? else {
        tracing::warn!(
            contract_id = %contract_id,
            missing_entity = true,
            "contract not found for renewal; treating as already handled"
        );
        return Ok(RenewalOutcome::Skipped);
    };

    let renewal_start = contract.end_date + Days::new(1);
    let future =
        contracts::future_for_room(pool, contract.tenant_id, contract.room_id, renewal_start)
            .await?;

    let new = match plan_renewal(&contract, &future, cfg.deposit_rollover) {
        RenewalPlan::NotEligible => {
            tracing::debug!(
                contract_id = %contract_id,
                status = contract.status.as_str(),
                auto_renew = contract.auto_renew,
                "contract not eligible for renewal; no-op"
            );
            return Ok(RenewalOutcome::Skipped);
        }
        RenewalPlan::AlreadyRenewed => {
            tracing::debug!(
                contract_id = %contract_id,
                "successor contract already exists; skipping renewal"
            );
            return Ok(RenewalOutcome::Skipped);
        }
        RenewalPlan::Create(new) => new,
    };

    let successor = contracts::insert(pool, &new).await?;

    audit::write_audit_log(
        pool,
        "contract",
        contract.id,
        "auto_renewed",
        "term ended with auto_renew enabled",
        json!({
            "successor_id": successor.id,
            "renewal_start": new.start_date,
            "renewal_end": new.end_date,
            "duration_count": new.duration_count,
            "deposit_rollover": cfg.deposit_rollover,
        }),
    )
    .await;

    notifier::notify_user(
        pool,
        contract.tenant_id,
        "Contract renewed",
        &format!(
            "Your rental contract was renewed through {}.",
            new.end_date.format("%Y-%m-%d")
        ),
        Some("/tenant/contracts"),
        json!({ "contract_id": contract.id, "successor_id": successor.id }),
    )
    .await;

    tracing::info!(
        contract_id = %contract.id,
        successor_id = %successor.id,
        duration_count = new.duration_count,
        "contract auto-renewed"
    );

    Ok(RenewalOutcome::Renewed {
        successor_id: successor.id,
    })
}

/// Complete a contract whose term ended. Auto-renew contracts go through the
/// renewal engine first so the successor exists before the old contract's
/// terminal side effects run; the completion transition then applies
/// unconditionally, so a renewal that already happened (this run or an
/// earlier partial one) still ends the old term.
pub async fn complete_ended(
    pool: &PgPool,
    contract_id: Uuid,
    cfg: &BillingConfig,
) -> Result<Applied, AppError> {
    if let Some(contract) = contracts::get(pool, contract_id).await? {
        if contract.status == ContractStatus::Active && contract.auto_renew {
            auto_renew(pool, contract_id, cfg).await?;
        }
    }
    state_machine::apply(pool, contract_id, LifecycleEvent::TermEnded, cfg).await
}

/// Re-measure the elapsed span of `[start, end]` in the contract's cadence:
/// daily counts days inclusively, weekly rounds days up to whole weeks, and
/// monthly counts full month-to-month boundaries walked from the start.
pub fn derive_duration(period: BillingPeriod, start: NaiveDate, end: NaiveDate) -> i32 {
    let count = match period {
        BillingPeriod::Daily => days_inclusive(start, end),
        BillingPeriod::Weekly => (days_inclusive(start, end) + 6) / 7,
        BillingPeriod::Monthly => {
            let boundary = end + Days::new(1);
            let mut months = 0u32;
            while add_months(start, months + 1) <= boundary {
                months += 1;
            }
            i64::from(months)
        }
    };
    count.max(1) as i32
}

/// End date of a term of `count` cadence units starting at `start`.
pub fn term_end(period: BillingPeriod, start: NaiveDate, count: i32) -> NaiveDate {
    let count = count.max(1);
    match period {
        BillingPeriod::Daily => start + Days::new(count as u64 - 1),
        BillingPeriod::Weekly => start + Days::new(count as u64 * 7 - 1),
        BillingPeriod::Monthly => add_months(start, count as u32) - Days::new(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn ts() -> DateTime<Utc> {
        Utc::now()
    }

    fn contract(start: NaiveDate, end: NaiveDate) -> Contract {
        Contract {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            room_id: Uuid::new_v4(),
            status: ContractStatus::Active,
            billing_period: BillingPeriod::Monthly,
            duration_count: 3,
            start_date: start,
            end_date: end,
            rent_amount: 1_500_000,
            deposit_amount: 500_000,
            auto_renew: true,
            paid_in_full_at: None,
            notes: None,
            created_at: ts(),
            updated_at: ts(),
        }
    }

    #[test]
    fn plans_a_regular_successor() {
        let old = contract(d(2024, 1, 15), d(2024, 4, 14));
        let RenewalPlan::Create(new) = plan_renewal(&old, &[], true) else {
            panic!("expected a successor plan");
        };
        assert_eq!(new.start_date, d(2024, 4, 15));
        assert_eq!(new.end_date, d(2024, 7, 14));
        assert_eq!(new.duration_count, 3);
        assert_eq!(new.status, ContractStatus::Booked);
        assert_eq!(new.tenant_id, old.tenant_id);
        assert_eq!(new.room_id, old.room_id);
    }

    #[test]
    fn existing_successor_blocks_a_second_renewal() {
        // A redelivered sweep finds the successor a previous run created.
        let old = contract(d(2024, 1, 1), d(2024, 3, 31));
        let mut successor = contract(d(2024, 4, 1), d(2024, 6, 30));
        successor.status = ContractStatus::Booked;
        assert_eq!(
            plan_renewal(&old, &[successor], true),
            RenewalPlan::AlreadyRenewed
        );
    }

    #[test]
    fn earlier_future_contract_does_not_block() {
        // A contract starting before the renewal start is not a successor.
        let old = contract(d(2024, 1, 1), d(2024, 3, 31));
        let unrelated = contract(d(2024, 3, 1), d(2024, 3, 31));
        assert!(matches!(
            plan_renewal(&old, &[unrelated], true),
            RenewalPlan::Create(_)
        ));
    }

    #[test]
    fn non_renewing_contracts_are_not_planned() {
        let mut manual = contract(d(2024, 1, 1), d(2024, 3, 31));
        manual.auto_renew = false;
        assert_eq!(plan_renewal(&manual, &[], true), RenewalPlan::NotEligible);

        let mut completed = contract(d(2024, 1, 1), d(2024, 3, 31));
        completed.status = ContractStatus::Completed;
        assert_eq!(
            plan_renewal(&completed, &[], true),
            RenewalPlan::NotEligible
        );
    }

    #[test]
    fn deposit_rollover_zeroes_the_successor_deposit() {
        let old = contract(d(2024, 1, 1), d(2024, 3, 31));
        let RenewalPlan::Create(rolled) = plan_renewal(&old, &[], true) else {
            panic!("expected a successor plan");
        };
        assert_eq!(rolled.deposit_amount, 0);

        let RenewalPlan::Create(recharged) = plan_renewal(&old, &[], false) else {
            panic!("expected a successor plan");
        };
        assert_eq!(recharged.deposit_amount, 500_000);
    }

    #[test]
    fn monthly_duration_counts_month_boundaries() {
        // Three full month-equivalents: 01-15 .. 04-14.
        assert_eq!(
            derive_duration(BillingPeriod::Monthly, d(2024, 1, 15), d(2024, 4, 14)),
            3
        );
        assert_eq!(
            derive_duration(BillingPeriod::Monthly, d(2024, 1, 1), d(2024, 1, 31)),
            1
        );
        // Irregular term a few days longer than two months still renews as 2.
        assert_eq!(
            derive_duration(BillingPeriod::Monthly, d(2024, 1, 1), d(2024, 3, 3)),
            2
        );
    }

    #[test]
    fn weekly_duration_rounds_up() {
        assert_eq!(
            derive_duration(BillingPeriod::Weekly, d(2024, 6, 3), d(2024, 6, 9)),
            1
        );
        assert_eq!(
            derive_duration(BillingPeriod::Weekly, d(2024, 6, 3), d(2024, 6, 10)),
            2
        );
    }

    #[test]
    fn daily_duration_is_inclusive() {
        assert_eq!(
            derive_duration(BillingPeriod::Daily, d(2024, 6, 1), d(2024, 6, 1)),
            1
        );
        assert_eq!(
            derive_duration(BillingPeriod::Daily, d(2024, 6, 1), d(2024, 6, 14)),
            14
        );
    }

    #[test]
    fn term_end_mirrors_duration() {
        assert_eq!(
            term_end(BillingPeriod::Monthly, d(2024, 4, 15), 3),
            d(2024, 7, 14)
        );
        assert_eq!(term_end(BillingPeriod::Daily, d(2024, 6, 1), 14), d(2024, 6, 14));
        assert_eq!(term_end(BillingPeriod::Weekly, d(2024, 6, 3), 2), d(2024, 6, 16));
    }
}
