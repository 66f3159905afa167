use chrono::NaiveDate;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::dates::{month_end, month_start, next_month_start};
use crate::error::AppError;
use crate::models::{BillingPeriod, Contract, Invoice, LineItem};
use crate::repository::invoices::{self, NewInvoice};
use crate::repository::contracts;
use crate::services::{audit, pricing};

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct GenerationOutcome {
    pub created: u32,
    pub skipped_existing: u32,
}

/// Ensure every calendar month from the last issued invoice up to
/// `target_month` is covered by exactly one non-cancelled invoice.
///
/// Each missing month is created as its own atomic step: a failure aborts
/// the remaining months but leaves already-created ones committed, and the
/// next catch-up run resumes where this one stopped.
pub async fn generate_monthly_invoices(
    pool: &PgPool,
    contract_id: Uuid,
    target_month: NaiveDate,
    cfg: &BillingConfig,
) -> Result<GenerationOutcome, AppError> {
    let mut outcome = GenerationOutcome::default();

    let Some(contract) = contracts::get(pool, contract_id).await? else {
        tracing::warn!(
            contract_id = %contract_id,
            missing_entity = true,
            "contract not found for invoice generation; treating as already handled"
        );
        return Ok(outcome);
    };

    if contract.status.is_terminal() {
        tracing::debug!(contract_id = %contract_id, "contract terminal; no invoices to generate");
        return Ok(outcome);
    }

    // Non-monthly contracts get a single full-term invoice at creation time
    // and never accrue periodic ones.
    if contract.billing_period != BillingPeriod::Monthly {
        tracing::debug!(contract_id = %contract_id, "non-monthly contract; skipping");
        return Ok(outcome);
    }

    let existing = invoices::list_non_cancelled(pool, contract.id).await?;

    if existing.is_empty() {
        if contract.paid_in_full_at.is_some() {
            tracing::debug!(contract_id = %contract_id, "contract pre-paid in full; skipping");
            return Ok(outcome);
        }
        create_initial_invoice(pool, &contract, cfg).await?;
        outcome.created += 1;
        return Ok(outcome);
    }

    let plan = plan_missing_periods(&contract, &existing, target_month);
    outcome.skipped_existing = plan.skipped_existing;

    for (period_start, period_end) in plan.periods {
        let priced = pricing::price_period(
            contract.rent_amount,
            period_start,
            period_end,
            cfg.prorata,
        );
        let invoice = create_invoice(pool, &contract, period_start, period_end, priced.amount, priced.line_items)
            .await?;
        outcome.created += 1;
        tracing::info!(
            contract_id = %contract.id,
            invoice_id = %invoice.id,
            number = %invoice.number,
            period_start = %period_start,
            period_end = %period_end,
            amount = invoice.amount,
            "invoice generated"
        );
    }

    Ok(outcome)
}

struct CatchupPlan {
    periods: Vec<(NaiveDate, NaiveDate)>,
    skipped_existing: u32,
}

/// Walk month starts from the day after the latest non-cancelled invoice
/// (or the contract's start month when none exists) up to `target_month`,
/// skipping any month already covered by an existing invoice range. The
/// overlap check is what makes concurrent catch-up runs safe.
fn plan_missing_periods(
    contract: &Contract,
    existing: &[Invoice],
    target_month: NaiveDate,
) -> CatchupPlan {
    let target = month_start(target_month);
    let mut periods = Vec::new();
    let mut skipped_existing = 0u32;

    let mut expected_start = match existing.iter().map(|i| i.period_end).max() {
        Some(latest_end) => month_start(latest_end + chrono::Days::new(1)),
        None => month_start(contract.start_date),
    };

    while expected_start <= target && expected_start <= contract.end_date {
        let window_end = month_end(expected_start);
        let covered = existing
            .iter()
            .any(|i| i.period_start <= window_end && i.period_end >= expected_start);

        if covered {
            skipped_existing += 1;
        } else {
            let period_start = expected_start.max(contract.start_date);
            let period_end = window_end.min(contract.end_date);
            periods.push((period_start, period_end));
        }

        expected_start = next_month_start(expected_start);
    }

    CatchupPlan {
        periods,
        skipped_existing,
    }
}

/// First invoice of a contract: first (possibly partial) month of rent plus
/// the security deposit.
async fn create_initial_invoice(
    pool: &PgPool,
    contract: &Contract,
    cfg: &BillingConfig,
) -> Result<Invoice, AppError> {
    let period_start = contract.start_date;
    let period_end = month_end(contract.start_date).min(contract.end_date);

    let priced = pricing::price_period(contract.rent_amount, period_start, period_end, cfg.prorata);
    let mut line_items = priced.line_items;
    let mut amount = priced.amount;
    if let Some(deposit) = pricing::deposit_line(contract.deposit_amount) {
        amount += deposit.amount;
        line_items.push(deposit);
    }

    let invoice = create_invoice(pool, contract, period_start, period_end, amount, line_items).await?;
    tracing::info!(
        contract_id = %contract.id,
        invoice_id = %invoice.id,
        number = %invoice.number,
        amount = invoice.amount,
        "initial invoice generated"
    );
    Ok(invoice)
}

async fn create_invoice(
    pool: &PgPool,
    contract: &Contract,
    period_start: NaiveDate,
    period_end: NaiveDate,
    amount: i64,
    line_items: Vec<LineItem>,
) -> Result<Invoice, AppError> {
    let new = NewInvoice {
        contract_id: contract.id,
        number: invoice_number(period_start),
        period_start,
        period_end,
        due_date: period_start,
        amount,
        line_items: serde_json::to_value(&line_items).unwrap_or_else(|_| json!([])),
    };
    let invoice = invoices::insert(pool, &new).await?;

    audit::write_audit_log(
        pool,
        "invoice",
        invoice.id,
        "invoice_generated",
        "periodic billing",
        json!({
            "contract_id": contract.id,
            "period_start": period_start,
            "period_end": period_end,
            "amount": amount,
        }),
    )
    .await;

    Ok(invoice)
}

fn invoice_number(period_start: NaiveDate) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("INV/{}/{}", period_start.format("%Y%m"), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use crate::models::{BillingPeriod, ContractStatus, InvoiceStatus};

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
            duration_count: 6,
            start_date: start,
            end_date: end,
            rent_amount: 1_500_000,
            deposit_amount: 500_000,
            auto_renew: false,
            paid_in_full_at: None,
            notes: None,
            created_at: ts(),
            updated_at: ts(),
        }
    }

    fn invoice(contract_id: Uuid, start: NaiveDate, end: NaiveDate) -> Invoice {
        Invoice {
            id: Uuid::new_v4(),
            contract_id,
            number: format!("INV/{}/test", start.format("%Y%m")),
            period_start: start,
            period_end: end,
            due_date: start,
            amount: 1_500_000,
            status: InvoiceStatus::Pending,
            line_items: json!([]),
            issued_at: ts(),
            paid_at: None,
        }
    }

    #[test]
    fn fully_invoiced_contract_plans_nothing() {
        let c = contract(d(2024, 1, 1), d(2024, 6, 30));
        let existing = vec![
            invoice(c.id, d(2024, 1, 1), d(2024, 1, 31)),
            invoice(c.id, d(2024, 2, 1), d(2024, 2, 29)),
            invoice(c.id, d(2024, 3, 1), d(2024, 3, 31)),
        ];
        let plan = plan_missing_periods(&c, &existing, d(2024, 3, 1));
        assert!(plan.periods.is_empty());
    }

    #[test]
    fn catches_up_all_intervening_months() {
        let c = contract(d(2024, 1, 1), d(2024, 12, 31));
        let existing = vec![invoice(c.id, d(2024, 1, 1), d(2024, 1, 31))];
        let plan = plan_missing_periods(&c, &existing, d(2024, 4, 1));
        assert_eq!(
            plan.periods,
            vec![
                (d(2024, 2, 1), d(2024, 2, 29)),
                (d(2024, 3, 1), d(2024, 3, 31)),
                (d(2024, 4, 1), d(2024, 4, 30)),
            ]
        );
    }

    #[test]
    fn overlapping_invoice_blocks_regeneration() {
        // A racing catch-up already created February; only March is missing.
        let c = contract(d(2024, 1, 1), d(2024, 12, 31));
        let existing = vec![
            invoice(c.id, d(2024, 1, 1), d(2024, 1, 31)),
            invoice(c.id, d(2024, 2, 1), d(2024, 2, 29)),
        ];
        let plan = plan_missing_periods(&c, &existing, d(2024, 3, 1));
        assert_eq!(plan.periods, vec![(d(2024, 3, 1), d(2024, 3, 31))]);
    }

    #[test]
    fn never_plans_past_contract_end() {
        let c = contract(d(2024, 1, 1), d(2024, 2, 15));
        let existing = vec![invoice(c.id, d(2024, 1, 1), d(2024, 1, 31))];
        let plan = plan_missing_periods(&c, &existing, d(2024, 6, 1));
        // The final partial month is clamped to the contract end.
        assert_eq!(plan.periods, vec![(d(2024, 2, 1), d(2024, 2, 15))]);
    }

    #[test]
    fn partial_final_month_is_clamped_both_sides() {
        let c = contract(d(2024, 1, 10), d(2024, 3, 9));
        let existing = vec![
            invoice(c.id, d(2024, 1, 10), d(2024, 1, 31)),
            invoice(c.id, d(2024, 2, 1), d(2024, 2, 29)),
        ];
        let plan = plan_missing_periods(&c, &existing, d(2024, 3, 1));
        assert_eq!(plan.periods, vec![(d(2024, 3, 1), d(2024, 3, 9))]);
    }

    #[test]
    fn invoice_number_embeds_period_month() {
        let number = invoice_number(d(2024, 3, 1));
        assert!(number.starts_with("INV/202403/"));
    }
}
