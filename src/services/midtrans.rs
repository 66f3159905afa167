use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Asia::Jakarta;
use reqwest::Client;
use serde_json::{json, Value};
use sha2::{Digest, Sha512};

use crate::error::AppError;
use crate::models::PaymentStatus;

/// Fetch the authoritative transaction status for an order reference.
/// Transport and non-2xx responses propagate as errors so the queue's retry
/// policy governs redelivery; no local state is touched on failure.
pub async fn fetch_status(
    http: &Client,
    base_url: &str,
    server_key: &str,
    order_id: &str,
) -> Result<Value, AppError> {
    let response = http
        .get(format!("{base_url}/v2/{order_id}/status"))
        .basic_auth(server_key, Some(""))
        .send()
        .await
        .map_err(|e| {
            tracing::error!(order_id, error = %e, "Midtrans status request failed");
            AppError::Gateway(format!("Midtrans status request failed: {e}"))
        })?;

    let status = response.status();
    let body: Value = response
        .json()
        .await
        .unwrap_or(json!({"error": "failed to parse response"}));

    if status.is_success() {
        Ok(body)
    } else {
        let message = body
            .get("status_message")
            .and_then(Value::as_str)
            .unwrap_or("unknown Midtrans error");
        Err(AppError::Gateway(format!(
            "Midtrans status error ({status}): {message}"
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedStatus {
    pub status: PaymentStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub va_number: Option<String>,
    pub va_expiry: Option<DateTime<Utc>>,
}

/// Map a raw Midtrans transaction payload to the canonical payment status.
/// Returns `None` for transaction states this engine does not recognize, so
/// the caller can leave the payment untouched rather than guess.
pub fn map_status(raw: &Value) -> Option<MappedStatus> {
    let transaction_status = raw
        .get("transaction_status")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let fraud_status = raw
        .get("fraud_status")
        .and_then(Value::as_str)
        .unwrap_or("accept");

    let status = match transaction_status {
        "capture" => match fraud_status {
            "accept" => PaymentStatus::Completed,
            "challenge" => PaymentStatus::Review,
            _ => PaymentStatus::Rejected,
        },
        "settlement" => PaymentStatus::Completed,
        "pending" => PaymentStatus::Pending,
        "deny" => PaymentStatus::Rejected,
        "cancel" => PaymentStatus::Cancelled,
        "expire" => PaymentStatus::Failed,
        "refund" | "partial_refund" | "chargeback" => PaymentStatus::Cancelled,
        _ => return None,
    };

    let paid_at = raw
        .get("settlement_time")
        .and_then(Value::as_str)
        .and_then(parse_jakarta_time);

    let va_number = raw
        .get("va_numbers")
        .and_then(Value::as_array)
        .and_then(|vas| vas.first())
        .and_then(|va| va.get("va_number"))
        .and_then(Value::as_str)
        .or_else(|| raw.get("permata_va_number").and_then(Value::as_str))
        .map(ToOwned::to_owned);

    let va_expiry = raw
        .get("expiry_time")
        .and_then(Value::as_str)
        .and_then(parse_jakarta_time);

    Some(MappedStatus {
        status,
        paid_at,
        va_number,
        va_expiry,
    })
}

/// Midtrans timestamps are local Jakarta time without an offset.
fn parse_jakarta_time(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").ok()?;
    Jakarta
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Verify a Midtrans notification signature:
/// SHA-512 of `order_id + status_code + gross_amount + server_key`.
pub fn verify_signature(
    order_id: &str,
    status_code: &str,
    gross_amount: &str,
    server_key: &str,
    signature_key: &str,
) -> bool {
    let mut hasher = Sha512::new();
    hasher.update(order_id.as_bytes());
    hasher.update(status_code.as_bytes());
    hasher.update(gross_amount.as_bytes());
    hasher.update(server_key.as_bytes());
    let expected = hex_encode(&hasher.finalize());
    expected.eq_ignore_ascii_case(signature_key.trim())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Order reference used at the gateway when the payment predates reference
/// recording.
pub fn synthesize_order_id(payment_id: uuid::Uuid) -> String {
    format!("PAY-{payment_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn settlement_maps_to_completed_with_utc_paid_at() {
        let raw = json!({
            "transaction_status": "settlement",
            "settlement_time": "2024-06-01 14:30:00",
        });
        let mapped = map_status(&raw).unwrap();
        assert_eq!(mapped.status, PaymentStatus::Completed);
        // Jakarta is UTC+7.
        let expected = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(7, 30, 0)
            .unwrap()
            .and_utc();
        assert_eq!(mapped.paid_at, Some(expected));
    }

    #[test]
    fn capture_respects_fraud_status() {
        let accept = json!({"transaction_status": "capture", "fraud_status": "accept"});
        assert_eq!(map_status(&accept).unwrap().status, PaymentStatus::Completed);

        let challenge = json!({"transaction_status": "capture", "fraud_status": "challenge"});
        assert_eq!(map_status(&challenge).unwrap().status, PaymentStatus::Review);
    }

    #[test]
    fn terminal_failures_map_distinctly() {
        let deny = json!({"transaction_status": "deny"});
        assert_eq!(map_status(&deny).unwrap().status, PaymentStatus::Rejected);

        let expire = json!({"transaction_status": "expire"});
        assert_eq!(map_status(&expire).unwrap().status, PaymentStatus::Failed);

        let cancel = json!({"transaction_status": "cancel"});
        assert_eq!(map_status(&cancel).unwrap().status, PaymentStatus::Cancelled);
    }

    #[test]
    fn unknown_transaction_status_is_not_mapped() {
        let raw = json!({"transaction_status": "authorize"});
        assert!(map_status(&raw).is_none());
    }

    #[test]
    fn extracts_virtual_account_fields() {
        let raw = json!({
            "transaction_status": "pending",
            "va_numbers": [{"bank": "bca", "va_number": "1234567890"}],
            "expiry_time": "2024-06-02 23:59:59",
        });
        let mapped = map_status(&raw).unwrap();
        assert_eq!(mapped.status, PaymentStatus::Pending);
        assert_eq!(mapped.va_number.as_deref(), Some("1234567890"));
        assert!(mapped.va_expiry.is_some());

        let permata = json!({
            "transaction_status": "pending",
            "permata_va_number": "987654321",
        });
        assert_eq!(
            map_status(&permata).unwrap().va_number.as_deref(),
            Some("987654321")
        );
    }

    #[test]
    fn signature_verification_round_trip() {
        // sha512("PAY-42" + "200" + "1500000.00" + "test-server-key")
        let valid = "979b369826a63435691215df3a313a8541262e86c84de472c6c879527973980d\
                     6393d1b68e75390e58120e680cd555b114ef818415d4ace928e7a2450b1bb5e7";
        assert!(verify_signature(
            "PAY-42",
            "200",
            "1500000.00",
            "test-server-key",
            valid
        ));
        assert!(!verify_signature(
            "PAY-42",
            "200",
            "1500000.00",
            "other-key",
            valid
        ));
    }

    #[test]
    fn synthesized_order_id_is_prefixed() {
        let id = uuid::Uuid::nil();
        assert_eq!(
            synthesize_order_id(id),
            "PAY-00000000-0000-0000-0000-000000000000"
        );
    }
}
