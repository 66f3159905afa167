use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Canonical contract lifecycle states. The transition table lives in
/// `services::state_machine`; nothing else mutates `Contract::status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum ContractStatus {
    PendingPayment,
    Booked,
    Active,
    Overdue,
    Completed,
    Cancelled,
}

impl ContractStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingPayment => "pending_payment",
            Self::Booked => "booked",
            Self::Active => "active",
            Self::Overdue => "overdue",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum BillingPeriod {
    Daily,
    Weekly,
    Monthly,
}

impl BillingPeriod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Overdue,
    Paid,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum PaymentStatus {
    Review,
    Pending,
    Completed,
    Failed,
    Rejected,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Review => "review",
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    /// A payment in a terminal state is never polled again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Rejected | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum RoomStatus {
    Vacant,
    Reserved,
    Occupied,
    Maintenance,
    Inactive,
}

impl RoomStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vacant => "vacant",
            Self::Reserved => "reserved",
            Self::Occupied => "occupied",
            Self::Maintenance => "maintenance",
            Self::Inactive => "inactive",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Contract {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub room_id: Uuid,
    pub status: ContractStatus,
    pub billing_period: BillingPeriod,
    pub duration_count: i32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub rent_amount: i64,
    pub deposit_amount: i64,
    pub auto_renew: bool,
    pub paid_in_full_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating a successor contract during auto-renewal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContract {
    pub tenant_id: Uuid,
    pub room_id: Uuid,
    pub status: ContractStatus,
    pub billing_period: BillingPeriod,
    pub duration_count: i32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub rent_amount: i64,
    pub deposit_amount: i64,
    pub auto_renew: bool,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub contract_id: Uuid,
    pub number: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub due_date: NaiveDate,
    pub amount: i64,
    pub status: InvoiceStatus,
    pub line_items: Value,
    pub issued_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// One priced component of an invoice, stored in the JSONB `line_items`
/// column. Amounts are IDR minor units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub code: String,
    pub label: String,
    pub amount: i64,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub meta: Value,
}

impl LineItem {
    pub fn new(code: &str, label: &str, amount: i64) -> Self {
        Self {
            code: code.to_string(),
            label: label.to_string(),
            amount,
            meta: Value::Null,
        }
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = meta;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub method: String,
    pub status: PaymentStatus,
    pub amount: i64,
    pub provider: Option<String>,
    pub reference: Option<String>,
    pub meta: Value,
    pub paid_at: Option<DateTime<Utc>>,
    pub virtual_account_number: Option<String>,
    pub virtual_account_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Room {
    pub id: Uuid,
    pub code: String,
    pub status: RoomStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum HandoverKind {
    Checkin,
    Checkout,
}

impl HandoverKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Checkin => "checkin",
            Self::Checkout => "checkout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum HandoverStatus {
    Pending,
    Acknowledged,
    AutoConfirmed,
    Disputed,
}

impl HandoverStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Acknowledged => "acknowledged",
            Self::AutoConfirmed => "auto_confirmed",
            Self::Disputed => "disputed",
        }
    }
}

/// Physical room handover record (move-in / move-out). Depending on
/// configuration these either gate lifecycle transitions or are purely
/// informational; see `services::handover`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RoomHandover {
    pub id: Uuid,
    pub contract_id: Uuid,
    pub kind: HandoverKind,
    pub status: HandoverStatus,
    pub notes: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}
