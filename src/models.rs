use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tabled::Tabled;

/// How a raw `amount * percentage / 100` value becomes a whole-unit reward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalculationMethod {
    /// Nearest integer, ties away from zero (half-up for positive values).
    Round,
    Floor,
    Ceil,
}

impl CalculationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalculationMethod::Round => "round",
            CalculationMethod::Floor => "floor",
            CalculationMethod::Ceil => "ceil",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "round" => Some(CalculationMethod::Round),
            "floor" => Some(CalculationMethod::Floor),
            "ceil" => Some(CalculationMethod::Ceil),
            _ => None,
        }
    }
}

/// Whether a rule rewards each transaction independently or the running
/// billing-cycle total (marginal calculation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaBasis {
    Transaction,
    Statement,
}

impl QuotaBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaBasis::Transaction => "transaction",
            QuotaBasis::Statement => "statement",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transaction" => Some(QuotaBasis::Transaction),
            "statement" => Some(QuotaBasis::Statement),
            _ => None,
        }
    }
}

/// When a rule's quota tracking rolls over to a fresh period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum RefreshPolicy {
    /// Quota never refreshes automatically.
    None,
    /// Refreshes on a fixed day of month (1-28).
    Monthly { day: u32 },
    /// One-shot refresh on a calendar date; terminal once passed.
    Date { on: NaiveDate },
    /// Refreshes once at the owning scheme's activity end date.
    Activity,
}

/// Which entity a tracking row accounts for. Scheme-scoped and
/// payment-method-scoped trackings never collide: the variant (and, for
/// scheme rows, the optional payment method the transaction also used) is
/// part of row identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrackingScope {
    Scheme {
        scheme_id: i64,
        /// Payment method the scheme transaction also went through, kept for
        /// per-method breakdowns. Matched null-vs-value, never ignored.
        payment_method_id: Option<i64>,
    },
    PaymentMethod {
        payment_method_id: i64,
    },
}

impl TrackingScope {
    pub fn scheme_id(&self) -> Option<i64> {
        match self {
            TrackingScope::Scheme { scheme_id, .. } => Some(*scheme_id),
            TrackingScope::PaymentMethod { .. } => None,
        }
    }

    pub fn payment_method_id(&self) -> Option<i64> {
        match self {
            TrackingScope::Scheme {
                payment_method_id, ..
            } => *payment_method_id,
            TrackingScope::PaymentMethod { payment_method_id } => Some(*payment_method_id),
        }
    }
}

/// Who owns a reward rule (exactly one of scheme / payment method).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RuleOwner {
    Scheme(i64),
    PaymentMethod(i64),
}

#[derive(Debug, Clone, Serialize)]
pub struct RewardRule {
    pub id: i64,
    pub owner: RuleOwner,
    pub percentage: f64,
    pub method: CalculationMethod,
    /// None = unlimited.
    pub quota_limit: Option<f64>,
    pub basis: QuotaBasis,
    pub refresh: RefreshPolicy,
    pub display_order: i64,
}

/// Mutable accounting state for one rule within its current refresh period.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaTracking {
    pub id: i64,
    pub scope: TrackingScope,
    pub rule_id: i64,
    /// System-computed reward accumulation since the last refresh.
    pub used_quota: f64,
    /// Sum of transaction amounts in the period; the prior base for
    /// statement-basis marginal rewards.
    pub current_amount: f64,
    /// Human-entered absolute correction, composing into remaining quota.
    pub manual_adjustment: f64,
    /// Derived: `max(0, limit - (used + manual))`, None when unlimited.
    pub remaining_quota: Option<f64>,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub next_refresh_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionRecord {
    pub id: i64,
    pub transaction_date: NaiveDate,
    pub amount: Option<i64>,
    pub scheme_id: Option<i64>,
    pub payment_method_id: Option<i64>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn display_opt<T: std::fmt::Display>(v: &Option<T>) -> String {
    match v {
        Some(v) => v.to_string(),
        None => "-".to_string(),
    }
}

/// One row of the aggregate quota view.
#[derive(Debug, Clone, Serialize, Tabled)]
pub struct QuotaSnapshotRow {
    pub name: String,
    #[tabled(display_with = "display_opt")]
    pub scheme_id: Option<i64>,
    #[tabled(display_with = "display_opt")]
    pub payment_method_id: Option<i64>,
    pub rule_id: i64,
    pub percentage: f64,
    pub used_quota: f64,
    pub manual_adjustment: f64,
    #[tabled(display_with = "display_opt")]
    pub remaining_quota: Option<f64>,
    pub current_amount: f64,
    /// Spend still available before the cap: remaining / percentage * 100.
    #[tabled(display_with = "display_opt")]
    pub reference_amount: Option<f64>,
    #[tabled(display_with = "display_opt")]
    pub next_refresh_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Tabled)]
pub struct RuleListRow {
    pub id: i64,
    pub owner: String,
    pub percentage: f64,
    pub method: String,
    #[tabled(display_with = "display_opt")]
    pub quota_limit: Option<f64>,
    pub basis: String,
    pub refresh: String,
}

#[derive(Debug, Clone, Serialize, Tabled)]
pub struct TransactionListRow {
    pub id: i64,
    pub transaction_date: NaiveDate,
    #[tabled(display_with = "display_opt")]
    pub amount: Option<i64>,
    pub scope_name: String,
    #[tabled(display_with = "display_opt")]
    pub note: Option<String>,
}
