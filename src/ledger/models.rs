use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use uuid::Uuid;

/// Subscription tier - drives the profit share rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Trader,
    Pro,
    Whale,
    /// Any tier string we do not recognise; billed at the most conservative rate
    Unknown,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Trader => "trader",
            SubscriptionTier::Pro => "pro",
            SubscriptionTier::Whale => "whale",
            SubscriptionTier::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => SubscriptionTier::Free,
            "trader" => SubscriptionTier::Trader,
            "pro" => SubscriptionTier::Pro,
            "whale" => SubscriptionTier::Whale,
            _ => SubscriptionTier::Unknown,
        }
    }
}

impl From<String> for SubscriptionTier {
    fn from(value: String) -> Self {
        SubscriptionTier::parse(&value)
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Cancelled,
    Suspended,
}

impl SubscriptionStatus {
    /// Map a gateway subscription status onto ours
    pub fn from_gateway(status: &str) -> Self {
        match status {
            "active" | "trialing" => SubscriptionStatus::Active,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" | "incomplete_expired" => SubscriptionStatus::Cancelled,
            "unpaid" => SubscriptionStatus::Suspended,
            _ => SubscriptionStatus::Active,
        }
    }
}

/// Account entity (the subset of the user record settlement cares about)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    #[sqlx(try_from = "String")]
    pub subscription_tier: SubscriptionTier,
    pub subscription_status: SubscriptionStatus,
    /// External billing identity, created lazily on first invoice
    pub billing_customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn is_active(&self) -> bool {
        self.subscription_status == SubscriptionStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "snapshot_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Periodic,
    Deposit,
    Withdrawal,
    PeriodStart,
    PeriodEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transaction_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transaction_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Capital movement - a deposit or withdrawal
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: TransactionKind,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

/// Closed-trade statistics for a window (informational only)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeStats {
    pub total: u32,
    pub wins: u32,
    pub losses: u32,
}

impl TradeStats {
    /// Win rate as a percentage (0-100)
    pub fn win_rate(&self) -> Decimal {
        if self.total == 0 {
            return Decimal::ZERO;
        }
        (Decimal::from(self.wins) / Decimal::from(self.total) * Decimal::ONE_HUNDRED).round_dp(2)
    }
}

/// Settlement status state machine
///
/// pending -> invoiced -> paid | failed, failed -> invoiced, pending -> waived.
/// Nothing ever returns to pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "settlement_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    Pending,
    Invoiced,
    Paid,
    Failed,
    Waived,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "pending",
            SettlementStatus::Invoiced => "invoiced",
            SettlementStatus::Paid => "paid",
            SettlementStatus::Failed => "failed",
            SettlementStatus::Waived => "waived",
        }
    }

    pub fn all() -> [SettlementStatus; 5] {
        [
            SettlementStatus::Pending,
            SettlementStatus::Invoiced,
            SettlementStatus::Paid,
            SettlementStatus::Failed,
            SettlementStatus::Waived,
        ]
    }

    /// The only transitions a persisted period may take
    pub fn can_transition_to(self, next: SettlementStatus) -> bool {
        use SettlementStatus::*;
        matches!(
            (self, next),
            (Pending, Invoiced)
                | (Invoiced, Paid)
                | (Invoiced, Failed)
                | (Failed, Invoiced)
                | (Pending, Waived)
        )
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted record of one accounting run for one account and one window.
/// Immutable except for `status` and `invoice_id`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SettlementPeriod {
    pub id: Uuid,
    pub account_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub starting_balance: Decimal,
    pub ending_balance: Decimal,
    pub deposits: Decimal,
    pub withdrawals: Decimal,
    pub gross_profit: Decimal,
    /// Carry consumed from the prior period
    pub loss_carry_consumed: Decimal,
    /// Carry generated by this period, seeds the next one
    pub loss_carryforward: Decimal,
    pub net_profit: Decimal,
    pub previous_high_water_mark: Decimal,
    pub high_water_mark: Decimal,
    pub profit_above_hwm: Decimal,
    pub profit_share_rate: Decimal,
    pub profit_share_due: Decimal,
    pub degraded: bool,
    pub status: SettlementStatus,
    pub invoice_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for a new settlement period
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSettlementPeriod {
    pub account_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub starting_balance: Decimal,
    pub ending_balance: Decimal,
    pub deposits: Decimal,
    pub withdrawals: Decimal,
    pub gross_profit: Decimal,
    pub loss_carry_consumed: Decimal,
    pub loss_carryforward: Decimal,
    pub net_profit: Decimal,
    pub previous_high_water_mark: Decimal,
    pub high_water_mark: Decimal,
    pub profit_above_hwm: Decimal,
    pub profit_share_rate: Decimal,
    pub profit_share_due: Decimal,
    pub degraded: bool,
    pub status: SettlementStatus,
}

impl NewSettlementPeriod {
    /// Materialise the persisted row (used by stores that assign ids themselves)
    pub fn into_period(self, id: Uuid, now: DateTime<Utc>) -> SettlementPeriod {
        SettlementPeriod {
            id,
            account_id: self.account_id,
            period_start: self.period_start,
            period_end: self.period_end,
            starting_balance: self.starting_balance,
            ending_balance: self.ending_balance,
            deposits: self.deposits,
            withdrawals: self.withdrawals,
            gross_profit: self.gross_profit,
            loss_carry_consumed: self.loss_carry_consumed,
            loss_carryforward: self.loss_carryforward,
            net_profit: self.net_profit,
            previous_high_water_mark: self.previous_high_water_mark,
            high_water_mark: self.high_water_mark,
            profit_above_hwm: self.profit_above_hwm,
            profit_share_rate: self.profit_share_rate,
            profit_share_due: self.profit_share_due,
            degraded: self.degraded,
            status: self.status,
            invoice_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Platform-wide settlement totals
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformStats {
    pub period_count: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_due: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_paid: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_outstanding: Decimal,
}
