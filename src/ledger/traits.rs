use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::AppResult;
use crate::ledger::models::*;

/// Read side of the trading ledger: balances, capital movements, trades
#[async_trait]
pub trait LedgerReader: Send + Sync {
    /// Total equity from the latest snapshot at or before `at`, if any
    async fn get_balance_near(&self, account_id: Uuid, at: DateTime<Utc>) -> AppResult<Option<Decimal>>;

    async fn get_transactions(
        &self,
        account_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<Vec<Transaction>>;

    async fn get_trade_stats(
        &self,
        account_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<TradeStats>;

    /// Current (balance, unrealized P&L) used for periodic snapshots
    async fn get_current_equity(&self, account_id: Uuid) -> AppResult<Option<(Decimal, Decimal)>>;

    /// Rebuild a balance from trade history. Most ledgers cannot.
    async fn replay_balance(&self, _account_id: Uuid, _at: DateTime<Utc>) -> AppResult<Option<Decimal>> {
        Ok(None)
    }
}

/// Persistence of settlement periods and balance snapshots
#[async_trait]
pub trait SettlementStore: Send + Sync {
    async fn get_active_accounts(&self) -> AppResult<Vec<Account>>;

    /// Latest non-degraded period for the account whose window ended at or before `before`
    async fn get_latest_settlement_period(
        &self,
        account_id: Uuid,
        before: DateTime<Utc>,
    ) -> AppResult<Option<SettlementPeriod>>;

    async fn find_settlement_period(
        &self,
        account_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> AppResult<Option<SettlementPeriod>>;

    async fn get_settlement_period(&self, period_id: Uuid) -> AppResult<Option<SettlementPeriod>>;

    async fn create_settlement_period(&self, period: &NewSettlementPeriod) -> AppResult<Uuid>;

    /// Guarded status write: rejects any transition outside the allowed table
    async fn update_settlement_status(
        &self,
        period_id: Uuid,
        status: SettlementStatus,
        invoice_id: Option<&str>,
    ) -> AppResult<()>;

    /// Non-degraded pending periods with something due
    async fn get_pending_settlement_periods(&self) -> AppResult<Vec<SettlementPeriod>>;

    async fn get_settlement_periods_by_status(&self, status: SettlementStatus) -> AppResult<Vec<SettlementPeriod>>;

    async fn get_account_settlement_history(&self, account_id: Uuid, limit: i64) -> AppResult<Vec<SettlementPeriod>>;

    async fn get_platform_stats(&self) -> AppResult<PlatformStats>;

    async fn create_balance_snapshot(
        &self,
        account_id: Uuid,
        kind: SnapshotKind,
        total_balance: Decimal,
        unrealized_pnl: Decimal,
    ) -> AppResult<Uuid>;
}

/// Account lookups and the billing-related account writes
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(&self, account_id: Uuid) -> AppResult<Option<Account>>;

    async fn get_account_by_customer_id(&self, customer_id: &str) -> AppResult<Option<Account>>;

    async fn set_billing_customer_id(&self, account_id: Uuid, customer_id: &str) -> AppResult<()>;

    async fn update_subscription_status(&self, account_id: Uuid, status: SubscriptionStatus) -> AppResult<()>;

    async fn update_subscription_tier(&self, account_id: Uuid, tier: SubscriptionTier) -> AppResult<()>;
}
