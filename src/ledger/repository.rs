use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use super::models::*;
use super::traits::{AccountStore, LedgerReader, SettlementStore};
use crate::error::{AppError, AppResult, SettlementError};

const PERIOD_COLUMNS: &str = r#"
    id, account_id, period_start, period_end, starting_balance, ending_balance,
    deposits, withdrawals, gross_profit, loss_carry_consumed, loss_carryforward,
    net_profit, previous_high_water_mark, high_water_mark, profit_above_hwm,
    profit_share_rate, profit_share_due, degraded, status, invoice_id,
    created_at, updated_at
"#;

const ACCOUNT_COLUMNS: &str = r#"
    id, email, name, subscription_tier, subscription_status, billing_customer_id, created_at
"#;

/// Ledger repository - PostgreSQL implementation of every settlement collaborator
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// ========== LEDGER READS ==========

#[async_trait]
impl LedgerReader for LedgerRepository {
    async fn get_balance_near(&self, account_id: Uuid, at: DateTime<Utc>) -> AppResult<Option<Decimal>> {
        let balance = sqlx::query_scalar::<_, Decimal>(
            r#"
            SELECT total_balance
            FROM balance_snapshots
            WHERE account_id = $1 AND created_at <= $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(account_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Ledger(format!("balance snapshot read: {}", e)))?;

        Ok(balance)
    }

    async fn get_transactions(
        &self,
        account_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<Vec<Transaction>> {
        let transactions = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT id, account_id, kind, amount, status, created_at
            FROM account_transactions
            WHERE account_id = $1 AND created_at >= $2 AND created_at < $3
            ORDER BY created_at ASC
            "#,
        )
        .bind(account_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Ledger(format!("transaction read: {}", e)))?;

        Ok(transactions)
    }

    async fn get_trade_stats(
        &self,
        account_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<TradeStats> {
        let (total, wins): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE realized_pnl > 0) AS wins
            FROM trades
            WHERE account_id = $1
              AND UPPER(status) = 'CLOSED'
              AND exit_time >= $2 AND exit_time < $3
            "#,
        )
        .bind(account_id)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Ledger(format!("trade stats read: {}", e)))?;

        let total = u32::try_from(total).unwrap_or(u32::MAX);
        let wins = u32::try_from(wins).unwrap_or(u32::MAX).min(total);

        Ok(TradeStats {
            total,
            wins,
            losses: total - wins,
        })
    }

    async fn get_current_equity(&self, account_id: Uuid) -> AppResult<Option<(Decimal, Decimal)>> {
        let equity = sqlx::query_as::<_, (Decimal, Decimal)>(
            r#"
            SELECT total_balance, unrealized_pnl
            FROM account_equity
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Ledger(format!("equity read: {}", e)))?;

        Ok(equity)
    }
}

// ========== SETTLEMENT PERIODS ==========

#[async_trait]
impl SettlementStore for LedgerRepository {
    async fn get_active_accounts(&self) -> AppResult<Vec<Account>> {
        let accounts = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE subscription_status = 'active' ORDER BY created_at ASC",
            ACCOUNT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(accounts)
    }

    async fn get_latest_settlement_period(
        &self,
        account_id: Uuid,
        before: DateTime<Utc>,
    ) -> AppResult<Option<SettlementPeriod>> {
        let period = sqlx::query_as::<_, SettlementPeriod>(&format!(
            r#"
            SELECT {}
            FROM settlement_periods
            WHERE account_id = $1 AND period_end <= $2 AND degraded = FALSE
            ORDER BY period_end DESC
            LIMIT 1
            "#,
            PERIOD_COLUMNS
        ))
        .bind(account_id)
        .bind(before)
        .fetch_optional(&self.pool)
        .await?;

        Ok(period)
    }

    async fn find_settlement_period(
        &self,
        account_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> AppResult<Option<SettlementPeriod>> {
        let period = sqlx::query_as::<_, SettlementPeriod>(&format!(
            r#"
            SELECT {}
            FROM settlement_periods
            WHERE account_id = $1 AND period_start = $2 AND period_end = $3
            "#,
            PERIOD_COLUMNS
        ))
        .bind(account_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_optional(&self.pool)
        .await?;

        Ok(period)
    }

    async fn get_settlement_period(&self, period_id: Uuid) -> AppResult<Option<SettlementPeriod>> {
        let period = sqlx::query_as::<_, SettlementPeriod>(&format!(
            "SELECT {} FROM settlement_periods WHERE id = $1",
            PERIOD_COLUMNS
        ))
        .bind(period_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(period)
    }

    async fn create_settlement_period(&self, period: &NewSettlementPeriod) -> AppResult<Uuid> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO settlement_periods (
                account_id, period_start, period_end, starting_balance, ending_balance,
                deposits, withdrawals, gross_profit, loss_carry_consumed, loss_carryforward,
                net_profit, previous_high_water_mark, high_water_mark, profit_above_hwm,
                profit_share_rate, profit_share_due, degraded, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (account_id, period_start, period_end) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(period.account_id)
        .bind(period.period_start)
        .bind(period.period_end)
        .bind(period.starting_balance)
        .bind(period.ending_balance)
        .bind(period.deposits)
        .bind(period.withdrawals)
        .bind(period.gross_profit)
        .bind(period.loss_carry_consumed)
        .bind(period.loss_carryforward)
        .bind(period.net_profit)
        .bind(period.previous_high_water_mark)
        .bind(period.high_water_mark)
        .bind(period.profit_above_hwm)
        .bind(period.profit_share_rate)
        .bind(period.profit_share_due)
        .bind(period.degraded)
        .bind(period.status)
        .fetch_optional(&self.pool)
        .await?;

        id.ok_or_else(|| {
            SettlementError::DuplicatePeriod {
                account_id: period.account_id,
                period_start: period.period_start,
            }
            .into()
        })
    }

    async fn update_settlement_status(
        &self,
        period_id: Uuid,
        status: SettlementStatus,
        invoice_id: Option<&str>,
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        // Row lock serialises the webhook path against the scheduler path
        let current = sqlx::query_scalar::<_, SettlementStatus>(
            "SELECT status FROM settlement_periods WHERE id = $1 FOR UPDATE",
        )
        .bind(period_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Settlement period {} not found", period_id)))?;

        if !current.can_transition_to(status) {
            warn!(
                period_id = %period_id,
                "Rejected settlement transition {} -> {}",
                current, status
            );
            return Err(SettlementError::InvalidTransition {
                period_id,
                from: current,
                to: status,
            }
            .into());
        }

        sqlx::query(
            r#"
            UPDATE settlement_periods
            SET status = $2, invoice_id = COALESCE($3, invoice_id), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(period_id)
        .bind(status)
        .bind(invoice_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(period_id = %period_id, "Settlement status {} -> {}", current, status);
        Ok(())
    }

    async fn get_pending_settlement_periods(&self) -> AppResult<Vec<SettlementPeriod>> {
        let periods = sqlx::query_as::<_, SettlementPeriod>(&format!(
            r#"
            SELECT {}
            FROM settlement_periods
            WHERE status = 'pending' AND degraded = FALSE AND profit_share_due > 0
            ORDER BY period_end ASC
            "#,
            PERIOD_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(periods)
    }

    async fn get_settlement_periods_by_status(&self, status: SettlementStatus) -> AppResult<Vec<SettlementPeriod>> {
        let periods = sqlx::query_as::<_, SettlementPeriod>(&format!(
            "SELECT {} FROM settlement_periods WHERE status = $1 ORDER BY period_end ASC",
            PERIOD_COLUMNS
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        Ok(periods)
    }

    async fn get_account_settlement_history(&self, account_id: Uuid, limit: i64) -> AppResult<Vec<SettlementPeriod>> {
        let periods = sqlx::query_as::<_, SettlementPeriod>(&format!(
            r#"
            SELECT {}
            FROM settlement_periods
            WHERE account_id = $1
            ORDER BY period_start DESC
            LIMIT $2
            "#,
            PERIOD_COLUMNS
        ))
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(periods)
    }

    async fn get_platform_stats(&self) -> AppResult<PlatformStats> {
        let (period_count, total_due, total_paid, total_outstanding): (i64, Decimal, Decimal, Decimal) =
            sqlx::query_as(
                r#"
                SELECT
                    COUNT(*),
                    COALESCE(SUM(profit_share_due) FILTER (WHERE degraded = FALSE), 0),
                    COALESCE(SUM(profit_share_due) FILTER (WHERE status = 'paid'), 0),
                    COALESCE(SUM(profit_share_due) FILTER (
                        WHERE status IN ('pending', 'invoiced', 'failed') AND degraded = FALSE
                    ), 0)
                FROM settlement_periods
                "#,
            )
            .fetch_one(&self.pool)
            .await?;

        Ok(PlatformStats {
            period_count,
            total_due,
            total_paid,
            total_outstanding,
        })
    }

    async fn create_balance_snapshot(
        &self,
        account_id: Uuid,
        kind: SnapshotKind,
        total_balance: Decimal,
        unrealized_pnl: Decimal,
    ) -> AppResult<Uuid> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO balance_snapshots (account_id, kind, total_balance, unrealized_pnl)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(account_id)
        .bind(kind)
        .bind(total_balance)
        .bind(unrealized_pnl)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }
}

// ========== ACCOUNTS ==========

#[async_trait]
impl AccountStore for LedgerRepository {
    async fn get_account(&self, account_id: Uuid) -> AppResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn get_account_by_customer_id(&self, customer_id: &str) -> AppResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE billing_customer_id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn set_billing_customer_id(&self, account_id: Uuid, customer_id: &str) -> AppResult<()> {
        // Never overwrite an identity that is already cached
        sqlx::query(
            r#"
            UPDATE accounts
            SET billing_customer_id = $2, updated_at = NOW()
            WHERE id = $1 AND billing_customer_id IS NULL
            "#,
        )
        .bind(account_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_subscription_status(&self, account_id: Uuid, status: SubscriptionStatus) -> AppResult<()> {
        sqlx::query("UPDATE accounts SET subscription_status = $2, updated_at = NOW() WHERE id = $1")
            .bind(account_id)
            .bind(status)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn update_subscription_tier(&self, account_id: Uuid, tier: SubscriptionTier) -> AppResult<()> {
        sqlx::query("UPDATE accounts SET subscription_tier = $2, updated_at = NOW() WHERE id = $1")
            .bind(account_id)
            .bind(tier.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
