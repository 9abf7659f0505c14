// Profit share calculator
//
// Per period:
// - gross profit = (ending - starting) - (deposits - withdrawals)
// - prior loss carryforward is offset first, net profit never goes negative
// - the high-water mark only ratchets up
// - only min(net profit, profit above HWM) is taxed

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    ledger::{
        models::*,
        traits::{AccountStore, LedgerReader, SettlementStore},
    },
    settlement::with_timeout,
};

/// Rate and payout floor for one subscription tier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierPolicy {
    pub rate: Decimal,
    /// Overrides the global minimum payout when set
    pub minimum_payout: Option<Decimal>,
}

/// Profit share configuration
#[derive(Debug, Clone)]
pub struct ProfitShareConfig {
    pub tiers: HashMap<SubscriptionTier, TierPolicy>,
    /// Invoices below this amount are waived
    pub minimum_payout: Decimal,
}

impl Default for ProfitShareConfig {
    fn default() -> Self {
        let mut tiers = HashMap::new();
        tiers.insert(SubscriptionTier::Free, TierPolicy { rate: dec!(0.30), minimum_payout: None });
        tiers.insert(SubscriptionTier::Trader, TierPolicy { rate: dec!(0.20), minimum_payout: None });
        tiers.insert(SubscriptionTier::Pro, TierPolicy { rate: dec!(0.12), minimum_payout: None });
        tiers.insert(SubscriptionTier::Whale, TierPolicy { rate: dec!(0.05), minimum_payout: None });

        Self {
            tiers,
            minimum_payout: dec!(10),
        }
    }
}

impl ProfitShareConfig {
    /// Unknown or unconfigured tiers pay the highest configured rate
    pub fn rate_for(&self, tier: SubscriptionTier) -> Decimal {
        self.tiers
            .get(&tier)
            .map(|policy| policy.rate)
            .unwrap_or_else(|| self.most_conservative_rate())
    }

    pub fn minimum_payout_for(&self, tier: SubscriptionTier) -> Decimal {
        self.tiers
            .get(&tier)
            .and_then(|policy| policy.minimum_payout)
            .unwrap_or(self.minimum_payout)
    }

    fn most_conservative_rate(&self) -> Decimal {
        self.tiers
            .values()
            .map(|policy| policy.rate)
            .max()
            .unwrap_or(dec!(0.30))
    }
}

/// Inputs to one period's accounting, already resolved from the ledger
#[derive(Debug, Clone, Copy)]
pub struct PeriodInputs {
    pub starting_balance: Decimal,
    pub ending_balance: Decimal,
    pub deposits: Decimal,
    pub withdrawals: Decimal,
    /// Carryforward left by the prior period (zero if none)
    pub prior_loss_carry: Decimal,
    /// HWM of the prior period; `None` seeds from the starting balance
    pub prior_high_water_mark: Option<Decimal>,
    pub rate: Decimal,
}

/// Accounting outcome for one period
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PeriodAccounting {
    pub gross_profit: Decimal,
    pub loss_carry_consumed: Decimal,
    pub loss_carryforward: Decimal,
    pub net_profit: Decimal,
    pub previous_high_water_mark: Decimal,
    pub high_water_mark: Decimal,
    pub profit_above_hwm: Decimal,
    pub taxable_profit: Decimal,
    pub profit_share_due: Decimal,
}

impl PeriodAccounting {
    /// Nothing computed: the prior carry and HWM pass through, nothing is due
    pub fn carried_over(loss_carry: Decimal, high_water_mark: Decimal) -> Self {
        let loss_carry = loss_carry.max(Decimal::ZERO);
        let high_water_mark = high_water_mark.max(Decimal::ZERO);
        Self {
            gross_profit: Decimal::ZERO,
            loss_carry_consumed: Decimal::ZERO,
            loss_carryforward: loss_carry,
            net_profit: Decimal::ZERO,
            previous_high_water_mark: high_water_mark,
            high_water_mark,
            profit_above_hwm: Decimal::ZERO,
            taxable_profit: Decimal::ZERO,
            profit_share_due: Decimal::ZERO,
        }
    }
}

/// Pure period accounting
pub fn settle_period(inputs: &PeriodInputs) -> PeriodAccounting {
    let gross_profit = (inputs.ending_balance - inputs.starting_balance)
        - (inputs.deposits - inputs.withdrawals);

    let prior_carry = inputs.prior_loss_carry.max(Decimal::ZERO);
    let mut net_profit = gross_profit - prior_carry;
    let loss_carryforward = if net_profit < Decimal::ZERO {
        let carry = -net_profit;
        net_profit = Decimal::ZERO;
        carry
    } else {
        Decimal::ZERO
    };
    let loss_carry_consumed = prior_carry.min(gross_profit.max(Decimal::ZERO));

    let previous_high_water_mark = inputs
        .prior_high_water_mark
        .unwrap_or(inputs.starting_balance);
    let (profit_above_hwm, high_water_mark) = if inputs.ending_balance > previous_high_water_mark {
        (inputs.ending_balance - previous_high_water_mark, inputs.ending_balance)
    } else {
        (Decimal::ZERO, previous_high_water_mark)
    };

    let taxable_profit = net_profit.min(profit_above_hwm);
    let profit_share_due = if taxable_profit > Decimal::ZERO {
        (taxable_profit * inputs.rate.max(Decimal::ZERO)).round_dp(8)
    } else {
        Decimal::ZERO
    };

    PeriodAccounting {
        gross_profit,
        loss_carry_consumed,
        loss_carryforward,
        net_profit,
        previous_high_water_mark,
        high_water_mark,
        profit_above_hwm,
        taxable_profit,
        profit_share_due,
    }
}

/// Full report for one account and one window
#[derive(Debug, Clone, Serialize)]
pub struct SettlementReport {
    pub account_id: Uuid,
    pub tier: SubscriptionTier,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub starting_balance: Decimal,
    pub ending_balance: Decimal,
    pub deposits: Decimal,
    pub withdrawals: Decimal,
    pub profit_share_rate: Decimal,
    #[serde(flatten)]
    pub accounting: PeriodAccounting,
    pub trade_stats: TradeStats,
    pub win_rate: Decimal,
    /// Set when a boundary balance could not be resolved
    pub degraded: bool,
    pub degraded_reason: Option<String>,
}

impl SettlementReport {
    pub fn profit_share_due(&self) -> Decimal {
        self.accounting.profit_share_due
    }

    pub fn to_new_period(&self, status: SettlementStatus) -> NewSettlementPeriod {
        NewSettlementPeriod {
            account_id: self.account_id,
            period_start: self.period_start,
            period_end: self.period_end,
            starting_balance: self.starting_balance,
            ending_balance: self.ending_balance,
            deposits: self.deposits,
            withdrawals: self.withdrawals,
            gross_profit: self.accounting.gross_profit,
            loss_carry_consumed: self.accounting.loss_carry_consumed,
            loss_carryforward: self.accounting.loss_carryforward,
            net_profit: self.accounting.net_profit,
            previous_high_water_mark: self.accounting.previous_high_water_mark,
            high_water_mark: self.accounting.high_water_mark,
            profit_above_hwm: self.accounting.profit_above_hwm,
            profit_share_rate: self.profit_share_rate,
            profit_share_due: self.accounting.profit_share_due,
            degraded: self.degraded,
            status,
        }
    }
}

/// Builds settlement reports from ledger and prior-period data
pub struct ProfitCalculator {
    config: ProfitShareConfig,
    ledger: Arc<dyn LedgerReader>,
    store: Arc<dyn SettlementStore>,
    accounts: Arc<dyn AccountStore>,
    call_timeout: Duration,
}

impl ProfitCalculator {
    pub fn new(
        config: ProfitShareConfig,
        ledger: Arc<dyn LedgerReader>,
        store: Arc<dyn SettlementStore>,
        accounts: Arc<dyn AccountStore>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            config,
            ledger,
            store,
            accounts,
            call_timeout,
        }
    }

    pub fn config(&self) -> &ProfitShareConfig {
        &self.config
    }

    /// Compute the report for an account id, failing if the account does not exist
    pub async fn compute_period_report(
        &self,
        account_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> AppResult<SettlementReport> {
        let account = with_timeout(self.call_timeout, "account lookup", self.accounts.get_account(account_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Account {} not found", account_id)))?;

        self.compute_report_for(&account, period_start, period_end).await
    }

    pub async fn compute_report_for(
        &self,
        account: &Account,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> AppResult<SettlementReport> {
        if period_end <= period_start {
            return Err(AppError::InvalidInput(format!(
                "Empty settlement window {} .. {}",
                period_start, period_end
            )));
        }

        // Step 1: rate from tier
        let rate = self.config.rate_for(account.subscription_tier);

        // Step 2: boundary balances
        let (starting_balance, start_gap) = self.resolve_balance(account.id, period_start).await?;
        let (ending_balance, end_gap) = self.resolve_balance(account.id, period_end).await?;
        let degraded_reason = match (start_gap, end_gap) {
            (None, None) => None,
            (Some(reason), None) | (None, Some(reason)) => Some(reason),
            (Some(start), Some(end)) => Some(format!("{}; {}", start, end)),
        };

        // Step 3: confirmed capital movements inside the window
        let transactions = with_timeout(
            self.call_timeout,
            "transaction read",
            self.ledger.get_transactions(account.id, period_start, period_end),
        )
        .await?;
        let (deposits, withdrawals) = sum_capital_movements(&transactions, period_start, period_end);

        // Step 4: prior period seeds carry and HWM
        let prior = with_timeout(
            self.call_timeout,
            "prior period lookup",
            self.store.get_latest_settlement_period(account.id, period_start),
        )
        .await?;

        let prior_loss_carry = prior.as_ref().map_or(Decimal::ZERO, |p| p.loss_carryforward);
        let prior_high_water_mark = prior.as_ref().map(|p| p.high_water_mark);

        // A zeroed boundary balance must not move carry or HWM
        let accounting = if degraded_reason.is_some() {
            PeriodAccounting::carried_over(prior_loss_carry, prior_high_water_mark.unwrap_or(Decimal::ZERO))
        } else {
            settle_period(&PeriodInputs {
                starting_balance,
                ending_balance,
                deposits,
                withdrawals,
                prior_loss_carry,
                prior_high_water_mark,
                rate,
            })
        };

        // Step 5: informational trade stats
        let trade_stats = match with_timeout(
            self.call_timeout,
            "trade stats read",
            self.ledger.get_trade_stats(account.id, period_start, period_end),
        )
        .await
        {
            Ok(stats) => stats,
            Err(e) => {
                warn!(account_id = %account.id, "Trade stats unavailable, defaulting to zero: {}", e);
                TradeStats::default()
            }
        };

        if let Some(reason) = &degraded_reason {
            warn!(account_id = %account.id, "⚠️  Degraded settlement report: {}", reason);
        }

        debug!(
            account_id = %account.id,
            gross = %accounting.gross_profit,
            net = %accounting.net_profit,
            hwm = %accounting.high_water_mark,
            due = %accounting.profit_share_due,
            "Computed settlement report"
        );

        Ok(SettlementReport {
            account_id: account.id,
            tier: account.subscription_tier,
            period_start,
            period_end,
            starting_balance,
            ending_balance,
            deposits,
            withdrawals,
            profit_share_rate: rate,
            accounting,
            win_rate: trade_stats.win_rate(),
            trade_stats,
            degraded: degraded_reason.is_some(),
            degraded_reason,
        })
    }

    /// Snapshot first, then replay if the ledger supports it, else zero with a reason
    async fn resolve_balance(&self, account_id: Uuid, at: DateTime<Utc>) -> AppResult<(Decimal, Option<String>)> {
        let snapshot = with_timeout(
            self.call_timeout,
            "balance snapshot read",
            self.ledger.get_balance_near(account_id, at),
        )
        .await?;
        if let Some(balance) = snapshot {
            return Ok((balance, None));
        }

        let replayed = with_timeout(
            self.call_timeout,
            "balance replay",
            self.ledger.replay_balance(account_id, at),
        )
        .await?;
        if let Some(balance) = replayed {
            return Ok((balance, None));
        }

        Ok((Decimal::ZERO, Some(format!("no balance snapshot at or before {}", at))))
    }
}

fn sum_capital_movements(
    transactions: &[Transaction],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> (Decimal, Decimal) {
    transactions
        .iter()
        .filter(|tx| tx.status == TransactionStatus::Confirmed)
        .filter(|tx| tx.created_at >= start && tx.created_at < end)
        .fold((Decimal::ZERO, Decimal::ZERO), |(deposits, withdrawals), tx| match tx.kind {
            TransactionKind::Deposit => (deposits + tx.amount, withdrawals),
            TransactionKind::Withdrawal => (deposits, withdrawals + tx.amount),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{account, InMemoryLedger, InMemoryStore};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use proptest::prelude::*;

    fn inputs(start: Decimal, end: Decimal, prior: Option<&PeriodAccounting>) -> PeriodInputs {
        PeriodInputs {
            starting_balance: start,
            ending_balance: end,
            deposits: Decimal::ZERO,
            withdrawals: Decimal::ZERO,
            prior_loss_carry: prior.map_or(Decimal::ZERO, |p| p.loss_carryforward),
            prior_high_water_mark: prior.map(|p| p.high_water_mark),
            rate: dec!(0.20),
        }
    }

    #[test]
    fn test_chained_periods_carry_and_hwm() {
        // A: first period, 10,000 -> 10,500
        let a = settle_period(&inputs(dec!(10000), dec!(10500), None));
        assert_eq!(a.gross_profit, dec!(500));
        assert_eq!(a.net_profit, dec!(500));
        assert_eq!(a.previous_high_water_mark, dec!(10000));
        assert_eq!(a.high_water_mark, dec!(10500));
        assert_eq!(a.profit_above_hwm, dec!(500));
        assert_eq!(a.taxable_profit, dec!(500));
        assert_eq!(a.profit_share_due, dec!(100));

        // B: losing week
        let b = settle_period(&inputs(dec!(10500), dec!(9800), Some(&a)));
        assert_eq!(b.gross_profit, dec!(-700));
        assert_eq!(b.loss_carryforward, dec!(700));
        assert_eq!(b.net_profit, Decimal::ZERO);
        assert_eq!(b.high_water_mark, dec!(10500));
        assert_eq!(b.profit_share_due, Decimal::ZERO);

        // C: recovery past the old high
        let c = settle_period(&inputs(dec!(9800), dec!(11200), Some(&b)));
        assert_eq!(c.gross_profit, dec!(1400));
        assert_eq!(c.loss_carry_consumed, dec!(700));
        assert_eq!(c.net_profit, dec!(700));
        assert_eq!(c.high_water_mark, dec!(11200));
        assert_eq!(c.profit_above_hwm, dec!(700));
        assert_eq!(c.taxable_profit, dec!(700));
        assert_eq!(c.profit_share_due, dec!(140));
        assert_eq!(c.loss_carryforward, Decimal::ZERO);
    }

    #[test]
    fn test_deposits_are_not_profit() {
        let mut period = inputs(dec!(1000), dec!(3000), None);
        period.deposits = dec!(2000);
        let result = settle_period(&period);

        assert_eq!(result.gross_profit, Decimal::ZERO);
        assert_eq!(result.profit_share_due, Decimal::ZERO);
        // the ratchet still moves with the balance
        assert_eq!(result.high_water_mark, dec!(3000));
    }

    #[test]
    fn test_recovery_below_hwm_is_not_taxed() {
        let prior = settle_period(&inputs(dec!(10000), dec!(12000), None));
        let dip = settle_period(&inputs(dec!(12000), dec!(9000), Some(&prior)));
        // carry 3,000 is worked off exactly, HWM untouched
        let recovery = settle_period(&inputs(dec!(9000), dec!(12000), Some(&dip)));

        assert_eq!(recovery.net_profit, Decimal::ZERO);
        assert_eq!(recovery.profit_above_hwm, Decimal::ZERO);
        assert_eq!(recovery.profit_share_due, Decimal::ZERO);
    }

    #[test]
    fn test_unknown_tier_uses_highest_rate() {
        let config = ProfitShareConfig::default();
        assert_eq!(config.rate_for(SubscriptionTier::Unknown), dec!(0.30));
        assert_eq!(config.rate_for(SubscriptionTier::Whale), dec!(0.05));
    }

    #[test]
    fn test_minimum_payout_override() {
        let mut config = ProfitShareConfig::default();
        config.tiers.insert(
            SubscriptionTier::Whale,
            TierPolicy { rate: dec!(0.05), minimum_payout: Some(dec!(50)) },
        );

        assert_eq!(config.minimum_payout_for(SubscriptionTier::Whale), dec!(50));
        assert_eq!(config.minimum_payout_for(SubscriptionTier::Pro), dec!(10));
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let end = Utc.with_ymd_and_hms(2024, 1, 7, 0, 0, 0).unwrap();
        (end - ChronoDuration::days(7), end)
    }

    fn calculator(ledger: Arc<InMemoryLedger>, store: Arc<InMemoryStore>) -> ProfitCalculator {
        ProfitCalculator::new(
            ProfitShareConfig::default(),
            ledger,
            store.clone(),
            store,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_report_from_ledger() {
        let (start, end) = window();
        let acct = account(SubscriptionTier::Trader);
        let ledger = Arc::new(InMemoryLedger::new());
        let store = Arc::new(InMemoryStore::new());
        store.add_account(acct.clone());

        ledger.add_snapshot(acct.id, start - ChronoDuration::minutes(5), dec!(10000));
        ledger.add_snapshot(acct.id, end - ChronoDuration::minutes(1), dec!(11500));
        ledger.add_transaction(acct.id, TransactionKind::Deposit, TransactionStatus::Confirmed, dec!(1000), start + ChronoDuration::days(1));
        // unconfirmed and out-of-window movements are ignored
        ledger.add_transaction(acct.id, TransactionKind::Deposit, TransactionStatus::Pending, dec!(400), start + ChronoDuration::days(2));
        ledger.add_transaction(acct.id, TransactionKind::Withdrawal, TransactionStatus::Confirmed, dec!(300), end);
        ledger.set_trade_stats(acct.id, TradeStats { total: 4, wins: 3, losses: 1 });

        let report = calculator(ledger, store)
            .compute_period_report(acct.id, start, end)
            .await
            .unwrap();

        assert!(!report.degraded);
        assert_eq!(report.deposits, dec!(1000));
        assert_eq!(report.withdrawals, Decimal::ZERO);
        assert_eq!(report.accounting.gross_profit, dec!(500));
        assert_eq!(report.profit_share_due(), dec!(100));
        assert_eq!(report.win_rate, dec!(75));
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_degraded() {
        let (start, end) = window();
        let acct = account(SubscriptionTier::Pro);
        let ledger = Arc::new(InMemoryLedger::new());
        let store = Arc::new(InMemoryStore::new());
        store.add_account(acct.clone());
        ledger.add_snapshot(acct.id, end - ChronoDuration::hours(1), dec!(5000));

        let report = calculator(ledger, store)
            .compute_report_for(&acct, start, end)
            .await
            .unwrap();

        assert!(report.degraded);
        assert_eq!(report.starting_balance, Decimal::ZERO);
        assert!(report.degraded_reason.is_some());
        // the zeroed start must not read as a 5,000 gain
        assert_eq!(report.accounting.gross_profit, Decimal::ZERO);
        assert_eq!(report.profit_share_due(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_degraded_period_does_not_seed_next_window() {
        let (start, end) = window();
        let acct = account(SubscriptionTier::Trader);
        let ledger = Arc::new(InMemoryLedger::new());
        let store = Arc::new(InMemoryStore::new());
        store.add_account(acct.clone());

        // a real period one week earlier left a carry of 200 at HWM 10,000
        let mut earlier = crate::testing::pending_period(acct.id, Decimal::ZERO);
        earlier.period_start = start - ChronoDuration::days(7);
        earlier.period_end = start;
        earlier.loss_carryforward = dec!(200);
        earlier.high_water_mark = dec!(10000);
        earlier.status = SettlementStatus::Waived;
        store.insert_period(earlier);

        let calc = calculator(ledger.clone(), store.clone());

        // no snapshot at the window start: degraded, carry and HWM pass through
        ledger.add_snapshot(acct.id, end - ChronoDuration::hours(1), dec!(10000));
        let degraded = calc.compute_report_for(&acct, start, end).await.unwrap();
        assert!(degraded.degraded);
        assert_eq!(degraded.accounting.loss_carryforward, dec!(200));
        assert_eq!(degraded.accounting.high_water_mark, dec!(10000));
        assert_eq!(degraded.profit_share_due(), Decimal::ZERO);
        let mut stored = degraded.to_new_period(SettlementStatus::Pending).into_period(Uuid::new_v4(), Utc::now());
        // even a row written before carry pass-through must not seed the next window
        stored.high_water_mark = dec!(99999);
        stored.loss_carryforward = Decimal::ZERO;
        store.insert_period(stored);

        // the following week seeds from the earlier real period
        let next_end = end + ChronoDuration::days(7);
        ledger.add_snapshot(acct.id, next_end - ChronoDuration::hours(1), dec!(10700));
        let next = calc.compute_report_for(&acct, end, next_end).await.unwrap();

        assert!(!next.degraded);
        assert_eq!(next.accounting.loss_carry_consumed, dec!(200));
        assert_eq!(next.accounting.previous_high_water_mark, dec!(10000));
        assert_eq!(next.accounting.net_profit, dec!(500));
        assert_eq!(next.profit_share_due(), dec!(100));
    }

    #[tokio::test]
    async fn test_trade_stats_failure_does_not_fail_report() {
        let (start, end) = window();
        let acct = account(SubscriptionTier::Pro);
        let ledger = Arc::new(InMemoryLedger::new());
        let store = Arc::new(InMemoryStore::new());
        ledger.add_snapshot(acct.id, start, dec!(100));
        ledger.add_snapshot(acct.id, end, dec!(100));
        ledger.fail_trade_stats();

        let report = calculator(ledger, store)
            .compute_report_for(&acct, start, end)
            .await
            .unwrap();

        assert_eq!(report.trade_stats, TradeStats::default());
    }

    #[tokio::test]
    async fn test_ledger_failure_propagates_as_retryable() {
        let (start, end) = window();
        let acct = account(SubscriptionTier::Pro);
        let ledger = Arc::new(InMemoryLedger::new());
        let store = Arc::new(InMemoryStore::new());
        ledger.fail_reads();

        let err = calculator(ledger, store)
            .compute_report_for(&acct, start, end)
            .await
            .unwrap_err();

        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_account_is_not_found() {
        let (start, end) = window();
        let ledger = Arc::new(InMemoryLedger::new());
        let store = Arc::new(InMemoryStore::new());

        let err = calculator(ledger, store)
            .compute_period_report(Uuid::new_v4(), start, end)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::NotFound(_)));
    }

    fn amount() -> impl Strategy<Value = Decimal> {
        (0i64..5_000_000).prop_map(|cents| Decimal::new(cents, 2))
    }

    proptest! {
        #[test]
        fn property_due_bounded_and_hwm_monotone(
            balances in prop::collection::vec(amount(), 2..12),
            flows in prop::collection::vec((amount(), amount()), 11),
            rate_bp in 0i64..=10_000,
        ) {
            let rate = Decimal::new(rate_bp, 4);
            let mut prior: Option<PeriodAccounting> = None;

            for (i, pair) in balances.windows(2).enumerate() {
                let (deposits, withdrawals) = flows[i];
                let result = settle_period(&PeriodInputs {
                    starting_balance: pair[0],
                    ending_balance: pair[1],
                    deposits,
                    withdrawals,
                    prior_loss_carry: prior.map_or(Decimal::ZERO, |p| p.loss_carryforward),
                    prior_high_water_mark: prior.map(|p| p.high_water_mark),
                    rate,
                });

                prop_assert!(result.profit_share_due >= Decimal::ZERO);
                prop_assert!(result.profit_share_due <= result.net_profit);
                prop_assert!(result.profit_share_due <= result.profit_above_hwm);
                prop_assert!(result.net_profit >= Decimal::ZERO);
                prop_assert!(result.loss_carryforward >= Decimal::ZERO);
                prop_assert!(result.high_water_mark >= result.previous_high_water_mark);
                if let Some(p) = prior {
                    prop_assert!(result.high_water_mark >= p.high_water_mark);
                }

                prior = Some(result);
            }
        }
    }
}
