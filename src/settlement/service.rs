use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::{
    future,
    stream::{self, StreamExt},
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    billing::service::BillingService,
    error::{AppError, AppResult, SettlementError},
    ledger::{
        models::*,
        traits::{AccountStore, LedgerReader, SettlementStore},
    },
    settlement::{calculator::ProfitCalculator, with_timeout},
};

pub const SETTLEMENT_WINDOW_DAYS: i64 = 7;

/// What happened to one account in a settlement pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// A period for this window already exists
    Skipped,
    /// Below the payout floor, recorded without an invoice
    Waived,
    Invoiced,
    /// Recorded, invoice deferred to a later retry
    Pending,
    /// Recorded for audit only, never invoiced
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountSettlement {
    pub account_id: Uuid,
    pub period_id: Option<Uuid>,
    pub disposition: Disposition,
    pub profit_share_due: Decimal,
}

/// Aggregate counters for one settlement pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
    pub waived: u32,
    pub invoiced: u32,
    /// Accounts left untouched because shutdown was signalled mid-pass
    pub not_started: u32,
    pub total_profit_share: Decimal,
}

impl BatchSummary {
    fn record(&mut self, result: &AppResult<AccountSettlement>) {
        self.processed += 1;
        match result {
            Ok(settlement) => match settlement.disposition {
                Disposition::Skipped => self.skipped += 1,
                disposition => {
                    self.succeeded += 1;
                    match disposition {
                        Disposition::Waived => self.waived += 1,
                        Disposition::Invoiced => self.invoiced += 1,
                        _ => {}
                    }
                    if disposition != Disposition::Degraded {
                        self.total_profit_share += settlement.profit_share_due;
                    }
                }
            },
            Err(_) => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotSummary {
    pub captured: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub retried: u32,
    pub failed: u32,
    pub skipped: u32,
}

/// Per-account settlement and the batch passes built on it
pub struct SettlementService {
    calculator: Arc<ProfitCalculator>,
    billing: Arc<BillingService>,
    ledger: Arc<dyn LedgerReader>,
    store: Arc<dyn SettlementStore>,
    accounts: Arc<dyn AccountStore>,
    concurrency: usize,
    call_timeout: Duration,
}

impl SettlementService {
    pub fn new(
        calculator: Arc<ProfitCalculator>,
        billing: Arc<BillingService>,
        ledger: Arc<dyn LedgerReader>,
        store: Arc<dyn SettlementStore>,
        accounts: Arc<dyn AccountStore>,
        concurrency: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            calculator,
            billing,
            ledger,
            store,
            accounts,
            concurrency: concurrency.max(1),
            call_timeout,
        }
    }

    pub fn minimum_payout(&self) -> Decimal {
        self.calculator.config().minimum_payout
    }

    /// Settle every active account for the week ending at `window_end`.
    /// One account failing never aborts the batch.
    pub async fn run_weekly_settlement(&self, window_end: DateTime<Utc>) -> AppResult<BatchSummary> {
        self.settle_window(window_end, None).await
    }

    /// Same pass, but no new account is started once `shutdown` flips to true.
    /// Accounts already in flight finish.
    pub async fn run_weekly_settlement_until(
        &self,
        window_end: DateTime<Utc>,
        shutdown: watch::Receiver<bool>,
    ) -> AppResult<BatchSummary> {
        self.settle_window(window_end, Some(shutdown)).await
    }

    async fn settle_window(
        &self,
        window_end: DateTime<Utc>,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> AppResult<BatchSummary> {
        let window_start = window_end - ChronoDuration::days(SETTLEMENT_WINDOW_DAYS);
        info!(
            "🔄 Starting weekly settlement for {} .. {}",
            window_start.format("%Y-%m-%d %H:%M"),
            window_end.format("%Y-%m-%d %H:%M")
        );

        let accounts = with_timeout(self.call_timeout, "active accounts", self.store.get_active_accounts()).await?;
        let total = accounts.len();

        // Each worker owns one account through report, persist and invoice
        let results: Vec<AppResult<AccountSettlement>> = stream::iter(accounts)
            .take_while(|_| future::ready(!shutdown.as_ref().map_or(false, |rx| *rx.borrow())))
            .map(move |account: Account| async move {
                let result = self.settle_account(&account, window_start, window_end).await;
                if let Err(e) = &result {
                    error!(account_id = %account.id, "❌ Settlement failed: {}", e);
                }
                result
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut summary = BatchSummary::default();
        for result in &results {
            summary.record(result);
        }
        summary.not_started = (total - results.len()) as u32;
        if summary.not_started > 0 {
            warn!("🛑 Shutdown during settlement, {} accounts not started", summary.not_started);
        }

        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            waived = summary.waived,
            invoiced = summary.invoiced,
            not_started = summary.not_started,
            total_profit_share = %summary.total_profit_share,
            "✓ Weekly settlement completed"
        );

        Ok(summary)
    }

    /// Settle one account for the week ending at `window_end`
    pub async fn manual_settlement(&self, account_id: Uuid, window_end: DateTime<Utc>) -> AppResult<AccountSettlement> {
        let account = with_timeout(self.call_timeout, "account lookup", self.accounts.get_account(account_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Account {} not found", account_id)))?;

        info!(account_id = %account_id, "Manual settlement requested");
        self.settle_account(&account, window_end - ChronoDuration::days(SETTLEMENT_WINDOW_DAYS), window_end)
            .await
    }

    /// Report, persist and (when due clears the floor) invoice one account
    pub async fn settle_account(
        &self,
        account: &Account,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> AppResult<AccountSettlement> {
        // Step 1: one period per window
        let existing = with_timeout(
            self.call_timeout,
            "existing period lookup",
            self.store.find_settlement_period(account.id, period_start, period_end),
        )
        .await?;
        if let Some(period) = existing {
            return Ok(skipped(account.id, Some(period.id)));
        }

        // Step 2: accounting
        let report = self
            .calculator
            .compute_report_for(account, period_start, period_end)
            .await?;
        let due = report.profit_share_due();
        let minimum = self.calculator.config().minimum_payout_for(account.subscription_tier);

        let status = if !report.degraded && due < minimum {
            SettlementStatus::Waived
        } else {
            SettlementStatus::Pending
        };

        // Step 3: persist
        let new_period = report.to_new_period(status);
        let period_id = match with_timeout(
            self.call_timeout,
            "create settlement period",
            self.store.create_settlement_period(&new_period),
        )
        .await
        {
            Ok(id) => id,
            Err(AppError::Settlement(SettlementError::DuplicatePeriod { .. })) => {
                return Ok(skipped(account.id, None));
            }
            Err(e) => return Err(e),
        };

        let settled = |disposition| AccountSettlement {
            account_id: account.id,
            period_id: Some(period_id),
            disposition,
            profit_share_due: due,
        };

        if report.degraded {
            warn!(
                account_id = %account.id,
                period_id = %period_id,
                "⚠️  Degraded period recorded, not invoiced: {}",
                report.degraded_reason.as_deref().unwrap_or("balance unavailable")
            );
            return Ok(settled(Disposition::Degraded));
        }
        if status == SettlementStatus::Waived {
            info!(account_id = %account.id, due = %due, "Profit share below minimum payout {}, waived", minimum);
            return Ok(settled(Disposition::Waived));
        }

        // Step 4: invoice; any failure leaves the period pending for retry
        if !self.billing.is_configured() {
            warn!(period_id = %period_id, "⚠️  Payment gateway not configured - invoicing skipped");
            return Ok(settled(Disposition::Pending));
        }

        let period = new_period.into_period(period_id, Utc::now());
        match self.billing.invoice_period(&period).await {
            Ok(_) => Ok(settled(Disposition::Invoiced)),
            Err(e) => {
                warn!(period_id = %period_id, "Invoice creation failed, left pending: {}", e);
                Ok(settled(Disposition::Pending))
            }
        }
    }

    /// Re-attempt invoicing for pending and failed periods
    pub async fn retry_failed_invoices(&self) -> AppResult<RetrySummary> {
        let mut periods =
            with_timeout(self.call_timeout, "pending periods", self.store.get_pending_settlement_periods()).await?;
        periods.extend(
            with_timeout(
                self.call_timeout,
                "failed periods",
                self.store.get_settlement_periods_by_status(SettlementStatus::Failed),
            )
            .await?,
        );

        let mut summary = RetrySummary::default();
        if !self.billing.is_configured() {
            warn!("⚠️  Payment gateway not configured - {} invoice retries skipped", periods.len());
            summary.skipped = periods.len() as u32;
            return Ok(summary);
        }

        info!("🔁 Retrying invoices for {} settlement periods", periods.len());
        for period in &periods {
            if period.degraded {
                summary.skipped += 1;
                continue;
            }
            match self.billing.invoice_period(period).await {
                Ok(outcome) => {
                    summary.retried += 1;
                    info!(period_id = %period.id, "Invoice retry succeeded: {}", outcome.invoice_id());
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(period_id = %period.id, "❌ Invoice retry failed: {}", e);
                }
            }
        }

        info!(
            retried = summary.retried,
            failed = summary.failed,
            skipped = summary.skipped,
            "✓ Invoice retry completed"
        );
        Ok(summary)
    }

    /// Capture a periodic balance snapshot for every active account
    pub async fn take_all_balance_snapshots(&self) -> AppResult<SnapshotSummary> {
        let accounts = with_timeout(self.call_timeout, "active accounts", self.store.get_active_accounts()).await?;
        let mut summary = SnapshotSummary::default();

        for account in &accounts {
            match self.snapshot_account(account.id).await {
                Ok(()) => summary.captured += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!(account_id = %account.id, "Balance snapshot failed: {}", e);
                }
            }
        }

        info!("📸 Balance snapshots: {} captured, {} failed", summary.captured, summary.failed);
        Ok(summary)
    }

    async fn snapshot_account(&self, account_id: Uuid) -> AppResult<()> {
        let (balance, unrealized_pnl) = with_timeout(
            self.call_timeout,
            "current equity",
            self.ledger.get_current_equity(account_id),
        )
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No equity for account {}", account_id)))?;

        with_timeout(
            self.call_timeout,
            "create snapshot",
            self.store
                .create_balance_snapshot(account_id, SnapshotKind::Periodic, balance, unrealized_pnl),
        )
        .await?;
        Ok(())
    }

    pub async fn get_pending_settlements(&self) -> AppResult<Vec<SettlementPeriod>> {
        with_timeout(self.call_timeout, "pending periods", self.store.get_pending_settlement_periods()).await
    }

    pub async fn get_account_settlement_history(&self, account_id: Uuid, limit: i64) -> AppResult<Vec<SettlementPeriod>> {
        with_timeout(
            self.call_timeout,
            "settlement history",
            self.store.get_account_settlement_history(account_id, limit),
        )
        .await
    }

    pub async fn get_platform_stats(&self) -> AppResult<PlatformStats> {
        with_timeout(self.call_timeout, "platform stats", self.store.get_platform_stats()).await
    }
}

fn skipped(account_id: Uuid, period_id: Option<Uuid>) -> AccountSettlement {
    AccountSettlement {
        account_id,
        period_id,
        disposition: Disposition::Skipped,
        profit_share_due: Decimal::ZERO,
    }
}
