// In-memory collaborators for unit tests
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

use crate::{
    billing::stripe::{
        CheckoutRequest, CheckoutSession, GatewayInvoice, GatewayInvoiceItem, GatewaySubscription,
        InvoiceItemRequest, InvoiceRequest, PaymentGateway, PortalSession,
    },
    error::{AppError, AppResult, GatewayError, SettlementError},
    ledger::{
        models::*,
        traits::{AccountStore, LedgerReader, SettlementStore},
    },
};

pub fn account(tier: SubscriptionTier) -> Account {
    let id = Uuid::new_v4();
    Account {
        id,
        email: format!("{}@example.com", id.simple()),
        name: Some("Test Trader".to_string()),
        subscription_tier: tier,
        subscription_status: SubscriptionStatus::Active,
        billing_customer_id: None,
        created_at: Utc::now(),
    }
}

pub fn pending_period(account_id: Uuid, due: Decimal) -> SettlementPeriod {
    let end = Utc.with_ymd_and_hms(2024, 1, 7, 0, 0, 0).unwrap();
    NewSettlementPeriod {
        account_id,
        period_start: end - ChronoDuration::days(7),
        period_end: end,
        starting_balance: Decimal::from(10_000),
        ending_balance: Decimal::from(10_000) + due * Decimal::from(5),
        deposits: Decimal::ZERO,
        withdrawals: Decimal::ZERO,
        gross_profit: due * Decimal::from(5),
        loss_carry_consumed: Decimal::ZERO,
        loss_carryforward: Decimal::ZERO,
        net_profit: due * Decimal::from(5),
        previous_high_water_mark: Decimal::from(10_000),
        high_water_mark: Decimal::from(10_000) + due * Decimal::from(5),
        profit_above_hwm: due * Decimal::from(5),
        profit_share_rate: Decimal::new(20, 2),
        profit_share_due: due,
        degraded: false,
        status: SettlementStatus::Pending,
    }
    .into_period(Uuid::new_v4(), Utc::now())
}

// ========== LEDGER ==========

#[derive(Default)]
struct LedgerState {
    snapshots: HashMap<Uuid, Vec<(DateTime<Utc>, Decimal)>>,
    transactions: Vec<Transaction>,
    trade_stats: HashMap<Uuid, TradeStats>,
    equity: HashMap<Uuid, (Decimal, Decimal)>,
    fail_reads: bool,
    fail_trade_stats: bool,
    read_delay: Option<std::time::Duration>,
}

#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_snapshot(&self, account_id: Uuid, at: DateTime<Utc>, balance: Decimal) {
        self.state
            .lock()
            .snapshots
            .entry(account_id)
            .or_default()
            .push((at, balance));
    }

    pub fn add_transaction(
        &self,
        account_id: Uuid,
        kind: TransactionKind,
        status: TransactionStatus,
        amount: Decimal,
        at: DateTime<Utc>,
    ) {
        self.state.lock().transactions.push(Transaction {
            id: Uuid::new_v4(),
            account_id,
            kind,
            amount,
            status,
            created_at: at,
        });
    }

    pub fn set_trade_stats(&self, account_id: Uuid, stats: TradeStats) {
        self.state.lock().trade_stats.insert(account_id, stats);
    }

    pub fn set_equity(&self, account_id: Uuid, balance: Decimal, unrealized_pnl: Decimal) {
        self.state.lock().equity.insert(account_id, (balance, unrealized_pnl));
    }

    pub fn fail_reads(&self) {
        self.state.lock().fail_reads = true;
    }

    pub fn fail_trade_stats(&self) {
        self.state.lock().fail_trade_stats = true;
    }

    /// Transaction reads sleep this long first
    pub fn set_read_delay(&self, delay: std::time::Duration) {
        self.state.lock().read_delay = Some(delay);
    }
}

#[async_trait]
impl LedgerReader for InMemoryLedger {
    async fn get_balance_near(&self, account_id: Uuid, at: DateTime<Utc>) -> AppResult<Option<Decimal>> {
        let state = self.state.lock();
        if state.fail_reads {
            return Err(AppError::Ledger("ledger offline".to_string()));
        }
        Ok(state
            .snapshots
            .get(&account_id)
            .and_then(|snapshots| {
                snapshots
                    .iter()
                    .filter(|(taken, _)| *taken <= at)
                    .max_by_key(|(taken, _)| *taken)
                    .map(|(_, balance)| *balance)
            }))
    }

    async fn get_transactions(
        &self,
        account_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<Vec<Transaction>> {
        let delay = self.state.lock().read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock();
        if state.fail_reads {
            return Err(AppError::Ledger("ledger offline".to_string()));
        }
        Ok(state
            .transactions
            .iter()
            .filter(|tx| tx.account_id == account_id && tx.created_at >= start && tx.created_at < end)
            .cloned()
            .collect())
    }

    async fn get_trade_stats(
        &self,
        account_id: Uuid,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> AppResult<TradeStats> {
        let state = self.state.lock();
        if state.fail_reads || state.fail_trade_stats {
            return Err(AppError::Ledger("trades table unavailable".to_string()));
        }
        Ok(state.trade_stats.get(&account_id).copied().unwrap_or_default())
    }

    async fn get_current_equity(&self, account_id: Uuid) -> AppResult<Option<(Decimal, Decimal)>> {
        let state = self.state.lock();
        if state.fail_reads {
            return Err(AppError::Ledger("ledger offline".to_string()));
        }
        Ok(state.equity.get(&account_id).copied())
    }
}

// ========== STORE ==========

#[derive(Default)]
struct StoreState {
    accounts: HashMap<Uuid, Account>,
    periods: HashMap<Uuid, SettlementPeriod>,
    snapshots: Vec<(Uuid, SnapshotKind, Decimal)>,
    failing_accounts: Vec<Uuid>,
    lookup_delay: Option<std::time::Duration>,
    fail_status_writes: u32,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&self, account: Account) {
        self.state.lock().accounts.insert(account.id, account);
    }

    pub fn account(&self, account_id: Uuid) -> Option<Account> {
        self.state.lock().accounts.get(&account_id).cloned()
    }

    pub fn insert_period(&self, period: SettlementPeriod) -> SettlementPeriod {
        self.state.lock().periods.insert(period.id, period.clone());
        period
    }

    pub fn period(&self, period_id: Uuid) -> Option<SettlementPeriod> {
        self.state.lock().periods.get(&period_id).cloned()
    }

    pub fn periods_for(&self, account_id: Uuid) -> Vec<SettlementPeriod> {
        let mut periods: Vec<_> = self
            .state
            .lock()
            .periods
            .values()
            .filter(|p| p.account_id == account_id)
            .cloned()
            .collect();
        periods.sort_by_key(|p| p.period_start);
        periods
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.lock().snapshots.len()
    }

    /// Period writes for this account fail with a database-style error
    pub fn fail_writes_for(&self, account_id: Uuid) {
        self.state.lock().failing_accounts.push(account_id);
    }

    /// Period lookups by id sleep this long first
    pub fn set_lookup_delay(&self, delay: std::time::Duration) {
        self.state.lock().lookup_delay = Some(delay);
    }

    /// The next `count` status writes fail with a database-style error
    pub fn fail_status_writes(&self, count: u32) {
        self.state.lock().fail_status_writes = count;
    }
}

#[async_trait]
impl SettlementStore for InMemoryStore {
    async fn get_active_accounts(&self) -> AppResult<Vec<Account>> {
        let mut accounts: Vec<_> = self
            .state
            .lock()
            .accounts
            .values()
            .filter(|a| a.is_active())
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.created_at);
        Ok(accounts)
    }

    async fn get_latest_settlement_period(
        &self,
        account_id: Uuid,
        before: DateTime<Utc>,
    ) -> AppResult<Option<SettlementPeriod>> {
        Ok(self
            .state
            .lock()
            .periods
            .values()
            .filter(|p| p.account_id == account_id && p.period_end <= before && !p.degraded)
            .max_by_key(|p| p.period_end)
            .cloned())
    }

    async fn find_settlement_period(
        &self,
        account_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> AppResult<Option<SettlementPeriod>> {
        Ok(self
            .state
            .lock()
            .periods
            .values()
            .find(|p| p.account_id == account_id && p.period_start == period_start && p.period_end == period_end)
            .cloned())
    }

    async fn get_settlement_period(&self, period_id: Uuid) -> AppResult<Option<SettlementPeriod>> {
        let delay = self.state.lock().lookup_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.period(period_id))
    }

    async fn create_settlement_period(&self, period: &NewSettlementPeriod) -> AppResult<Uuid> {
        let mut state = self.state.lock();
        if state.failing_accounts.contains(&period.account_id) {
            return Err(AppError::Ledger("store write failed".to_string()));
        }
        let duplicate = state.periods.values().any(|p| {
            p.account_id == period.account_id
                && p.period_start == period.period_start
                && p.period_end == period.period_end
        });
        if duplicate {
            return Err(SettlementError::DuplicatePeriod {
                account_id: period.account_id,
                period_start: period.period_start,
            }
            .into());
        }

        let id = Uuid::new_v4();
        state.periods.insert(id, period.clone().into_period(id, Utc::now()));
        Ok(id)
    }

    async fn update_settlement_status(
        &self,
        period_id: Uuid,
        status: SettlementStatus,
        invoice_id: Option<&str>,
    ) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.fail_status_writes > 0 {
            state.fail_status_writes -= 1;
            return Err(AppError::Ledger("status write failed".to_string()));
        }
        let period = state
            .periods
            .get_mut(&period_id)
            .ok_or_else(|| AppError::NotFound(format!("Settlement period {} not found", period_id)))?;

        if !period.status.can_transition_to(status) {
            return Err(SettlementError::InvalidTransition {
                period_id,
                from: period.status,
                to: status,
            }
            .into());
        }

        period.status = status;
        if let Some(invoice_id) = invoice_id {
            period.invoice_id = Some(invoice_id.to_string());
        }
        period.updated_at = Utc::now();
        Ok(())
    }

    async fn get_pending_settlement_periods(&self) -> AppResult<Vec<SettlementPeriod>> {
        let mut periods: Vec<_> = self
            .state
            .lock()
            .periods
            .values()
            .filter(|p| p.status == SettlementStatus::Pending && !p.degraded && p.profit_share_due > Decimal::ZERO)
            .cloned()
            .collect();
        periods.sort_by_key(|p| p.period_end);
        Ok(periods)
    }

    async fn get_settlement_periods_by_status(&self, status: SettlementStatus) -> AppResult<Vec<SettlementPeriod>> {
        let mut periods: Vec<_> = self
            .state
            .lock()
            .periods
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        periods.sort_by_key(|p| p.period_end);
        Ok(periods)
    }

    async fn get_account_settlement_history(&self, account_id: Uuid, limit: i64) -> AppResult<Vec<SettlementPeriod>> {
        let mut periods = self.periods_for(account_id);
        periods.reverse();
        periods.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(periods)
    }

    async fn get_platform_stats(&self) -> AppResult<PlatformStats> {
        let state = self.state.lock();
        let mut stats = PlatformStats {
            period_count: state.periods.len() as i64,
            total_due: Decimal::ZERO,
            total_paid: Decimal::ZERO,
            total_outstanding: Decimal::ZERO,
        };
        for period in state.periods.values() {
            if !period.degraded {
                stats.total_due += period.profit_share_due;
            }
            match period.status {
                SettlementStatus::Paid => stats.total_paid += period.profit_share_due,
                SettlementStatus::Pending | SettlementStatus::Invoiced | SettlementStatus::Failed if !period.degraded => {
                    stats.total_outstanding += period.profit_share_due
                }
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn create_balance_snapshot(
        &self,
        account_id: Uuid,
        kind: SnapshotKind,
        total_balance: Decimal,
        _unrealized_pnl: Decimal,
    ) -> AppResult<Uuid> {
        self.state.lock().snapshots.push((account_id, kind, total_balance));
        Ok(Uuid::new_v4())
    }
}

#[async_trait]
impl AccountStore for InMemoryStore {
    async fn get_account(&self, account_id: Uuid) -> AppResult<Option<Account>> {
        Ok(self.account(account_id))
    }

    async fn get_account_by_customer_id(&self, customer_id: &str) -> AppResult<Option<Account>> {
        Ok(self
            .state
            .lock()
            .accounts
            .values()
            .find(|a| a.billing_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn set_billing_customer_id(&self, account_id: Uuid, customer_id: &str) -> AppResult<()> {
        if let Some(account) = self.state.lock().accounts.get_mut(&account_id) {
            if account.billing_customer_id.is_none() {
                account.billing_customer_id = Some(customer_id.to_string());
            }
        }
        Ok(())
    }

    async fn update_subscription_status(&self, account_id: Uuid, status: SubscriptionStatus) -> AppResult<()> {
        if let Some(account) = self.state.lock().accounts.get_mut(&account_id) {
            account.subscription_status = status;
        }
        Ok(())
    }

    async fn update_subscription_tier(&self, account_id: Uuid, tier: SubscriptionTier) -> AppResult<()> {
        if let Some(account) = self.state.lock().accounts.get_mut(&account_id) {
            account.subscription_tier = tier;
        }
        Ok(())
    }
}

// ========== GATEWAY ==========

/// Gateway calls that can be made to fail once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStep {
    CreateInvoice,
    CreateItem,
    Finalize,
}

struct FakeInvoice {
    customer_id: String,
    invoice: GatewayInvoice,
}

struct FakeItem {
    idempotency_key: String,
    invoice_id: String,
    item: GatewayInvoiceItem,
}

#[derive(Default)]
struct GatewayState {
    customers: u32,
    invoices: Vec<FakeInvoice>,
    items: Vec<FakeItem>,
    /// Live idempotency keys and the response first returned for them
    invoice_keys: HashMap<String, GatewayInvoice>,
    item_keys: HashMap<String, String>,
    paid: Vec<String>,
    fail_invoices: bool,
    fail_once: Vec<GatewayStep>,
}

impl GatewayState {
    fn take_failure(&mut self, step: GatewayStep) -> AppResult<()> {
        if let Some(pos) = self.fail_once.iter().position(|s| *s == step) {
            self.fail_once.remove(pos);
            return Err(unavailable());
        }
        Ok(())
    }
}

fn unavailable() -> AppError {
    GatewayError::Api {
        status: 503,
        message: "service unavailable".to_string(),
    }
    .into()
}

/// Stripe-shaped fake: items attach to one invoice, idempotency keys can expire
pub struct FakeGateway {
    configured: bool,
    state: Mutex<GatewayState>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            configured: true,
            state: Mutex::new(GatewayState::default()),
        }
    }

    pub fn unconfigured() -> Self {
        Self {
            configured: false,
            state: Mutex::new(GatewayState::default()),
        }
    }

    /// Every invoice creation returns a 503
    pub fn fail_invoices(&self) {
        self.state.lock().fail_invoices = true;
    }

    /// The next call of `step` returns a 503
    pub fn fail_once(&self, step: GatewayStep) {
        self.state.lock().fail_once.push(step);
    }

    /// Forget every idempotency key, as the gateway does after 24h
    pub fn expire_idempotency_keys(&self) {
        let mut state = self.state.lock();
        state.invoice_keys.clear();
        state.item_keys.clear();
    }

    pub fn customers_created(&self) -> u32 {
        self.state.lock().customers
    }

    /// (idempotency key, amount in cents) per created line item
    pub fn invoice_items(&self) -> Vec<(String, i64)> {
        self.state
            .lock()
            .items
            .iter()
            .map(|i| (i.idempotency_key.clone(), i.item.amount))
            .collect()
    }

    pub fn invoice_count(&self) -> usize {
        self.state.lock().invoices.len()
    }

    /// Amounts billed on one invoice
    pub fn invoice_lines(&self, invoice_id: &str) -> Vec<i64> {
        self.state
            .lock()
            .items
            .iter()
            .filter(|i| i.invoice_id == invoice_id)
            .map(|i| i.item.amount)
            .collect()
    }

    pub fn invoice_status(&self, invoice_id: &str) -> Option<String> {
        self.state
            .lock()
            .invoices
            .iter()
            .find(|i| i.invoice.id == invoice_id)
            .and_then(|i| i.invoice.status.clone())
    }

    pub fn paid_invoices(&self) -> Vec<String> {
        self.state.lock().paid.clone()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn create_customer(&self, _email: &str, _name: Option<&str>, _metadata: &HashMap<String, String>) -> AppResult<String> {
        let mut state = self.state.lock();
        state.customers += 1;
        Ok(format!("cus_{}", state.customers))
    }

    async fn create_invoice_item(&self, request: &InvoiceItemRequest, idempotency_key: &str) -> AppResult<String> {
        let mut state = self.state.lock();
        if let Some(id) = state.item_keys.get(idempotency_key) {
            return Ok(id.clone());
        }
        state.take_failure(GatewayStep::CreateItem)?;

        let draft = state
            .invoices
            .iter()
            .any(|i| i.invoice.id == request.invoice_id && i.invoice.is_draft());
        if !draft {
            return Err(GatewayError::Api {
                status: 400,
                message: format!("Invoice {} is not a draft", request.invoice_id),
            }
            .into());
        }

        let id = format!("ii_{}", state.items.len() + 1);
        state.items.push(FakeItem {
            idempotency_key: idempotency_key.to_string(),
            invoice_id: request.invoice_id.clone(),
            item: GatewayInvoiceItem {
                id: id.clone(),
                amount: request.amount_cents,
                invoice: Some(request.invoice_id.clone()),
                metadata: request.metadata.clone(),
            },
        });
        state.item_keys.insert(idempotency_key.to_string(), id.clone());
        Ok(id)
    }

    async fn create_invoice(&self, request: &InvoiceRequest, idempotency_key: &str) -> AppResult<GatewayInvoice> {
        let mut state = self.state.lock();
        if let Some(cached) = state.invoice_keys.get(idempotency_key) {
            return Ok(cached.clone());
        }
        if state.fail_invoices {
            return Err(unavailable());
        }
        state.take_failure(GatewayStep::CreateInvoice)?;

        let invoice = GatewayInvoice {
            id: format!("in_{}", state.invoices.len() + 1),
            status: Some("draft".to_string()),
            amount_due: 0,
            hosted_invoice_url: None,
            metadata: request.metadata.clone(),
        };
        state.invoices.push(FakeInvoice {
            customer_id: request.customer_id.clone(),
            invoice: invoice.clone(),
        });
        state.invoice_keys.insert(idempotency_key.to_string(), invoice.clone());
        Ok(invoice)
    }

    async fn list_invoices(&self, customer_id: &str) -> AppResult<Vec<GatewayInvoice>> {
        Ok(self
            .state
            .lock()
            .invoices
            .iter()
            .filter(|i| i.customer_id == customer_id)
            .map(|i| i.invoice.clone())
            .collect())
    }

    async fn list_invoice_items(&self, invoice_id: &str) -> AppResult<Vec<GatewayInvoiceItem>> {
        Ok(self
            .state
            .lock()
            .items
            .iter()
            .filter(|i| i.invoice_id == invoice_id)
            .map(|i| i.item.clone())
            .collect())
    }

    async fn finalize_invoice(&self, invoice_id: &str) -> AppResult<GatewayInvoice> {
        let mut state = self.state.lock();
        state.take_failure(GatewayStep::Finalize)?;

        let amount_due: i64 = state
            .items
            .iter()
            .filter(|i| i.invoice_id == invoice_id)
            .map(|i| i.item.amount)
            .sum();
        let entry = state
            .invoices
            .iter_mut()
            .find(|i| i.invoice.id == invoice_id)
            .ok_or_else(|| AppError::NotFound(format!("Invoice {} not found", invoice_id)))?;
        if !entry.invoice.is_draft() {
            return Err(GatewayError::Api {
                status: 400,
                message: "This invoice is already finalized".to_string(),
            }
            .into());
        }

        entry.invoice.status = Some("open".to_string());
        entry.invoice.amount_due = amount_due;
        Ok(entry.invoice.clone())
    }

    async fn pay_invoice(&self, invoice_id: &str) -> AppResult<GatewayInvoice> {
        self.state.lock().paid.push(invoice_id.to_string());
        Ok(GatewayInvoice {
            id: invoice_id.to_string(),
            status: Some("paid".to_string()),
            amount_due: 0,
            hosted_invoice_url: None,
            metadata: HashMap::new(),
        })
    }

    async fn get_invoice(&self, invoice_id: &str) -> AppResult<GatewayInvoice> {
        self.state
            .lock()
            .invoices
            .iter()
            .find(|i| i.invoice.id == invoice_id)
            .map(|i| i.invoice.clone())
            .ok_or_else(|| AppError::NotFound(format!("Invoice {} not found", invoice_id)))
    }

    async fn create_subscription(
        &self,
        _customer_id: &str,
        _price_id: &str,
        metadata: &HashMap<String, String>,
    ) -> AppResult<GatewaySubscription> {
        Ok(GatewaySubscription {
            id: "sub_1".to_string(),
            status: "active".to_string(),
            cancel_at_period_end: false,
            metadata: metadata.clone(),
        })
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> AppResult<GatewaySubscription> {
        Ok(GatewaySubscription {
            id: subscription_id.to_string(),
            status: "active".to_string(),
            cancel_at_period_end: true,
            metadata: HashMap::new(),
        })
    }

    async fn create_checkout_session(&self, _request: &CheckoutRequest) -> AppResult<CheckoutSession> {
        Ok(CheckoutSession {
            id: "cs_1".to_string(),
            url: Some("https://checkout.example.com/cs_1".to_string()),
        })
    }

    async fn create_portal_session(&self, _customer_id: &str, return_url: &str) -> AppResult<PortalSession> {
        Ok(PortalSession {
            id: "bps_1".to_string(),
            url: return_url.to_string(),
        })
    }
}
