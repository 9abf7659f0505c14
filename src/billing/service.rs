use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::info;
use uuid::Uuid;

use crate::{
    billing::stripe::{
        CheckoutRequest, CheckoutSession, GatewayInvoice, GatewaySubscription, InvoiceItemRequest,
        InvoiceRequest, PaymentGateway, PortalSession, StripeConfig,
    },
    error::{AppError, AppResult, GatewayError, SettlementError},
    ledger::{
        models::*,
        traits::{AccountStore, SettlementStore},
    },
    settlement::with_timeout,
};

/// What `invoice_period` did for a period
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "invoice_id", rename_all = "snake_case")]
pub enum InvoiceOutcome {
    /// New line item and invoice created and finalized
    Created(String),
    /// The period already referenced an invoice; only the status was recorded
    Recorded(String),
    /// Payment re-attempted on the existing invoice of a failed period
    Retried(String),
}

impl InvoiceOutcome {
    pub fn invoice_id(&self) -> &str {
        match self {
            InvoiceOutcome::Created(id) | InvoiceOutcome::Recorded(id) | InvoiceOutcome::Retried(id) => id,
        }
    }
}

/// Billing orchestration: customer identity, profit-share invoices, subscriptions
pub struct BillingService {
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<dyn SettlementStore>,
    accounts: Arc<dyn AccountStore>,
    prices: HashMap<SubscriptionTier, String>,
    call_timeout: Duration,
}

impl BillingService {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn SettlementStore>,
        accounts: Arc<dyn AccountStore>,
        stripe_config: &StripeConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            store,
            accounts,
            prices: stripe_config.prices.clone(),
            call_timeout,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.gateway.is_configured()
    }

    /// Cached billing identity, created on first use
    pub async fn get_or_create_customer(&self, account: &Account) -> AppResult<String> {
        if let Some(customer_id) = account.billing_customer_id.as_deref().filter(|id| !id.is_empty()) {
            return Ok(customer_id.to_string());
        }

        let mut metadata = HashMap::new();
        metadata.insert("account_id".to_string(), account.id.to_string());

        let customer_id = with_timeout(
            self.call_timeout,
            "create customer",
            self.gateway
                .create_customer(&account.email, account.name.as_deref(), &metadata),
        )
        .await?;

        with_timeout(
            self.call_timeout,
            "cache customer id",
            self.accounts.set_billing_customer_id(account.id, &customer_id),
        )
        .await?;

        info!(account_id = %account.id, "✅ Billing customer {} linked", customer_id);
        Ok(customer_id)
    }

    /// Invoice a persisted period. Safe to call again for the same period.
    pub async fn invoice_period(&self, period: &SettlementPeriod) -> AppResult<InvoiceOutcome> {
        // Step 1: refuse what must never be billed
        if period.degraded {
            return Err(SettlementError::DegradedReport(period.id).into());
        }
        if !matches!(period.status, SettlementStatus::Pending | SettlementStatus::Failed) {
            return Err(SettlementError::NotInvoiceable {
                period_id: period.id,
                status: period.status,
            }
            .into());
        }
        if !self.is_configured() {
            return Err(GatewayError::NotConfigured.into());
        }

        // Step 2: an invoice already exists for this period
        if let Some(invoice_id) = period.invoice_id.as_deref().filter(|id| !id.is_empty()) {
            return match period.status {
                SettlementStatus::Failed => {
                    with_timeout(self.call_timeout, "pay invoice", self.gateway.pay_invoice(invoice_id)).await?;
                    self.record_status(period.id, SettlementStatus::Invoiced, None).await?;
                    info!(period_id = %period.id, "🔁 Payment re-attempted on invoice {}", invoice_id);
                    Ok(InvoiceOutcome::Retried(invoice_id.to_string()))
                }
                _ => {
                    self.record_status(period.id, SettlementStatus::Invoiced, None).await?;
                    Ok(InvoiceOutcome::Recorded(invoice_id.to_string()))
                }
            };
        }

        // Step 3: billing identity
        let account = with_timeout(self.call_timeout, "account lookup", self.accounts.get_account(period.account_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Account {} not found", period.account_id)))?;
        let customer_id = self.get_or_create_customer(&account).await?;

        // Step 4: reuse whatever the gateway already holds for this period.
        // Idempotency keys expire, so the metadata tag is the durable link.
        let description = invoice_description(period);
        let metadata = invoice_metadata(period);

        let invoice = match self.find_period_invoice(&customer_id, period.id).await? {
            Some(invoice) => {
                info!(period_id = %period.id, "Reusing invoice {} ({:?})", invoice.id, invoice.status);
                invoice
            }
            None => {
                with_timeout(
                    self.call_timeout,
                    "create invoice",
                    self.gateway.create_invoice(
                        &InvoiceRequest {
                            customer_id: customer_id.clone(),
                            description: description.clone(),
                            metadata: metadata.clone(),
                        },
                        &format!("profit-share-invoice-{}", period.id),
                    ),
                )
                .await?
            }
        };
        if invoice.is_void() {
            return Err(GatewayError::Api {
                status: 409,
                message: format!("Invoice {} for period {} was voided", invoice.id, period.id),
            }
            .into());
        }

        // Step 5: the line item lives on this draft only, then finalize.
        // A non-draft invoice was finalized by an earlier attempt.
        let invoice = if invoice.is_draft() {
            self.ensure_line_item(period, &customer_id, &invoice.id, &description, &metadata)
                .await?;
            with_timeout(
                self.call_timeout,
                "finalize invoice",
                self.gateway.finalize_invoice(&invoice.id),
            )
            .await?
        } else {
            invoice
        };

        // Step 6: record the reference
        self.record_status(period.id, SettlementStatus::Invoiced, Some(&invoice.id))
            .await?;

        info!(
            period_id = %period.id,
            account_id = %period.account_id,
            amount = %period.profit_share_due,
            "🧾 Invoice {} created",
            invoice.id
        );

        Ok(InvoiceOutcome::Created(invoice.id))
    }

    /// The non-void invoice tagged with this period, if one exists
    async fn find_period_invoice(&self, customer_id: &str, period_id: Uuid) -> AppResult<Option<GatewayInvoice>> {
        let tag = period_id.to_string();
        let invoices = with_timeout(
            self.call_timeout,
            "list invoices",
            self.gateway.list_invoices(customer_id),
        )
        .await?;

        Ok(invoices
            .into_iter()
            .find(|invoice| !invoice.is_void() && invoice.metadata.get("period_id") == Some(&tag)))
    }

    async fn ensure_line_item(
        &self,
        period: &SettlementPeriod,
        customer_id: &str,
        invoice_id: &str,
        description: &str,
        metadata: &HashMap<String, String>,
    ) -> AppResult<()> {
        let tag = period.id.to_string();
        let items = with_timeout(
            self.call_timeout,
            "list invoice items",
            self.gateway.list_invoice_items(invoice_id),
        )
        .await?;
        if items.iter().any(|item| item.metadata.get("period_id") == Some(&tag)) {
            return Ok(());
        }

        with_timeout(
            self.call_timeout,
            "create invoice item",
            self.gateway.create_invoice_item(
                &InvoiceItemRequest {
                    customer_id: customer_id.to_string(),
                    invoice_id: invoice_id.to_string(),
                    amount_cents: to_cents(period.profit_share_due)?,
                    currency: "usd".to_string(),
                    description: description.to_string(),
                    metadata: metadata.clone(),
                },
                &format!("profit-share-item-{}", period.id),
            ),
        )
        .await?;
        Ok(())
    }

    async fn record_status(&self, period_id: Uuid, status: SettlementStatus, invoice_id: Option<&str>) -> AppResult<()> {
        with_timeout(
            self.call_timeout,
            "settlement status write",
            self.store.update_settlement_status(period_id, status, invoice_id),
        )
        .await
    }

    pub async fn get_invoice(&self, invoice_id: &str) -> AppResult<GatewayInvoice> {
        with_timeout(self.call_timeout, "get invoice", self.gateway.get_invoice(invoice_id)).await
    }

    pub async fn create_subscription(&self, account_id: Uuid, tier: SubscriptionTier) -> AppResult<GatewaySubscription> {
        let account = self.require_account(account_id).await?;
        let price_id = self.price_for(tier)?;
        let customer_id = self.get_or_create_customer(&account).await?;

        let subscription = with_timeout(
            self.call_timeout,
            "create subscription",
            self.gateway
                .create_subscription(&customer_id, &price_id, &subscription_metadata(account_id, tier)),
        )
        .await?;

        info!(account_id = %account_id, tier = %tier, "📝 Subscription {} created", subscription.id);
        Ok(subscription)
    }

    pub async fn cancel_subscription(&self, subscription_id: &str) -> AppResult<GatewaySubscription> {
        let subscription = with_timeout(
            self.call_timeout,
            "cancel subscription",
            self.gateway.cancel_subscription(subscription_id),
        )
        .await?;

        info!("Subscription {} set to cancel at period end", subscription_id);
        Ok(subscription)
    }

    pub async fn create_checkout_session(
        &self,
        account_id: Uuid,
        tier: SubscriptionTier,
        success_url: &str,
        cancel_url: &str,
    ) -> AppResult<CheckoutSession> {
        let account = self.require_account(account_id).await?;
        let price_id = self.price_for(tier)?;
        let customer_id = self.get_or_create_customer(&account).await?;

        with_timeout(
            self.call_timeout,
            "create checkout session",
            self.gateway.create_checkout_session(&CheckoutRequest {
                customer_id,
                price_id,
                success_url: success_url.to_string(),
                cancel_url: cancel_url.to_string(),
                metadata: subscription_metadata(account_id, tier),
            }),
        )
        .await
    }

    pub async fn create_portal_session(&self, account_id: Uuid, return_url: &str) -> AppResult<PortalSession> {
        let account = self.require_account(account_id).await?;
        let customer_id = self.get_or_create_customer(&account).await?;

        with_timeout(
            self.call_timeout,
            "create portal session",
            self.gateway.create_portal_session(&customer_id, return_url),
        )
        .await
    }

    async fn require_account(&self, account_id: Uuid) -> AppResult<Account> {
        with_timeout(self.call_timeout, "account lookup", self.accounts.get_account(account_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Account {} not found", account_id)))
    }

    fn price_for(&self, tier: SubscriptionTier) -> AppResult<String> {
        self.prices
            .get(&tier)
            .cloned()
            .ok_or_else(|| GatewayError::NoPriceForTier(tier.to_string()).into())
    }
}

/// "Trading Profit Share - Jan 1 to Jan 8, 2024 (20% of $500.00 profit)"
pub fn invoice_description(period: &SettlementPeriod) -> String {
    let rate_pct = (period.profit_share_rate * Decimal::ONE_HUNDRED).normalize();
    format!(
        "Trading Profit Share - {} to {} ({}% of ${:.2} profit)",
        period.period_start.format("%b %-d"),
        period.period_end.format("%b %-d, %Y"),
        rate_pct,
        period.net_profit.round_dp(2),
    )
}

pub fn invoice_metadata(period: &SettlementPeriod) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert("period_id".to_string(), period.id.to_string());
    metadata.insert("account_id".to_string(), period.account_id.to_string());
    metadata.insert("type".to_string(), "profit_share".to_string());
    metadata
}

fn subscription_metadata(account_id: Uuid, tier: SubscriptionTier) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert("account_id".to_string(), account_id.to_string());
    metadata.insert("tier".to_string(), tier.to_string());
    metadata
}

/// Dollars to integer cents, midpoint away from zero
pub fn to_cents(amount: Decimal) -> AppResult<i64> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| AppError::InvalidInput(format!("Amount {} out of range", amount)))
}
