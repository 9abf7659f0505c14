use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::{str::FromStr, sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult, GatewayError},
    ledger::{
        models::*,
        traits::{AccountStore, SettlementStore},
    },
    settlement::with_timeout,
};

type HmacSha256 = Hmac<Sha256>;

/// Parsed `Stripe-Signature` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    /// Raw MAC bytes of every `v1` entry
    pub signatures: Vec<Vec<u8>>,
}

/// `t=<unix>,v1=<hex>[,v1=<hex>...]`; other keys are ignored
pub fn parse_signature_header(header: &str) -> AppResult<SignatureHeader> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" => {
                // an undecodable entry can never match; skip it
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    match timestamp {
        Some(timestamp) if !signatures.is_empty() => Ok(SignatureHeader { timestamp, signatures }),
        _ => Err(GatewayError::InvalidSignature.into()),
    }
}

fn signing_mac(secret: &str, timestamp: i64, payload: &[u8]) -> AppResult<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Internal(format!("Invalid webhook secret: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

/// Hex HMAC-SHA256 over `timestamp + "." + payload`
pub fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> AppResult<String> {
    let mac = signing_mac(secret, timestamp, payload)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Accept only if some `v1` entry matches (constant time) and the timestamp is fresh
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: u64,
    now: i64,
) -> AppResult<()> {
    if secret.is_empty() {
        return Err(GatewayError::InvalidSignature.into());
    }

    let parsed = parse_signature_header(header)?;

    if tolerance_secs > 0 && (now - parsed.timestamp).unsigned_abs() > tolerance_secs {
        warn!("Webhook timestamp {} outside tolerance", parsed.timestamp);
        return Err(GatewayError::InvalidSignature.into());
    }

    for signature in &parsed.signatures {
        let mac = signing_mac(secret, parsed.timestamp, payload)?;
        if mac.verify_slice(signature).is_ok() {
            return Ok(());
        }
    }

    Err(GatewayError::InvalidSignature.into())
}

/// Inbound event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
    #[serde(default)]
    pub created: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    id: String,
    #[serde(default)]
    metadata: std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    customer: String,
    status: String,
    #[serde(default)]
    metadata: std::collections::HashMap<String, String>,
}

/// Result of handling one verified event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookOutcome {
    PeriodUpdated { period_id: Uuid, status: SettlementStatus },
    /// Replay or stale event; state left untouched
    NoChange { period_id: Uuid, status: SettlementStatus },
    SubscriptionUpdated { account_id: Uuid },
    Ignored { event_type: String },
}

/// Verifies and dispatches gateway webhooks
pub struct WebhookProcessor {
    secret: Option<String>,
    tolerance_secs: u64,
    store: Arc<dyn SettlementStore>,
    accounts: Arc<dyn AccountStore>,
    call_timeout: Duration,
}

impl WebhookProcessor {
    pub fn new(
        secret: Option<String>,
        tolerance_secs: u64,
        store: Arc<dyn SettlementStore>,
        accounts: Arc<dyn AccountStore>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            secret,
            tolerance_secs,
            store,
            accounts,
            call_timeout,
        }
    }

    /// Verify the raw body against its signature header, then dispatch
    pub async fn handle(&self, payload: &[u8], signature_header: Option<&str>) -> AppResult<WebhookOutcome> {
        // Step 1: authenticate before parsing anything
        let secret = self.secret.as_deref().unwrap_or_default();
        let header = signature_header.ok_or(GatewayError::InvalidSignature)?;
        verify_signature(payload, header, secret, self.tolerance_secs, Utc::now().timestamp())?;

        // Step 2: decode the envelope
        let event: WebhookEvent = serde_json::from_slice(payload)?;
        info!("📨 Webhook {} received: {}", event.id, event.event_type);

        // Step 3: dispatch
        self.dispatch(&event).await
    }

    pub async fn dispatch(&self, event: &WebhookEvent) -> AppResult<WebhookOutcome> {
        match event.event_type.as_str() {
            "invoice.paid" => self.apply_invoice_event(event, SettlementStatus::Paid).await,
            "invoice.payment_failed" => self.apply_invoice_event(event, SettlementStatus::Failed).await,
            "customer.subscription.created" | "customer.subscription.updated" => {
                self.apply_subscription_change(event).await
            }
            "customer.subscription.deleted" => self.apply_subscription_deleted(event).await,
            other => {
                debug!("Ignoring webhook event type {}", other);
                Ok(WebhookOutcome::Ignored {
                    event_type: other.to_string(),
                })
            }
        }
    }

    async fn apply_invoice_event(&self, event: &WebhookEvent, target: SettlementStatus) -> AppResult<WebhookOutcome> {
        let invoice: InvoiceObject = serde_json::from_value(event.data.object.clone())?;

        // Only profit-share invoices map back to a period
        if invoice.metadata.get("type").map(String::as_str) != Some("profit_share") {
            return Ok(WebhookOutcome::Ignored {
                event_type: event.event_type.clone(),
            });
        }
        let period_id = invoice
            .metadata
            .get("period_id")
            .and_then(|id| Uuid::from_str(id).ok())
            .ok_or_else(|| GatewayError::MalformedPayload("invoice metadata lacks period_id".to_string()))?;

        let period = with_timeout(self.call_timeout, "period lookup", self.store.get_settlement_period(period_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Settlement period {} not found", period_id)))?;

        let mut current = period.status;

        if current == target {
            debug!(period_id = %period_id, "Webhook replay, period already {}", current);
            return Ok(WebhookOutcome::NoChange { period_id, status: current });
        }
        if target == SettlementStatus::Failed && current == SettlementStatus::Paid {
            warn!(period_id = %period_id, "Stale payment_failed for a paid period ignored");
            return Ok(WebhookOutcome::NoChange { period_id, status: current });
        }

        // Webhook raced ahead of our own invoiced write
        if current == SettlementStatus::Pending {
            self.record_status(period_id, SettlementStatus::Invoiced, Some(&invoice.id))
                .await?;
            current = SettlementStatus::Invoiced;
        }

        // Failed periods must be re-invoiced before they can be paid
        if current == SettlementStatus::Failed && target == SettlementStatus::Paid {
            self.record_status(period_id, SettlementStatus::Invoiced, None).await?;
        }

        self.record_status(period_id, target, Some(&invoice.id)).await?;

        info!(period_id = %period_id, "✅ Settlement period marked {} (invoice {})", target, invoice.id);
        Ok(WebhookOutcome::PeriodUpdated { period_id, status: target })
    }

    async fn apply_subscription_change(&self, event: &WebhookEvent) -> AppResult<WebhookOutcome> {
        let subscription: SubscriptionObject = serde_json::from_value(event.data.object.clone())?;
        let account = self.account_for_customer(&subscription.customer).await?;

        let status = SubscriptionStatus::from_gateway(&subscription.status);
        with_timeout(
            self.call_timeout,
            "subscription status write",
            self.accounts.update_subscription_status(account.id, status),
        )
        .await?;

        if let Some(tier) = subscription.metadata.get("tier") {
            with_timeout(
                self.call_timeout,
                "subscription tier write",
                self.accounts.update_subscription_tier(account.id, SubscriptionTier::parse(tier)),
            )
            .await?;
        }

        info!(
            account_id = %account.id,
            "Subscription {} is {} ({:?})",
            subscription.id, subscription.status, status
        );
        Ok(WebhookOutcome::SubscriptionUpdated { account_id: account.id })
    }

    async fn apply_subscription_deleted(&self, event: &WebhookEvent) -> AppResult<WebhookOutcome> {
        let subscription: SubscriptionObject = serde_json::from_value(event.data.object.clone())?;
        let account = self.account_for_customer(&subscription.customer).await?;

        with_timeout(
            self.call_timeout,
            "subscription tier write",
            self.accounts.update_subscription_tier(account.id, SubscriptionTier::Free),
        )
        .await?;
        with_timeout(
            self.call_timeout,
            "subscription status write",
            self.accounts.update_subscription_status(account.id, SubscriptionStatus::Cancelled),
        )
        .await?;

        info!(account_id = %account.id, "Subscription {} deleted, downgraded to free", subscription.id);
        Ok(WebhookOutcome::SubscriptionUpdated { account_id: account.id })
    }

    async fn account_for_customer(&self, customer_id: &str) -> AppResult<Account> {
        with_timeout(
            self.call_timeout,
            "account lookup",
            self.accounts.get_account_by_customer_id(customer_id),
        )
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No account for customer {}", customer_id)))
    }

    async fn record_status(&self, period_id: Uuid, status: SettlementStatus, invoice_id: Option<&str>) -> AppResult<()> {
        with_timeout(
            self.call_timeout,
            "settlement status write",
            self.store.update_settlement_status(period_id, status, invoice_id),
        )
        .await
    }
}
