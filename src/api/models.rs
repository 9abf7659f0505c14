use crate::ledger::models::*;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ========== REQUEST MODELS ==========

/// Query for GET /settlement/history/:account_id
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Number of most recent periods (default 12, max 104)
    pub limit: Option<i64>,
}

impl HistoryQuery {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(12).clamp(1, 104)
    }
}

// ========== RESPONSE MODELS ==========

/// Webhook acknowledgement
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: crate::billing::webhook::WebhookOutcome,
}

#[derive(Debug, Serialize)]
pub struct PendingSettlementsResponse {
    pub count: usize,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_due: Decimal,
    pub periods: Vec<SettlementPeriod>,
}

#[derive(Debug, Serialize)]
pub struct SettlementHistoryResponse {
    pub account_id: uuid::Uuid,
    pub periods: Vec<SettlementPeriod>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub scheduler_running: bool,
    pub gateway_configured: bool,
}

/// Body of POST /billing/accounts/:account_id/checkout
#[derive(Debug, Deserialize)]
pub struct CheckoutSessionRequest {
    pub tier: SubscriptionTier,
    pub success_url: String,
    pub cancel_url: String,
}

/// Body of POST /billing/accounts/:account_id/portal
#[derive(Debug, Deserialize)]
pub struct PortalSessionRequest {
    pub return_url: String,
}

/// Body of POST /billing/accounts/:account_id/subscription
#[derive(Debug, Deserialize)]
pub struct SubscriptionRequest {
    pub tier: SubscriptionTier,
}
