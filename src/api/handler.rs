use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use super::models::*;
use crate::{
    billing::{
        service::BillingService,
        stripe::{CheckoutSession, GatewayInvoice, GatewaySubscription, PortalSession},
        webhook::WebhookProcessor,
    },
    error::AppResult,
    ledger::models::PlatformStats,
    settlement::{
        scheduler::{SchedulerStatus, SettlementScheduler},
        service::{AccountSettlement, BatchSummary, RetrySummary, SettlementService},
    },
};

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<SettlementScheduler>,
    pub settlement: Arc<SettlementService>,
    pub billing: Arc<BillingService>,
    pub webhooks: Arc<WebhookProcessor>,
}

/// Stripe webhook endpoint
/// POST /webhook/stripe
///
/// The raw body is verified against `Stripe-Signature` before anything is parsed;
/// a bad signature is a 400 with no state change.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookAck>> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok());

    let outcome = state.webhooks.handle(&body, signature).await.map_err(|e| {
        error!("Webhook rejected: {}", e);
        e
    })?;

    Ok(Json(WebhookAck {
        received: true,
        outcome,
    }))
}

/// GET /settlement/status
pub async fn get_scheduler_status(State(state): State<AppState>) -> Json<SchedulerStatus> {
    Json(state.scheduler.status())
}

/// GET /settlement/pending - periods awaiting an invoice
pub async fn get_pending_settlements(
    State(state): State<AppState>,
) -> AppResult<Json<PendingSettlementsResponse>> {
    let periods = state.settlement.get_pending_settlements().await?;
    let total_due = periods
        .iter()
        .map(|p| p.profit_share_due)
        .fold(Decimal::ZERO, |acc, due| acc + due);

    Ok(Json(PendingSettlementsResponse {
        count: periods.len(),
        total_due,
        periods,
    }))
}

/// GET /settlement/stats
pub async fn get_platform_stats(State(state): State<AppState>) -> AppResult<Json<PlatformStats>> {
    Ok(Json(state.settlement.get_platform_stats().await?))
}

/// GET /settlement/history/:account_id
pub async fn get_settlement_history(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<SettlementHistoryResponse>> {
    let periods = state
        .settlement
        .get_account_settlement_history(account_id, query.limit())
        .await?;

    Ok(Json(SettlementHistoryResponse { account_id, periods }))
}

/// POST /settlement/run - settle the most recently closed week now
pub async fn run_settlement(State(state): State<AppState>) -> AppResult<Json<BatchSummary>> {
    info!("Operator-triggered settlement pass");
    Ok(Json(state.scheduler.run_now().await?))
}

/// POST /settlement/accounts/:account_id
pub async fn settle_account(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> AppResult<Json<AccountSettlement>> {
    Ok(Json(state.scheduler.manual_settlement(account_id).await?))
}

/// POST /settlement/retry-invoices
pub async fn retry_invoices(State(state): State<AppState>) -> AppResult<Json<RetrySummary>> {
    Ok(Json(state.scheduler.retry_failed_invoices().await?))
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let scheduler_running = state.scheduler.is_running();

    Json(HealthResponse {
        status: if scheduler_running {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        },
        timestamp: Utc::now(),
        scheduler_running,
        gateway_configured: state.billing.is_configured(),
    })
}

/// POST /billing/accounts/:account_id/subscription
pub async fn create_subscription(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Json(request): Json<SubscriptionRequest>,
) -> AppResult<Json<GatewaySubscription>> {
    Ok(Json(state.billing.create_subscription(account_id, request.tier).await?))
}

/// POST /billing/subscriptions/:subscription_id/cancel
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(subscription_id): Path<String>,
) -> AppResult<Json<GatewaySubscription>> {
    Ok(Json(state.billing.cancel_subscription(&subscription_id).await?))
}

/// POST /billing/accounts/:account_id/checkout
pub async fn create_checkout_session(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Json(request): Json<CheckoutSessionRequest>,
) -> AppResult<Json<CheckoutSession>> {
    let session = state
        .billing
        .create_checkout_session(account_id, request.tier, &request.success_url, &request.cancel_url)
        .await?;
    Ok(Json(session))
}

/// POST /billing/accounts/:account_id/portal
pub async fn create_portal_session(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Json(request): Json<PortalSessionRequest>,
) -> AppResult<Json<PortalSession>> {
    Ok(Json(state.billing.create_portal_session(account_id, &request.return_url).await?))
}

/// GET /billing/invoices/:invoice_id
pub async fn get_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<String>,
) -> AppResult<Json<GatewayInvoice>> {
    Ok(Json(state.billing.get_invoice(&invoice_id).await?))
}
