use axum::{
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::api::handler::{
    cancel_subscription, create_checkout_session, create_portal_session, create_subscription,
    get_invoice, get_pending_settlements, get_platform_stats, get_scheduler_status,
    get_settlement_history, health_check, retry_invoices, run_settlement, settle_account,
    stripe_webhook, AppState,
};

pub fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Payment gateway webhooks
                .route("/webhook/stripe", post(stripe_webhook))
                // Operator endpoints
                .route("/settlement/status", get(get_scheduler_status))
                .route("/settlement/pending", get(get_pending_settlements))
                .route("/settlement/stats", get(get_platform_stats))
                .route("/settlement/history/:account_id", get(get_settlement_history))
                .route("/settlement/run", post(run_settlement))
                .route("/settlement/accounts/:account_id", post(settle_account))
                .route("/settlement/retry-invoices", post(retry_invoices))
                // Billing endpoints
                .route("/billing/accounts/:account_id/subscription", post(create_subscription))
                .route("/billing/accounts/:account_id/checkout", post(create_checkout_session))
                .route("/billing/accounts/:account_id/portal", post(create_portal_session))
                .route("/billing/subscriptions/:subscription_id/cancel", post(cancel_subscription))
                .route("/billing/invoices/:invoice_id", get(get_invoice)),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::very_permissive())
                .layer(TimeoutLayer::new(Duration::from_secs(120))),
        )
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(
    app: Router,
    bind_address: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
