use std::{sync::Arc, time::Duration};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{info, warn};

use crate::{
    api::handler::AppState,
    billing::{
        service::BillingService,
        stripe::{PaymentGateway, StripeClient},
        webhook::WebhookProcessor,
    },
    config::Settings,
    error::AppResult,
    ledger::{
        repository::LedgerRepository,
        traits::{AccountStore, LedgerReader, SettlementStore},
    },
    settlement::{calculator::ProfitCalculator, scheduler::SettlementScheduler, service::SettlementService},
};

pub async fn initialize_app_state(settings: &Settings) -> AppResult<AppState> {
    info!("Initializing application components ...");

    // Database pool
    let pool = initialize_database(&settings.database_url).await?;

    // One repository serves every collaborator contract
    let repository = Arc::new(LedgerRepository::new(pool));
    let ledger: Arc<dyn LedgerReader> = repository.clone();
    let store: Arc<dyn SettlementStore> = repository.clone();
    let accounts: Arc<dyn AccountStore> = repository;

    // Payment gateway
    let gateway: Arc<dyn PaymentGateway> = Arc::new(StripeClient::new(settings.stripe.clone()));
    if gateway.is_configured() {
        info!("✅ Stripe gateway configured ({})", settings.stripe.api_base);
    } else {
        warn!("⚠️  STRIPE_SECRET_KEY not set - settlements will be recorded but not invoiced");
    }
    if settings.stripe.webhook_secret.is_none() {
        warn!("⚠️  STRIPE_WEBHOOK_SECRET not set - all webhooks will be rejected");
    }

    let billing = Arc::new(BillingService::new(
        gateway,
        store.clone(),
        accounts.clone(),
        &settings.stripe,
        settings.call_timeout,
    ));

    let webhooks = Arc::new(WebhookProcessor::new(
        settings.stripe.webhook_secret.clone(),
        settings.stripe.webhook_tolerance_secs,
        store.clone(),
        accounts.clone(),
        settings.call_timeout,
    ));

    // Settlement engine
    let calculator = Arc::new(ProfitCalculator::new(
        settings.profit_share.clone(),
        ledger.clone(),
        store.clone(),
        accounts.clone(),
        settings.call_timeout,
    ));
    let settlement = Arc::new(SettlementService::new(
        calculator,
        billing.clone(),
        ledger,
        store,
        accounts,
        settings.concurrency,
        settings.call_timeout,
    ));
    info!(
        "✅ Settlement engine initialized (minimum payout ${}, concurrency {})",
        settings.profit_share.minimum_payout, settings.concurrency
    );

    let scheduler = Arc::new(SettlementScheduler::new(settings.schedule.clone(), settlement.clone()));

    info!("✓ Application state ready");

    Ok(AppState {
        scheduler,
        settlement,
        billing,
        webhooks,
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 20 max connections");

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
