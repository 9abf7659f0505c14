mod api;
mod billing;
mod bootstrap;
mod config;
mod error;
mod ledger;
mod server;
mod settlement;
#[cfg(test)]
mod testing;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,profit_settlement=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env before anything reads the environment
    dotenv::dotenv().ok();

    // Initialize tracing
    init_tracing();

    info!("🚀 Starting Profit Settlement Service");

    // Load configuration
    let settings = config::Settings::from_env()?;

    let state = bootstrap::initialize_app_state(&settings).await?;
    let scheduler = state.scheduler.clone();

    // Background loops
    scheduler.start()?;

    // Create HTTP server
    let app = server::create_app(state);

    // Run the Server until Ctrl-C
    let served = server::run_server(app, &settings.bind_address, shutdown_signal()).await;

    // Join both scheduler loops before exiting
    scheduler.stop().await;

    served?;
    info!("👋 Server stopped");

    Ok(())
}
