mod api;
mod clearing;
mod config;
mod db;
mod events;
mod invariants;
mod metrics;
mod payments;
mod recovery;
mod registry;
mod router;
mod trustlines;

use clearing::ClearingWorker;
use config::Config;
use events::EventBus;
use payments::PaymentEngine;
use recovery::RecoveryWorker;
use registry::RegistryService;
use trustlines::TrustLineService;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    // Run the async main
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    // Initialize logging
    init_logging();

    tracing::info!("Starting GEO hub");

    // Load configuration
    let config = Config::load()?;
    tracing::info!(
        port = config.server.port,
        lock_ttl_seconds = config.protocol.lock_ttl_seconds,
        "Configuration loaded"
    );

    // Connect to database
    let pool = db::create_pool(&config.database.url, config.database.max_connections).await?;
    tracing::info!("Database connected");

    // Run migrations
    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    // Wire the engines
    let events = EventBus::new();
    events.spawn_logger();
    let engine = PaymentEngine::new(pool.clone(), config.clone(), events.clone());
    let trustlines = TrustLineService::new(pool.clone(), events.clone());
    let registry = RegistryService::new(pool.clone());

    // Reconcile whatever a previous process left behind
    recovery::startup_reconcile(&engine, &pool, &config).await?;

    // Create shutdown channels
    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let (shutdown_tx2, shutdown_rx2) = tokio::sync::mpsc::channel::<()>(1);

    // Setup signal handlers
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(()).await;
        let _ = shutdown_tx2.send(()).await;
    });

    // Background workers
    let recovery_worker = RecoveryWorker::new(
        engine.clone(),
        pool.clone(),
        config.clone(),
        events.clone(),
    );
    let clearing_worker = ClearingWorker::new(pool.clone(), config.clone(), events.clone());

    // Start the API server
    let addr = api::bind_address(&config)?;
    let state = api::AppState {
        pool: pool.clone(),
        config: config.clone(),
        engine,
        trustlines,
        registry,
        events,
    };
    tokio::spawn(async move {
        if let Err(e) = api::start_server(addr, state).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    tracing::info!("Workers initialized, hub is serving");

    // Run recovery and clearing concurrently until shutdown
    tokio::select! {
        result = recovery_worker.run(shutdown_rx) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Recovery worker error");
            }
        }
        result = clearing_worker.run(shutdown_rx2) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Clearing worker error");
            }
        }
    }

    tracing::info!("GEO hub stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,geo_hub=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
