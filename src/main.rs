//! Conduit Relayer - routes transaction intents across heterogeneous ledgers,
//! sponsors fees within daily budgets and bridges value under validator quorum.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use conduit_relayer::api;
use conduit_relayer::config::Settings;
use conduit_relayer::coordination::CoordinationEngine;
use conduit_relayer::metrics::{self, MetricsServer};
use conduit_relayer::state::{MemoryStore, PostgresStore, StateStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Conduit Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Durable state: Postgres when configured, memory otherwise
    let store: Arc<dyn StateStore> = match &settings.database {
        Some(database) => {
            let postgres = PostgresStore::new(database).await?;
            info!("Database connection established");
            postgres.run_migrations().await?;
            info!("Database migrations complete");
            Arc::new(postgres)
        }
        None => {
            warn!("No [database] configured - state is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        metrics::set_treasury_balance(settings.sponsorship.treasury_balance);
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Register chains and wire every component
    let engine = Arc::new(CoordinationEngine::build(settings.clone(), store.clone()).await?);
    info!(
        "Coordination engine initialized with {} chains and {} validators",
        engine.registry().len(),
        engine.quorum().len()
    );

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let engine = engine.clone();
        async move {
            if let Err(e) = api::run_server(config, engine).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Start coordination engine
    let coordination_handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.run().await {
                error!("Coordination engine error: {}", e);
            }
        }
    });

    // Store health loop
    let health_handle = tokio::spawn({
        let store = store.clone();
        let interval = settings.health.probe_interval();
        async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = store.health_check().await {
                    warn!("State store health check failed: {}", e);
                }
            }
        }
    });

    info!("Conduit Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown: stop intake, then drain chains
    engine.stop().await;
    for chain_id in engine.registry().chain_ids() {
        if let Err(e) = engine.registry().deregister(&chain_id).await {
            warn!("Failed to drain chain {}: {}", chain_id, e);
        }
    }

    // Abort background tasks
    api_handle.abort();
    coordination_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Conduit Relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,conduit_relayer=debug,sqlx=warn,hyper=warn")
    });

    let json = std::env::var("CONDUIT_LOG_FORMAT").is_ok_and(|f| f == "json");
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
