//! Worker entry point.

use event_store::{InMemoryEventStore, PostgresEventStore};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use worker::config::Config;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Configuration, tracing and metrics
    let config = Config::from_env()?;
    worker::telemetry::init_tracing(&config);
    worker::telemetry::init_metrics(&config)?;
    tracing::info!(metrics_addr = %config.metrics_addr, "metrics exporter listening");

    // 2. Stop the loops on SIGINT/SIGTERM
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    // 3. Pick the store and run
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
            let store = PostgresEventStore::new(pool);
            store.run_migrations().await?;
            tracing::info!("using PostgreSQL store");
            worker::run(store, &config, shutdown_rx).await?;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
            worker::run(InMemoryEventStore::new(), &config, shutdown_rx).await?;
        }
    }

    Ok(())
}
