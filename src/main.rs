use std::{sync::Arc, time::Duration};

use bankd::{
    config::{CliArgs, Config, StorageKind},
    logging, telemetry, AppState, Bank, Settings,
};
use bankd_core::StorageBackend;
use bankd_memory::InMemoryStorage;
use bankd_sqlite::SqliteStorage;
use clap::Parser;

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        tracing::error!(error = %e, "Server failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();
    let config = Config::load(&cli);
    logging::init(&config.logging);

    let storage: Arc<dyn StorageBackend> = match config.storage.backend {
        StorageKind::Memory => Arc::new(InMemoryStorage::new()),
        StorageKind::Sqlite => Arc::new(SqliteStorage::new(&config.storage.path)?),
    };
    tracing::info!(backend = ?config.storage.backend, "Storage ready");

    let bank = Bank::new(storage, Settings::from_config(&config));
    if let Some(admin) = &config.auth.bootstrap_admin {
        bank.bootstrap_admin(admin).await?;
    }
    if config.auth.api_keys.is_empty() {
        tracing::debug!("No service API keys configured");
    }

    let metrics = match telemetry::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Metrics recorder unavailable");
            None
        }
    };

    let resumed = bank.resume_pending_payments()?;
    if resumed > 0 {
        tracing::info!(resumed, "Pending payments rescheduled");
    }
    spawn_session_sweeper(bank.clone());

    let state = AppState::new(bank, config.auth.api_keys.clone(), metrics);
    let app = bankd::router(state);

    let addr = config.listen_addr()?;
    tracing::info!(%addr, "API listening");
    axum::Server::try_bind(&addr)?
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

fn spawn_session_sweeper(bank: Bank) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            match bank.purge_expired_sessions() {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "Expired sessions purged"),
                Err(e) => tracing::warn!(error = %e, "Session sweep failed"),
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
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
    tracing::info!("Shutdown signal received");
}
