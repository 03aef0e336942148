//! Tokenbill server binary
//!
//! Loads the environment configuration, opens the ledger store, wires the
//! dispatcher to the REST payment gateway, and serves the HTTP surface with
//! the scheduled workers alongside. `maintain` and `reconcile` run a single
//! worker pass and exit, for operators and cron-style deployments.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use tokenbill_core::catalog::Catalog;
use tokenbill_core::config::BillingConfig;
use tokenbill_core::gateway::{PaymentGateway, RestGateway};
use tokenbill_core::maintenance::MaintenanceWorker;
use tokenbill_core::reconcile::{ReconciliationWorker, TracingAlertSink};
use tokenbill_core::store::LedgerStore;

use tokenbill_server::{router, AppState};

#[derive(Parser, Debug)]
#[command(
    name = "tokenbill-server",
    version,
    about = "Billing and token-ledger service"
)]
struct Cli {
    /// Listen address override (defaults to BIND_ADDR)
    #[arg(long)]
    bind: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the webhook endpoint and user-facing API (default)
    Serve,
    /// Run one maintenance sweep and exit
    Maintain,
    /// Run one reconciliation pass and exit
    Reconcile,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = BillingConfig::from_env().context("loading configuration")?;

    let store = Arc::new(
        LedgerStore::connect(&config.storage_url, &config.storage_service_key)
            .context("opening ledger store")?,
    );
    let catalog = Arc::new(
        Catalog::from_path(&config.catalog_path).context("loading plan catalog")?,
    );
    let gateway: Arc<dyn PaymentGateway> = Arc::new(RestGateway::new(
        config.pg_api_base.clone(),
        config.pg_secret_key.clone(),
    ));

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let bind_addr = cli.bind.clone().unwrap_or_else(|| config.bind_addr.clone());
            let state = AppState::assemble(store, gateway, catalog, config)?;

            let workers = tokenbill_server::workers::spawn(&state);
            let app = router(state);

            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .with_context(|| format!("binding {bind_addr}"))?;
            info!(%bind_addr, "serving");

            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    if let Err(err) = shutdown_signal().await {
                        error!(%err, "shutdown signal watcher failed");
                    }
                })
                .await
                .context("server error")?;

            for worker in workers {
                worker.abort();
            }
            Ok(())
        }
        Commands::Maintain => {
            let worker = MaintenanceWorker::new(store, catalog);
            let report = worker.run(Utc::now());
            println!(
                "expired {} batch(es) ({} tokens forfeited), ended {} subscription(s), {} refill(s), {} failure(s)",
                report.expired_batches,
                report.forfeited_tokens,
                report.ended_subscriptions,
                report.refills_granted,
                report.failures
            );
            Ok(())
        }
        Commands::Reconcile => {
            let worker = ReconciliationWorker::new(
                store,
                gateway,
                Arc::new(TracingAlertSink),
                config.pg_call_deadline,
            );
            let anomalies = worker.run().await;
            if anomalies.is_empty() {
                println!("no anomalies");
            } else {
                for anomaly in &anomalies {
                    println!("{anomaly}");
                }
            }
            Ok(())
        }
    }
}

async fn shutdown_signal() -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;
    #[cfg(unix)]
    let terminate = sigterm.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = ctrl_c => result.context("installing Ctrl+C handler")?,
        _ = terminate => {},
    }
    info!("shutdown signal received");
    Ok(())
}
