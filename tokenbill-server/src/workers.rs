//! Scheduled workers
//!
//! The maintenance sweep and the reconciliation job as long-lived tokio
//! tasks on configurable intervals. Both run once shortly after startup so a
//! restarted process catches up immediately rather than waiting a full
//! period.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::info;

use tokenbill_core::maintenance::MaintenanceWorker;
use tokenbill_core::reconcile::{AlertSink, ReconciliationWorker, TracingAlertSink};

use crate::alerts::WebhookAlertSink;
use crate::state::AppState;

/// Spawn the maintenance and reconciliation loops.
pub fn spawn(state: &AppState) -> Vec<JoinHandle<()>> {
    let maintenance = MaintenanceWorker::new(Arc::clone(&state.store), Arc::clone(&state.catalog));
    let maintenance_interval = state.config.maintenance_interval;
    let maintenance_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(maintenance_interval);
        loop {
            ticker.tick().await;
            let report = maintenance.run(Utc::now());
            info!(?report, "maintenance tick");
        }
    });

    let alerts: Arc<dyn AlertSink> = match &state.config.alert_webhook_url {
        Some(url) => Arc::new(WebhookAlertSink::new(url.clone())),
        None => Arc::new(TracingAlertSink),
    };
    let reconciliation = ReconciliationWorker::new(
        Arc::clone(&state.store),
        Arc::clone(&state.gateway),
        alerts,
        state.config.pg_call_deadline,
    );
    let reconcile_interval = state.config.reconcile_interval;
    let reconcile_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reconcile_interval);
        loop {
            ticker.tick().await;
            let anomalies = reconciliation.run().await;
            info!(count = anomalies.len(), "reconciliation tick");
        }
    });

    vec![maintenance_task, reconcile_task]
}
