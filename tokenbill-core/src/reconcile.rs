//! Reconciliation worker
//!
//! Scheduled drift detector between the payment gateway and the ledger
//! store. Walks every local subscription and cross-checks it upstream,
//! flagging status drift, plan drift, and orphans; then audits each user's
//! journal against their batch totals. The worker only reports — it never
//! auto-heals. Anomalies flow through an [`AlertSink`] so the delivery
//! channel stays swappable.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use crate::gateway::{GatewayError, PaymentGateway};
use crate::model::Subscription;
use crate::store::LedgerStore;

/// A detected divergence between gateway and ledger state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    /// Local active flag disagrees with the gateway status
    StatusDrift {
        pg_subscription_id: String,
        local_active: bool,
        pg_status: String,
    },
    /// Local plan key disagrees with the gateway price
    PlanDrift {
        pg_subscription_id: String,
        local_plan_key: String,
        pg_plan_key: String,
    },
    /// Local row has no upstream counterpart
    Orphan { pg_subscription_id: String },
    /// A user's journal sum disagrees with their batch totals. Critical:
    /// the append-only audit trail no longer explains the balances.
    JournalImbalance {
        user_id: String,
        journal_sum: i64,
        batch_total: i64,
    },
}

impl Anomaly {
    /// Whether the anomaly indicates ledger corruption rather than drift.
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::JournalImbalance { .. })
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StatusDrift {
                pg_subscription_id,
                local_active,
                pg_status,
            } => write!(
                f,
                "status drift on {pg_subscription_id}: local active={local_active}, gateway status={pg_status}"
            ),
            Self::PlanDrift {
                pg_subscription_id,
                local_plan_key,
                pg_plan_key,
            } => write!(
                f,
                "plan drift on {pg_subscription_id}: local {local_plan_key}, gateway {pg_plan_key}"
            ),
            Self::Orphan { pg_subscription_id } => {
                write!(f, "orphan subscription {pg_subscription_id}: not found upstream")
            }
            Self::JournalImbalance {
                user_id,
                journal_sum,
                batch_total,
            } => write!(
                f,
                "journal imbalance for {user_id}: journal sum {journal_sum}, batch total {batch_total}"
            ),
        }
    }
}

/// Where anomalies are delivered.
pub trait AlertSink: Send + Sync {
    /// Deliver one anomaly.
    fn alert(&self, anomaly: &Anomaly);
}

/// Default sink: structured log records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn alert(&self, anomaly: &Anomaly) {
        if anomaly.is_critical() {
            error!(anomaly = %anomaly, "reconciliation anomaly");
        } else {
            warn!(anomaly = %anomaly, "reconciliation anomaly");
        }
    }
}

/// Gateway statuses that count as "active" for drift comparison. Dunning
/// states keep access locally, so they compare as active.
fn pg_status_is_active(status: &str) -> bool {
    matches!(status, "active" | "trialing" | "past_due")
}

/// The scheduled reconciliation job.
pub struct ReconciliationWorker {
    store: Arc<LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    alerts: Arc<dyn AlertSink>,
    pg_call_deadline: Duration,
}

impl ReconciliationWorker {
    /// Assemble the worker from its injected collaborators.
    #[must_use]
    pub fn new(
        store: Arc<LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        alerts: Arc<dyn AlertSink>,
        pg_call_deadline: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            alerts,
            pg_call_deadline,
        }
    }

    /// Run one reconciliation pass and return the anomaly list.
    pub async fn run(&self) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();

        let subscriptions: Vec<Subscription> =
            self.store.read(|tx| tx.subscriptions().cloned().collect());
        for sub in &subscriptions {
            match self.fetch_remote(&sub.pg_subscription_id).await {
                Ok(Some(remote)) => {
                    let pg_status = remote.status.clone().unwrap_or_else(|| "unknown".into());
                    if pg_status_is_active(&pg_status) != sub.is_active {
                        anomalies.push(Anomaly::StatusDrift {
                            pg_subscription_id: sub.pg_subscription_id.clone(),
                            local_active: sub.is_active,
                            pg_status,
                        });
                    }
                    if let Some(pg_plan_key) = remote.plan_key() {
                        if pg_plan_key != sub.plan_key {
                            anomalies.push(Anomaly::PlanDrift {
                                pg_subscription_id: sub.pg_subscription_id.clone(),
                                local_plan_key: sub.plan_key.clone(),
                                pg_plan_key: pg_plan_key.to_owned(),
                            });
                        }
                    }
                }
                Ok(None) => anomalies.push(Anomaly::Orphan {
                    pg_subscription_id: sub.pg_subscription_id.clone(),
                }),
                Err(err) => {
                    // Unreachable gateway is not drift; skip rather than
                    // flag.
                    warn!(
                        pg_subscription_id = %sub.pg_subscription_id,
                        %err,
                        "reconciliation lookup failed"
                    );
                }
            }
        }

        anomalies.extend(self.audit_journals());

        for anomaly in &anomalies {
            self.alerts.alert(anomaly);
        }
        anomalies
    }

    async fn fetch_remote(
        &self,
        pg_subscription_id: &str,
    ) -> Result<Option<crate::events::SubscriptionObject>, GatewayError> {
        tokio::time::timeout(
            self.pg_call_deadline,
            self.gateway.subscription_with_latest_invoice(pg_subscription_id),
        )
        .await
        .map_err(|_| GatewayError::Timeout)?
    }

    /// For every user, the running journal sum must equal the remaining
    /// balance across their active batches: expired and fully-consumed
    /// batches net to zero by construction.
    fn audit_journals(&self) -> Vec<Anomaly> {
        self.store.read(|tx| {
            let mut anomalies = Vec::new();
            for user in tx.users() {
                let journal_sum: i64 = tx
                    .token_events_for_user(&user.user_id)
                    .iter()
                    .map(|e| e.delta)
                    .sum();
                let batch_total: i64 = tx
                    .batches_for_user(&user.user_id)
                    .iter()
                    .filter(|b| b.is_active)
                    .map(|b| i64::try_from(b.remaining()).unwrap_or(i64::MAX))
                    .sum();
                if journal_sum != batch_total {
                    anomalies.push(Anomaly::JournalImbalance {
                        user_id: user.user_id.clone(),
                        journal_sum,
                        batch_total,
                    });
                }
            }
            anomalies
        })
    }
}
