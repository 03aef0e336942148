//! Maintenance worker
//!
//! The daily sweep: expire stale batches, deactivate subscriptions whose
//! billing period lapsed without renewal, and perform the yearly-plan
//! monthly refills. The expiry pass runs in one transaction; every
//! subscription is then processed in its own transaction so a single bad row
//! never aborts the pass. Re-running the sweep with an unchanged clock is a
//! no-op: expiry only touches still-active batches, deactivation only
//! touches still-active rows, and refills are guarded by both the same-month
//! check and a per-month synthetic invoice anchor.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use tracing::{error, info};

use crate::catalog::Catalog;
use crate::constants::{MONTHLY_REFILLS_PER_YEAR, NOTE_YEARLY_MONTHLY_REFILL};
use crate::errors::BillingError;
use crate::ledger::{expire_due, grant_batch, GrantOutcome, GrantRequest};
use crate::lifecycle::{self, SubscriptionState};
use crate::model::{BatchOrigin, BillingCycle, Subscription, TokenReason};
use crate::store::LedgerStore;

/// Summary of one maintenance pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct MaintenanceReport {
    /// Batches deactivated by the expiry pass
    pub expired_batches: usize,
    /// Unspent tokens forfeited by those batches
    pub forfeited_tokens: u64,
    /// Subscriptions deactivated because their period lapsed
    pub ended_subscriptions: usize,
    /// Yearly refill batches granted
    pub refills_granted: usize,
    /// Per-subscription failures logged and skipped
    pub failures: usize,
}

/// The scheduled maintenance sweep.
pub struct MaintenanceWorker {
    store: Arc<LedgerStore>,
    catalog: Arc<Catalog>,
}

impl MaintenanceWorker {
    /// Assemble the worker from its injected collaborators.
    #[must_use]
    pub const fn new(store: Arc<LedgerStore>, catalog: Arc<Catalog>) -> Self {
        Self { store, catalog }
    }

    /// Run one full pass at `now`.
    pub fn run(&self, now: DateTime<Utc>) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        self.expire_batches(now, &mut report);
        self.end_lapsed_subscriptions(now, &mut report);
        self.refill_yearly_subscriptions(now, &mut report);

        info!(
            expired = report.expired_batches,
            forfeited = report.forfeited_tokens,
            ended = report.ended_subscriptions,
            refills = report.refills_granted,
            failures = report.failures,
            "maintenance pass complete"
        );
        report
    }

    fn expire_batches(&self, now: DateTime<Utc>, report: &mut MaintenanceReport) {
        match self
            .store
            .transaction::<_, BillingError>(|tx| expire_due(tx, now))
        {
            Ok(expired) => {
                report.expired_batches = expired.len();
                report.forfeited_tokens = expired.iter().map(|e| e.forfeited).sum();
            }
            Err(err) => {
                error!(%err, "expiry pass failed");
                report.failures += 1;
            }
        }
    }

    fn end_lapsed_subscriptions(&self, now: DateTime<Utc>, report: &mut MaintenanceReport) {
        let lapsed: Vec<Subscription> = self.store.read(|tx| {
            tx.subscriptions()
                .filter(|s| s.is_active && s.current_period_end < now)
                .cloned()
                .collect()
        });

        for sub in lapsed {
            let result = self.store.transaction::<_, BillingError>(|tx| {
                // Re-check inside the transaction; another pass or an event
                // may have raced us.
                let Some(current) = tx.subscription(sub.id).filter(|s| s.is_active).cloned()
                else {
                    return Ok(false);
                };
                tx.deactivate_subscription(current.id)?;
                let (active, issue) = lifecycle::user_flags(SubscriptionState::Ended);
                tx.update_user_flags(&current.user_id, Some(active), Some(issue))?;
                Ok(true)
            });
            match result {
                Ok(true) => report.ended_subscriptions += 1,
                Ok(false) => {}
                Err(err) => {
                    error!(subscription_id = sub.id, %err, "failed to end lapsed subscription");
                    report.failures += 1;
                }
            }
        }
    }

    fn refill_yearly_subscriptions(&self, now: DateTime<Utc>, report: &mut MaintenanceReport) {
        let due: Vec<Subscription> = self.store.read(|tx| {
            tx.subscriptions()
                .filter(|s| {
                    s.is_active
                        && s.billing_cycle == BillingCycle::Yearly
                        && !refilled_this_month(s.last_monthly_refill, now)
                })
                .cloned()
                .collect()
        });

        for sub in due {
            match self.refill_one(&sub, now) {
                Ok(true) => report.refills_granted += 1,
                Ok(false) => {}
                Err(err) => {
                    error!(subscription_id = sub.id, %err, "yearly refill failed");
                    report.failures += 1;
                }
            }
        }
    }

    fn refill_one(&self, sub: &Subscription, now: DateTime<Utc>) -> Result<bool, BillingError> {
        let amount = self
            .catalog
            .subscription_price(&sub.plan_key)
            .ok()
            .and_then(|price| price.monthly_refill_tokens)
            .unwrap_or(sub.tokens_per_cycle / MONTHLY_REFILLS_PER_YEAR);
        if amount == 0 {
            return Ok(false);
        }

        // One anchor per subscription per calendar month; redelivered or
        // re-run sweeps collide here and write nothing.
        let anchor = format!(
            "refill:{}:{:04}-{:02}",
            sub.pg_subscription_id,
            now.year(),
            now.month()
        );

        self.store.transaction(|tx| {
            let Some(current) = tx.subscription(sub.id).filter(|s| s.is_active).cloned() else {
                return Ok(false);
            };
            if refilled_this_month(current.last_monthly_refill, now) {
                return Ok(false);
            }

            let outcome = grant_batch(
                tx,
                GrantRequest {
                    user_id: current.user_id.clone(),
                    origin: BatchOrigin::Subscription {
                        subscription_id: current.id,
                    },
                    amount,
                    expires_at: BillingCycle::Monthly.period_end(now),
                    invoice_id: Some(anchor.clone()),
                    note: NOTE_YEARLY_MONTHLY_REFILL.into(),
                    reason: TokenReason::SubscriptionRefill,
                },
                now,
            )?;
            tx.update_subscription(current.id, |s| s.last_monthly_refill = Some(now))?;
            Ok(matches!(outcome, GrantOutcome::Granted { .. }))
        })
    }
}

/// Whether `last` falls in the same calendar year-month as `now`.
fn refilled_this_month(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    last.is_some_and(|t| t.year() == now.year() && t.month() == now.month())
}
