//! Subscription lifecycle handlers
//!
//! `customer.subscription.created` upserts the local row and flips the user's
//! active flag — no credits here, the first paid invoice carries those.
//! `customer.subscription.updated` refreshes plan fields and grants the
//! upgrade batch when the tier changed. `customer.subscription.deleted` ends
//! the subscription; batches are never revoked.

use chrono::{DateTime, Utc};
use tracing::warn;

use super::{
    subscription_grant_plan, BillingReasonKind, Disposition, EventDispatcher,
};
use crate::errors::Result;
use crate::events::{EventEnvelope, SubscriptionObject};
use crate::ledger::{grant_batch, GrantOutcome, GrantRequest};
use crate::lifecycle::{self, LifecycleEvent, SubscriptionState};
use crate::model::BatchOrigin;
use crate::store::{StoreError, SubscriptionFields};

/// Gateway statuses that keep the local row active. Dunning states stay
/// active on purpose; only terminal statuses end the row.
fn status_is_live(status: Option<&str>) -> bool {
    !matches!(
        status,
        Some("canceled" | "unpaid" | "incomplete_expired")
    )
}

fn fields_from_object(
    d: &EventDispatcher,
    sub: &SubscriptionObject,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<SubscriptionFields> {
    let plan_key = sub.plan_key().unwrap_or_default().to_owned();
    let price = d.catalog.subscription_price(&plan_key)?;

    let period_start = sub.period_start().unwrap_or(now);
    let period_end = sub
        .period_end()
        .unwrap_or_else(|| price.billing_cycle.period_end(period_start));

    Ok(SubscriptionFields {
        user_id: user_id.to_owned(),
        plan_key,
        plan_tier: price.plan_tier,
        billing_cycle: price.billing_cycle,
        pg_subscription_id: sub.id.clone(),
        is_active: status_is_live(sub.status.as_deref()),
        current_period_start: period_start,
        current_period_end: period_end,
        tokens_per_cycle: price.tokens_per_cycle,
        price_cents: price.price_cents,
    })
}

pub(crate) async fn handle_created(
    d: &EventDispatcher,
    envelope: &EventEnvelope,
    now: DateTime<Utc>,
) -> Result<Disposition> {
    let sub = envelope.subscription()?;
    let Some(user) = d
        .resolve_user(
            sub.metadata.get("user_id").map(String::as_str),
            sub.customer.as_deref(),
        )
        .await?
    else {
        warn!(event_id = %envelope.id, pg_subscription = %sub.id, "subscription cannot be attributed to a user");
        return Ok(Disposition::Skipped);
    };
    let fields = fields_from_object(d, &sub, &user.user_id, now)?;

    d.store.transaction(|tx| {
        if !tx.record_event(&envelope.id, &envelope.event_type, now) {
            return Ok(Disposition::Duplicate);
        }
        if let Some(customer_id) = sub.customer.as_deref() {
            tx.bind_pg_customer(&user.user_id, customer_id)?;
        }

        let previous = lifecycle::state_of(tx.subscription_by_pg_id(&sub.id));
        tx.upsert_subscription_by_pg_id(fields.clone())?;

        let next = lifecycle::transition(previous, LifecycleEvent::Created)
            .unwrap_or(SubscriptionState::Active);
        let (active, issue) = lifecycle::user_flags(next);
        tx.update_user_flags(&user.user_id, Some(active), Some(issue))?;
        Ok(Disposition::Processed)
    })
}

pub(crate) async fn handle_updated(
    d: &EventDispatcher,
    envelope: &EventEnvelope,
    now: DateTime<Utc>,
) -> Result<Disposition> {
    let sub = envelope.subscription()?;

    // Prefer the local row for attribution; fall back to event resolution
    // when the update arrives before the creation event.
    let local = d
        .store
        .read(|tx| tx.subscription_by_pg_id(&sub.id).cloned());
    let user_id = match &local {
        Some(row) => row.user_id.clone(),
        None => {
            let Some(user) = d
                .resolve_user(
                    sub.metadata.get("user_id").map(String::as_str),
                    sub.customer.as_deref(),
                )
                .await?
            else {
                warn!(event_id = %envelope.id, pg_subscription = %sub.id, "subscription update cannot be attributed");
                return Ok(Disposition::Skipped);
            };
            user.user_id
        }
    };
    let fields = fields_from_object(d, &sub, &user_id, now)?;
    let price = d.catalog.subscription_price(&fields.plan_key)?.clone();

    d.store.transaction(|tx| {
        if !tx.record_event(&envelope.id, &envelope.event_type, now) {
            return Ok(Disposition::Duplicate);
        }

        let previous_tier = tx.subscription_by_pg_id(&sub.id).map(|s| s.plan_tier);
        let outcome = tx.upsert_subscription_by_pg_id(fields.clone())?;
        let row = tx
            .subscription(outcome.id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "subscription",
                key: outcome.id.to_string(),
            })?;

        let tier_changed = previous_tier.is_some_and(|t| t != fields.plan_tier);
        if tier_changed {
            if let Some(plan) =
                subscription_grant_plan(&price, &row, BillingReasonKind::Update, None, now)
            {
                // The update event has no invoice; a synthetic anchor keeps
                // the grant idempotent across redeliveries.
                let anchor = format!(
                    "upgrade:{}:{}",
                    row.pg_subscription_id,
                    row.current_period_start.timestamp()
                );
                let granted = grant_batch(
                    tx,
                    GrantRequest {
                        user_id: user_id.clone(),
                        origin: BatchOrigin::Subscription {
                            subscription_id: row.id,
                        },
                        amount: plan.amount,
                        expires_at: plan.expires_at,
                        invoice_id: Some(anchor),
                        note: "subscription-upgrade".into(),
                        reason: plan.reason,
                    },
                    now,
                )?;
                if plan.stamp_monthly_refill && matches!(granted, GrantOutcome::Granted { .. }) {
                    tx.update_subscription(row.id, |s| s.last_monthly_refill = Some(now))?;
                }
            }
        }

        if fields.is_active {
            tx.update_user_flags(&user_id, Some(true), None)?;
        }
        Ok(Disposition::Processed)
    })
}

pub(crate) fn handle_deleted(
    d: &EventDispatcher,
    envelope: &EventEnvelope,
    now: DateTime<Utc>,
) -> Result<Disposition> {
    let sub = envelope.subscription()?;

    d.store.transaction(|tx| {
        if !tx.record_event(&envelope.id, &envelope.event_type, now) {
            return Ok(Disposition::Duplicate);
        }
        let Some(local) = tx.subscription_by_pg_id(&sub.id).cloned() else {
            warn!(event_id = %envelope.id, pg_subscription = %sub.id, "deletion for unknown subscription");
            return Ok(Disposition::Skipped);
        };

        tx.deactivate_subscription(local.id)?;
        let (active, issue) = lifecycle::user_flags(SubscriptionState::Ended);
        tx.update_user_flags(&local.user_id, Some(active), Some(issue))?;
        // Batches are deliberately left alone; credits outlive the
        // subscription until natural expiry.
        Ok(Disposition::Processed)
    })
}
