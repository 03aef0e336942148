//! Paid-invoice handler
//!
//! `invoice.paid` and its `invoice.payment_succeeded` redelivery alias drive
//! all recurring credit grants. The grant carries the invoice id as its
//! idempotency anchor, so the second delivery of the same invoice — under
//! either event name — is a no-op. A paid invoice also clears dunning state.

use chrono::{DateTime, Utc};
use tracing::warn;

use super::{
    apply_referral_reward, subscription_grant_plan, BillingReasonKind, Disposition,
    EventDispatcher,
};
use crate::errors::Result;
use crate::events::EventEnvelope;
use crate::ledger::{grant_batch, GrantOutcome, GrantRequest};
use crate::lifecycle::{self, LifecycleEvent, SubscriptionState};
use crate::model::BatchOrigin;
use crate::model::Subscription;
use crate::store::{StoreError, SubscriptionFields};

enum Prepared {
    /// The subscription row already exists locally
    Local(Subscription),
    /// The row is built from the gateway's view inside the transaction
    Bootstrap(SubscriptionFields),
}

pub(crate) async fn handle_invoice_paid(
    d: &EventDispatcher,
    envelope: &EventEnvelope,
    now: DateTime<Utc>,
) -> Result<Disposition> {
    let invoice = envelope.invoice()?;
    if invoice.status.as_deref().is_some_and(|s| s != "paid") {
        return Ok(Disposition::Ignored);
    }
    let Some(pg_subscription_id) = invoice.subscription.clone() else {
        // One-off invoices carry no subscription credit.
        return Ok(Disposition::Ignored);
    };

    let reason = BillingReasonKind::parse(invoice.billing_reason.as_deref());

    // Bootstrap the subscription row from the gateway when the invoice beat
    // the creation event to us.
    let local = d
        .store
        .read(|tx| tx.subscription_by_pg_id(&pg_subscription_id).cloned());
    let (user_id, prepared) = match local {
        Some(row) => (row.user_id.clone(), Prepared::Local(row)),
        None => {
            let Some(remote) = d
                .pg_call(d.gateway.subscription_with_latest_invoice(&pg_subscription_id))
                .await?
            else {
                warn!(
                    event_id = %envelope.id,
                    pg_subscription = %pg_subscription_id,
                    "paid invoice for a subscription unknown locally and upstream"
                );
                return Ok(Disposition::Skipped);
            };
            let Some(user) = d
                .resolve_user(
                    remote.metadata.get("user_id").map(String::as_str),
                    remote.customer.as_deref().or(invoice.customer.as_deref()),
                )
                .await?
            else {
                warn!(event_id = %envelope.id, "paid invoice cannot be attributed to a user");
                return Ok(Disposition::Skipped);
            };

            let plan_key = remote.plan_key().unwrap_or_default().to_owned();
            let price = d.catalog.subscription_price(&plan_key)?;
            let period_start = remote.period_start().unwrap_or(now);
            let fields = SubscriptionFields {
                user_id: user.user_id.clone(),
                plan_key,
                plan_tier: price.plan_tier,
                billing_cycle: price.billing_cycle,
                pg_subscription_id: pg_subscription_id.clone(),
                is_active: true,
                current_period_start: period_start,
                current_period_end: remote
                    .period_end()
                    .unwrap_or_else(|| price.billing_cycle.period_end(period_start)),
                tokens_per_cycle: price.tokens_per_cycle,
                price_cents: price.price_cents,
            };
            (user.user_id.clone(), Prepared::Bootstrap(fields))
        }
    };

    let plan_key = match &prepared {
        Prepared::Local(row) => row.plan_key.clone(),
        Prepared::Bootstrap(fields) => fields.plan_key.clone(),
    };
    let price = d.catalog.subscription_price(&plan_key)?.clone();

    d.store.transaction(|tx| {
        if !tx.record_event(&envelope.id, &envelope.event_type, now) {
            return Ok(Disposition::Duplicate);
        }

        let sub_id = match &prepared {
            Prepared::Local(row) => row.id,
            Prepared::Bootstrap(fields) => tx.upsert_subscription_by_pg_id(fields.clone())?.id,
        };
        let row = tx
            .subscription(sub_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "subscription",
                key: sub_id.to_string(),
            })?;

        if let Some(customer_id) = invoice.customer.as_deref() {
            tx.bind_pg_customer(&user_id, customer_id)?;
        }

        if let Some(plan) = subscription_grant_plan(&price, &row, reason, Some(&invoice), now) {
            let granted = grant_batch(
                tx,
                GrantRequest {
                    user_id: user_id.clone(),
                    origin: BatchOrigin::Subscription {
                        subscription_id: row.id,
                    },
                    amount: plan.amount,
                    expires_at: plan.expires_at,
                    invoice_id: Some(invoice.id.clone()),
                    note: format!("invoice {}", invoice.id),
                    reason: plan.reason,
                },
                now,
            )?;
            if plan.stamp_monthly_refill && matches!(granted, GrantOutcome::Granted { .. }) {
                tx.update_subscription(row.id, |s| s.last_monthly_refill = Some(now))?;
            }
        }

        // A paid invoice always clears dunning.
        let next = lifecycle::transition(lifecycle::state_of(Some(&row)), LifecycleEvent::InvoicePaid)
            .unwrap_or(SubscriptionState::Active);
        tx.update_subscription(row.id, |s| {
            s.payment_failure_reason = None;
            s.is_active = !matches!(next, SubscriptionState::Ended | SubscriptionState::Absent);
        })?;
        let (active, issue) = lifecycle::user_flags(next);
        tx.update_user_flags(&user_id, Some(active), Some(issue))?;

        if reason == BillingReasonKind::Create {
            apply_referral_reward(tx, &user_id, d.settings.referral_token_amount, now)?;
        }
        Ok(Disposition::Processed)
    })
}
