//! One-time purchase handlers
//!
//! `checkout.session.completed` settles hosted checkouts: payment-mode
//! sessions create a Purchase row and grant a 60-day batch; subscription-mode
//! sessions only bind the gateway customer id, since the subscription events
//! carry the real effects. `payment_intent.succeeded` covers one-time
//! payments taken outside Checkout, idempotent on the intent id.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{apply_referral_reward, Disposition, EventDispatcher};
use crate::constants::{NOTE_ONE_TIME_PURCHASE, ONE_TIME_PURCHASE_EXPIRY_DAYS};
use crate::errors::Result;
use crate::events::EventEnvelope;
use crate::ledger::{grant_batch, GrantRequest};
use crate::model::{BatchOrigin, TokenReason};
use crate::store::PurchaseFields;

pub(crate) async fn handle_checkout_completed(
    d: &EventDispatcher,
    envelope: &EventEnvelope,
    now: DateTime<Utc>,
) -> Result<Disposition> {
    let session = envelope.checkout_session()?;
    match session.mode.as_str() {
        "payment" => {
            settle_one_time_payment(
                d,
                envelope,
                session.metadata.get("user_id").map(String::as_str),
                session.metadata.get("plan_option").map(String::as_str),
                session.customer.as_deref(),
                &session.id,
                session
                    .total_details
                    .as_ref()
                    .map_or(0, |t| t.amount_discount),
                now,
            )
            .await
        }
        "subscription" => {
            bind_customer_only(d, envelope, &session, now).await
        }
        other => {
            debug!(event_id = %envelope.id, mode = other, "ignoring checkout session mode");
            Ok(Disposition::Ignored)
        }
    }
}

/// One-time payments taken without a Checkout session. Only intents that
/// carry purchase metadata and no invoice are in scope; everything else
/// belongs to other flows.
pub(crate) async fn handle_payment_intent_succeeded(
    d: &EventDispatcher,
    envelope: &EventEnvelope,
    now: DateTime<Utc>,
) -> Result<Disposition> {
    let intent = envelope.payment_intent()?;
    if intent.invoice.is_some() {
        return Ok(Disposition::Ignored);
    }
    let Some(plan_option) = intent.metadata.get("plan_option").map(String::to_owned) else {
        debug!(event_id = %envelope.id, intent = %intent.id, "payment intent carries no purchase metadata");
        return Ok(Disposition::Ignored);
    };

    settle_one_time_payment(
        d,
        envelope,
        intent.metadata.get("user_id").map(String::as_str),
        Some(plan_option.as_str()),
        intent.customer.as_deref(),
        &intent.id,
        0,
        now,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn settle_one_time_payment(
    d: &EventDispatcher,
    envelope: &EventEnvelope,
    metadata_user_id: Option<&str>,
    plan_option: Option<&str>,
    pg_customer_id: Option<&str>,
    pg_purchase_id: &str,
    discount_cents: i64,
    now: DateTime<Utc>,
) -> Result<Disposition> {
    let Some(user) = d.resolve_user(metadata_user_id, pg_customer_id).await? else {
        warn!(event_id = %envelope.id, "one-time payment cannot be attributed to a user");
        return Ok(Disposition::Skipped);
    };
    let Some(plan_option) = plan_option else {
        warn!(event_id = %envelope.id, user_id = %user.user_id, "one-time payment carries no plan_option");
        return Ok(Disposition::Skipped);
    };
    let pack = d.catalog.token_price_by_tier(plan_option)?.clone();

    let expires_at = now + chrono::Duration::days(ONE_TIME_PURCHASE_EXPIRY_DAYS);
    d.store.transaction(|tx| {
        if !tx.record_event(&envelope.id, &envelope.event_type, now) {
            return Ok(Disposition::Duplicate);
        }
        if let Some(customer_id) = pg_customer_id {
            tx.bind_pg_customer(&user.user_id, customer_id)?;
        }

        let purchase = tx.insert_purchase(PurchaseFields {
            user_id: user.user_id.clone(),
            plan_tier: pack.tier.clone(),
            pg_purchase_id: pg_purchase_id.to_owned(),
            amount_tokens: pack.tokens,
            discount_cents,
            period_start: now,
            period_end: expires_at,
        })?;
        if !purchase.was_insert {
            // A parallel delivery path already settled this purchase.
            return Ok(Disposition::Processed);
        }

        grant_batch(
            tx,
            GrantRequest {
                user_id: user.user_id.clone(),
                origin: BatchOrigin::Purchase {
                    purchase_id: purchase.id,
                },
                amount: pack.tokens,
                expires_at,
                invoice_id: None,
                note: NOTE_ONE_TIME_PURCHASE.into(),
                reason: TokenReason::Purchase,
            },
            now,
        )?;

        apply_referral_reward(tx, &user.user_id, d.settings.referral_token_amount, now)?;
        Ok(Disposition::Processed)
    })
}

async fn bind_customer_only(
    d: &EventDispatcher,
    envelope: &EventEnvelope,
    session: &crate::events::CheckoutSessionObject,
    now: DateTime<Utc>,
) -> Result<Disposition> {
    let Some(customer_id) = session.customer.as_deref() else {
        return Ok(Disposition::Ignored);
    };
    let Some(user) = d
        .resolve_user(
            session.metadata.get("user_id").map(String::as_str),
            Some(customer_id),
        )
        .await?
    else {
        warn!(event_id = %envelope.id, "subscription checkout cannot be attributed to a user");
        return Ok(Disposition::Skipped);
    };

    d.store.transaction(|tx| {
        if !tx.record_event(&envelope.id, &envelope.event_type, now) {
            return Ok(Disposition::Duplicate);
        }
        tx.bind_pg_customer(&user.user_id, customer_id)?;
        Ok(Disposition::Processed)
    })
}
