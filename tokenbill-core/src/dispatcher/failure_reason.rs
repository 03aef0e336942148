//! Failure-reason escalation chain
//!
//! Failed-payment events rarely carry the human-readable reason themselves,
//! so the handler walks an ordered chain of gateway lookups and stops at the
//! first non-empty result:
//!
//! 1. re-fetch the invoice with its payment intent and latest charge
//!    expanded;
//! 2. the payment intent's `last_payment_error` (inline payload first);
//! 3. the invoice's charge object;
//! 4. a payment-intent search by invoice id;
//! 5. the subscription's latest-invoice expansion.
//!
//! When every source comes back empty the failure is diagnosed from invoice
//! and customer state; when every lookup errored the reason degrades to an
//! `unknown: ...` summary. A non-empty reason is always produced.

use tracing::{debug, warn};

use super::EventDispatcher;
use crate::events::{InvoiceObject, PaymentError};

/// Everything the escalation chain can start from, pulled out of the
/// triggering event.
#[derive(Debug, Default)]
pub(crate) struct FailureContext {
    pub invoice_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub pg_subscription_id: Option<String>,
    pub customer_id: Option<String>,
    /// `last_payment_error` already present on the event payload
    pub inline_intent_error: Option<String>,
    /// Charge failure already present on the event payload
    pub inline_charge_failure: Option<String>,
    pub collection_method: Option<String>,
    pub status: Option<String>,
    pub attempt_count: u32,
    pub next_payment_attempt: Option<i64>,
}

/// Walk the escalation chain. Infallible: some reason string always comes
/// back.
pub(crate) async fn extract(d: &EventDispatcher, ctx: &FailureContext) -> String {
    let mut lookups_attempted = 0u32;
    let mut lookups_failed = 0u32;

    // Step 1: the expanded invoice.
    if let Some(invoice_id) = &ctx.invoice_id {
        lookups_attempted += 1;
        match d.pg_call(d.gateway.invoice_with_payment_details(invoice_id)).await {
            Ok(Some(invoice)) => {
                if let Some(reason) = reason_from_invoice(&invoice) {
                    return reason;
                }
            }
            Ok(None) => {}
            Err(err) => {
                lookups_failed += 1;
                warn!(%invoice_id, %err, "failure-reason lookup: invoice fetch failed");
            }
        }
    }

    // Step 2: the payment intent's last error.
    if let Some(reason) = &ctx.inline_intent_error {
        return reason.clone();
    }
    if let Some(intent_id) = &ctx.payment_intent_id {
        lookups_attempted += 1;
        match d.pg_call(d.gateway.payment_intent(intent_id)).await {
            Ok(Some(intent)) => {
                if let Some(reason) = intent
                    .last_payment_error
                    .as_ref()
                    .and_then(PaymentError::describe)
                {
                    return reason;
                }
            }
            Ok(None) => {}
            Err(err) => {
                lookups_failed += 1;
                warn!(%intent_id, %err, "failure-reason lookup: payment intent fetch failed");
            }
        }
    }

    // Step 3: the invoice's charge object.
    if let Some(reason) = &ctx.inline_charge_failure {
        return reason.clone();
    }

    // Step 4: search payment intents by invoice.
    if let Some(invoice_id) = &ctx.invoice_id {
        lookups_attempted += 1;
        match d
            .pg_call(d.gateway.payment_intents_for_invoice(invoice_id))
            .await
        {
            Ok(intents) => {
                if let Some(reason) = intents
                    .iter()
                    .find_map(|pi| pi.last_payment_error.as_ref().and_then(PaymentError::describe))
                {
                    return reason;
                }
            }
            Err(err) => {
                lookups_failed += 1;
                warn!(%invoice_id, %err, "failure-reason lookup: payment intent search failed");
            }
        }
    }

    // Step 5: via the subscription's latest invoice.
    if let Some(pg_subscription_id) = &ctx.pg_subscription_id {
        lookups_attempted += 1;
        match d
            .pg_call(d.gateway.subscription_with_latest_invoice(pg_subscription_id))
            .await
        {
            Ok(Some(subscription)) => {
                if let Some(reason) = subscription
                    .latest_invoice
                    .as_ref()
                    .and_then(|inv| inv.object())
                    .and_then(reason_from_invoice)
                {
                    return reason;
                }
            }
            Ok(None) => {}
            Err(err) => {
                lookups_failed += 1;
                warn!(%pg_subscription_id, %err, "failure-reason lookup: subscription fetch failed");
            }
        }
    }

    if lookups_attempted > 0 && lookups_failed == lookups_attempted {
        return format!(
            "unknown: status={}, attempt_count={}, next_attempt={}",
            ctx.status.as_deref().unwrap_or("-"),
            ctx.attempt_count,
            ctx.next_payment_attempt
                .map_or_else(|| "-".to_owned(), |t| t.to_string()),
        );
    }

    diagnose(d, ctx).await
}

/// Every lookup came back empty: classify from invoice and customer state.
async fn diagnose(d: &EventDispatcher, ctx: &FailureContext) -> String {
    if ctx.collection_method.as_deref() == Some("send_invoice") {
        return "no_automatic_payment".into();
    }

    if let Some(customer_id) = &ctx.customer_id {
        match d.pg_call(d.gateway.customer(customer_id)).await {
            Ok(Some(customer)) if !customer.has_payment_method() => {
                return "no_payment_method_on_file".into();
            }
            Ok(_) => {}
            Err(err) => {
                debug!(%customer_id, %err, "failure-reason diagnosis: customer fetch failed");
            }
        }
    }

    "no_attempt_yet".into()
}

fn reason_from_invoice(invoice: &InvoiceObject) -> Option<String> {
    invoice
        .payment_intent
        .as_ref()
        .and_then(|pi| pi.object())
        .and_then(|pi| pi.last_payment_error.as_ref())
        .and_then(PaymentError::describe)
        .or_else(|| {
            invoice
                .charge
                .as_ref()
                .and_then(|c| c.object())
                .and_then(|c| c.describe_failure())
        })
}
