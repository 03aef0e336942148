//! Payment-failure handlers
//!
//! `invoice.payment_failed`, `payment_intent.payment_failed`, and
//! `charge.failed` all land here. The handler extracts a failure reason
//! through the escalation chain, stores it on the subscription row, and
//! flips the user's `has_payment_issue` flag. Access is never revoked on a
//! failed payment; the subscription stays active until the gateway deletes
//! it or the billing period lapses.

use chrono::{DateTime, Utc};
use tracing::warn;

use super::failure_reason::{self, FailureContext};
use super::{Disposition, EventDispatcher};
use crate::errors::Result;
use crate::events::{EventEnvelope, EventKind};
use crate::lifecycle::{self, LifecycleEvent};

pub(crate) async fn handle_payment_failure(
    d: &EventDispatcher,
    envelope: &EventEnvelope,
    now: DateTime<Utc>,
) -> Result<Disposition> {
    let ctx = context_for(envelope)?;

    let reason = failure_reason::extract(d, &ctx).await;

    // Attribution: the local subscription row wins, then customer-based
    // resolution.
    let local_sub = ctx.pg_subscription_id.as_deref().and_then(|pg_id| {
        d.store.read(|tx| tx.subscription_by_pg_id(pg_id).cloned())
    });
    let user_id = match &local_sub {
        Some(row) => row.user_id.clone(),
        None => {
            let Some(user) = d.resolve_user(None, ctx.customer_id.as_deref()).await? else {
                warn!(event_id = %envelope.id, "payment failure cannot be attributed to a user");
                return Ok(Disposition::Skipped);
            };
            user.user_id
        }
    };

    d.store.transaction(|tx| {
        if !tx.record_event(&envelope.id, &envelope.event_type, now) {
            return Ok(Disposition::Duplicate);
        }

        let target = match &local_sub {
            Some(row) => Some(row.clone()),
            None => tx.latest_active_subscription(&user_id).cloned(),
        };
        if let Some(sub) = &target {
            let state = lifecycle::state_of(Some(sub));
            // The transition table is the authority here: dunning never
            // touches is_active.
            if lifecycle::transition(state, LifecycleEvent::PaymentFailed).is_some() {
                tx.update_subscription(sub.id, |s| {
                    s.payment_failure_reason = Some(reason.clone());
                })?;
            }
        }
        tx.update_user_flags(&user_id, None, Some(true))?;
        Ok(Disposition::Processed)
    })
}

fn context_for(envelope: &EventEnvelope) -> Result<FailureContext> {
    match envelope.kind() {
        EventKind::InvoicePaymentFailed => {
            let invoice = envelope.invoice()?;
            Ok(FailureContext {
                invoice_id: Some(invoice.id.clone()),
                payment_intent_id: invoice
                    .payment_intent
                    .as_ref()
                    .map(|pi| pi.id().to_owned()),
                pg_subscription_id: invoice.subscription.clone(),
                customer_id: invoice.customer.clone(),
                inline_intent_error: invoice
                    .payment_intent
                    .as_ref()
                    .and_then(|pi| pi.object())
                    .and_then(|pi| pi.last_payment_error.as_ref())
                    .and_then(crate::events::PaymentError::describe),
                inline_charge_failure: invoice
                    .charge
                    .as_ref()
                    .and_then(|c| c.object())
                    .and_then(|c| c.describe_failure()),
                collection_method: invoice.collection_method.clone(),
                status: invoice.status.clone(),
                attempt_count: invoice.attempt_count,
                next_payment_attempt: invoice.next_payment_attempt,
            })
        }
        EventKind::PaymentIntentPaymentFailed => {
            let intent = envelope.payment_intent()?;
            Ok(FailureContext {
                invoice_id: intent.invoice.clone(),
                payment_intent_id: Some(intent.id.clone()),
                pg_subscription_id: None,
                customer_id: intent.customer.clone(),
                inline_intent_error: intent
                    .last_payment_error
                    .as_ref()
                    .and_then(crate::events::PaymentError::describe),
                inline_charge_failure: None,
                collection_method: None,
                status: None,
                attempt_count: 0,
                next_payment_attempt: None,
            })
        }
        _ => {
            let charge = envelope.charge()?;
            Ok(FailureContext {
                invoice_id: charge.invoice.clone(),
                payment_intent_id: None,
                pg_subscription_id: None,
                customer_id: charge.customer.clone(),
                inline_intent_error: None,
                inline_charge_failure: charge.describe_failure(),
                collection_method: None,
                status: None,
                attempt_count: 0,
                next_payment_attempt: None,
            })
        }
    }
}
