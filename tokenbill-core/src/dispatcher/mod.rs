//! Event dispatcher
//!
//! Consumes raw webhook deliveries from the payment gateway: verifies the
//! signature over the exact body bytes, parses the envelope, deduplicates on
//! the event id, routes to the handler for the event kind, and commits every
//! resulting ledger mutation in a single store transaction. Any error inside
//! a handler rolls the whole effect back and surfaces a retriable failure so
//! the gateway redelivers.

mod checkout;
mod failure;
mod failure_reason;
mod invoice;
mod subscription;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::catalog::{Catalog, SubscriptionPrice};
use crate::config::BillingConfig;
use crate::constants::ONE_TIME_PURCHASE_EXPIRY_DAYS;
use crate::errors::{BillingError, Result};
use crate::events::{EventEnvelope, EventKind, InvoiceObject};
use crate::gateway::{GatewayError, PaymentGateway};
use crate::ledger::{grant_batch, GrantRequest};
use crate::model::{BatchOrigin, BillingCycle, Subscription, TokenReason, User};
use crate::signature;
use crate::store::{LedgerStore, StoreError, StoreTx};

/// Dispatcher tunables, extracted from the service configuration.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Inbound webhook signing secret
    pub webhook_secret: String,
    /// Tokens granted per successful referral; 0 disables referrals
    pub referral_token_amount: u64,
    /// Wall-clock budget per event
    pub event_deadline: Duration,
    /// Inner deadline per gateway call
    pub pg_call_deadline: Duration,
}

impl DispatchSettings {
    /// Extract the dispatcher settings from the service configuration.
    #[must_use]
    pub fn from_config(config: &BillingConfig) -> Self {
        Self {
            webhook_secret: config.pg_webhook_secret.clone(),
            referral_token_amount: config.referral_token_amount,
            event_deadline: config.event_deadline,
            pg_call_deadline: config.pg_call_deadline,
        }
    }
}

/// How a webhook delivery was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Effects were committed
    Processed,
    /// The event id was already in the event log; nothing was done
    Duplicate,
    /// The event kind (or object state) carries no effects for the ledger
    Ignored,
    /// The event could not be attributed or its subject is gone; logged as
    /// an anomaly and acknowledged so the gateway stops retrying
    Skipped,
}

/// Result of accepting one webhook delivery.
#[derive(Debug, Clone)]
pub struct WebhookReceipt {
    /// Gateway event id
    pub event_id: String,
    /// Routed event kind
    pub kind: EventKind,
    /// How the delivery was resolved
    pub disposition: Disposition,
}

/// The webhook event dispatcher.
pub struct EventDispatcher {
    pub(crate) store: Arc<LedgerStore>,
    pub(crate) gateway: Arc<dyn PaymentGateway>,
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) settings: DispatchSettings,
}

impl EventDispatcher {
    /// Assemble a dispatcher from its injected collaborators.
    #[must_use]
    pub fn new(
        store: Arc<LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<Catalog>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            catalog,
            settings,
        }
    }

    /// Verify, parse, deduplicate, and apply one webhook delivery.
    ///
    /// `payload` must be the raw request body, byte for byte, or signature
    /// verification will fail.
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
        now: DateTime<Utc>,
    ) -> Result<WebhookReceipt> {
        if let Err(err) =
            signature::verify(&self.settings.webhook_secret, signature_header, payload, now)
        {
            warn!(
                payload_prefix = %truncate_payload(payload),
                %err,
                "rejected webhook with bad signature"
            );
            return Err(err);
        }

        let envelope = EventEnvelope::parse(payload)?;
        let kind = envelope.kind();

        if kind == EventKind::Unknown {
            info!(event_id = %envelope.id, event_type = %envelope.event_type, "ignoring unhandled event type");
            return Ok(WebhookReceipt {
                event_id: envelope.id,
                kind,
                disposition: Disposition::Ignored,
            });
        }

        if self.store.read(|tx| tx.event_seen(&envelope.id)) {
            info!(event_id = %envelope.id, "skipping duplicate event");
            return Ok(WebhookReceipt {
                event_id: envelope.id,
                kind,
                disposition: Disposition::Duplicate,
            });
        }

        let routed = tokio::time::timeout(self.settings.event_deadline, self.route(&envelope, now))
            .await
            .map_err(|_| BillingError::DeadlineExceeded("handling webhook event"))?;

        let disposition = match routed {
            Ok(disposition) => disposition,
            // A soft-deleted user blocks ledger mutations; acknowledge and
            // move on, redelivery cannot change the outcome.
            Err(BillingError::Storage(StoreError::UserDeleted(user_id))) => {
                warn!(event_id = %envelope.id, %user_id, "dropping event for deleted user");
                Disposition::Skipped
            }
            Err(err) => {
                warn!(event_id = %envelope.id, kind = kind.as_str(), %err, "event handling failed");
                return Err(err);
            }
        };

        info!(
            event_id = %envelope.id,
            kind = kind.as_str(),
            ?disposition,
            "webhook handled"
        );
        Ok(WebhookReceipt {
            event_id: envelope.id,
            kind,
            disposition,
        })
    }

    async fn route(&self, envelope: &EventEnvelope, now: DateTime<Utc>) -> Result<Disposition> {
        match envelope.kind() {
            EventKind::CheckoutSessionCompleted => {
                checkout::handle_checkout_completed(self, envelope, now).await
            }
            EventKind::PaymentIntentSucceeded => {
                checkout::handle_payment_intent_succeeded(self, envelope, now).await
            }
            EventKind::SubscriptionCreated => {
                subscription::handle_created(self, envelope, now).await
            }
            EventKind::SubscriptionUpdated => {
                subscription::handle_updated(self, envelope, now).await
            }
            EventKind::SubscriptionDeleted => subscription::handle_deleted(self, envelope, now),
            EventKind::InvoicePaid | EventKind::InvoicePaymentSucceeded => {
                invoice::handle_invoice_paid(self, envelope, now).await
            }
            EventKind::InvoicePaymentFailed
            | EventKind::PaymentIntentPaymentFailed
            | EventKind::ChargeFailed => failure::handle_payment_failure(self, envelope, now).await,
            EventKind::Unknown => Ok(Disposition::Ignored),
        }
    }

    /// Run a gateway call under the inner per-call deadline.
    pub(crate) async fn pg_call<T>(
        &self,
        fut: impl Future<Output = std::result::Result<T, GatewayError>> + Send,
    ) -> std::result::Result<T, GatewayError> {
        tokio::time::timeout(self.settings.pg_call_deadline, fut)
            .await
            .map_err(|_| GatewayError::Timeout)?
    }

    /// Attribute an event to a local user.
    ///
    /// Resolution order: explicit `metadata.user_id`, then the bound gateway
    /// customer id, then the customer's email fetched from the gateway.
    /// `Ok(None)` means the event cannot be attributed; gateway transport
    /// errors propagate so the delivery is retried rather than dropped.
    pub(crate) async fn resolve_user(
        &self,
        metadata_user_id: Option<&str>,
        pg_customer_id: Option<&str>,
    ) -> Result<Option<User>> {
        if let Some(user_id) = metadata_user_id {
            if let Some(user) = self.store.read(|tx| tx.user(user_id).cloned()) {
                return Ok(Some(user));
            }
        }

        let Some(customer_id) = pg_customer_id else {
            return Ok(None);
        };

        if let Some(user) = self
            .store
            .read(|tx| tx.user_by_pg_customer(customer_id).cloned())
        {
            return Ok(Some(user));
        }

        let customer = self.pg_call(self.gateway.customer(customer_id)).await?;
        if let Some(email) = customer.and_then(|c| c.email) {
            if let Some(user) = self.store.read(|tx| tx.user_by_email(&email).cloned()) {
                return Ok(Some(user));
            }
        }

        Ok(None)
    }
}

/// How many tokens a subscription invoice should grant, and on what terms.
#[derive(Debug, Clone)]
pub(crate) struct GrantPlan {
    pub amount: u64,
    pub expires_at: DateTime<Utc>,
    pub reason: TokenReason,
    /// Whether the grant stamps `last_monthly_refill` (yearly plans)
    pub stamp_monthly_refill: bool,
}

/// Why the gateway issued a subscription invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BillingReasonKind {
    Create,
    Cycle,
    Update,
}

impl BillingReasonKind {
    pub(crate) fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("subscription_create") => Self::Create,
            Some("subscription_update") => Self::Update,
            _ => Self::Cycle,
        }
    }

    const fn grant_reason(self) -> TokenReason {
        match self {
            Self::Create => TokenReason::SubscriptionInitialCredit,
            Self::Cycle => TokenReason::SubscriptionRefill,
            Self::Update => TokenReason::SubscriptionUpgradeCredit,
        }
    }
}

/// The credit policy for subscription batches.
///
/// Non-yearly plans grant `tokens_per_cycle` with the invoice line's period
/// end as the expiry (falling back to the subscription period end, then to
/// `now` plus one cycle). Yearly plans amortize: creation and upgrades grant
/// one monthly refill and stamp `last_monthly_refill`; cycle renewals grant
/// nothing because the maintenance worker performs the remaining refills.
pub(crate) fn subscription_grant_plan(
    price: &SubscriptionPrice,
    sub: &Subscription,
    reason: BillingReasonKind,
    invoice: Option<&InvoiceObject>,
    now: DateTime<Utc>,
) -> Option<GrantPlan> {
    if price.billing_cycle == BillingCycle::Yearly {
        if reason == BillingReasonKind::Cycle {
            return None;
        }
        let amount = price
            .monthly_refill_tokens
            .unwrap_or(price.tokens_per_cycle / crate::constants::MONTHLY_REFILLS_PER_YEAR);
        return Some(GrantPlan {
            amount,
            expires_at: BillingCycle::Monthly.period_end(now),
            reason: reason.grant_reason(),
            stamp_monthly_refill: true,
        });
    }

    let expires_at = invoice
        .and_then(InvoiceObject::line_period_end)
        .or_else(|| {
            (sub.current_period_end > now).then_some(sub.current_period_end)
        })
        .unwrap_or_else(|| price.billing_cycle.period_end(now));

    Some(GrantPlan {
        amount: price.tokens_per_cycle,
        expires_at,
        reason: reason.grant_reason(),
        stamp_monthly_refill: false,
    })
}

/// Grant the pending referral reward for `referred_user_id`, if any.
///
/// The reward goes to the referrer and the referral row flips to rewarded in
/// the same transaction, making the reward exactly-once. A missing or
/// deleted referrer forfeits the reward rather than failing the event.
pub(crate) fn apply_referral_reward(
    tx: &mut StoreTx<'_>,
    referred_user_id: &str,
    amount: u64,
    now: DateTime<Utc>,
) -> Result<bool> {
    if amount == 0 {
        return Ok(false);
    }
    let Some(referral) = tx.pending_referral_for(referred_user_id).cloned() else {
        return Ok(false);
    };

    let referrer_ok = tx
        .user(&referral.referrer_user_id)
        .is_some_and(|u| !u.is_deleted);
    if !referrer_ok {
        warn!(
            referrer = %referral.referrer_user_id,
            referred = %referred_user_id,
            "referrer missing or deleted, forfeiting reward"
        );
        tx.mark_referral_rewarded(referral.id)?;
        return Ok(false);
    }

    grant_batch(
        tx,
        GrantRequest {
            user_id: referral.referrer_user_id.clone(),
            origin: BatchOrigin::Referral {
                referrer_user_id: referral.referrer_user_id.clone(),
            },
            amount,
            expires_at: now + chrono::Duration::days(ONE_TIME_PURCHASE_EXPIRY_DAYS),
            invoice_id: None,
            note: "referral-reward".into(),
            reason: TokenReason::ReferralReward,
        },
        now,
    )?;
    tx.mark_referral_rewarded(referral.id)?;
    Ok(true)
}

fn truncate_payload(payload: &[u8]) -> String {
    const MAX: usize = 160;
    let text = String::from_utf8_lossy(payload);
    if text.len() <= MAX {
        text.into_owned()
    } else {
        let mut end = MAX;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &text[..end])
    }
}
