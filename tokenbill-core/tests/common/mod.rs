//! Shared harness for the webhook scenario tests
//!
//! Wires the dispatcher to an in-memory store, the fake gateway, and a seeded
//! catalog, and provides signed-payload builders so every test drives the
//! full pipeline exactly the way the transport layer does.

// Not every test binary exercises every helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use tokenbill_core::catalog::{Catalog, SubscriptionPrice, TokenPrice};
use tokenbill_core::dispatcher::{DispatchSettings, EventDispatcher, WebhookReceipt};
use tokenbill_core::errors::BillingError;
use tokenbill_core::gateway::FakeGateway;
use tokenbill_core::model::{BillingCycle, PlanTier};
use tokenbill_core::signature;
use tokenbill_core::store::{LedgerStore, StoreError};

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

pub const MONTHLY_PLAN: &str = "price_monthly_standard";
pub const MONTHLY_PREMIUM_PLAN: &str = "price_monthly_premium";
pub const YEARLY_PLAN: &str = "price_yearly_premium";

/// A fixed wall clock; every scenario advances from here explicitly.
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

pub fn test_catalog() -> Catalog {
    Catalog::new(
        vec![
            SubscriptionPrice {
                plan_key: MONTHLY_PLAN.into(),
                plan_tier: PlanTier::Standard,
                billing_cycle: BillingCycle::Monthly,
                tokens_per_cycle: 1000,
                monthly_refill_tokens: None,
                price_cents: 1900,
            },
            SubscriptionPrice {
                plan_key: MONTHLY_PREMIUM_PLAN.into(),
                plan_tier: PlanTier::Premium,
                billing_cycle: BillingCycle::Monthly,
                tokens_per_cycle: 2000,
                monthly_refill_tokens: None,
                price_cents: 2900,
            },
            SubscriptionPrice {
                plan_key: YEARLY_PLAN.into(),
                plan_tier: PlanTier::Premium,
                billing_cycle: BillingCycle::Yearly,
                tokens_per_cycle: 12_000,
                monthly_refill_tokens: Some(1000),
                price_cents: 19_900,
            },
        ],
        vec![TokenPrice {
            plan_key: "price_pack_tier1".into(),
            tier: "tier1".into(),
            tokens: 5000,
            price_cents: 4900,
        }],
    )
}

pub struct Harness {
    pub store: Arc<LedgerStore>,
    pub gateway: Arc<FakeGateway>,
    pub catalog: Arc<Catalog>,
    pub dispatcher: EventDispatcher,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_referral_amount(0)
    }

    pub fn with_referral_amount(referral_token_amount: u64) -> Self {
        let store = Arc::new(LedgerStore::in_memory());
        let gateway = Arc::new(FakeGateway::new());
        let catalog = Arc::new(test_catalog());
        let dispatcher = EventDispatcher::new(
            Arc::clone(&store),
            gateway.clone(),
            Arc::clone(&catalog),
            DispatchSettings {
                webhook_secret: WEBHOOK_SECRET.into(),
                referral_token_amount,
                event_deadline: Duration::from_secs(30),
                pg_call_deadline: Duration::from_secs(10),
            },
        );
        Self {
            store,
            gateway,
            catalog,
            dispatcher,
        }
    }

    pub fn seed_user(&self, user_id: &str) {
        self.store
            .transaction::<_, StoreError>(|tx| {
                tx.upsert_user_by_external_id(user_id, &format!("{user_id}@example.com"))?;
                Ok(())
            })
            .unwrap();
    }

    pub fn seed_referral(&self, referrer: &str, referred: &str) {
        self.store
            .transaction::<_, StoreError>(|tx| {
                tx.insert_referral(referrer, referred)?;
                Ok(())
            })
            .unwrap();
    }

    /// Sign and deliver a payload at the fixed clock.
    pub async fn deliver(&self, payload: &Value) -> Result<WebhookReceipt, BillingError> {
        self.deliver_at(payload, now()).await
    }

    /// Sign and deliver a payload at an explicit clock.
    pub async fn deliver_at(
        &self,
        payload: &Value,
        at: DateTime<Utc>,
    ) -> Result<WebhookReceipt, BillingError> {
        let body = payload.to_string();
        let header = signature::sign(WEBHOOK_SECRET, body.as_bytes(), at);
        self.dispatcher
            .handle_webhook(body.as_bytes(), &header, at)
            .await
    }

    pub fn balance(&self, user_id: &str) -> u64 {
        self.store.balance(user_id, now())
    }
}

// ── payload builders ────────────────────────────────────────────────────

pub fn envelope(event_id: &str, event_type: &str, object: Value) -> Value {
    json!({
        "id": event_id,
        "type": event_type,
        "created": now().timestamp(),
        "livemode": false,
        "data": { "object": object }
    })
}

pub fn checkout_payment_session(
    event_id: &str,
    session_id: &str,
    user_id: &str,
    plan_option: &str,
    discount_cents: i64,
) -> Value {
    envelope(
        event_id,
        "checkout.session.completed",
        json!({
            "id": session_id,
            "mode": "payment",
            "customer": format!("cus_{user_id}"),
            "metadata": { "user_id": user_id, "plan_option": plan_option },
            "total_details": { "amount_discount": discount_cents }
        }),
    )
}

pub fn subscription_object(pg_sub_id: &str, user_id: &str, plan_key: &str) -> Value {
    json!({
        "id": pg_sub_id,
        "customer": format!("cus_{user_id}"),
        "status": "active",
        "current_period_start": now().timestamp(),
        "current_period_end": (now() + chrono::Duration::days(30)).timestamp(),
        "metadata": { "user_id": user_id },
        "items": { "data": [ { "price": { "id": plan_key, "unit_amount": 1900 } } ] }
    })
}

pub fn subscription_created(event_id: &str, pg_sub_id: &str, user_id: &str, plan_key: &str) -> Value {
    envelope(
        event_id,
        "customer.subscription.created",
        subscription_object(pg_sub_id, user_id, plan_key),
    )
}

pub fn invoice_object(
    invoice_id: &str,
    pg_sub_id: &str,
    user_id: &str,
    billing_reason: &str,
) -> Value {
    json!({
        "id": invoice_id,
        "customer": format!("cus_{user_id}"),
        "subscription": pg_sub_id,
        "billing_reason": billing_reason,
        "status": "paid",
        "lines": { "data": [ {
            "period": {
                "start": now().timestamp(),
                "end": (now() + chrono::Duration::days(30)).timestamp()
            }
        } ] }
    })
}

pub fn invoice_paid(
    event_id: &str,
    invoice_id: &str,
    pg_sub_id: &str,
    user_id: &str,
    billing_reason: &str,
) -> Value {
    envelope(
        event_id,
        "invoice.paid",
        invoice_object(invoice_id, pg_sub_id, user_id, billing_reason),
    )
}
