//! Payment failure and recovery
//!
//! A failed charge records a non-null reason and flips `has_payment_issue`
//! while leaving access intact (dunning grace); the next paid invoice clears
//! both. The failure reason comes from the escalation chain, degrading
//! through diagnosis to an `unknown: ...` summary when the gateway is
//! unreachable.

mod common;

use common::*;
use serde_json::json;
use tokenbill_core::dispatcher::Disposition;

async fn activate_subscription(h: &Harness) {
    h.seed_user("u1");
    h.deliver(&subscription_created("evt_sub", "sub_1", "u1", MONTHLY_PLAN))
        .await
        .unwrap();
    h.deliver(&invoice_paid(
        "evt_inv_1",
        "in_1",
        "sub_1",
        "u1",
        "subscription_create",
    ))
    .await
    .unwrap();
}

fn failed_invoice_event(event_id: &str, invoice_id: &str) -> serde_json::Value {
    envelope(
        event_id,
        "invoice.payment_failed",
        json!({
            "id": invoice_id,
            "customer": "cus_u1",
            "subscription": "sub_1",
            "billing_reason": "subscription_cycle",
            "status": "open",
            "attempt_count": 2,
            "next_payment_attempt": (now() + chrono::Duration::days(3)).timestamp(),
            "collection_method": "charge_automatically"
        }),
    )
}

#[tokio::test]
async fn failure_sets_issue_flag_but_keeps_access() {
    let h = Harness::new();
    activate_subscription(&h).await;

    // The gateway's expanded invoice carries the real decline message.
    h.gateway.put_invoice(
        serde_json::from_value(json!({
            "id": "in_2",
            "customer": "cus_u1",
            "subscription": "sub_1",
            "payment_intent": {
                "id": "pi_1",
                "last_payment_error": { "message": "Your card was declined.", "code": "card_declined" }
            }
        }))
        .unwrap(),
    );

    let receipt = h.deliver(&failed_invoice_event("evt_fail", "in_2")).await.unwrap();
    assert_eq!(receipt.disposition, Disposition::Processed);

    h.store.read(|tx| {
        let sub = tx.subscription_by_pg_id("sub_1").unwrap();
        assert!(sub.is_active, "dunning grace: access is not revoked");
        assert_eq!(
            sub.payment_failure_reason.as_deref(),
            Some("Your card was declined.")
        );

        let user = tx.user("u1").unwrap();
        assert!(user.has_active_subscription, "active flag untouched");
        assert!(user.has_payment_issue);
    });
    // Tokens remain spendable during dunning.
    assert_eq!(h.balance("u1"), 1000);
}

#[tokio::test]
async fn later_paid_invoice_clears_the_issue() {
    let h = Harness::new();
    activate_subscription(&h).await;
    h.deliver(&failed_invoice_event("evt_fail", "in_2")).await.unwrap();

    h.deliver(&invoice_paid(
        "evt_inv_2",
        "in_3",
        "sub_1",
        "u1",
        "subscription_cycle",
    ))
    .await
    .unwrap();

    h.store.read(|tx| {
        let sub = tx.subscription_by_pg_id("sub_1").unwrap();
        assert!(sub.is_active);
        assert_eq!(sub.payment_failure_reason, None);

        let user = tx.user("u1").unwrap();
        assert!(user.has_active_subscription);
        assert!(!user.has_payment_issue);
    });
}

#[tokio::test]
async fn inline_intent_error_short_circuits_the_chain() {
    let h = Harness::new();
    activate_subscription(&h).await;

    let payload = envelope(
        "evt_fail",
        "payment_intent.payment_failed",
        json!({
            "id": "pi_9",
            "customer": "cus_u1",
            "last_payment_error": { "message": "Insufficient funds.", "code": "insufficient_funds" }
        }),
    );
    h.deliver(&payload).await.unwrap();

    h.store.read(|tx| {
        let sub = tx.subscription_by_pg_id("sub_1").unwrap();
        assert_eq!(sub.payment_failure_reason.as_deref(), Some("Insufficient funds."));
    });
}

#[tokio::test]
async fn charge_failed_uses_its_own_failure_message() {
    let h = Harness::new();
    activate_subscription(&h).await;

    let payload = envelope(
        "evt_fail",
        "charge.failed",
        json!({
            "id": "ch_1",
            "customer": "cus_u1",
            "failure_message": "Card expired.",
            "failure_code": "expired_card"
        }),
    );
    h.deliver(&payload).await.unwrap();

    h.store.read(|tx| {
        let sub = tx.subscription_by_pg_id("sub_1").unwrap();
        assert_eq!(sub.payment_failure_reason.as_deref(), Some("Card expired."));
    });
}

#[tokio::test]
async fn empty_sources_fall_back_to_diagnosis() {
    let h = Harness::new();
    activate_subscription(&h).await;

    // Invoice exists upstream but carries no error details; customer has no
    // payment method on file.
    h.gateway.put_invoice(
        serde_json::from_value(json!({ "id": "in_2", "subscription": "sub_1" })).unwrap(),
    );
    h.gateway.put_customer(
        serde_json::from_value(json!({ "id": "cus_u1", "invoice_settings": {} })).unwrap(),
    );
    // Upstream subscription for chain step 5, also without error details.
    h.gateway.put_subscription(
        serde_json::from_value(subscription_object("sub_1", "u1", MONTHLY_PLAN)).unwrap(),
    );

    h.deliver(&failed_invoice_event("evt_fail", "in_2")).await.unwrap();
    h.store.read(|tx| {
        let sub = tx.subscription_by_pg_id("sub_1").unwrap();
        assert_eq!(
            sub.payment_failure_reason.as_deref(),
            Some("no_payment_method_on_file")
        );
    });
}

#[tokio::test]
async fn send_invoice_collection_diagnoses_no_automatic_payment() {
    let h = Harness::new();
    activate_subscription(&h).await;

    let payload = envelope(
        "evt_fail",
        "invoice.payment_failed",
        json!({
            "id": "in_2",
            "customer": "cus_u1",
            "subscription": "sub_1",
            "status": "open",
            "collection_method": "send_invoice"
        }),
    );
    h.deliver(&payload).await.unwrap();
    h.store.read(|tx| {
        let sub = tx.subscription_by_pg_id("sub_1").unwrap();
        assert_eq!(
            sub.payment_failure_reason.as_deref(),
            Some("no_automatic_payment")
        );
    });
}

#[tokio::test]
async fn unreachable_gateway_degrades_to_unknown_summary() {
    let h = Harness::new();
    activate_subscription(&h).await;
    h.gateway.set_fail_lookups(true);

    h.deliver(&failed_invoice_event("evt_fail", "in_2")).await.unwrap();

    h.store.read(|tx| {
        let sub = tx.subscription_by_pg_id("sub_1").unwrap();
        let reason = sub.payment_failure_reason.as_deref().unwrap();
        assert!(
            reason.starts_with("unknown: status=open, attempt_count=2"),
            "got {reason}"
        );
    });
}
