//! Webhook pipeline contract
//!
//! Signature verification over the raw bytes, duplicate suppression, unknown
//! event acknowledgment, and the state-equality property: delivering the
//! same event twice leaves the ledger exactly as after the first delivery.

mod common;

use common::*;
use serde_json::json;
use tokenbill_core::dispatcher::Disposition;
use tokenbill_core::errors::BillingError;
use tokenbill_core::signature;

#[tokio::test]
async fn tampered_body_is_rejected_as_bad_signature() {
    let h = Harness::new();
    h.seed_user("u1");

    let payload = checkout_payment_session("evt_1", "cs_1", "u1", "tier1", 0);
    let body = payload.to_string();
    let header = signature::sign(WEBHOOK_SECRET, body.as_bytes(), now());

    // Flip one byte after signing.
    let tampered = body.replace("tier1", "tier9");
    let err = h
        .dispatcher
        .handle_webhook(tampered.as_bytes(), &header, now())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::BadSignature(_)));
    assert!(!err.is_retriable());
    assert_eq!(h.balance("u1"), 0);
}

#[tokio::test]
async fn wrong_secret_is_rejected() {
    let h = Harness::new();
    let payload = checkout_payment_session("evt_1", "cs_1", "u1", "tier1", 0);
    let body = payload.to_string();
    let header = signature::sign("whsec_wrong", body.as_bytes(), now());

    let err = h
        .dispatcher
        .handle_webhook(body.as_bytes(), &header, now())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::BadSignature(_)));
}

#[tokio::test]
async fn malformed_json_with_valid_signature_is_a_client_error() {
    let h = Harness::new();
    let body = b"{ definitely not an event";
    let header = signature::sign(WEBHOOK_SECRET, body, now());

    let err = h
        .dispatcher
        .handle_webhook(body, &header, now())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::MalformedEvent(_)));
    assert!(!err.is_retriable());
}

#[tokio::test]
async fn unknown_event_kinds_are_acknowledged() {
    let h = Harness::new();
    let payload = envelope("evt_1", "customer.created", json!({ "id": "cus_1" }));
    let receipt = h.deliver(&payload).await.unwrap();
    assert_eq!(receipt.disposition, Disposition::Ignored);
}

#[tokio::test]
async fn second_delivery_leaves_state_identical() {
    let h = Harness::new();
    h.seed_user("u1");

    let payload = checkout_payment_session("evt_1", "cs_1", "u1", "tier1", 500);
    h.deliver(&payload).await.unwrap();

    let snapshot_before = h.store.read(|tx| {
        (
            tx.batches_for_user("u1")
                .iter()
                .map(|b| (b.id, b.amount, b.consumed))
                .collect::<Vec<_>>(),
            tx.token_events_for_user("u1").len(),
            tx.balance("u1", now()),
        )
    });

    let receipt = h.deliver(&payload).await.unwrap();
    assert_eq!(receipt.disposition, Disposition::Duplicate);

    let snapshot_after = h.store.read(|tx| {
        (
            tx.batches_for_user("u1")
                .iter()
                .map(|b| (b.id, b.amount, b.consumed))
                .collect::<Vec<_>>(),
            tx.token_events_for_user("u1").len(),
            tx.balance("u1", now()),
        )
    });
    assert_eq!(snapshot_before, snapshot_after);
}

#[tokio::test]
async fn stale_signature_is_rejected() {
    let h = Harness::new();
    let payload = envelope("evt_1", "customer.created", json!({ "id": "cus_1" }));
    let body = payload.to_string();
    let header = signature::sign(WEBHOOK_SECRET, body.as_bytes(), now());

    let err = h
        .dispatcher
        .handle_webhook(
            body.as_bytes(),
            &header,
            now() + chrono::Duration::seconds(301),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::BadSignature(_)));
}
