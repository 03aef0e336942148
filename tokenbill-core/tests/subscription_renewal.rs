//! Monthly subscription creation and renewal
//!
//! Creation grants nothing; the first paid invoice grants the initial batch,
//! each cycle invoice grants a renewal batch, and replaying any delivery —
//! same event id or the `invoice.payment_succeeded` alias for the same
//! invoice — creates no extra batches.

mod common;

use common::*;
use serde_json::json;
use tokenbill_core::dispatcher::Disposition;
use tokenbill_core::model::TokenReason;

#[tokio::test]
async fn creation_then_invoices_grant_one_batch_each() {
    let h = Harness::new();
    h.seed_user("u1");

    let receipt = h
        .deliver(&subscription_created("evt_sub", "sub_1", "u1", MONTHLY_PLAN))
        .await
        .unwrap();
    assert_eq!(receipt.disposition, Disposition::Processed);

    // No credit on creation.
    assert_eq!(h.balance("u1"), 0);
    h.store.read(|tx| {
        let sub = tx.subscription_by_pg_id("sub_1").expect("subscription row");
        assert!(sub.is_active);
        assert_eq!(sub.tokens_per_cycle, 1000);
        let user = tx.user("u1").unwrap();
        assert!(user.has_active_subscription);
        assert!(!user.has_payment_issue);
    });

    // Initial credit arrives with the first paid invoice.
    h.deliver(&invoice_paid(
        "evt_inv_1",
        "in_1",
        "sub_1",
        "u1",
        "subscription_create",
    ))
    .await
    .unwrap();
    assert_eq!(h.balance("u1"), 1000);
    h.store.read(|tx| {
        let batch = tx.batch_by_invoice("in_1").expect("initial batch");
        assert_eq!(batch.amount, 1000);
        let reasons: Vec<_> = tx
            .token_events_for_user("u1")
            .iter()
            .map(|e| e.reason)
            .collect();
        assert_eq!(reasons, vec![TokenReason::SubscriptionInitialCredit]);
    });

    // A cycle invoice with a different id grants a second batch.
    h.deliver(&invoice_paid(
        "evt_inv_2",
        "in_2",
        "sub_1",
        "u1",
        "subscription_cycle",
    ))
    .await
    .unwrap();
    assert_eq!(h.balance("u1"), 2000);
    h.store.read(|tx| {
        assert!(tx.batch_by_invoice("in_2").is_some());
        assert_eq!(tx.batches_for_user("u1").len(), 2);
    });
}

#[tokio::test]
async fn replays_and_aliases_do_not_double_credit() {
    let h = Harness::new();
    h.seed_user("u1");
    h.deliver(&subscription_created("evt_sub", "sub_1", "u1", MONTHLY_PLAN))
        .await
        .unwrap();

    let first = invoice_paid("evt_inv_1", "in_1", "sub_1", "u1", "subscription_create");
    h.deliver(&first).await.unwrap();

    // Replay with the same event id: event-level guard.
    let replay = h.deliver(&first).await.unwrap();
    assert_eq!(replay.disposition, Disposition::Duplicate);

    // Redelivery as invoice.payment_succeeded for the same invoice id:
    // credit-level guard.
    let alias = envelope(
        "evt_inv_1b",
        "invoice.payment_succeeded",
        invoice_object("in_1", "sub_1", "u1", "subscription_create"),
    );
    let aliased = h.deliver(&alias).await.unwrap();
    assert_eq!(aliased.disposition, Disposition::Processed);

    assert_eq!(h.balance("u1"), 1000);
    h.store.read(|tx| {
        assert_eq!(tx.batches_for_user("u1").len(), 1);
        assert_eq!(tx.token_events_for_user("u1").len(), 1);
    });
}

#[tokio::test]
async fn duplicate_creation_keeps_one_active_subscription() {
    let h = Harness::new();
    h.seed_user("u1");

    h.deliver(&subscription_created("evt_1", "sub_1", "u1", MONTHLY_PLAN))
        .await
        .unwrap();
    h.deliver(&subscription_created("evt_2", "sub_2", "u1", MONTHLY_PLAN))
        .await
        .unwrap();

    h.store.read(|tx| {
        let active: Vec<_> = tx.subscriptions().filter(|s| s.is_active).collect();
        assert_eq!(active.len(), 1, "at most one active subscription per user");
        assert_eq!(active[0].pg_subscription_id, "sub_2");
    });
}

#[tokio::test]
async fn invoice_before_creation_bootstraps_from_gateway() {
    let h = Harness::new();
    h.seed_user("u1");

    // The gateway knows the subscription even though no creation event has
    // arrived yet.
    let remote: tokenbill_core::events::SubscriptionObject =
        serde_json::from_value(subscription_object("sub_1", "u1", MONTHLY_PLAN)).unwrap();
    h.gateway.put_subscription(remote);

    let receipt = h
        .deliver(&invoice_paid(
            "evt_inv_1",
            "in_1",
            "sub_1",
            "u1",
            "subscription_create",
        ))
        .await
        .unwrap();
    assert_eq!(receipt.disposition, Disposition::Processed);

    assert_eq!(h.balance("u1"), 1000);
    h.store.read(|tx| {
        let sub = tx.subscription_by_pg_id("sub_1").expect("bootstrapped row");
        assert!(sub.is_active);
        assert_eq!(sub.plan_key, MONTHLY_PLAN);
    });
}

#[tokio::test]
async fn subscription_deleted_keeps_batches_spendable() {
    let h = Harness::new();
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

    let deleted = envelope(
        "evt_del",
        "customer.subscription.deleted",
        json!({ "id": "sub_1", "customer": "cus_u1", "status": "canceled" }),
    );
    h.deliver(&deleted).await.unwrap();

    h.store.read(|tx| {
        assert!(!tx.subscription_by_pg_id("sub_1").unwrap().is_active);
        let user = tx.user("u1").unwrap();
        assert!(!user.has_active_subscription);
    });
    // Tokens keep spending until natural expiry.
    assert_eq!(h.balance("u1"), 1000);
}

#[tokio::test]
async fn tier_upgrade_grants_upgrade_batch_idempotently() {
    let h = Harness::new();
    h.seed_user("u1");
    h.deliver(&subscription_created("evt_sub", "sub_1", "u1", MONTHLY_PLAN))
        .await
        .unwrap();

    let upgraded = envelope(
        "evt_up_1",
        "customer.subscription.updated",
        subscription_object("sub_1", "u1", MONTHLY_PREMIUM_PLAN),
    );
    h.deliver(&upgraded).await.unwrap();

    assert_eq!(h.balance("u1"), 2000, "upgrade grants the new tier's cycle");
    h.store.read(|tx| {
        let sub = tx.subscription_by_pg_id("sub_1").unwrap();
        assert_eq!(sub.plan_key, MONTHLY_PREMIUM_PLAN);
        let reasons: Vec<_> = tx
            .token_events_for_user("u1")
            .iter()
            .map(|e| e.reason)
            .collect();
        assert_eq!(reasons, vec![TokenReason::SubscriptionUpgradeCredit]);
    });

    // Redelivery under a fresh event id: the tier no longer differs, so no
    // further grant.
    let redelivered = envelope(
        "evt_up_2",
        "customer.subscription.updated",
        subscription_object("sub_1", "u1", MONTHLY_PREMIUM_PLAN),
    );
    h.deliver(&redelivered).await.unwrap();
    assert_eq!(h.balance("u1"), 2000);
}
