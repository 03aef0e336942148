//! Yearly plans: initial credit and cron refills
//!
//! A yearly plan's first paid invoice grants one monthly slice and stamps
//! `last_monthly_refill`; the yearly renewal invoice grants nothing; the
//! maintenance worker performs the remaining monthly refills, exactly one
//! per calendar month no matter how often it runs.

mod common;

use std::sync::Arc;

use common::*;
use tokenbill_core::maintenance::MaintenanceWorker;
use tokenbill_core::model::TokenReason;

fn yearly_subscription_object(user_id: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "sub_y1",
        "customer": format!("cus_{user_id}"),
        "status": "active",
        "current_period_start": now().timestamp(),
        "current_period_end": (now() + chrono::Duration::days(365)).timestamp(),
        "metadata": { "user_id": user_id },
        "items": { "data": [ { "price": { "id": YEARLY_PLAN, "unit_amount": 19_900 } } ] }
    })
}

#[tokio::test]
async fn initial_credit_is_one_monthly_slice() {
    let h = Harness::new();
    h.seed_user("u1");

    h.deliver(&envelope(
        "evt_sub",
        "customer.subscription.created",
        yearly_subscription_object("u1"),
    ))
    .await
    .unwrap();
    h.deliver(&envelope(
        "evt_inv_1",
        "invoice.paid",
        serde_json::json!({
            "id": "in_y1",
            "customer": "cus_u1",
            "subscription": "sub_y1",
            "billing_reason": "subscription_create",
            "status": "paid"
        }),
    ))
    .await
    .unwrap();

    assert_eq!(h.balance("u1"), 1000, "one monthly slice, not the full year");
    h.store.read(|tx| {
        let batch = tx.batch_by_invoice("in_y1").expect("initial yearly batch");
        assert_eq!(batch.amount, 1000);
        assert_eq!(
            batch.expires_at,
            now().checked_add_months(chrono::Months::new(1)).unwrap()
        );

        let sub = tx.subscription_by_pg_id("sub_y1").unwrap();
        assert_eq!(sub.last_monthly_refill, Some(now()));
    });
}

#[tokio::test]
async fn yearly_renewal_invoice_does_not_credit() {
    let h = Harness::new();
    h.seed_user("u1");
    h.deliver(&envelope(
        "evt_sub",
        "customer.subscription.created",
        yearly_subscription_object("u1"),
    ))
    .await
    .unwrap();
    h.deliver(&envelope(
        "evt_inv_1",
        "invoice.paid",
        serde_json::json!({
            "id": "in_y1",
            "subscription": "sub_y1",
            "customer": "cus_u1",
            "billing_reason": "subscription_create",
            "status": "paid"
        }),
    ))
    .await
    .unwrap();

    let renewal = envelope(
        "evt_inv_2",
        "invoice.paid",
        serde_json::json!({
            "id": "in_y2",
            "subscription": "sub_y1",
            "customer": "cus_u1",
            "billing_reason": "subscription_cycle",
            "status": "paid"
        }),
    );
    h.deliver(&renewal).await.unwrap();

    assert_eq!(h.balance("u1"), 1000, "cycle renewals are the cron's job");
    h.store.read(|tx| {
        assert!(tx.batch_by_invoice("in_y2").is_none());
    });
}

#[tokio::test]
async fn maintenance_refills_once_per_calendar_month() {
    let h = Harness::new();
    h.seed_user("u1");
    h.deliver(&envelope(
        "evt_sub",
        "customer.subscription.created",
        yearly_subscription_object("u1"),
    ))
    .await
    .unwrap();
    h.deliver(&envelope(
        "evt_inv_1",
        "invoice.paid",
        serde_json::json!({
            "id": "in_y1",
            "subscription": "sub_y1",
            "customer": "cus_u1",
            "billing_reason": "subscription_create",
            "status": "paid"
        }),
    ))
    .await
    .unwrap();

    let worker = MaintenanceWorker::new(Arc::clone(&h.store), Arc::clone(&h.catalog));

    // Same month: the stamp blocks a second refill.
    let same_month = worker.run(now() + chrono::Duration::days(3));
    assert_eq!(same_month.refills_granted, 0);

    // One calendar month later: exactly one refill.
    let next_month = now().checked_add_months(chrono::Months::new(1)).unwrap();
    let report = worker.run(next_month);
    assert_eq!(report.refills_granted, 1);
    assert_eq!(report.failures, 0);

    h.store.read(|tx| {
        let sub = tx.subscription_by_pg_id("sub_y1").unwrap();
        assert_eq!(sub.last_monthly_refill, Some(next_month));

        let refill = tx
            .batch_by_invoice("refill:sub_y1:2025-07")
            .expect("cron refill batch");
        assert_eq!(refill.amount, 1000);
        assert_eq!(refill.note, "yearly-monthly-refill (cron)");

        let refill_entries: Vec<_> = tx
            .token_events_for_user("u1")
            .iter()
            .filter(|e| e.reason == TokenReason::SubscriptionRefill)
            .map(|e| e.delta)
            .collect();
        assert_eq!(refill_entries, vec![1000]);
    });

    // Running the worker twice in the same month is a no-op: no new batches
    // and no new journal entries.
    let journal_len = h.store.read(|tx| tx.token_events_for_user("u1").len());
    let batches_len = h.store.read(|tx| tx.batches_for_user("u1").len());
    let rerun = worker.run(next_month + chrono::Duration::hours(6));
    assert_eq!(rerun.refills_granted, 0);
    h.store.read(|tx| {
        assert_eq!(tx.token_events_for_user("u1").len(), journal_len);
        assert_eq!(tx.batches_for_user("u1").len(), batches_len);
    });
}

#[tokio::test]
async fn maintenance_deactivates_lapsed_subscriptions() {
    let h = Harness::new();
    h.seed_user("u1");
    h.deliver(&subscription_created("evt_sub", "sub_1", "u1", MONTHLY_PLAN))
        .await
        .unwrap();

    let worker = MaintenanceWorker::new(Arc::clone(&h.store), Arc::clone(&h.catalog));

    // Within the period: nothing happens.
    let report = worker.run(now() + chrono::Duration::days(1));
    assert_eq!(report.ended_subscriptions, 0);

    // Past the period end: deactivated, user flag cleared.
    let report = worker.run(now() + chrono::Duration::days(31));
    assert_eq!(report.ended_subscriptions, 1);
    h.store.read(|tx| {
        assert!(!tx.subscription_by_pg_id("sub_1").unwrap().is_active);
        assert!(!tx.user("u1").unwrap().has_active_subscription);
    });

    // Idempotent on re-run.
    let rerun = worker.run(now() + chrono::Duration::days(31));
    assert_eq!(rerun.ended_subscriptions, 0);
}
