//! Subscription state machine
//!
//! The authority on what a subscription's lifecycle looks like. Event
//! handlers consult [`transition`] instead of editing flags ad hoc, which is
//! what keeps the dunning rule intact: a failed payment moves the
//! subscription into `PaymentIssue` but never revokes access — only
//! `subscription.deleted` or a lapsed billing period ends it.

use crate::model::Subscription;

/// Observable lifecycle states of a user's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// No subscription row exists
    Absent,
    /// Active and paying
    Active,
    /// Active but the latest charge failed (dunning grace)
    PaymentIssue,
    /// Cancel-at-period-end requested upstream; locally still active until
    /// the deletion event arrives
    CancelledPendingEnd,
    /// Terminated; batches remain spendable until natural expiry
    Ended,
}

/// Inputs that drive lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// `customer.subscription.created`
    Created,
    /// A paid invoice for the subscription
    InvoicePaid,
    /// Any of the payment-failure events
    PaymentFailed,
    /// User-initiated cancel (gateway set to cancel at period end)
    CancelRequested,
    /// `customer.subscription.deleted`
    Deleted,
    /// The billing period lapsed without renewal (maintenance sweep)
    PeriodEnded,
}

/// Compute the state a subscription row is observed in.
#[must_use]
pub fn state_of(subscription: Option<&Subscription>) -> SubscriptionState {
    match subscription {
        None => SubscriptionState::Absent,
        Some(sub) if !sub.is_active => SubscriptionState::Ended,
        Some(sub) if sub.payment_failure_reason.is_some() => SubscriptionState::PaymentIssue,
        Some(_) => SubscriptionState::Active,
    }
}

/// The transition function. Returns `None` when the event does not move the
/// state (callers treat that as a no-op, not an error: webhook deliveries
/// are unordered and duplicates are routine).
#[must_use]
pub const fn transition(
    state: SubscriptionState,
    event: LifecycleEvent,
) -> Option<SubscriptionState> {
    use LifecycleEvent as E;
    use SubscriptionState as S;

    match (state, event) {
        // Creation, including re-subscribing after an earlier subscription
        // ended.
        (S::Absent | S::Ended, E::Created) => Some(S::Active),

        // Payments keep (or restore) the active state. A paid invoice is
        // also the only way out of dunning.
        (S::Active | S::PaymentIssue, E::InvoicePaid) => Some(S::Active),
        (S::Absent | S::Ended, E::InvoicePaid) => Some(S::Active),

        // Dunning grace: record the issue, never revoke access here.
        (S::Active | S::PaymentIssue | S::CancelledPendingEnd, E::PaymentFailed) => {
            Some(S::PaymentIssue)
        }

        // User asked the gateway to cancel at period end; local state waits
        // for the deletion event.
        (S::Active | S::PaymentIssue, E::CancelRequested) => Some(S::CancelledPendingEnd),

        // Terminal transitions.
        (_, E::Deleted) => Some(S::Ended),
        (S::Active | S::PaymentIssue | S::CancelledPendingEnd, E::PeriodEnded) => Some(S::Ended),

        _ => None,
    }
}

/// The denormalized user flags implied by a lifecycle state:
/// `(has_active_subscription, has_payment_issue)`.
#[must_use]
pub const fn user_flags(state: SubscriptionState) -> (bool, bool) {
    match state {
        SubscriptionState::Active | SubscriptionState::CancelledPendingEnd => (true, false),
        SubscriptionState::PaymentIssue => (true, true),
        SubscriptionState::Absent | SubscriptionState::Ended => (false, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleEvent as E;
    use SubscriptionState as S;

    #[test]
    fn creation_activates_from_absent_and_ended() {
        assert_eq!(transition(S::Absent, E::Created), Some(S::Active));
        assert_eq!(transition(S::Ended, E::Created), Some(S::Active));
        assert_eq!(transition(S::Active, E::Created), None);
    }

    #[test]
    fn payment_failure_never_revokes_access() {
        assert_eq!(transition(S::Active, E::PaymentFailed), Some(S::PaymentIssue));
        assert_eq!(
            transition(S::PaymentIssue, E::PaymentFailed),
            Some(S::PaymentIssue)
        );

        let (active, issue) = user_flags(S::PaymentIssue);
        assert!(active, "dunning grace keeps the subscription usable");
        assert!(issue);
    }

    #[test]
    fn paid_invoice_clears_dunning() {
        assert_eq!(transition(S::PaymentIssue, E::InvoicePaid), Some(S::Active));
        assert_eq!(user_flags(S::Active), (true, false));
    }

    #[test]
    fn deletion_ends_from_any_state() {
        for state in [
            S::Absent,
            S::Active,
            S::PaymentIssue,
            S::CancelledPendingEnd,
            S::Ended,
        ] {
            assert_eq!(transition(state, E::Deleted), Some(S::Ended));
        }
        assert_eq!(user_flags(S::Ended), (false, false));
    }

    #[test]
    fn cancel_request_leaves_access_until_deletion() {
        let next = transition(S::Active, E::CancelRequested).unwrap();
        assert_eq!(next, S::CancelledPendingEnd);
        assert_eq!(user_flags(next), (true, false));
    }

    #[test]
    fn period_end_terminates_lingering_states() {
        assert_eq!(transition(S::Active, E::PeriodEnded), Some(S::Ended));
        assert_eq!(transition(S::PaymentIssue, E::PeriodEnded), Some(S::Ended));
        assert_eq!(
            transition(S::CancelledPendingEnd, E::PeriodEnded),
            Some(S::Ended)
        );
        assert_eq!(transition(S::Ended, E::PeriodEnded), None);
    }

    #[test]
    fn state_of_reads_row_flags() {
        assert_eq!(state_of(None), S::Absent);

        let mut sub = Subscription {
            id: 1,
            user_id: "u1".into(),
            plan_key: "price_monthly_standard".into(),
            plan_tier: crate::model::PlanTier::Standard,
            billing_cycle: crate::model::BillingCycle::Monthly,
            pg_subscription_id: "sub_1".into(),
            is_active: true,
            current_period_start: chrono::Utc::now(),
            current_period_end: chrono::Utc::now(),
            tokens_per_cycle: 1000,
            price_cents: 1900,
            last_monthly_refill: None,
            payment_failure_reason: None,
        };
        assert_eq!(state_of(Some(&sub)), S::Active);

        sub.payment_failure_reason = Some("card_declined".into());
        assert_eq!(state_of(Some(&sub)), S::PaymentIssue);

        sub.is_active = false;
        assert_eq!(state_of(Some(&sub)), S::Ended);
    }
}
