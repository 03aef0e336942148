//! Core data model
//!
//! The entities persisted by the ledger store: users, subscriptions,
//! purchases, credit batches, the append-only token journal, and referrals.
//! Internal row ids are store-assigned monotonically increasing `u64`s, so
//! the FIFO tie-break on batch id coincides with insertion order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A billing account, keyed by the external identity provider's user id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// External identity (the `sub` claim of the caller's bearer token)
    pub user_id: String,
    /// Unique email, used as the last-resort attribution key for events
    pub email: String,
    /// Payment-gateway customer id, bound on the first payment event
    pub pg_customer_id: Option<String>,
    /// Whether the user currently holds an active subscription
    pub has_active_subscription: bool,
    /// Whether the latest charge attempt for the user failed (dunning)
    pub has_payment_issue: bool,
    /// Soft-deletion flag; blocks all further ledger mutations
    pub is_deleted: bool,
}

/// Subscription plan tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Basic,
    Standard,
    Premium,
    Ultra,
    Daily,
}

impl PlanTier {
    /// Stable string tag, matching the persisted representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Standard => "standard",
            Self::Premium => "premium",
            Self::Ultra => "ultra",
            Self::Daily => "daily",
        }
    }

    /// Parse the persisted string tag.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "basic" => Some(Self::Basic),
            "standard" => Some(Self::Standard),
            "premium" => Some(Self::Premium),
            "ultra" => Some(Self::Ultra),
            "daily" => Some(Self::Daily),
            _ => None,
        }
    }
}

/// Billing period length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Daily,
    Monthly,
    Yearly,
}

impl BillingCycle {
    /// Stable string tag, matching the persisted representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }

    /// Parse the persisted string tag.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "daily" | "day" => Some(Self::Daily),
            "monthly" | "month" => Some(Self::Monthly),
            "yearly" | "year" => Some(Self::Yearly),
            _ => None,
        }
    }

    /// End of a billing period that starts at `from`.
    ///
    /// Monthly and yearly periods use calendar arithmetic; the day-count
    /// fallback only applies to degenerate dates near the end of the
    /// representable range.
    #[must_use]
    pub fn period_end(self, from: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Daily => from + chrono::Duration::days(1),
            Self::Monthly => from
                .checked_add_months(chrono::Months::new(1))
                .unwrap_or_else(|| from + chrono::Duration::days(30)),
            Self::Yearly => from
                .checked_add_months(chrono::Months::new(12))
                .unwrap_or_else(|| from + chrono::Duration::days(365)),
        }
    }
}

/// A recurring subscription, one row per gateway subscription object.
///
/// At most one row per user carries `is_active = true`; the store enforces
/// this on upsert by deactivating any older active row for the same user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Store-assigned row id
    pub id: u64,
    /// Owning user
    pub user_id: String,
    /// Stable identifier of the gateway price this subscription bills on
    pub plan_key: String,
    /// Plan tier
    pub plan_tier: PlanTier,
    /// Billing period length
    pub billing_cycle: BillingCycle,
    /// Gateway subscription id (unique)
    pub pg_subscription_id: String,
    /// Whether the subscription is currently active
    pub is_active: bool,
    /// Start of the current billing period
    pub current_period_start: DateTime<Utc>,
    /// End of the current billing period
    pub current_period_end: DateTime<Utc>,
    /// Tokens granted per billing cycle
    pub tokens_per_cycle: u64,
    /// Price per cycle in cents
    pub price_cents: i64,
    /// When the last monthly refill was granted (yearly plans only)
    pub last_monthly_refill: Option<DateTime<Utc>>,
    /// Reason recorded by the most recent failed charge, cleared on payment
    pub payment_failure_reason: Option<String>,
}

/// A settled one-time token purchase. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Purchase {
    /// Store-assigned row id
    pub id: u64,
    /// Owning user
    pub user_id: String,
    /// Tier of the purchased token pack
    pub plan_tier: String,
    /// Gateway-side purchase identifier (checkout session or payment intent
    /// id), unique
    pub pg_purchase_id: String,
    /// Tokens granted by this purchase
    pub amount_tokens: u64,
    /// Discount applied at checkout, in cents
    pub discount_cents: i64,
    /// Start of the purchase validity window
    pub period_start: DateTime<Utc>,
    /// End of the purchase validity window
    pub period_end: DateTime<Utc>,
}

/// Where a credit batch came from.
///
/// The persisted representation is the string tag plus one nullable link id;
/// in-process the origin is matched exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum BatchOrigin {
    /// Recurring credit granted against a subscription row
    Subscription {
        /// Local subscription row id
        subscription_id: u64,
    },
    /// One-time purchase credit
    Purchase {
        /// Local purchase row id
        purchase_id: u64,
    },
    /// Referral reward credit
    Referral {
        /// User whose referral earned the reward
        referrer_user_id: String,
    },
}

impl BatchOrigin {
    /// The persisted string tag for this origin.
    #[must_use]
    pub const fn source_tag(&self) -> &'static str {
        match self {
            Self::Subscription { .. } => "subscription",
            Self::Purchase { .. } => "purchase",
            Self::Referral { .. } => "referral",
        }
    }
}

/// A unit of spendable credit: the ledger's atom.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    /// Store-assigned row id; FIFO tie-break key
    pub id: u64,
    /// Owning user
    pub user_id: String,
    /// What created the batch
    pub origin: BatchOrigin,
    /// Credit-grant idempotency anchor; unique over all batches when present.
    /// Always set for subscription-sourced batches.
    pub invoice_id: Option<String>,
    /// Tokens granted (positive)
    pub amount: u64,
    /// Tokens already consumed; `0 <= consumed <= amount`
    pub consumed: u64,
    /// When the batch stops being spendable
    pub expires_at: DateTime<Utc>,
    /// Cleared by the expiry sweep; inactive batches never participate in
    /// consumption or balance
    pub is_active: bool,
    /// Free-form provenance note
    pub note: String,
}

impl Batch {
    /// Tokens still spendable from this batch.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.amount.saturating_sub(self.consumed)
    }

    /// Whether the batch can be spent from at `now`.
    #[must_use]
    pub fn is_spendable(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at > now
    }
}

/// One processed gateway event. Presence of a row means "processed before".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Gateway event id (unique)
    pub event_id: String,
    /// Gateway event type string
    pub event_type: String,
    /// When the dispatcher accepted the event
    pub received_at: DateTime<Utc>,
}

/// Why a journal entry exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenReason {
    Purchase,
    SubscriptionInitialCredit,
    SubscriptionRefill,
    SubscriptionUpgradeCredit,
    ReferralReward,
    Consumption,
    Expiry,
}

impl TokenReason {
    /// Stable string tag, matching the persisted representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::SubscriptionInitialCredit => "subscription_initial_credit",
            Self::SubscriptionRefill => "subscription_refill",
            Self::SubscriptionUpgradeCredit => "subscription_upgrade_credit",
            Self::ReferralReward => "referral_reward",
            Self::Consumption => "consumption",
            Self::Expiry => "expiry",
        }
    }
}

/// One signed delta in the append-only token journal.
///
/// The journal is the authoritative audit trail: for every user the running
/// sum of `delta` equals the remaining balance across their active batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEvent {
    /// Store-assigned row id
    pub id: u64,
    /// Owning user
    pub user_id: String,
    /// Batch the delta applies to
    pub batch_id: u64,
    /// Signed token delta; positive for grants, negative for consumption and
    /// expiry
    pub delta: i64,
    /// Why the delta happened
    pub reason: TokenReason,
    /// When the delta was recorded
    pub at: DateTime<Utc>,
}

/// A referral edge between two users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Referral {
    /// Store-assigned row id
    pub id: u64,
    /// User who referred
    pub referrer_user_id: String,
    /// User who was referred (unique; a user is referred at most once)
    pub referred_user_id: String,
    /// Set once the reward batch has been granted
    pub is_rewarded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn batch_remaining_saturates() {
        let batch = Batch {
            id: 1,
            user_id: "u1".into(),
            origin: BatchOrigin::Referral {
                referrer_user_id: "u0".into(),
            },
            invoice_id: None,
            amount: 10,
            consumed: 10,
            expires_at: Utc.timestamp_opt(2_000_000_000, 0).unwrap(),
            is_active: true,
            note: String::new(),
        };
        assert_eq!(batch.remaining(), 0);
    }

    #[test]
    fn spendability_requires_active_and_unexpired() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut batch = Batch {
            id: 1,
            user_id: "u1".into(),
            origin: BatchOrigin::Purchase { purchase_id: 7 },
            invoice_id: None,
            amount: 100,
            consumed: 0,
            expires_at: now + chrono::Duration::seconds(1),
            is_active: true,
            note: String::new(),
        };
        assert!(batch.is_spendable(now));

        batch.is_active = false;
        assert!(!batch.is_spendable(now));

        batch.is_active = true;
        batch.expires_at = now;
        assert!(!batch.is_spendable(now), "expiry boundary is exclusive");
    }

    #[test]
    fn cycle_period_end_uses_calendar_months() {
        let from = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        let end = BillingCycle::Monthly.period_end(from);
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap());

        let yearly = BillingCycle::Yearly.period_end(from);
        assert_eq!(yearly, Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).unwrap());
    }

    #[test]
    fn tier_and_cycle_tags_round_trip() {
        for tier in [
            PlanTier::Basic,
            PlanTier::Standard,
            PlanTier::Premium,
            PlanTier::Ultra,
            PlanTier::Daily,
        ] {
            assert_eq!(PlanTier::parse(tier.as_str()), Some(tier));
        }
        for cycle in [
            BillingCycle::Daily,
            BillingCycle::Monthly,
            BillingCycle::Yearly,
        ] {
            assert_eq!(BillingCycle::parse(cycle.as_str()), Some(cycle));
        }
        assert_eq!(PlanTier::parse("gold"), None);
        assert_eq!(BillingCycle::parse("weekly"), None);
    }
}
