//! Protocol constants
//!
//! Fixed values used throughout the billing core. These are protocol-level
//! invariants rather than tunables; everything an operator may change lives in
//! [`crate::config::BillingConfig`].

/// Lifetime of a one-time purchase batch in days.
///
/// Tokens bought outside a subscription expire this many days after the
/// purchase settles. Referral reward batches share the same lifetime.
pub const ONE_TIME_PURCHASE_EXPIRY_DAYS: i64 = 60;

/// Number of monthly refills a yearly plan amortizes into.
///
/// Used as the fallback divisor when a yearly plan's catalog entry does not
/// carry an explicit `monthly_refill_tokens` value.
pub const MONTHLY_REFILLS_PER_YEAR: u64 = 12;

/// Maximum accepted age of a webhook signature timestamp, in seconds.
///
/// Signatures older (or newer, allowing for clock skew) than this window are
/// rejected to keep replayed payloads out of the dispatcher.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Default wall-clock budget for handling a single webhook event, in seconds.
pub const DEFAULT_EVENT_DEADLINE_SECS: u64 = 30;

/// Default inner deadline for a single payment-gateway call, in seconds.
///
/// Kept well below the event deadline so store writes still have time to
/// commit after a slow gateway lookup.
pub const DEFAULT_PG_CALL_DEADLINE_SECS: u64 = 10;

/// Default period of the maintenance sweep, in seconds (once per day).
pub const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 86_400;

/// Default period of the reconciliation job, in seconds (once per day).
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 86_400;

/// Note recorded on batches created by a one-time purchase.
pub const NOTE_ONE_TIME_PURCHASE: &str = "one-time-purchase";

/// Note recorded on batches created by the yearly-plan monthly refill sweep.
pub const NOTE_YEARLY_MONTHLY_REFILL: &str = "yearly-monthly-refill (cron)";
