//! Ledger store
//!
//! Durable persistence of users, subscriptions, purchases, batches, the
//! event log, the token journal, and referrals, exposed through transactional
//! operations. The engine is an embedded in-memory state machine behind the
//! opaque [`LedgerStore`] handle: a transaction clones the current state,
//! applies the closure against the staged copy, and swaps it in only on
//! success. The single state mutex serializes concurrent transactions, which
//! is the row-lock mechanism the consumption path relies on; a closure error
//! discards the staged copy, rolling the whole event effect back.
//!
//! Unique constraints enforced at insert time: `user.user_id`, `user.email`,
//! `user.pg_customer_id`, `subscription.pg_subscription_id`,
//! `purchase.pg_purchase_id`, `batch.invoice_id` (when present),
//! `event_log.event_id`, `referral.referred_user_id`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;

use crate::model::{
    Batch, BatchOrigin, BillingCycle, EventRecord, PlanTier, Purchase, Referral, Subscription,
    TokenEvent, TokenReason, User,
};

/// Error types raised by store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// A row the operation requires does not exist
    #[error("{entity} not found: {key}")]
    NotFound {
        /// Entity name
        entity: &'static str,
        /// Lookup key
        key: String,
    },

    /// An insert or update collided with a unique constraint
    #[error("unique constraint {constraint} violated by \"{value}\"")]
    UniqueViolation {
        /// Constraint name
        constraint: &'static str,
        /// Conflicting value
        value: String,
    },

    /// The target user is soft-deleted; ledger mutations are blocked
    #[error("user {0} is deleted; ledger mutations are blocked")]
    UserDeleted(String),

    /// The configured storage URL names an unsupported backend
    #[error("unsupported storage url \"{0}\" (expected the mem: scheme)")]
    UnsupportedUrl(String),

    /// A store-level invariant would be broken by the operation
    #[error("store invariant violated: {0}")]
    Invariant(String),
}

/// Outcome of an upsert keyed on an external id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Row id of the inserted or updated row
    pub id: u64,
    /// Whether the row was newly inserted
    pub was_insert: bool,
}

/// Outcome of a batch insert carrying an invoice id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchInsert {
    /// The batch was inserted
    Inserted(u64),
    /// The invoice id already anchored an earlier batch; nothing was written
    AlreadyCredited(u64),
}

impl BatchInsert {
    /// Row id of the new or pre-existing batch.
    #[must_use]
    pub const fn batch_id(self) -> u64 {
        match self {
            Self::Inserted(id) | Self::AlreadyCredited(id) => id,
        }
    }
}

/// Field set for [`StoreTx::upsert_subscription_by_pg_id`].
#[derive(Debug, Clone)]
pub struct SubscriptionFields {
    pub user_id: String,
    pub plan_key: String,
    pub plan_tier: PlanTier,
    pub billing_cycle: BillingCycle,
    pub pg_subscription_id: String,
    pub is_active: bool,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub tokens_per_cycle: u64,
    pub price_cents: i64,
}

/// Field set for [`StoreTx::insert_purchase`].
#[derive(Debug, Clone)]
pub struct PurchaseFields {
    pub user_id: String,
    pub plan_tier: String,
    pub pg_purchase_id: String,
    pub amount_tokens: u64,
    pub discount_cents: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

/// Field set for [`StoreTx::insert_batch`].
#[derive(Debug, Clone)]
pub struct BatchFields {
    pub user_id: String,
    pub origin: BatchOrigin,
    pub invoice_id: Option<String>,
    pub amount: u64,
    pub expires_at: DateTime<Utc>,
    pub note: String,
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    users: BTreeMap<String, User>,
    subscriptions: BTreeMap<u64, Subscription>,
    purchases: BTreeMap<u64, Purchase>,
    batches: BTreeMap<u64, Batch>,
    event_log: BTreeMap<String, EventRecord>,
    token_events: Vec<TokenEvent>,
    referrals: BTreeMap<u64, Referral>,
    next_id: u64,
}

impl StoreState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Opaque handle to the ledger store.
#[derive(Debug)]
pub struct LedgerStore {
    state: Mutex<StoreState>,
}

impl Default for LedgerStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl LedgerStore {
    /// Create an empty in-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Open the store named by the configured connection URL.
    ///
    /// # Errors
    /// Returns [`StoreError::UnsupportedUrl`] for URL schemes the embedded
    /// engine does not provide, so a misconfigured deployment fails at
    /// startup instead of silently losing writes.
    pub fn connect(storage_url: &str, _service_key: &str) -> Result<Self, StoreError> {
        if storage_url == "mem:" || storage_url.starts_with("mem://") {
            Ok(Self::in_memory())
        } else {
            Err(StoreError::UnsupportedUrl(storage_url.to_owned()))
        }
    }

    /// Run `f` inside a serializable transaction.
    ///
    /// The closure operates on a staged copy of the state; the copy replaces
    /// the live state only when the closure returns `Ok`. Any error rolls
    /// the entire effect back.
    pub fn transaction<T, E>(
        &self,
        f: impl FnOnce(&mut StoreTx<'_>) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut guard = self.state.lock();
        let mut staged = guard.clone();
        let result = f(&mut StoreTx { state: &mut staged });
        if result.is_ok() {
            *guard = staged;
        }
        result
    }

    /// Run `f` against a consistent read-only snapshot.
    pub fn read<T>(&self, f: impl FnOnce(&StoreTx<'_>) -> T) -> T {
        let mut guard = self.state.lock();
        let tx = StoreTx { state: &mut *guard };
        f(&tx)
    }

    /// Convenience wrapper around [`StoreTx::balance`].
    #[must_use]
    pub fn balance(&self, user_id: &str, now: DateTime<Utc>) -> u64 {
        self.read(|tx| tx.balance(user_id, now))
    }
}

/// Transaction handle carrying every store operation.
pub struct StoreTx<'a> {
    state: &'a mut StoreState,
}

impl StoreTx<'_> {
    // ── users ───────────────────────────────────────────────────────────

    /// Look up a user by external id.
    #[must_use]
    pub fn user(&self, user_id: &str) -> Option<&User> {
        self.state.users.get(user_id)
    }

    /// Look up a user by bound gateway customer id.
    #[must_use]
    pub fn user_by_pg_customer(&self, pg_customer_id: &str) -> Option<&User> {
        self.state
            .users
            .values()
            .find(|u| u.pg_customer_id.as_deref() == Some(pg_customer_id))
    }

    /// Look up a user by email.
    #[must_use]
    pub fn user_by_email(&self, email: &str) -> Option<&User> {
        self.state.users.values().find(|u| u.email == email)
    }

    /// Iterate all users.
    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.state.users.values()
    }

    /// Create the user row on first authenticated interaction, or return the
    /// existing one.
    pub fn upsert_user_by_external_id(
        &mut self,
        user_id: &str,
        email: &str,
    ) -> Result<User, StoreError> {
        if let Some(existing) = self.state.users.get(user_id) {
            return Ok(existing.clone());
        }
        if self.user_by_email(email).is_some() {
            return Err(StoreError::UniqueViolation {
                constraint: "user.email",
                value: email.to_owned(),
            });
        }
        let user = User {
            user_id: user_id.to_owned(),
            email: email.to_owned(),
            pg_customer_id: None,
            has_active_subscription: false,
            has_payment_issue: false,
            is_deleted: false,
        };
        self.state.users.insert(user_id.to_owned(), user.clone());
        Ok(user)
    }

    /// Bind the gateway customer id to a user, enforcing its uniqueness.
    /// Re-binding the same id is a no-op.
    pub fn bind_pg_customer(
        &mut self,
        user_id: &str,
        pg_customer_id: &str,
    ) -> Result<(), StoreError> {
        if let Some(owner) = self.user_by_pg_customer(pg_customer_id) {
            if owner.user_id == user_id {
                return Ok(());
            }
            return Err(StoreError::UniqueViolation {
                constraint: "user.pg_customer_id",
                value: pg_customer_id.to_owned(),
            });
        }
        let user = self.require_live_user(user_id)?;
        user.pg_customer_id = Some(pg_customer_id.to_owned());
        Ok(())
    }

    /// Update the denormalized subscription flags on a user row.
    pub fn update_user_flags(
        &mut self,
        user_id: &str,
        has_active_subscription: Option<bool>,
        has_payment_issue: Option<bool>,
    ) -> Result<(), StoreError> {
        let user = self.require_live_user(user_id)?;
        if let Some(active) = has_active_subscription {
            user.has_active_subscription = active;
        }
        if let Some(issue) = has_payment_issue {
            user.has_payment_issue = issue;
        }
        Ok(())
    }

    /// Soft-delete a user, blocking all further ledger mutations for them.
    pub fn soft_delete_user(&mut self, user_id: &str) -> Result<(), StoreError> {
        let user = self
            .state
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "user",
                key: user_id.to_owned(),
            })?;
        user.is_deleted = true;
        Ok(())
    }

    fn require_live_user(&mut self, user_id: &str) -> Result<&mut User, StoreError> {
        let user = self
            .state
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "user",
                key: user_id.to_owned(),
            })?;
        if user.is_deleted {
            return Err(StoreError::UserDeleted(user_id.to_owned()));
        }
        Ok(user)
    }

    // ── event log (idempotency guard) ───────────────────────────────────

    /// Whether an event id is already present in the event log.
    #[must_use]
    pub fn event_seen(&self, event_id: &str) -> bool {
        self.state.event_log.contains_key(event_id)
    }

    /// Record an event id. Returns `false` when the id was already present
    /// (the caller must skip all effects).
    pub fn record_event(
        &mut self,
        event_id: &str,
        event_type: &str,
        received_at: DateTime<Utc>,
    ) -> bool {
        if self.state.event_log.contains_key(event_id) {
            return false;
        }
        self.state.event_log.insert(
            event_id.to_owned(),
            EventRecord {
                event_id: event_id.to_owned(),
                event_type: event_type.to_owned(),
                received_at,
            },
        );
        true
    }

    // ── subscriptions ───────────────────────────────────────────────────

    /// Look up a subscription row by id.
    #[must_use]
    pub fn subscription(&self, id: u64) -> Option<&Subscription> {
        self.state.subscriptions.get(&id)
    }

    /// Look up a subscription by gateway subscription id.
    #[must_use]
    pub fn subscription_by_pg_id(&self, pg_subscription_id: &str) -> Option<&Subscription> {
        self.state
            .subscriptions
            .values()
            .find(|s| s.pg_subscription_id == pg_subscription_id)
    }

    /// The newest active subscription for a user, if any.
    #[must_use]
    pub fn latest_active_subscription(&self, user_id: &str) -> Option<&Subscription> {
        self.state
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id && s.is_active)
            .max_by_key(|s| s.id)
    }

    /// Iterate all subscription rows.
    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.state.subscriptions.values()
    }

    /// Insert or update the subscription row keyed by gateway subscription
    /// id.
    ///
    /// When the resulting row is active, any other active row for the same
    /// user is deactivated so at most one active subscription per user ever
    /// exists.
    pub fn upsert_subscription_by_pg_id(
        &mut self,
        fields: SubscriptionFields,
    ) -> Result<UpsertOutcome, StoreError> {
        self.require_live_user(&fields.user_id)?;

        let existing_id = self
            .subscription_by_pg_id(&fields.pg_subscription_id)
            .map(|s| s.id);

        let (id, was_insert) = match existing_id {
            Some(id) => {
                let row = self
                    .state
                    .subscriptions
                    .get_mut(&id)
                    .ok_or_else(|| StoreError::NotFound {
                        entity: "subscription",
                        key: id.to_string(),
                    })?;
                row.user_id = fields.user_id.clone();
                row.plan_key = fields.plan_key;
                row.plan_tier = fields.plan_tier;
                row.billing_cycle = fields.billing_cycle;
                row.is_active = fields.is_active;
                row.current_period_start = fields.current_period_start;
                row.current_period_end = fields.current_period_end;
                row.tokens_per_cycle = fields.tokens_per_cycle;
                row.price_cents = fields.price_cents;
                (id, false)
            }
            None => {
                let id = self.state.allocate_id();
                self.state.subscriptions.insert(
                    id,
                    Subscription {
                        id,
                        user_id: fields.user_id.clone(),
                        plan_key: fields.plan_key,
                        plan_tier: fields.plan_tier,
                        billing_cycle: fields.billing_cycle,
                        pg_subscription_id: fields.pg_subscription_id,
                        is_active: fields.is_active,
                        current_period_start: fields.current_period_start,
                        current_period_end: fields.current_period_end,
                        tokens_per_cycle: fields.tokens_per_cycle,
                        price_cents: fields.price_cents,
                        last_monthly_refill: None,
                        payment_failure_reason: None,
                    },
                );
                (id, true)
            }
        };

        if fields.is_active {
            let older: Vec<u64> = self
                .state
                .subscriptions
                .values()
                .filter(|s| s.user_id == fields.user_id && s.is_active && s.id != id)
                .map(|s| s.id)
                .collect();
            for other in older {
                if let Some(row) = self.state.subscriptions.get_mut(&other) {
                    row.is_active = false;
                }
            }
        }

        Ok(UpsertOutcome { id, was_insert })
    }

    /// Apply an in-place update to a subscription row.
    pub fn update_subscription(
        &mut self,
        id: u64,
        f: impl FnOnce(&mut Subscription),
    ) -> Result<(), StoreError> {
        let row = self
            .state
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "subscription",
                key: id.to_string(),
            })?;
        f(row);
        Ok(())
    }

    /// Mark a subscription inactive.
    pub fn deactivate_subscription(&mut self, id: u64) -> Result<(), StoreError> {
        self.update_subscription(id, |s| s.is_active = false)
    }

    // ── purchases ───────────────────────────────────────────────────────

    /// Look up a purchase by gateway purchase id.
    #[must_use]
    pub fn purchase_by_pg_id(&self, pg_purchase_id: &str) -> Option<&Purchase> {
        self.state
            .purchases
            .values()
            .find(|p| p.pg_purchase_id == pg_purchase_id)
    }

    /// Insert a purchase row, deduplicating on the gateway purchase id.
    pub fn insert_purchase(&mut self, fields: PurchaseFields) -> Result<UpsertOutcome, StoreError> {
        if let Some(existing) = self.purchase_by_pg_id(&fields.pg_purchase_id) {
            return Ok(UpsertOutcome {
                id: existing.id,
                was_insert: false,
            });
        }
        self.require_live_user(&fields.user_id)?;
        let id = self.state.allocate_id();
        self.state.purchases.insert(
            id,
            Purchase {
                id,
                user_id: fields.user_id,
                plan_tier: fields.plan_tier,
                pg_purchase_id: fields.pg_purchase_id,
                amount_tokens: fields.amount_tokens,
                discount_cents: fields.discount_cents,
                period_start: fields.period_start,
                period_end: fields.period_end,
            },
        );
        Ok(UpsertOutcome {
            id,
            was_insert: true,
        })
    }

    // ── batches ─────────────────────────────────────────────────────────

    /// Look up a batch by id.
    #[must_use]
    pub fn batch(&self, id: u64) -> Option<&Batch> {
        self.state.batches.get(&id)
    }

    /// Look up a batch by its credit-grant invoice anchor.
    #[must_use]
    pub fn batch_by_invoice(&self, invoice_id: &str) -> Option<&Batch> {
        self.state
            .batches
            .values()
            .find(|b| b.invoice_id.as_deref() == Some(invoice_id))
    }

    /// All batches belonging to a user, in id order.
    #[must_use]
    pub fn batches_for_user(&self, user_id: &str) -> Vec<&Batch> {
        self.state
            .batches
            .values()
            .filter(|b| b.user_id == user_id)
            .collect()
    }

    /// Active, non-expired batches for a user in consumption order:
    /// earliest `expires_at` first, batch id as the tie-break.
    #[must_use]
    pub fn active_batches_fifo(&self, user_id: &str, now: DateTime<Utc>) -> Vec<Batch> {
        let mut batches: Vec<Batch> = self
            .state
            .batches
            .values()
            .filter(|b| b.user_id == user_id && b.is_spendable(now))
            .cloned()
            .collect();
        batches.sort_by_key(|b| (b.expires_at, b.id));
        batches
    }

    /// Insert a credit batch.
    ///
    /// A collision on `invoice_id` means the grant already happened; the
    /// caller receives the existing batch id and must treat the operation as
    /// success.
    pub fn insert_batch(&mut self, fields: BatchFields) -> Result<BatchInsert, StoreError> {
        if fields.amount == 0 {
            return Err(StoreError::Invariant(
                "batch amount must be positive".into(),
            ));
        }
        if let Some(invoice_id) = &fields.invoice_id {
            if let Some(existing) = self.batch_by_invoice(invoice_id) {
                return Ok(BatchInsert::AlreadyCredited(existing.id));
            }
        }
        self.require_live_user(&fields.user_id)?;
        let id = self.state.allocate_id();
        self.state.batches.insert(
            id,
            Batch {
                id,
                user_id: fields.user_id,
                origin: fields.origin,
                invoice_id: fields.invoice_id,
                amount: fields.amount,
                consumed: 0,
                expires_at: fields.expires_at,
                is_active: true,
                note: fields.note,
            },
        );
        Ok(BatchInsert::Inserted(id))
    }

    /// Increase a batch's consumed counter by `take` tokens.
    pub fn apply_batch_consumption(&mut self, batch_id: u64, take: u64) -> Result<(), StoreError> {
        let batch = self
            .state
            .batches
            .get_mut(&batch_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "batch",
                key: batch_id.to_string(),
            })?;
        let consumed = batch.consumed.saturating_add(take);
        if consumed > batch.amount {
            return Err(StoreError::Invariant(format!(
                "batch {batch_id}: consumption {consumed} would exceed amount {}",
                batch.amount
            )));
        }
        batch.consumed = consumed;
        Ok(())
    }

    /// Mark a batch inactive.
    pub fn deactivate_batch(&mut self, id: u64) -> Result<(), StoreError> {
        let batch = self
            .state
            .batches
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "batch",
                key: id.to_string(),
            })?;
        batch.is_active = false;
        Ok(())
    }

    /// Remaining balance across a user's active, non-expired batches.
    #[must_use]
    pub fn balance(&self, user_id: &str, now: DateTime<Utc>) -> u64 {
        self.state
            .batches
            .values()
            .filter(|b| b.user_id == user_id && b.is_spendable(now))
            .map(Batch::remaining)
            .sum()
    }

    // ── token journal ───────────────────────────────────────────────────

    /// Append a signed delta to the token journal.
    pub fn append_token_event(
        &mut self,
        user_id: &str,
        batch_id: u64,
        delta: i64,
        reason: TokenReason,
        at: DateTime<Utc>,
    ) -> u64 {
        let id = self.state.allocate_id();
        self.state.token_events.push(TokenEvent {
            id,
            user_id: user_id.to_owned(),
            batch_id,
            delta,
            reason,
            at,
        });
        id
    }

    /// Journal entries for one user, in append order.
    #[must_use]
    pub fn token_events_for_user(&self, user_id: &str) -> Vec<&TokenEvent> {
        self.state
            .token_events
            .iter()
            .filter(|e| e.user_id == user_id)
            .collect()
    }

    /// Journal entries for one batch, in append order.
    #[must_use]
    pub fn token_events_for_batch(&self, batch_id: u64) -> Vec<&TokenEvent> {
        self.state
            .token_events
            .iter()
            .filter(|e| e.batch_id == batch_id)
            .collect()
    }

    // ── referrals ───────────────────────────────────────────────────────

    /// Record that `referred_user_id` was referred by `referrer_user_id`.
    /// A user can be referred at most once.
    pub fn insert_referral(
        &mut self,
        referrer_user_id: &str,
        referred_user_id: &str,
    ) -> Result<u64, StoreError> {
        if self
            .state
            .referrals
            .values()
            .any(|r| r.referred_user_id == referred_user_id)
        {
            return Err(StoreError::UniqueViolation {
                constraint: "referral.referred_user_id",
                value: referred_user_id.to_owned(),
            });
        }
        let id = self.state.allocate_id();
        self.state.referrals.insert(
            id,
            Referral {
                id,
                referrer_user_id: referrer_user_id.to_owned(),
                referred_user_id: referred_user_id.to_owned(),
                is_rewarded: false,
            },
        );
        Ok(id)
    }

    /// The not-yet-rewarded referral naming this user as the referred party.
    #[must_use]
    pub fn pending_referral_for(&self, referred_user_id: &str) -> Option<&Referral> {
        self.state
            .referrals
            .values()
            .find(|r| r.referred_user_id == referred_user_id && !r.is_rewarded)
    }

    /// Flip a referral to rewarded.
    pub fn mark_referral_rewarded(&mut self, id: u64) -> Result<(), StoreError> {
        let referral = self
            .state
            .referrals
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "referral",
                key: id.to_string(),
            })?;
        referral.is_rewarded = true;
        Ok(())
    }
}
