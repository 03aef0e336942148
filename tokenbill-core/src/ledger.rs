//! Token ledger
//!
//! Grants credit batches, consumes them FIFO-by-expiry, expires stale
//! batches, and mirrors every balance-affecting delta into the append-only
//! token journal. The in-transaction functions operate on a [`StoreTx`] so
//! event handlers can compose grants with their other effects atomically;
//! [`TokenLedger`] wraps them for callers that own the whole operation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::errors::{BillingError, Result};
use crate::model::{BatchOrigin, TokenReason};
use crate::store::{BatchFields, BatchInsert, LedgerStore, StoreTx};

/// How a consume request treats a shortfall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsumeMode {
    /// Fail with [`BillingError::InsufficientTokens`] unless the full amount
    /// is available. The default.
    #[default]
    AllOrNothing,
    /// Consume whatever is available and report the partial amount.
    BestEffort,
}

/// A credit grant request.
#[derive(Debug, Clone)]
pub struct GrantRequest {
    /// Receiving user
    pub user_id: String,
    /// What created the credit
    pub origin: BatchOrigin,
    /// Tokens to grant (positive)
    pub amount: u64,
    /// When the batch stops being spendable
    pub expires_at: DateTime<Utc>,
    /// Credit-level idempotency anchor; required for subscription-sourced
    /// grants
    pub invoice_id: Option<String>,
    /// Provenance note stored on the batch
    pub note: String,
    /// Journal reason for the positive delta
    pub reason: TokenReason,
}

/// Outcome of a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    /// A new batch was created and journaled
    Granted {
        /// Id of the new batch
        batch_id: u64,
    },
    /// The invoice id already anchored a batch; nothing was written
    AlreadyCredited {
        /// Id of the pre-existing batch
        batch_id: u64,
    },
}

impl GrantOutcome {
    /// Batch id regardless of whether the grant was fresh.
    #[must_use]
    pub const fn batch_id(self) -> u64 {
        match self {
            Self::Granted { batch_id } | Self::AlreadyCredited { batch_id } => batch_id,
        }
    }
}

/// A batch deactivated by the expiry sweep.
#[derive(Debug, Clone, Copy)]
pub struct ExpiredBatch {
    /// Batch id
    pub batch_id: u64,
    /// Unspent tokens forfeited by the expiry
    pub forfeited: u64,
}

/// Grant a credit batch and journal the positive delta.
///
/// A collision on `invoice_id` returns [`GrantOutcome::AlreadyCredited`]
/// without touching the journal; redelivered grant events are no-ops.
pub fn grant_batch(
    tx: &mut StoreTx<'_>,
    req: GrantRequest,
    now: DateTime<Utc>,
) -> Result<GrantOutcome> {
    // Subscription credits are only idempotent through their invoice anchor.
    if matches!(req.origin, BatchOrigin::Subscription { .. }) && req.invoice_id.is_none() {
        return Err(BillingError::Storage(crate::store::StoreError::Invariant(
            "subscription-sourced batches require an invoice anchor".into(),
        )));
    }

    let inserted = tx.insert_batch(BatchFields {
        user_id: req.user_id.clone(),
        origin: req.origin,
        invoice_id: req.invoice_id,
        amount: req.amount,
        expires_at: req.expires_at,
        note: req.note,
    })?;

    match inserted {
        BatchInsert::Inserted(batch_id) => {
            let delta = i64::try_from(req.amount).map_err(|_| {
                BillingError::Storage(crate::store::StoreError::Invariant(format!(
                    "grant amount {} does not fit the journal delta",
                    req.amount
                )))
            })?;
            tx.append_token_event(&req.user_id, batch_id, delta, req.reason, now);
            info!(
                user_id = %req.user_id,
                batch_id,
                amount = req.amount,
                reason = req.reason.as_str(),
                "granted token batch"
            );
            Ok(GrantOutcome::Granted { batch_id })
        }
        BatchInsert::AlreadyCredited(batch_id) => {
            debug!(
                user_id = %req.user_id,
                batch_id,
                "grant skipped, invoice already credited"
            );
            Ok(GrantOutcome::AlreadyCredited { batch_id })
        }
    }
}

/// Consume `amount` tokens from a user's batches, earliest expiry first.
///
/// Spends across all active, non-expired batches regardless of origin;
/// subscription, purchase, and referral credits rank equally. Returns the
/// amount actually consumed.
pub fn consume(
    tx: &mut StoreTx<'_>,
    user_id: &str,
    amount: u64,
    purpose: &str,
    mode: ConsumeMode,
    now: DateTime<Utc>,
) -> Result<u64> {
    if tx.user(user_id).is_some_and(|u| u.is_deleted) {
        return Err(BillingError::Storage(crate::store::StoreError::UserDeleted(
            user_id.to_owned(),
        )));
    }

    let candidates = tx.active_batches_fifo(user_id, now);
    let available: u64 = candidates.iter().map(|b| b.remaining()).sum();

    if mode == ConsumeMode::AllOrNothing && available < amount {
        return Err(BillingError::InsufficientTokens {
            requested: amount,
            available,
        });
    }

    let mut taken = 0u64;
    for batch in &candidates {
        if taken == amount {
            break;
        }
        let take = (amount - taken).min(batch.remaining());
        if take == 0 {
            continue;
        }
        tx.apply_batch_consumption(batch.id, take)?;
        let delta = i64::try_from(take).map_err(|_| {
            BillingError::Storage(crate::store::StoreError::Invariant(format!(
                "consumption {take} does not fit the journal delta"
            )))
        })?;
        tx.append_token_event(user_id, batch.id, -delta, TokenReason::Consumption, now);
        taken += take;
    }

    debug!(
        user_id,
        requested = amount,
        consumed = taken,
        purpose,
        "consumed tokens"
    );
    Ok(taken)
}

/// Deactivate every active batch whose expiry has passed, forfeiting the
/// unspent remainder through a journal entry so the per-batch sum invariant
/// holds.
pub fn expire_due(tx: &mut StoreTx<'_>, now: DateTime<Utc>) -> Result<Vec<ExpiredBatch>> {
    let due: Vec<(u64, String, u64)> = tx
        .users()
        .flat_map(|u| tx.batches_for_user(&u.user_id))
        .filter(|b| b.is_active && b.expires_at <= now)
        .map(|b| (b.id, b.user_id.clone(), b.remaining()))
        .collect();

    let mut expired = Vec::with_capacity(due.len());
    for (batch_id, user_id, forfeited) in due {
        tx.deactivate_batch(batch_id)?;
        if forfeited > 0 {
            let delta = i64::try_from(forfeited).map_err(|_| {
                BillingError::Storage(crate::store::StoreError::Invariant(format!(
                    "forfeit {forfeited} does not fit the journal delta"
                )))
            })?;
            tx.append_token_event(&user_id, batch_id, -delta, TokenReason::Expiry, now);
        }
        expired.push(ExpiredBatch {
            batch_id,
            forfeited,
        });
    }
    Ok(expired)
}

/// Transaction-owning facade over the ledger operations.
pub struct TokenLedger {
    store: Arc<LedgerStore>,
}

impl TokenLedger {
    /// Wrap a store handle.
    #[must_use]
    pub const fn new(store: Arc<LedgerStore>) -> Self {
        Self { store }
    }

    /// Grant a batch in its own transaction.
    pub fn grant(&self, req: GrantRequest, now: DateTime<Utc>) -> Result<GrantOutcome> {
        self.store.transaction(|tx| grant_batch(tx, req, now))
    }

    /// Consume tokens in their own transaction. The default mode is
    /// all-or-nothing: a shortfall aborts without a partial debit.
    pub fn consume(
        &self,
        user_id: &str,
        amount: u64,
        purpose: &str,
        mode: ConsumeMode,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.store
            .transaction(|tx| consume(tx, user_id, amount, purpose, mode, now))
    }

    /// Expire due batches in their own transaction.
    pub fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredBatch>> {
        self.store.transaction(|tx| expire_due(tx, now))
    }

    /// Current balance for a user.
    #[must_use]
    pub fn balance(&self, user_id: &str, now: DateTime<Utc>) -> u64 {
        self.store.balance(user_id, now)
    }
}
