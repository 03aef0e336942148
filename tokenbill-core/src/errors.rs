//! Error types for the billing core
//!
//! Every externally observable failure maps to one variant of
//! [`BillingError`]. The webhook transport classifies variants through
//! [`BillingError::is_retriable`]: retriable failures surface as 5xx so the
//! payment gateway redelivers the event, everything else resolves the
//! delivery (2xx/4xx). Idempotency no-ops — a duplicate event id, an
//! already-credited invoice — are not errors at all; they resolve as success
//! values (`Disposition::Duplicate`, `GrantOutcome::AlreadyCredited`) so the
//! gateway sees a 200 and stops retrying.

use thiserror::Error;

use crate::gateway::GatewayError;
use crate::store::StoreError;

/// Result type for billing-core operations
pub type Result<T> = std::result::Result<T, BillingError>;

/// Error types that can occur while ingesting events or mutating the ledger
#[derive(Error, Debug)]
pub enum BillingError {
    /// Webhook signature verification failed; redelivery cannot help.
    #[error("webhook signature verification failed: {0}")]
    BadSignature(String),

    /// The payload could not be parsed as a gateway event envelope.
    #[error("malformed event payload: {0}")]
    MalformedEvent(String),

    /// A consume request exceeded the caller's available balance.
    #[error("insufficient tokens: requested {requested}, available {available}")]
    InsufficientTokens {
        /// Tokens the caller asked for
        requested: u64,
        /// Tokens actually available across active, non-expired batches
        available: u64,
    },

    /// An event referenced a plan key the local catalog does not know.
    /// Retriable so operators can fix the catalog and let the gateway retry.
    #[error("plan key \"{0}\" is not present in the catalog")]
    CatalogMissing(String),

    /// Ledger store failure; the enclosing transaction was rolled back.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// Payment gateway call failure.
    #[error("payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// A deadline bounded the operation and was exceeded.
    #[error("deadline exceeded while {0}")]
    DeadlineExceeded(&'static str),

    /// Startup-time misconfiguration. The process must not come up.
    #[error("configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Whether the payment gateway should redeliver the event that produced
    /// this error.
    ///
    /// Transient storage and gateway failures, catalog gaps, and deadline
    /// overruns are worth retrying; signature and parse failures are not.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Storage(_)
                | Self::Gateway(_)
                | Self::CatalogMissing(_)
                | Self::DeadlineExceeded(_)
        )
    }
}
