//! Payment-gateway port
//!
//! The billing core never talks to the gateway SDK directly; it depends on
//! the [`PaymentGateway`] trait, which carries exactly the calls the
//! dispatcher, the reconciliation worker, and the user-facing endpoints
//! need. [`RestGateway`] implements the trait over the gateway's REST API;
//! [`FakeGateway`] backs tests and local runs.

mod fake;
mod rest;

pub use fake::FakeGateway;
pub use rest::RestGateway;

use async_trait::async_trait;
use thiserror::Error;

use crate::events::{CustomerObject, InvoiceObject, PaymentIntentObject, SubscriptionObject};

/// Error types raised by gateway calls
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Transport-level failure (connect, TLS, non-2xx status)
    #[error("gateway request failed: {0}")]
    Request(String),

    /// The gateway answered with a payload the client cannot interpret
    #[error("gateway returned an unexpected payload: {0}")]
    Payload(String),

    /// The inner per-call deadline elapsed
    #[error("gateway call exceeded its deadline")]
    Timeout,
}

/// Checkout session mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutMode {
    /// One-time payment
    Payment,
    /// Recurring subscription
    Subscription,
}

impl CheckoutMode {
    /// The wire string for this mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Payment => "payment",
            Self::Subscription => "subscription",
        }
    }
}

/// Parameters for creating a hosted checkout session.
#[derive(Debug, Clone)]
pub struct CheckoutSessionRequest {
    /// Session mode
    pub mode: CheckoutMode,
    /// Gateway price to sell
    pub plan_key: String,
    /// Local user id, carried in session metadata for attribution
    pub user_id: String,
    /// Catalog option tag, carried in session metadata
    pub plan_option: String,
    /// Redirect after successful payment
    pub success_url: String,
    /// Redirect after abandonment
    pub cancel_url: String,
    /// Customer email to prefill, when known
    pub customer_email: Option<String>,
}

/// A created checkout session.
#[derive(Debug, Clone)]
pub struct CheckoutSessionLink {
    /// Session id
    pub session_id: String,
    /// Hosted payment page URL the caller redirects to
    pub url: String,
}

/// The calls the billing core makes against the payment gateway.
///
/// Lookup methods return `Ok(None)` when the object does not exist upstream
/// and `Err` only for transport-level trouble, so callers can distinguish
/// "gone" from "unreachable".
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Fetch an invoice with its payment intent and latest charge expanded.
    async fn invoice_with_payment_details(
        &self,
        invoice_id: &str,
    ) -> Result<Option<InvoiceObject>, GatewayError>;

    /// Fetch a payment intent.
    async fn payment_intent(&self, id: &str)
        -> Result<Option<PaymentIntentObject>, GatewayError>;

    /// Search payment intents charging the given invoice.
    async fn payment_intents_for_invoice(
        &self,
        invoice_id: &str,
    ) -> Result<Vec<PaymentIntentObject>, GatewayError>;

    /// Fetch a subscription with its latest invoice expanded.
    async fn subscription_with_latest_invoice(
        &self,
        pg_subscription_id: &str,
    ) -> Result<Option<SubscriptionObject>, GatewayError>;

    /// Fetch a customer.
    async fn customer(&self, pg_customer_id: &str)
        -> Result<Option<CustomerObject>, GatewayError>;

    /// Create a hosted checkout session.
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSessionLink, GatewayError>;

    /// Flag a subscription to cancel at the end of its current period.
    async fn cancel_at_period_end(&self, pg_subscription_id: &str) -> Result<(), GatewayError>;
}
