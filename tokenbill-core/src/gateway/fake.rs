//! In-memory fake of the payment-gateway port
//!
//! Backs the integration tests and local development runs. State is seeded
//! through the `put_*` methods; every mutating call is recorded so tests can
//! assert on outbound traffic. `fail_lookups` simulates an unreachable
//! gateway for the failure-reason escalation paths.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use super::{
    CheckoutSessionLink, CheckoutSessionRequest, GatewayError, PaymentGateway,
};
use crate::events::{CustomerObject, InvoiceObject, PaymentIntentObject, SubscriptionObject};

#[derive(Default)]
struct FakeState {
    invoices: HashMap<String, InvoiceObject>,
    payment_intents: HashMap<String, PaymentIntentObject>,
    subscriptions: HashMap<String, SubscriptionObject>,
    customers: HashMap<String, CustomerObject>,
    cancelled: Vec<String>,
    created_sessions: Vec<CheckoutSessionRequest>,
}

/// Deterministic in-memory gateway double.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<FakeState>,
    fail_lookups: AtomicBool,
}

impl FakeGateway {
    /// Create an empty fake.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an invoice.
    pub fn put_invoice(&self, invoice: InvoiceObject) {
        self.state.lock().invoices.insert(invoice.id.clone(), invoice);
    }

    /// Seed a payment intent.
    pub fn put_payment_intent(&self, intent: PaymentIntentObject) {
        self.state
            .lock()
            .payment_intents
            .insert(intent.id.clone(), intent);
    }

    /// Seed a subscription.
    pub fn put_subscription(&self, subscription: SubscriptionObject) {
        self.state
            .lock()
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    /// Seed a customer.
    pub fn put_customer(&self, customer: CustomerObject) {
        self.state
            .lock()
            .customers
            .insert(customer.id.clone(), customer);
    }

    /// Make every lookup fail with a transport error until cleared.
    pub fn set_fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    /// Subscription ids flagged to cancel at period end, in call order.
    #[must_use]
    pub fn cancelled_subscriptions(&self) -> Vec<String> {
        self.state.lock().cancelled.clone()
    }

    /// Checkout sessions created through the fake, in call order.
    #[must_use]
    pub fn created_sessions(&self) -> Vec<CheckoutSessionRequest> {
        self.state.lock().created_sessions.clone()
    }

    fn check_lookups(&self) -> Result<(), GatewayError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(GatewayError::Request("fake gateway unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn invoice_with_payment_details(
        &self,
        invoice_id: &str,
    ) -> Result<Option<InvoiceObject>, GatewayError> {
        self.check_lookups()?;
        Ok(self.state.lock().invoices.get(invoice_id).cloned())
    }

    async fn payment_intent(
        &self,
        id: &str,
    ) -> Result<Option<PaymentIntentObject>, GatewayError> {
        self.check_lookups()?;
        Ok(self.state.lock().payment_intents.get(id).cloned())
    }

    async fn payment_intents_for_invoice(
        &self,
        invoice_id: &str,
    ) -> Result<Vec<PaymentIntentObject>, GatewayError> {
        self.check_lookups()?;
        Ok(self
            .state
            .lock()
            .payment_intents
            .values()
            .filter(|pi| pi.invoice.as_deref() == Some(invoice_id))
            .cloned()
            .collect())
    }

    async fn subscription_with_latest_invoice(
        &self,
        pg_subscription_id: &str,
    ) -> Result<Option<SubscriptionObject>, GatewayError> {
        self.check_lookups()?;
        Ok(self
            .state
            .lock()
            .subscriptions
            .get(pg_subscription_id)
            .cloned())
    }

    async fn customer(
        &self,
        pg_customer_id: &str,
    ) -> Result<Option<CustomerObject>, GatewayError> {
        self.check_lookups()?;
        Ok(self.state.lock().customers.get(pg_customer_id).cloned())
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSessionLink, GatewayError> {
        let session_id = format!("cs_{}", Uuid::new_v4().simple());
        let mut state = self.state.lock();
        state.created_sessions.push(request.clone());
        Ok(CheckoutSessionLink {
            url: format!("https://checkout.pg.test/{session_id}"),
            session_id,
        })
    }

    async fn cancel_at_period_end(&self, pg_subscription_id: &str) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        if !state.subscriptions.contains_key(pg_subscription_id) {
            return Err(GatewayError::Request(format!(
                "no such subscription: {pg_subscription_id}"
            )));
        }
        state.cancelled.push(pg_subscription_id.to_owned());
        Ok(())
    }
}
