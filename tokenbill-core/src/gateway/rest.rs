//! REST implementation of the payment-gateway port
//!
//! A thin client over the gateway's HTTP API: bearer-authenticated GETs for
//! lookups, form-encoded POSTs for mutations. Responses decode into the same
//! typed objects the webhook path parses. A 404 resolves to `Ok(None)` so
//! callers can treat "gone upstream" as data rather than failure.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::{
    CheckoutSessionLink, CheckoutSessionRequest, GatewayError, PaymentGateway,
};
use crate::events::{CustomerObject, InvoiceObject, PaymentIntentObject, SubscriptionObject};

/// Payment gateway client over its REST API.
pub struct RestGateway {
    http: reqwest::Client,
    api_base: String,
    secret_key: String,
}

#[derive(Debug, Deserialize)]
struct SearchPage<T> {
    #[serde(default)]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct CreatedSession {
    id: String,
    url: String,
}

impl RestGateway {
    /// Build a client against `api_base` using the configured secret key.
    #[must_use]
    pub fn new(api_base: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into(),
            secret_key: secret_key.into(),
        }
    }

    async fn get_optional<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>, GatewayError> {
        let url = format!("{}/{path}", self.api_base);
        debug!(%url, "gateway GET");
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.secret_key)
            .query(query)
            .send()
            .await
            .map_err(|e| GatewayError::Request(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .map_err(|e| GatewayError::Request(e.to_string()))?;
        let object = response
            .json()
            .await
            .map_err(|e| GatewayError::Payload(e.to_string()))?;
        Ok(Some(object))
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> Result<T, GatewayError> {
        let url = format!("{}/{path}", self.api_base);
        debug!(%url, "gateway POST");
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.secret_key)
            .form(form)
            .send()
            .await
            .map_err(|e| GatewayError::Request(e.to_string()))?
            .error_for_status()
            .map_err(|e| GatewayError::Request(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| GatewayError::Payload(e.to_string()))
    }
}

#[async_trait]
impl PaymentGateway for RestGateway {
    async fn invoice_with_payment_details(
        &self,
        invoice_id: &str,
    ) -> Result<Option<InvoiceObject>, GatewayError> {
        self.get_optional(
            &format!("invoices/{invoice_id}"),
            &[
                ("expand[]", "payment_intent"),
                ("expand[]", "charge"),
            ],
        )
        .await
    }

    async fn payment_intent(
        &self,
        id: &str,
    ) -> Result<Option<PaymentIntentObject>, GatewayError> {
        self.get_optional(&format!("payment_intents/{id}"), &[]).await
    }

    async fn payment_intents_for_invoice(
        &self,
        invoice_id: &str,
    ) -> Result<Vec<PaymentIntentObject>, GatewayError> {
        let query = format!("invoice:\"{invoice_id}\"");
        let page: Option<SearchPage<PaymentIntentObject>> = self
            .get_optional("payment_intents/search", &[("query", query.as_str())])
            .await?;
        Ok(page.map(|p| p.data).unwrap_or_default())
    }

    async fn subscription_with_latest_invoice(
        &self,
        pg_subscription_id: &str,
    ) -> Result<Option<SubscriptionObject>, GatewayError> {
        self.get_optional(
            &format!("subscriptions/{pg_subscription_id}"),
            &[("expand[]", "latest_invoice.payment_intent")],
        )
        .await
    }

    async fn customer(
        &self,
        pg_customer_id: &str,
    ) -> Result<Option<CustomerObject>, GatewayError> {
        self.get_optional(&format!("customers/{pg_customer_id}"), &[])
            .await
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSessionLink, GatewayError> {
        let mut form: Vec<(String, String)> = vec![
            ("mode".into(), request.mode.as_str().into()),
            ("line_items[0][price]".into(), request.plan_key.clone()),
            ("line_items[0][quantity]".into(), "1".into()),
            ("success_url".into(), request.success_url.clone()),
            ("cancel_url".into(), request.cancel_url.clone()),
            ("metadata[user_id]".into(), request.user_id.clone()),
            ("metadata[plan_option]".into(), request.plan_option.clone()),
        ];
        if let Some(email) = &request.customer_email {
            form.push(("customer_email".into(), email.clone()));
        }

        let created: CreatedSession = self.post_form("checkout/sessions", &form).await?;
        Ok(CheckoutSessionLink {
            session_id: created.id,
            url: created.url,
        })
    }

    async fn cancel_at_period_end(&self, pg_subscription_id: &str) -> Result<(), GatewayError> {
        let form = vec![("cancel_at_period_end".to_owned(), "true".to_owned())];
        let _updated: SubscriptionObject = self
            .post_form(&format!("subscriptions/{pg_subscription_id}"), &form)
            .await?;
        Ok(())
    }
}
