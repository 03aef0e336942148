//! Typed payment-gateway events
//!
//! Strongly-typed representations of the gateway's webhook envelope and the
//! event objects the dispatcher consumes. Parsing is tolerant: unknown
//! fields are ignored, unknown event kinds route to [`EventKind::Unknown`],
//! and expandable references (`"in_123"` vs. a nested object) are modeled
//! explicitly so the same structs serve both webhook payloads and REST
//! responses.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{BillingError, Result};

/// Gateway event kinds the dispatcher routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `checkout.session.completed`
    CheckoutSessionCompleted,
    /// `customer.subscription.created`
    SubscriptionCreated,
    /// `customer.subscription.updated`
    SubscriptionUpdated,
    /// `customer.subscription.deleted`
    SubscriptionDeleted,
    /// `invoice.paid`
    InvoicePaid,
    /// `invoice.payment_succeeded` (redelivery alias of a paid invoice)
    InvoicePaymentSucceeded,
    /// `invoice.payment_failed`
    InvoicePaymentFailed,
    /// `payment_intent.succeeded`
    PaymentIntentSucceeded,
    /// `payment_intent.payment_failed`
    PaymentIntentPaymentFailed,
    /// `charge.failed`
    ChargeFailed,
    /// Anything else; acknowledged without effects
    Unknown,
}

impl FromStr for EventKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "checkout.session.completed" => Self::CheckoutSessionCompleted,
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.paid" => Self::InvoicePaid,
            "invoice.payment_succeeded" => Self::InvoicePaymentSucceeded,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            "payment_intent.succeeded" => Self::PaymentIntentSucceeded,
            "payment_intent.payment_failed" => Self::PaymentIntentPaymentFailed,
            "charge.failed" => Self::ChargeFailed,
            _ => Self::Unknown,
        })
    }
}

impl EventKind {
    /// The wire string for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CheckoutSessionCompleted => "checkout.session.completed",
            Self::SubscriptionCreated => "customer.subscription.created",
            Self::SubscriptionUpdated => "customer.subscription.updated",
            Self::SubscriptionDeleted => "customer.subscription.deleted",
            Self::InvoicePaid => "invoice.paid",
            Self::InvoicePaymentSucceeded => "invoice.payment_succeeded",
            Self::InvoicePaymentFailed => "invoice.payment_failed",
            Self::PaymentIntentSucceeded => "payment_intent.succeeded",
            Self::PaymentIntentPaymentFailed => "payment_intent.payment_failed",
            Self::ChargeFailed => "charge.failed",
            Self::Unknown => "unknown",
        }
    }
}

/// A reference the gateway may deliver either as a bare id or as the
/// expanded object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expandable<T> {
    /// Bare object id
    Id(String),
    /// Expanded object
    Object(Box<T>),
}

impl<T> Expandable<T> {
    /// The expanded object, when present.
    #[must_use]
    pub fn object(&self) -> Option<&T> {
        match self {
            Self::Id(_) => None,
            Self::Object(obj) => Some(obj),
        }
    }
}

impl Expandable<PaymentIntentObject> {
    /// The referenced payment-intent id, expanded or not.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Object(obj) => &obj.id,
        }
    }
}

impl Expandable<ChargeObject> {
    /// The referenced charge id, expanded or not.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Object(obj) => &obj.id,
        }
    }
}

impl Expandable<InvoiceObject> {
    /// The referenced invoice id, expanded or not.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Object(obj) => &obj.id,
        }
    }
}

/// The event envelope delivered to the webhook endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    /// Unique event id; the event-level idempotency key
    pub id: String,
    /// Event type string
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event creation time (unix seconds)
    #[serde(default)]
    pub created: i64,
    /// Event payload
    pub data: EventData,
}

/// Payload wrapper inside the envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    /// The event's primary object, kept raw until the route is known
    pub object: serde_json::Value,
}

impl EventEnvelope {
    /// Parse an envelope from raw webhook bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| BillingError::MalformedEvent(e.to_string()))
    }

    /// The typed event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.event_type
            .parse()
            .unwrap_or(EventKind::Unknown)
    }

    /// Extract the payload as a checkout session.
    pub fn checkout_session(&self) -> Result<CheckoutSessionObject> {
        self.object_as("checkout session")
    }

    /// Extract the payload as a subscription.
    pub fn subscription(&self) -> Result<SubscriptionObject> {
        self.object_as("subscription")
    }

    /// Extract the payload as an invoice.
    pub fn invoice(&self) -> Result<InvoiceObject> {
        self.object_as("invoice")
    }

    /// Extract the payload as a payment intent.
    pub fn payment_intent(&self) -> Result<PaymentIntentObject> {
        self.object_as("payment intent")
    }

    /// Extract the payload as a charge.
    pub fn charge(&self) -> Result<ChargeObject> {
        self.object_as("charge")
    }

    fn object_as<T: serde::de::DeserializeOwned>(&self, what: &str) -> Result<T> {
        serde_json::from_value(self.data.object.clone())
            .map_err(|e| BillingError::MalformedEvent(format!("not a {what}: {e}")))
    }
}

/// Free-form key/value metadata attached to gateway objects.
pub type Metadata = HashMap<String, String>;

/// `checkout.session` object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckoutSessionObject {
    /// Session id; the purchase idempotency key for payment-mode sessions
    pub id: String,
    /// `payment` for one-time purchases, `subscription` for recurring
    #[serde(default)]
    pub mode: String,
    /// Gateway customer id
    #[serde(default)]
    pub customer: Option<String>,
    /// Payment intent settled by the session (payment mode)
    #[serde(default)]
    pub payment_intent: Option<String>,
    /// Subscription created by the session (subscription mode)
    #[serde(default)]
    pub subscription: Option<String>,
    /// Caller-supplied metadata (`user_id`, `plan_option`)
    #[serde(default)]
    pub metadata: Metadata,
    /// Discount totals applied at checkout
    #[serde(default)]
    pub total_details: Option<TotalDetails>,
}

/// Discount totals on a checkout session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TotalDetails {
    /// Discount applied, in cents
    #[serde(default)]
    pub amount_discount: i64,
}

/// `subscription` object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionObject {
    /// Gateway subscription id
    pub id: String,
    /// Gateway customer id
    #[serde(default)]
    pub customer: Option<String>,
    /// Gateway lifecycle status (`active`, `past_due`, `canceled`, ...)
    #[serde(default)]
    pub status: Option<String>,
    /// Whether the subscription is set to cancel at period end
    #[serde(default)]
    pub cancel_at_period_end: bool,
    /// Current period start (unix seconds)
    #[serde(default)]
    pub current_period_start: Option<i64>,
    /// Current period end (unix seconds)
    #[serde(default)]
    pub current_period_end: Option<i64>,
    /// Caller-supplied metadata (`user_id`)
    #[serde(default)]
    pub metadata: Metadata,
    /// Subscription line items
    #[serde(default)]
    pub items: SubscriptionItems,
    /// Latest invoice, expandable
    #[serde(default)]
    pub latest_invoice: Option<Expandable<InvoiceObject>>,
    /// Charge collection mode (`charge_automatically` or `send_invoice`)
    #[serde(default)]
    pub collection_method: Option<String>,
}

impl SubscriptionObject {
    /// The plan key (gateway price id) of the first line item.
    #[must_use]
    pub fn plan_key(&self) -> Option<&str> {
        self.items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.as_str())
    }

    /// Current period start as a timestamp.
    #[must_use]
    pub fn period_start(&self) -> Option<DateTime<Utc>> {
        self.current_period_start.and_then(epoch_to_datetime)
    }

    /// Current period end as a timestamp.
    #[must_use]
    pub fn period_end(&self) -> Option<DateTime<Utc>> {
        self.current_period_end.and_then(epoch_to_datetime)
    }
}

/// Line-item list on a subscription.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionItems {
    /// Items
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

/// One subscription line item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionItem {
    /// The price the item bills on
    #[serde(default)]
    pub price: Option<PriceObject>,
}

/// `price` object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceObject {
    /// Gateway price id; the local catalog's `plan_key`
    pub id: String,
    /// Unit amount in cents
    #[serde(default)]
    pub unit_amount: Option<i64>,
}

/// `invoice` object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvoiceObject {
    /// Invoice id; the credit-grant idempotency anchor
    pub id: String,
    /// Gateway customer id
    #[serde(default)]
    pub customer: Option<String>,
    /// Subscription the invoice bills
    #[serde(default)]
    pub subscription: Option<String>,
    /// Why the invoice was generated (`subscription_create`,
    /// `subscription_cycle`, `subscription_update`, ...)
    #[serde(default)]
    pub billing_reason: Option<String>,
    /// Invoice status (`paid`, `open`, ...)
    #[serde(default)]
    pub status: Option<String>,
    /// Charge collection mode
    #[serde(default)]
    pub collection_method: Option<String>,
    /// Number of charge attempts so far
    #[serde(default)]
    pub attempt_count: u32,
    /// Next scheduled charge attempt (unix seconds)
    #[serde(default)]
    pub next_payment_attempt: Option<i64>,
    /// The payment intent charging the invoice, expandable
    #[serde(default)]
    pub payment_intent: Option<Expandable<PaymentIntentObject>>,
    /// The latest charge, expandable
    #[serde(default)]
    pub charge: Option<Expandable<ChargeObject>>,
    /// Invoice line items
    #[serde(default)]
    pub lines: InvoiceLines,
}

impl InvoiceObject {
    /// End of the first line item's service period.
    #[must_use]
    pub fn line_period_end(&self) -> Option<DateTime<Utc>> {
        self.lines
            .data
            .first()
            .and_then(|line| line.period.as_ref())
            .and_then(|period| epoch_to_datetime(period.end))
    }
}

/// Line-item list on an invoice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvoiceLines {
    /// Items
    #[serde(default)]
    pub data: Vec<InvoiceLine>,
}

/// One invoice line item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvoiceLine {
    /// Service period the line covers
    #[serde(default)]
    pub period: Option<LinePeriod>,
    /// The price billed
    #[serde(default)]
    pub price: Option<PriceObject>,
}

/// Service period of an invoice line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinePeriod {
    /// Period start (unix seconds)
    #[serde(default)]
    pub start: i64,
    /// Period end (unix seconds)
    #[serde(default)]
    pub end: i64,
}

/// `payment_intent` object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentIntentObject {
    /// Payment intent id
    pub id: String,
    /// Gateway customer id
    #[serde(default)]
    pub customer: Option<String>,
    /// Amount in cents
    #[serde(default)]
    pub amount: i64,
    /// Invoice the intent charges, when any
    #[serde(default)]
    pub invoice: Option<String>,
    /// Caller-supplied metadata (`user_id`, `plan_option`)
    #[serde(default)]
    pub metadata: Metadata,
    /// The most recent charge error
    #[serde(default)]
    pub last_payment_error: Option<PaymentError>,
}

/// Charge error details on a payment intent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentError {
    /// Human-readable failure message
    #[serde(default)]
    pub message: Option<String>,
    /// Machine-readable failure code
    #[serde(default)]
    pub code: Option<String>,
}

impl PaymentError {
    /// The best available description of the failure.
    #[must_use]
    pub fn describe(&self) -> Option<String> {
        self.message
            .clone()
            .or_else(|| self.code.clone())
            .filter(|s| !s.is_empty())
    }
}

/// `charge` object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChargeObject {
    /// Charge id
    pub id: String,
    /// Gateway customer id
    #[serde(default)]
    pub customer: Option<String>,
    /// Invoice the charge settles, when any
    #[serde(default)]
    pub invoice: Option<String>,
    /// Human-readable failure message
    #[serde(default)]
    pub failure_message: Option<String>,
    /// Machine-readable failure code
    #[serde(default)]
    pub failure_code: Option<String>,
}

impl ChargeObject {
    /// The best available description of the failure.
    #[must_use]
    pub fn describe_failure(&self) -> Option<String> {
        self.failure_message
            .clone()
            .or_else(|| self.failure_code.clone())
            .filter(|s| !s.is_empty())
    }
}

/// `customer` object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomerObject {
    /// Gateway customer id
    pub id: String,
    /// Customer email
    #[serde(default)]
    pub email: Option<String>,
    /// Invoice settings, carrying the default payment method
    #[serde(default)]
    pub invoice_settings: Option<InvoiceSettings>,
    /// Legacy default source
    #[serde(default)]
    pub default_source: Option<String>,
}

impl CustomerObject {
    /// Whether the customer has any chargeable payment method on file.
    #[must_use]
    pub fn has_payment_method(&self) -> bool {
        self.invoice_settings
            .as_ref()
            .and_then(|s| s.default_payment_method.as_ref())
            .is_some()
            || self.default_source.is_some()
    }
}

/// Customer invoice settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvoiceSettings {
    /// Default payment method id
    #[serde(default)]
    pub default_payment_method: Option<String>,
}

/// Convert a gateway unix timestamp to a [`DateTime<Utc>`].
#[must_use]
pub fn epoch_to_datetime(epoch: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(epoch, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_parses_and_routes_kind() {
        let payload = json!({
            "id": "evt_1",
            "type": "invoice.paid",
            "created": 1_700_000_000,
            "data": { "object": { "id": "in_1", "billing_reason": "subscription_create" } }
        });
        let envelope = EventEnvelope::parse(payload.to_string().as_bytes()).unwrap();
        assert_eq!(envelope.id, "evt_1");
        assert_eq!(envelope.kind(), EventKind::InvoicePaid);

        let invoice = envelope.invoice().unwrap();
        assert_eq!(invoice.id, "in_1");
        assert_eq!(invoice.billing_reason.as_deref(), Some("subscription_create"));
    }

    #[test]
    fn unknown_kind_and_unknown_fields_are_tolerated() {
        let payload = json!({
            "id": "evt_2",
            "type": "customer.created",
            "api_version": "2024-06-20",
            "livemode": false,
            "data": { "object": { "id": "cus_1", "some_future_field": [1, 2, 3] } }
        });
        let envelope = EventEnvelope::parse(payload.to_string().as_bytes()).unwrap();
        assert_eq!(envelope.kind(), EventKind::Unknown);
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(EventEnvelope::parse(b"{ nope").is_err());
        assert!(EventEnvelope::parse(b"{\"id\":\"evt\"}").is_err());
    }

    #[test]
    fn expandable_accepts_id_and_object() {
        let bare = json!({ "id": "in_1", "payment_intent": "pi_1" });
        let invoice: InvoiceObject = serde_json::from_value(bare).unwrap();
        let intent = invoice.payment_intent.unwrap();
        assert_eq!(intent.id(), "pi_1");
        assert!(intent.object().is_none());

        let expanded = json!({
            "id": "in_2",
            "payment_intent": {
                "id": "pi_2",
                "last_payment_error": { "message": "card declined", "code": "card_declined" }
            }
        });
        let invoice: InvoiceObject = serde_json::from_value(expanded).unwrap();
        let intent = invoice.payment_intent.unwrap();
        assert_eq!(intent.id(), "pi_2");
        let error = intent.object().unwrap().last_payment_error.as_ref().unwrap();
        assert_eq!(error.describe().as_deref(), Some("card declined"));
    }

    #[test]
    fn subscription_accessors_read_first_item() {
        let sub: SubscriptionObject = serde_json::from_value(json!({
            "id": "sub_1",
            "status": "active",
            "current_period_start": 1_700_000_000,
            "current_period_end": 1_702_592_000,
            "items": { "data": [ { "price": { "id": "price_monthly_standard", "unit_amount": 1900 } } ] }
        }))
        .unwrap();
        assert_eq!(sub.plan_key(), Some("price_monthly_standard"));
        assert!(sub.period_end().unwrap() > sub.period_start().unwrap());
    }

    #[test]
    fn invoice_line_period_end_reads_first_line() {
        let invoice: InvoiceObject = serde_json::from_value(json!({
            "id": "in_1",
            "lines": { "data": [ { "period": { "start": 1_700_000_000, "end": 1_702_592_000 } } ] }
        }))
        .unwrap();
        assert_eq!(
            invoice.line_period_end(),
            epoch_to_datetime(1_702_592_000)
        );
    }

    #[test]
    fn customer_payment_method_detection() {
        let with_method: CustomerObject = serde_json::from_value(json!({
            "id": "cus_1",
            "invoice_settings": { "default_payment_method": "pm_1" }
        }))
        .unwrap();
        assert!(with_method.has_payment_method());

        let without: CustomerObject =
            serde_json::from_value(json!({ "id": "cus_2", "invoice_settings": {} })).unwrap();
        assert!(!without.has_payment_method());
    }
}
