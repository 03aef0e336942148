//! Alert delivery
//!
//! Reconciliation anomalies default to structured log records; when
//! `ALERT_CHANNEL_WEBHOOK_URL` is configured they are additionally posted to
//! the out-of-band alerting collaborator as small JSON documents. Delivery
//! is fire-and-forget: alerting must never stall a reconciliation pass.

use serde_json::json;
use tracing::{error, warn};

use tokenbill_core::reconcile::{AlertSink, Anomaly, TracingAlertSink};

/// Sink posting each anomaly to a webhook, on top of the log record.
pub struct WebhookAlertSink {
    http: reqwest::Client,
    url: String,
    fallback: TracingAlertSink,
}

impl WebhookAlertSink {
    /// Build a sink for the configured alert endpoint.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            fallback: TracingAlertSink,
        }
    }
}

impl AlertSink for WebhookAlertSink {
    fn alert(&self, anomaly: &Anomaly) {
        self.fallback.alert(anomaly);

        let body = json!({
            "source": "tokenbill-reconciliation",
            "critical": anomaly.is_critical(),
            "text": anomaly.to_string(),
        });
        let http = self.http.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            match http.post(&url).json(&body).send().await {
                Ok(response) if !response.status().is_success() => {
                    warn!(status = %response.status(), "alert delivery rejected");
                }
                Ok(_) => {}
                Err(err) => error!(%err, "alert delivery failed"),
            }
        });
    }
}
