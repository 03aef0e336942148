//! Configuration management for the billing core
//!
//! Centralizes every environment-provided value, with typed defaults for the
//! optional ones. Missing required variables fail construction so a
//! misconfigured process never starts serving webhooks.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    DEFAULT_EVENT_DEADLINE_SECS, DEFAULT_MAINTENANCE_INTERVAL_SECS, DEFAULT_PG_CALL_DEADLINE_SECS,
    DEFAULT_RECONCILE_INTERVAL_SECS,
};
use crate::errors::{BillingError, Result};

/// Default REST base of the payment gateway.
pub const DEFAULT_PG_API_BASE: &str = "https://api.stripe.com/v1";

/// Centralized configuration for the billing service
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Credential used for outbound payment-gateway calls
    pub pg_secret_key: String,

    /// Signing secret for inbound webhook verification
    pub pg_webhook_secret: String,

    /// REST base URL of the payment gateway
    pub pg_api_base: String,

    /// Ledger store connection URL
    pub storage_url: String,

    /// Ledger store credential
    pub storage_service_key: String,

    /// Base URL for checkout success/cancel redirects
    pub site_domain: String,

    /// Bearer-token verification key; required by the HTTP surface
    pub auth_jwt_secret: Option<String>,

    /// Tokens granted per successful referral; 0 disables referrals
    pub referral_token_amount: u64,

    /// Optional out-of-band alert delivery endpoint
    pub alert_webhook_url: Option<String>,

    /// Path of the catalog JSON document
    pub catalog_path: PathBuf,

    /// HTTP listen address
    pub bind_addr: String,

    /// Wall-clock budget for handling a single webhook event
    pub event_deadline: Duration,

    /// Inner deadline for a single payment-gateway call
    pub pg_call_deadline: Duration,

    /// Period of the maintenance sweep
    pub maintenance_interval: Duration,

    /// Period of the reconciliation job
    pub reconcile_interval: Duration,
}

impl BillingConfig {
    /// Build the configuration from environment variables.
    ///
    /// # Errors
    /// Returns [`BillingError::Config`] when a required variable is missing
    /// or an optional one fails to parse.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            pg_secret_key: require("PG_SECRET_KEY")?,
            pg_webhook_secret: require("PG_WEBHOOK_SECRET")?,
            pg_api_base: env::var("PG_API_BASE").unwrap_or_else(|_| DEFAULT_PG_API_BASE.into()),
            storage_url: require("STORAGE_URL")?,
            storage_service_key: require("STORAGE_SERVICE_KEY")?,
            site_domain: require("SITE_DOMAIN")?,
            auth_jwt_secret: env::var("AUTH_JWT_SECRET").ok(),
            referral_token_amount: parse_or("REFERRAL_TOKEN_AMOUNT", 0)?,
            alert_webhook_url: env::var("ALERT_CHANNEL_WEBHOOK_URL").ok(),
            catalog_path: env::var("CATALOG_PATH")
                .map_or_else(|_| PathBuf::from("catalog.json"), PathBuf::from),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            event_deadline: Duration::from_secs(parse_or(
                "EVENT_DEADLINE_SECS",
                DEFAULT_EVENT_DEADLINE_SECS,
            )?),
            pg_call_deadline: Duration::from_secs(parse_or(
                "PG_CALL_DEADLINE_SECS",
                DEFAULT_PG_CALL_DEADLINE_SECS,
            )?),
            maintenance_interval: Duration::from_secs(parse_or(
                "MAINTENANCE_INTERVAL_SECS",
                DEFAULT_MAINTENANCE_INTERVAL_SECS,
            )?),
            reconcile_interval: Duration::from_secs(parse_or(
                "RECONCILE_INTERVAL_SECS",
                DEFAULT_RECONCILE_INTERVAL_SECS,
            )?),
        })
    }

    /// Whether referral rewards are enabled.
    #[must_use]
    pub const fn referrals_enabled(&self) -> bool {
        self.referral_token_amount > 0
    }
}

fn require(name: &'static str) -> Result<String> {
    env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BillingError::Config(format!("required environment variable {name} is not set")))
}

fn parse_or(name: &'static str, default: u64) -> Result<u64> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| BillingError::Config(format!("{name} must be an integer, got \"{raw}\""))),
    }
}
