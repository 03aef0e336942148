//! Plan and price catalog
//!
//! Read-only lookup tables mapping gateway price keys to token grants. The
//! catalog is populated out-of-band (a JSON document shipped with the
//! deployment); the core only reads it. An event referencing an unknown plan
//! key fails with [`BillingError::CatalogMissing`] so the gateway retries
//! after operators fix the catalog.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{BillingError, Result};
use crate::model::{BillingCycle, PlanTier};

/// Catalog row for a recurring subscription price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPrice {
    /// Stable identifier of the gateway price
    pub plan_key: String,
    /// Plan tier
    pub plan_tier: PlanTier,
    /// Billing period length
    pub billing_cycle: BillingCycle,
    /// Tokens granted per billing cycle
    pub tokens_per_cycle: u64,
    /// Monthly refill size for yearly plans; `None` for other cycles
    #[serde(default)]
    pub monthly_refill_tokens: Option<u64>,
    /// Price per cycle in cents
    pub price_cents: i64,
}

/// Catalog row for a one-time token pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPrice {
    /// Stable identifier of the gateway price
    pub plan_key: String,
    /// Pack tier, the `plan_option` value checkout metadata carries
    pub tier: String,
    /// Tokens granted by the pack
    pub tokens: u64,
    /// Pack price in cents
    pub price_cents: i64,
}

/// Serialized catalog document.
#[derive(Debug, Default, Deserialize, Serialize)]
struct CatalogDocument {
    #[serde(default)]
    subscription_prices: Vec<SubscriptionPrice>,
    #[serde(default)]
    token_prices: Vec<TokenPrice>,
}

/// In-memory catalog with plan-key and tier indexes.
#[derive(Debug, Default)]
pub struct Catalog {
    subscriptions_by_key: HashMap<String, SubscriptionPrice>,
    tokens_by_key: HashMap<String, TokenPrice>,
    tokens_by_tier: HashMap<String, TokenPrice>,
}

impl Catalog {
    /// Build a catalog from explicit rows. Later rows win on key collision.
    #[must_use]
    pub fn new(subscriptions: Vec<SubscriptionPrice>, tokens: Vec<TokenPrice>) -> Self {
        let mut catalog = Self::default();
        for row in subscriptions {
            catalog
                .subscriptions_by_key
                .insert(row.plan_key.clone(), row);
        }
        for row in tokens {
            catalog.tokens_by_key.insert(row.plan_key.clone(), row.clone());
            catalog.tokens_by_tier.insert(row.tier.clone(), row);
        }
        catalog
    }

    /// Parse a catalog from its JSON document form.
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: CatalogDocument = serde_json::from_str(json)
            .map_err(|e| BillingError::Config(format!("invalid catalog document: {e}")))?;
        Ok(Self::new(doc.subscription_prices, doc.token_prices))
    }

    /// Load a catalog from a JSON file on disk.
    pub fn from_path(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            BillingError::Config(format!("cannot read catalog {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Look up a subscription price by its gateway plan key.
    pub fn subscription_price(&self, plan_key: &str) -> Result<&SubscriptionPrice> {
        self.subscriptions_by_key
            .get(plan_key)
            .ok_or_else(|| BillingError::CatalogMissing(plan_key.to_owned()))
    }

    /// Look up a one-time token pack by its gateway plan key.
    pub fn token_price(&self, plan_key: &str) -> Result<&TokenPrice> {
        self.tokens_by_key
            .get(plan_key)
            .ok_or_else(|| BillingError::CatalogMissing(plan_key.to_owned()))
    }

    /// Look up a one-time token pack by its tier (the `plan_option` value
    /// carried in checkout metadata).
    pub fn token_price_by_tier(&self, tier: &str) -> Result<&TokenPrice> {
        self.tokens_by_tier
            .get(tier)
            .ok_or_else(|| BillingError::CatalogMissing(tier.to_owned()))
    }
}
