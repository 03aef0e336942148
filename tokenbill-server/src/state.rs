//! Shared application state
//!
//! Everything the HTTP handlers and workers need, dependency-injected once
//! at startup. All members are cheap to clone; axum clones the state per
//! request.

use std::sync::Arc;

use tokenbill_core::catalog::Catalog;
use tokenbill_core::config::BillingConfig;
use tokenbill_core::dispatcher::{DispatchSettings, EventDispatcher};
use tokenbill_core::gateway::PaymentGateway;
use tokenbill_core::ledger::TokenLedger;
use tokenbill_core::store::LedgerStore;

use crate::auth::AuthVerifier;

/// Application-wide state shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<LedgerStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub catalog: Arc<Catalog>,
    pub dispatcher: Arc<EventDispatcher>,
    pub ledger: Arc<TokenLedger>,
    pub auth: AuthVerifier,
    pub config: Arc<BillingConfig>,
}

impl AppState {
    /// Assemble the state from its collaborators.
    ///
    /// # Errors
    /// Fails when the configuration misses the auth secret; the process must
    /// not come up without a way to verify bearer tokens.
    pub fn assemble(
        store: Arc<LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<Catalog>,
        config: BillingConfig,
    ) -> Result<Self, tokenbill_core::BillingError> {
        let auth_secret = config.auth_jwt_secret.as_deref().ok_or_else(|| {
            tokenbill_core::BillingError::Config(
                "required environment variable AUTH_JWT_SECRET is not set".into(),
            )
        })?;
        let auth = AuthVerifier::new(auth_secret);

        let dispatcher = Arc::new(EventDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            Arc::clone(&catalog),
            DispatchSettings::from_config(&config),
        ));
        let ledger = Arc::new(TokenLedger::new(Arc::clone(&store)));

        Ok(Self {
            store,
            gateway,
            catalog,
            dispatcher,
            ledger,
            auth,
            config: Arc::new(config),
        })
    }
}
