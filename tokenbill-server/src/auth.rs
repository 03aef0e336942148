//! Bearer-token authentication
//!
//! The UI collaborator authenticates callers and mints HS256 bearer tokens;
//! this layer only verifies them. The `sub` claim is the local user id; the
//! optional `email` claim lets the first authenticated interaction create
//! the user row.

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by an accepted bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Local user id
    pub sub: String,
    /// Email, used to create the user row on first interaction
    #[serde(default)]
    pub email: Option<String>,
    /// Expiry (unix seconds); enforced by validation
    #[serde(default)]
    pub exp: i64,
}

/// HS256 bearer-token verifier.
#[derive(Clone)]
pub struct AuthVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl AuthVerifier {
    /// Build a verifier for the shared signing secret.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verify an `Authorization` header value and return its claims.
    ///
    /// # Errors
    /// Returns a human-readable rejection for a missing header, a
    /// non-bearer scheme, or an invalid token.
    pub fn verify_bearer(&self, authorization: Option<&str>) -> Result<Claims, String> {
        let header = authorization.ok_or_else(|| "missing authorization header".to_owned())?;
        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .ok_or_else(|| "authorization header is not a bearer token".to_owned())?;

        jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| format!("invalid bearer token: {e}"))
    }
}
