//! Webhook signature verification
//!
//! The payment gateway signs every delivery with an HMAC-SHA256 over
//! `"{timestamp}.{raw body}"` and ships it in a header shaped like
//! `t=<unix>,v1=<hex>`. Verification re-computes the MAC over the exact raw
//! bytes, so the transport layer must hand the body through unmodified.
//! Several `v1` entries may be present during signing-secret rotation; any
//! one matching accepts the delivery.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::constants::SIGNATURE_TOLERANCE_SECS;
use crate::errors::{BillingError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Verify a webhook signature header against the raw payload.
///
/// # Errors
/// Returns [`BillingError::BadSignature`] when the header is malformed, the
/// timestamp falls outside the replay tolerance, or no `v1` entry matches.
pub fn verify(
    secret: &str,
    signature_header: &str,
    payload: &[u8],
    now: DateTime<Utc>,
) -> Result<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<Vec<u8>> = Vec::new();

    for part in signature_header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => {
                timestamp = Some(value.parse().map_err(|_| {
                    BillingError::BadSignature(format!("invalid timestamp \"{value}\""))
                })?);
            }
            "v1" => {
                let bytes = hex::decode(value).map_err(|_| {
                    BillingError::BadSignature("signature is not valid hex".into())
                })?;
                candidates.push(bytes);
            }
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| BillingError::BadSignature("header carries no timestamp".into()))?;
    if candidates.is_empty() {
        return Err(BillingError::BadSignature(
            "header carries no v1 signature".into(),
        ));
    }

    let age = (now.timestamp() - timestamp).abs();
    if age > SIGNATURE_TOLERANCE_SECS {
        return Err(BillingError::BadSignature(format!(
            "timestamp outside tolerance ({age}s old, limit {SIGNATURE_TOLERANCE_SECS}s)"
        )));
    }

    for candidate in &candidates {
        let mut mac = mac_for(secret);
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        // verify_slice is constant-time.
        if mac.verify_slice(candidate).is_ok() {
            return Ok(());
        }
    }

    Err(BillingError::BadSignature(
        "no signature matched the payload".into(),
    ))
}

/// Produce a signature header for a payload, as the gateway would.
///
/// Used by the test harness and event simulators; the production path only
/// ever verifies.
#[must_use]
pub fn sign(secret: &str, payload: &[u8], at: DateTime<Utc>) -> String {
    let timestamp = at.timestamp();
    let mut mac = mac_for(secret);
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let digest = mac.finalize().into_bytes();
    format!("t={timestamp},v1={}", hex::encode(digest))
}

fn mac_for(secret: &str) -> HmacSha256 {
    HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size")
}
