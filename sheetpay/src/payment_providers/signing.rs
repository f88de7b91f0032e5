//! Hashing and HMAC helpers shared by the gateway adapters.
//!
//! Gateway checkout forms are signed with plain SHA-256 digests over `key=value&...`
//! strings. Webhooks are signed with HMAC-SHA256 over `{timestamp}.{body}`, hex encoded,
//! and are rejected when the timestamp is further than [`WEBHOOK_TOLERANCE_SECS`] from now.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::{PaymentError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Maximum clock skew accepted on a webhook timestamp.
pub const WEBHOOK_TOLERANCE_SECS: i64 = 300;

/// Lowercase hex SHA-256 digest.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Sign a webhook payload.
///
/// The signature is computed over: `{timestamp}.{payload}`
pub fn sign_webhook(secret: &str, timestamp: i64, payload: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a webhook signature against the raw body.
///
/// `timestamp` is the header value in unix seconds.
pub fn verify_webhook(secret: &str, timestamp: &str, payload: &str, signature: &str, now: DateTime<Utc>) -> Result<()> {
    let timestamp: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| PaymentError::InvalidData("Invalid webhook timestamp".to_string()))?;

    if (now.timestamp() - timestamp).abs() > WEBHOOK_TOLERANCE_SECS {
        tracing::warn!("Webhook timestamp {} outside tolerance", timestamp);
        return Err(PaymentError::SignatureInvalid);
    }

    let expected = sign_webhook(secret, timestamp, payload).ok_or(PaymentError::SignatureInvalid)?;

    // Use constant-time comparison to prevent timing attacks
    if constant_time_eq(signature.trim().to_ascii_lowercase().as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(PaymentError::SignatureInvalid)
    }
}

/// Constant-time byte comparison to prevent timing attacks.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
