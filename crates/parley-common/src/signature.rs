//! Webhook signature helpers
//!
//! Inbound gateway callbacks carry `X-Webhook-Signature: sha256=<hex>` and
//! `X-Webhook-Timestamp: <unix seconds>`. The signature is HMAC-SHA256 keyed
//! by the session's webhook secret over `"{timestamp}.{raw body}"`, so the
//! timestamp cannot be swapped without invalidating the signature.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Reasons a signed request is rejected
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("timestamp is not a unix time")]
    MalformedTimestamp,

    #[error("timestamp outside the replay window ({skew_secs}s skew)")]
    Stale { skew_secs: i64 },

    #[error("signature is not hex encoded")]
    MalformedSignature,

    #[error("signature mismatch")]
    Mismatch,

    #[error("invalid signing key")]
    InvalidKey,
}

fn mac_for(secret: &str, timestamp: &str, body: &[u8]) -> Result<HmacSha256, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac)
}

/// Produce the `X-Webhook-Signature` header value for a body
pub fn sign(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, SignatureError> {
    let mac = mac_for(secret, &timestamp.to_string(), body)?;
    Ok(format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Verify a signed request against `secret`.
///
/// The timestamp must lie within `window_secs` of `now` in either
/// direction. The digest comparison is constant-time.
pub fn verify(
    secret: &str,
    signature: Option<&str>,
    timestamp: Option<&str>,
    body: &[u8],
    now: DateTime<Utc>,
    window_secs: i64,
) -> Result<(), SignatureError> {
    let signature = signature.ok_or(SignatureError::MissingHeader(SIGNATURE_HEADER))?;
    let timestamp = timestamp
        .ok_or(SignatureError::MissingHeader(TIMESTAMP_HEADER))?
        .trim();

    let sent_at: i64 = timestamp
        .parse()
        .map_err(|_| SignatureError::MalformedTimestamp)?;
    let skew_secs = (now.timestamp() - sent_at).abs();
    if skew_secs > window_secs {
        return Err(SignatureError::Stale { skew_secs });
    }

    let hex_digest = signature
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .unwrap_or(signature.trim());
    let expected = hex::decode(hex_digest).map_err(|_| SignatureError::MalformedSignature)?;

    mac_for(secret, timestamp, body)?
        .verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}
