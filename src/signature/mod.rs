//! HMAC-SHA256 signing and verification of webhook payloads.
//!
//! The signature header has the form `t=<unix_ts>,v1=<hex_hmac_sha256>`, where
//! the MAC covers `"{timestamp}.{payload}"` keyed by the endpoint secret.

use std::str::FromStr;

use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_TYPE_HEADER: &str = "X-Webhook-Event-Type";
pub const EVENT_ID_HEADER: &str = "X-Webhook-Event-ID";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

/// Maximum allowed clock skew between signing and verification
pub const DEFAULT_TOLERANCE_SECONDS: i64 = 300;

/// Default secret size in bytes (hex-encoded to twice as many characters)
pub const DEFAULT_SECRET_BYTES: usize = 32;

/// Errors parsing a signature header. Never escapes [`verify`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("invalid digest encoding")]
    InvalidDigest,
}

/// Parsed `t=...,v1=...` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    pub digest: Vec<u8>,
}

impl FromStr for SignatureHeader {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut timestamp = None;
        let mut digest = None;

        for part in s.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => {
                    let ts = value
                        .parse::<i64>()
                        .map_err(|_| SignatureError::InvalidTimestamp(value.to_string()))?;
                    timestamp = Some(ts);
                }
                "v1" => {
                    let bytes = hex::decode(value).map_err(|_| SignatureError::InvalidDigest)?;
                    digest = Some(bytes);
                }
                _ => {}
            }
        }

        Ok(Self {
            timestamp: timestamp.ok_or(SignatureError::MissingField("t"))?,
            digest: digest.ok_or(SignatureError::MissingField("v1"))?,
        })
    }
}

/// The exact body bytes that are sent and signed.
///
/// Strings are used as-is; any other JSON value is serialized compactly.
pub fn canonical_payload(payload: &Value) -> String {
    match payload {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

fn mac_for(secret: &str, timestamp: i64, body: &str) -> HmacSha256 {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    mac
}

/// Sign an already-canonical body.
pub fn sign_raw(body: &str, secret: &str, timestamp: i64) -> String {
    let digest = mac_for(secret, timestamp, body).finalize().into_bytes();
    format!("t={},v1={}", timestamp, hex::encode(digest))
}

/// Sign a payload, returning the `X-Webhook-Signature` header value.
pub fn sign(payload: &Value, secret: &str, timestamp: i64) -> String {
    sign_raw(&canonical_payload(payload), secret, timestamp)
}

/// Verify a signature header against the current time.
pub fn verify(payload: &Value, header: &str, secret: &str, tolerance_secs: i64) -> bool {
    verify_at(
        &canonical_payload(payload),
        header,
        secret,
        tolerance_secs,
        Utc::now().timestamp(),
    )
}

/// Verify a signature header for a raw body at a given `now`.
///
/// Fails closed: malformed headers, stale timestamps and MAC mismatches all
/// return `false`. The MAC comparison is constant-time.
pub fn verify_at(body: &str, header: &str, secret: &str, tolerance_secs: i64, now: i64) -> bool {
    let parsed = match header.parse::<SignatureHeader>() {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!(error = %e, "Rejecting malformed signature header");
            return false;
        }
    };

    if now.abs_diff(parsed.timestamp) > tolerance_secs.unsigned_abs() {
        tracing::debug!(
            timestamp = parsed.timestamp,
            now,
            "Rejecting signature outside tolerance window"
        );
        return false;
    }

    mac_for(secret, parsed.timestamp, body)
        .verify_slice(&parsed.digest)
        .is_ok()
}

/// Generate a random hex-encoded secret of `byte_len` bytes.
pub fn generate_secret(byte_len: usize) -> String {
    let mut bytes = vec![0u8; byte_len];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "whsec_test";

    #[test]
    fn test_sign_format() {
        let sig = sign(&json!({"id": 1}), SECRET, 1_700_000_000);

        assert!(sig.starts_with("t=1700000000,v1="));
        let digest = sig.split("v1=").nth(1).unwrap();
        assert_eq!(digest.len(), 64);
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let payload = json!({"order_id": "ord_1", "total": 42.5});
        let now = Utc::now().timestamp();
        let header = sign(&payload, SECRET, now);

        assert!(verify(&payload, &header, SECRET, DEFAULT_TOLERANCE_SECONDS));
    }

    #[test]
    fn test_string_payload_is_signed_verbatim() {
        let raw = r#"{"b":1,"a":2}"#;
        let from_string = sign(&Value::String(raw.to_string()), SECRET, 100);

        assert_eq!(from_string, sign_raw(raw, SECRET, 100));
    }

    #[test]
    fn test_stale_signature_rejected() {
        let body = r#"{"id":1}"#;
        let header = sign_raw(body, SECRET, 1_000);

        assert!(verify_at(body, &header, SECRET, 300, 1_300));
        assert!(!verify_at(body, &header, SECRET, 300, 1_301));
        assert!(!verify_at(body, &header, SECRET, 300, 699));
    }

    #[test]
    fn test_tampered_payload_or_wrong_secret_rejected() {
        let header = sign_raw(r#"{"amount":10}"#, SECRET, 500);

        assert!(!verify_at(r#"{"amount":1000}"#, &header, SECRET, 300, 500));
        assert!(!verify_at(r#"{"amount":10}"#, &header, "other", 300, 500));
    }

    #[test]
    fn test_malformed_headers_fail_closed() {
        let body = "{}";
        for header in [
            "",
            "garbage",
            "t=abc,v1=00",
            "t=500",
            "v1=deadbeef",
            "t=500,v1=not-hex",
            "t=500,v1=",
            "t=-9223372036854775808,v1=00",
            "t=9223372036854775807,v1=00",
        ] {
            assert!(!verify_at(body, header, SECRET, 300, 500), "{header:?}");
            assert!(!verify_at(body, header, SECRET, 300, -1_700_000_000), "{header:?}");
        }
    }

    #[test]
    fn test_header_parse_ignores_unknown_fields() {
        let parsed: SignatureHeader = "t=10, v0=zz, v1=abcd".parse().unwrap();
        assert_eq!(parsed.timestamp, 10);
        assert_eq!(parsed.digest, vec![0xab, 0xcd]);

        assert_eq!(
            "v1=abcd".parse::<SignatureHeader>(),
            Err(SignatureError::MissingField("t"))
        );
    }

    #[test]
    fn test_generate_secret() {
        let a = generate_secret(DEFAULT_SECRET_BYTES);
        let b = generate_secret(DEFAULT_SECRET_BYTES);

        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
        assert_eq!(generate_secret(8).len(), 16);
    }
}
