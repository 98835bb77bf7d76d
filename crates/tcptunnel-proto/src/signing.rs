//! Message signing and verification
//!
//! Every control and relay message is a flat JSON object. Signing injects a
//! random `nonce`, the current `timestamp` (epoch ms) and the protocol
//! `version`, then stores an uppercase hex SHA-256 digest of
//! `secret + name1 + value1 + ... + nameN + valueN + secret` (fields sorted by
//! name, `sign` excluded) under `sign`.
//!
//! Verification never errors: it returns a [`VerifyOutcome`] and callers pick
//! the disconnect policy.

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::messages::Fields;
use crate::session::{now_millis, random_string};
use crate::PROTOCOL_VERSION;

/// Default replay tolerance window
pub const DEFAULT_TOLERANCE_MS: i64 = 10_000;

const NONCE_LEN: usize = 16;
const SIGN_FIELD: &str = "sign";

/// Result of checking a signed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Valid,
    MissingNonce,
    MissingTimestamp,
    StaleTimestamp,
    MissingSignature,
    BadSignature,
}

impl VerifyOutcome {
    pub fn is_valid(self) -> bool {
        self == VerifyOutcome::Valid
    }
}

/// Sign `fields` in place with the common fields injected
pub fn sign(secret: &str, fields: &mut Fields) {
    sign_fields(secret, fields, true);
}

/// Sign `fields` in place, optionally injecting `nonce`/`timestamp`/`version`
pub fn sign_fields(secret: &str, fields: &mut Fields, include_common_fields: bool) {
    if include_common_fields {
        fields.insert("nonce".to_string(), Value::from(random_string(NONCE_LEN)));
        fields.insert("timestamp".to_string(), Value::from(now_millis()));
        fields.insert("version".to_string(), Value::from(PROTOCOL_VERSION));
    }
    let signature = compute_signature(secret, fields);
    fields.insert(SIGN_FIELD.to_string(), Value::from(signature));
}

/// Verify a signed message against the current clock and default tolerance
pub fn verify(secret: &str, fields: &Fields) -> VerifyOutcome {
    verify_at(secret, fields, now_millis(), DEFAULT_TOLERANCE_MS)
}

/// Verify a signed message as of `now_ms` with an explicit replay tolerance
pub fn verify_at(secret: &str, fields: &Fields, now_ms: i64, tolerance_ms: i64) -> VerifyOutcome {
    let has_nonce = match fields.get("nonce") {
        Some(Value::String(s)) => !s.is_empty(),
        _ => false,
    };
    if !has_nonce {
        return VerifyOutcome::MissingNonce;
    }

    let Some(timestamp) = fields.get("timestamp").and_then(Value::as_i64) else {
        return VerifyOutcome::MissingTimestamp;
    };
    if now_ms.abs_diff(timestamp) > tolerance_ms.unsigned_abs() {
        return VerifyOutcome::StaleTimestamp;
    }

    let Some(claimed) = fields.get(SIGN_FIELD).and_then(Value::as_str) else {
        return VerifyOutcome::MissingSignature;
    };

    let expected = compute_signature(secret, fields);
    trace!(ok = claimed == expected, "verify signature");
    if claimed == expected {
        VerifyOutcome::Valid
    } else {
        VerifyOutcome::BadSignature
    }
}

fn compute_signature(secret: &str, fields: &Fields) -> String {
    let mut keys: Vec<&String> = fields.keys().filter(|k| *k != SIGN_FIELD).collect();
    keys.sort();

    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    for key in keys {
        hasher.update(key.as_bytes());
        hasher.update(render_value(&fields[key.as_str()]).as_bytes());
    }
    hasher.update(secret.as_bytes());
    format!("{:X}", hasher.finalize())
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
