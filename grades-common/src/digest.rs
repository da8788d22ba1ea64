//! Canonical JSON digests
//!
//! Used for `visible_blocks_hash` and `grading_policy_hash`: object keys are
//! sorted, separators are compact, and the SHA-256 of the result is base64
//! encoded.

use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render a JSON value with sorted object keys and no whitespace
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(val, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// base64(SHA-256(bytes))
pub fn sha256_base64(bytes: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(bytes))
}

/// Serialize a value, canonicalize it and hash it
///
/// Returns the canonical JSON alongside the digest so callers can persist both.
pub fn hash_canonical<T: Serialize>(value: &T) -> Result<(String, String)> {
    let json = serde_json::to_value(value)
        .map_err(|e| Error::Internal(format!("Failed to serialize for hashing: {}", e)))?;
    let canonical = canonical_json(&json);
    let digest = sha256_base64(canonical.as_bytes());
    Ok((canonical, digest))
}
