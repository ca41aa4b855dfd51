//! HMAC-SHA256 webhook signatures.
//!
//! Two signing inputs are in use: the raw request body, and a canonical JSON
//! rendering of the payload (keys sorted, every scalar stringified, the
//! `signature` field dropped, `/` escaped) for gateways that sign form data
//! rather than bytes.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &[u8]) -> Option<HmacSha256> {
    HmacSha256::new_from_slice(secret).ok()
}

/// Hex-encoded HMAC-SHA256 of `data`.
pub fn sign_hex(secret: &[u8], data: &[u8]) -> String {
    match mac(secret) {
        Some(mut mac) => {
            mac.update(data);
            hex::encode(mac.finalize().into_bytes())
        }
        None => String::new(),
    }
}

/// Constant-time check of a hex signature. Empty secrets never verify.
pub fn verify_hex(secret: &[u8], data: &[u8], signature_hex: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    match mac(secret) {
        Some(mut mac) => {
            mac.update(data);
            mac.verify_slice(&expected).is_ok()
        }
        None => false,
    }
}

/// Canonical signing string for a JSON payload.
pub fn canonical_json(payload: &Value) -> String {
    let mut out = String::new();
    match payload {
        Value::Object(map) => {
            let mut filtered = map.clone();
            filtered.remove("signature");
            write_canonical(&Value::Object(filtered), &mut out);
        }
        other => write_canonical(other, &mut out),
    }
    out.replace('/', "\\/")
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&quote(key));
                out.push(':');
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
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
        Value::String(s) => out.push_str(&quote(s)),
        Value::Number(n) => out.push_str(&quote(&n.to_string())),
        Value::Bool(b) => out.push_str(&quote(if *b { "true" } else { "false" })),
        Value::Null => out.push_str("\"\""),
    }
}

fn quote(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

/// Signs a payload with the canonical JSON scheme.
pub fn sign_canonical(secret: &[u8], payload: &Value) -> String {
    sign_hex(secret, canonical_json(payload).as_bytes())
}

pub fn verify_canonical(secret: &[u8], payload: &Value, signature_hex: &str) -> bool {
    verify_hex(secret, canonical_json(payload).as_bytes(), signature_hex)
}

/// Non-empty string (or number) field of a JSON object.
pub fn field_str(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
