//! Entry signatures: HMAC-SHA256 over a canonical, key-sorted JSON form.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::entry::{AuditEntry, SIGNATURE_ALGORITHM};
use super::AuditError;
use crate::core::safety::constant_time_compare;

type HmacSha256 = Hmac<Sha256>;

/// Raw key length in bytes.
pub const KEY_LEN: usize = 32;

/// Hex length of a SHA-256 digest
const SIGNATURE_HEX_LEN: usize = 64;

const FINGERPRINT_LEN: usize = 16;

/// Fields excluded from the signed form.
pub const UNSIGNED_FIELDS: [&str; 2] = ["_signature", "_sigAlg"];

/// 256-bit HMAC key.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKey([u8; KEY_LEN]);

impl SigningKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AuditError> {
        let raw: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| AuditError::InvalidKey { len: bytes.len() })?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Short public identifier: leading hex of SHA-256(key).
    pub fn fingerprint(&self) -> String {
        let digest = hex::encode(Sha256::digest(self.0));
        digest[..FINGERPRINT_LEN].to_string()
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKey({})", self.fingerprint())
    }
}

/// Serialize with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
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
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
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

/// The signed form of an entry: every field except `_signature` / `_sigAlg`.
pub fn signing_payload(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut payload = map.clone();
            for field in UNSIGNED_FIELDS {
                payload.remove(field);
            }
            canonical_json(&Value::Object(payload))
        }
        other => canonical_json(other),
    }
}

/// Hex HMAC-SHA256 of a raw JSON entry's signed form.
pub fn signature_for_value(value: &Value, key: &SigningKey) -> String {
    // HMAC takes keys of any length
    let mut mac = match HmacSha256::new_from_slice(key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(signing_payload(value).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn generate_entry_signature(entry: &AuditEntry, key: &SigningKey) -> String {
    signature_for_value(&entry.to_value(), key)
}

/// Signed copy of `entry`. Existing fields are left as they are; `_keyId`,
/// `_signature` and `_sigAlg` are (re)written.
pub fn sign_entry(entry: &AuditEntry, key: &SigningKey) -> AuditEntry {
    let mut signed = entry.unsigned();
    signed.key_id = Some(key.fingerprint());
    signed.signature = Some(generate_entry_signature(&signed, key));
    signed.sig_alg = Some(SIGNATURE_ALGORITHM.to_string());
    signed
}

pub fn verify_entry_signature(entry: &AuditEntry, key: &SigningKey) -> bool {
    verify_value_signature(&entry.to_value(), key)
}

/// Check a raw entry against `key`. False for missing, malformed or
/// mismatched signatures, or a foreign `_sigAlg`.
pub fn verify_value_signature(value: &Value, key: &SigningKey) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };

    let Some(stored) = obj.get("_signature").and_then(Value::as_str) else {
        return false;
    };

    if !is_well_formed_signature(stored) {
        return false;
    }

    if let Some(alg) = obj.get("_sigAlg") {
        if alg.as_str() != Some(SIGNATURE_ALGORITHM) {
            return false;
        }
    }

    let expected = signature_for_value(value, key);
    constant_time_compare(&expected, stored)
}

/// Check a raw entry against every key in `ring`, trying the key named by
/// `_keyId` first.
pub fn verify_with_ring(value: &Value, ring: &[SigningKey]) -> bool {
    let named = value.get("_keyId").and_then(Value::as_str);

    let (preferred, rest): (Vec<&SigningKey>, Vec<&SigningKey>) = ring
        .iter()
        .partition(|key| named.is_some_and(|id| constant_time_compare(&key.fingerprint(), id)));

    preferred
        .into_iter()
        .chain(rest)
        .any(|key| verify_value_signature(value, key))
}

pub fn is_well_formed_signature(signature: &str) -> bool {
    signature.len() == SIGNATURE_HEX_LEN && signature.bytes().all(|b| b.is_ascii_hexdigit())
}
