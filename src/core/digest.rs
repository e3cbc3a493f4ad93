//! Content digests.
//!
//! Every identity in the solver (vertices, cache keys, index keys) is a
//! sha-256 digest. Structural digests over composite material are computed by
//! hashing canonical JSON bytes so that identity never depends on map
//! iteration order.

use std::fmt;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as Sha2Digest, Sha256};

use super::error::CoreError;

/// 32-byte sha-256 content digest.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn from_raw(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Digest of raw bytes.
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let out = hasher.finalize();
        let mut buf = [0u8; 32];
        buf.copy_from_slice(&out);
        Self(buf)
    }

    /// Structural digest of a serializable value via canonical JSON.
    pub fn of_canonical<T: Serialize>(value: &T) -> Result<Self, CoreError> {
        Ok(Self::of_bytes(&canon_json_bytes(value)?))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in self.0 {
            use fmt::Write;
            let _ = write!(s, "{:02x}", b);
        }
        s
    }

    pub fn parse_hex(s: &str) -> Result<Self, CoreError> {
        if s.len() != 64 {
            return Err(CoreError::InvalidDigest {
                raw: s.to_string(),
                reason: "expected 64 hex characters".into(),
            });
        }
        let mut buf = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            match (hex_val(chunk[0]), hex_val(chunk[1])) {
                (Some(hi), Some(lo)) => buf[i] = (hi << 4) | lo,
                _ => {
                    return Err(CoreError::InvalidDigest {
                        raw: s.to_string(),
                        reason: "non-hex character".into(),
                    });
                }
            }
        }
        Ok(Self(buf))
    }
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // short form: enough to tell digests apart in traces
        write!(f, "Digest({})", &self.to_hex()[..12])
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Digest::parse_hex(&raw).map_err(D::Error::custom)
    }
}

/// Serialize a value to canonical JSON bytes.
///
/// Canonical rules: object keys sorted by UTF-8 byte order recursively, no
/// insignificant whitespace. Digest material in this crate never contains
/// floats, so no float canonicalization is needed.
pub fn canon_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CoreError> {
    let value = serde_json::to_value(value).map_err(CoreError::DigestMaterial)?;
    let canon = canon_value(value);
    serde_json::to_vec(&canon).map_err(CoreError::DigestMaterial)
}

fn canon_value(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(String, serde_json::Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k, canon_value(v));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(canon_value).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let d = Digest::of_bytes(b"kiln");
        let parsed = Digest::parse_hex(&d.to_hex()).unwrap();
        assert_eq!(d, parsed);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(Digest::parse_hex("abc").is_err());
        assert!(Digest::parse_hex(&"g".repeat(64)).is_err());
    }

    #[test]
    fn canonical_digest_ignores_key_order() {
        let a = serde_json::json!({"b": 1, "a": [2, 3]});
        let b = serde_json::json!({"a": [2, 3], "b": 1});
        assert_eq!(
            Digest::of_canonical(&a).unwrap(),
            Digest::of_canonical(&b).unwrap()
        );
    }

    #[test]
    fn distinct_material_distinct_digest() {
        let a = Digest::of_canonical(&serde_json::json!({"op": "exec"})).unwrap();
        let b = Digest::of_canonical(&serde_json::json!({"op": "fetch"})).unwrap();
        assert_ne!(a, b);
    }
}
