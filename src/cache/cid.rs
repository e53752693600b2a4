//! Content identifiers
//!
//! CIDs are opaque, immutable strings; the cache never parses their
//! internal structure. Equality is string equality.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Number of lock shards keyed by CID hash
pub const CID_SHARD_COUNT: usize = 64;

/// Opaque content identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cid(String);

impl Cid {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory shard prefix: the first four characters (or the whole CID
    /// when shorter), used by the disk tier layout.
    pub fn shard_prefix(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(4)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }

    /// Lock shard index for sharded per-CID state
    #[inline]
    pub fn shard_index(&self) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.0.hash(&mut hasher);
        (hasher.finish() as usize) % CID_SHARD_COUNT
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Cid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Cid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for Cid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Local CID Derivation
// =============================================================================

/// Derive a deterministic CIDv1-style identifier from content bytes.
///
/// Used when no backend is reachable to assign one: base16 multibase
/// prefix, CIDv1, raw codec, sha2-256 multihash over the payload.
pub fn derive_cid(data: &[u8]) -> Cid {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(9 + digest.len() * 2);
    out.push_str("f01551220");
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    Cid(out)
}

/// Hex-encoded SHA-256 of a payload, used by cross-tier integrity checks
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_prefix() {
        let cid = Cid::new("bafybeigdyrzt5example");
        assert_eq!(cid.shard_prefix(), "bafy");

        let short = Cid::new("ab");
        assert_eq!(short.shard_prefix(), "ab");
    }

    #[test]
    fn test_shard_index_stable() {
        let a = Cid::new("bafyabc");
        let b = Cid::new("bafyabc");
        assert_eq!(a.shard_index(), b.shard_index());
        assert!(a.shard_index() < CID_SHARD_COUNT);
    }

    #[test]
    fn test_derive_cid_deterministic() {
        let a = derive_cid(b"hello world");
        let b = derive_cid(b"hello world");
        let c = derive_cid(b"hello worlds");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("f01551220"));
        // multibase prefix + cid header + 32-byte digest in hex
        assert_eq!(a.as_str().len(), 9 + 64);
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        // sha256("") is a fixed vector
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
