//! Content metadata
//!
//! The cache owns one metadata record per known CID. Payload bytes are
//! immutable (the store is content-addressed); records change only through
//! access accounting, pinning, and tier migration.

use crate::cache::cid::Cid;
use serde::{Deserialize, Serialize};

// =============================================================================
// Migration History
// =============================================================================

/// One completed cross-tier move
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub from_tier: String,
    pub to_tier: String,
    /// Epoch seconds at completion
    pub at: u64,
}

// =============================================================================
// Content Metadata
// =============================================================================

/// Per-CID record in the cache's metadata index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentMetadata {
    pub cid: Cid,
    /// Payload length in bytes
    pub size: u64,
    /// Epoch seconds at first put
    pub added_at: u64,
    /// Epoch seconds at last read or re-put
    pub last_access_at: u64,
    pub access_count: u64,
    /// Authoritative tier: the fastest tier holding the content at the
    /// time of the last successful get
    pub current_tier: String,
    /// Caller asked for durability
    pub pinned: bool,
    #[serde(default)]
    pub migration_history: Vec<MigrationRecord>,
}

impl ContentMetadata {
    pub fn new(cid: Cid, size: u64, tier: impl Into<String>, now: u64) -> Self {
        Self {
            cid,
            size,
            added_at: now,
            last_access_at: now,
            access_count: 0,
            current_tier: tier.into(),
            pinned: false,
            migration_history: Vec::new(),
        }
    }

    /// Record a read
    pub fn record_access(&mut self, now: u64) {
        self.last_access_at = now;
        self.access_count += 1;
    }

    /// Record a completed migration and move authority to the target tier
    pub fn record_migration(&mut self, from: &str, to: &str, now: u64) {
        self.migration_history.push(MigrationRecord {
            from_tier: from.to_string(),
            to_tier: to.to_string(),
            at: now,
        });
        self.current_tier = to.to_string();
    }

    /// Seconds since the last access
    pub fn idle_seconds(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_access_at)
    }
}

// =============================================================================
// Pins
// =============================================================================

/// How a pin is held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinKind {
    Direct,
    Recursive,
    Indirect,
}

impl std::fmt::Display for PinKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PinKind::Direct => write!(f, "direct"),
            PinKind::Recursive => write!(f, "recursive"),
            PinKind::Indirect => write!(f, "indirect"),
        }
    }
}

/// One pinned CID as reported by `list_pins`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinInfo {
    pub cid: Cid,
    #[serde(rename = "type")]
    pub kind: PinKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_recording() {
        let mut meta = ContentMetadata::new(Cid::new("bafyabc"), 11, "memory", 1000);
        assert_eq!(meta.access_count, 0);
        assert_eq!(meta.added_at, 1000);

        meta.record_access(1010);
        meta.record_access(1020);
        assert_eq!(meta.access_count, 2);
        assert_eq!(meta.last_access_at, 1020);
        assert_eq!(meta.idle_seconds(1100), 80);
    }

    #[test]
    fn test_migration_moves_authority() {
        let mut meta = ContentMetadata::new(Cid::new("bafyabc"), 11, "memory", 1000);
        meta.record_migration("memory", "disk", 2000);

        assert_eq!(meta.current_tier, "disk");
        assert_eq!(meta.migration_history.len(), 1);
        assert_eq!(meta.migration_history[0].from_tier, "memory");
        assert_eq!(meta.migration_history[0].at, 2000);
    }

    #[test]
    fn test_metadata_serde_round_trip() {
        let mut meta = ContentMetadata::new(Cid::new("bafyabc"), 42, "disk", 500);
        meta.pinned = true;
        meta.record_migration("disk", "ipfs_local", 600);

        let json = serde_json::to_string(&meta).unwrap();
        let parsed: ContentMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.cid, meta.cid);
        assert_eq!(parsed.current_tier, "ipfs_local");
        assert!(parsed.pinned);
        assert_eq!(parsed.migration_history, meta.migration_history);
    }
}
