//! Tier trait
//!
//! Each storage level implements this trait so the orchestrator can treat
//! memory, disk, and remote CAS uniformly. Tiers own their internal state
//! and serialize their own writes; they never hold back-pointers into the
//! cache — metadata travels in as an optional value on `put`.

use crate::cache::cid::Cid;
use crate::cache::entry::ContentMetadata;
use crate::config::TierKind;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;

// =============================================================================
// Tier Trait
// =============================================================================

/// A single prioritized storage location
#[async_trait]
pub trait Tier: Send + Sync {
    /// Unique tier name
    fn name(&self) -> &str;

    /// Storage kind
    fn kind(&self) -> TierKind;

    /// Lookup priority, lower = faster
    fn priority(&self) -> u32;

    /// Capacity in bytes; None = unbounded
    fn capacity_bytes(&self) -> Option<u64>;

    /// Bytes currently held
    fn used_bytes(&self) -> u64;

    /// Entries currently held
    fn entry_count(&self) -> u64;

    /// Per-item size cap; None = only bounded by capacity
    fn max_item_size(&self) -> Option<u64> {
        None
    }

    /// Whether an item of `size` bytes is admissible at all
    fn accepts_size(&self, size: u64) -> bool {
        if let Some(limit) = self.max_item_size() {
            if size > limit {
                return false;
            }
        }
        match self.capacity_bytes() {
            Some(capacity) => size <= capacity,
            None => true,
        }
    }

    /// Whether this tier survives process restart
    fn is_durable(&self) -> bool {
        self.kind() != TierKind::Memory
    }

    async fn has(&self, cid: &Cid) -> Result<bool>;

    /// Fetch the payload; Ok(None) on a clean miss
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>>;

    /// Fetch without touching access statistics (integrity scrubs,
    /// replication reads)
    async fn peek(&self, cid: &Cid) -> Result<Option<Bytes>> {
        self.get(cid).await
    }

    /// Store the payload, evicting colder entries as needed
    async fn put(&self, cid: &Cid, data: Bytes, meta: Option<&ContentMetadata>) -> Result<()>;

    /// Remove the payload; true if it was present
    async fn evict(&self, cid: &Cid) -> Result<bool>;

    /// All resident CIDs (may be expensive on large tiers)
    async fn cids(&self) -> Result<Vec<Cid>>;

    /// Probe availability
    async fn health_check(&self) -> Result<bool>;
}

/// Shared tier handle
pub type TierRef = Arc<dyn Tier>;

// =============================================================================
// Tier Status
// =============================================================================

/// Point-in-time view of one tier for stats and health reporting
#[derive(Debug, Clone, Serialize)]
pub struct TierStatus {
    pub name: String,
    pub kind: TierKind,
    pub priority: u32,
    pub capacity_bytes: Option<u64>,
    pub used_bytes: u64,
    pub entry_count: u64,
    pub healthy: bool,
    /// Epoch seconds of the last health probe; 0 = never probed
    pub last_probe_at: u64,
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    /// Minimal scriptable tier for orchestrator tests
    pub struct FakeTier {
        name: String,
        kind: TierKind,
        priority: u32,
        pub entries: DashMap<String, Bytes>,
        pub healthy: AtomicBool,
        pub fail_writes: AtomicBool,
        used: AtomicU64,
        max_item: Option<u64>,
    }

    impl FakeTier {
        pub fn new(name: &str, kind: TierKind, priority: u32) -> Self {
            Self {
                name: name.to_string(),
                kind,
                priority,
                entries: DashMap::new(),
                healthy: AtomicBool::new(true),
                fail_writes: AtomicBool::new(false),
                used: AtomicU64::new(0),
                max_item: None,
            }
        }

        pub fn with_max_item(mut self, limit: u64) -> Self {
            self.max_item = Some(limit);
            self
        }

        pub fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }

        /// Flip one byte of a stored payload, simulating silent corruption
        pub fn corrupt(&self, cid: &Cid) {
            if let Some(mut entry) = self.entries.get_mut(cid.as_str()) {
                let mut bytes = entry.value().to_vec();
                if let Some(first) = bytes.first_mut() {
                    *first ^= 0xff;
                }
                *entry.value_mut() = Bytes::from(bytes);
            }
        }
    }

    #[async_trait]
    impl Tier for FakeTier {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> TierKind {
            self.kind
        }

        fn priority(&self) -> u32 {
            self.priority
        }

        fn capacity_bytes(&self) -> Option<u64> {
            None
        }

        fn used_bytes(&self) -> u64 {
            self.used.load(Ordering::Relaxed)
        }

        fn entry_count(&self) -> u64 {
            self.entries.len() as u64
        }

        fn max_item_size(&self) -> Option<u64> {
            self.max_item
        }

        async fn has(&self, cid: &Cid) -> Result<bool> {
            Ok(self.entries.contains_key(cid.as_str()))
        }

        async fn get(&self, cid: &Cid) -> Result<Option<Bytes>> {
            Ok(self.entries.get(cid.as_str()).map(|e| e.value().clone()))
        }

        async fn put(&self, cid: &Cid, data: Bytes, _meta: Option<&ContentMetadata>) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(crate::error::Error::WriteFailed {
                    tier: self.name.clone(),
                    cid: cid.to_string(),
                    cause: "scripted failure".into(),
                });
            }
            if let Some(limit) = self.max_item {
                if data.len() as u64 > limit {
                    return Err(crate::error::Error::TooLarge {
                        tier: self.name.clone(),
                        size: data.len() as u64,
                        limit,
                    });
                }
            }
            let len = data.len() as u64;
            if self.entries.insert(cid.as_str().to_string(), data).is_none() {
                self.used.fetch_add(len, Ordering::Relaxed);
            }
            Ok(())
        }

        async fn evict(&self, cid: &Cid) -> Result<bool> {
            if let Some((_, data)) = self.entries.remove(cid.as_str()) {
                self.used.fetch_sub(data.len() as u64, Ordering::Relaxed);
                Ok(true)
            } else {
                Ok(false)
            }
        }

        async fn cids(&self) -> Result<Vec<Cid>> {
            Ok(self.entries.iter().map(|e| Cid::new(e.key().clone())).collect())
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(self.healthy.load(Ordering::SeqCst))
        }
    }
}
