//! Memory tier
//!
//! Bounded in-process CID→bytes map backed by DashMap. Eviction picks the
//! entry with the lowest heat score; the heat model is injected, the tier
//! does not score anything itself. A resident CID with no access record
//! (possible after restart) scores 0 and is evicted first.

use crate::cache::cid::Cid;
use crate::cache::entry::ContentMetadata;
use crate::cache::heat::HeatModel;
use crate::cache::tier::Tier;
use crate::config::TierKind;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// In-memory cache tier
pub struct MemoryTier {
    name: String,
    priority: u32,
    capacity_bytes: u64,
    max_item_size: Option<u64>,
    entries: DashMap<String, Bytes>,
    used_bytes: AtomicU64,
    entry_count: AtomicU64,
    hits: AtomicU64,
    heat: Arc<HeatModel>,
}

impl MemoryTier {
    pub fn new(
        name: impl Into<String>,
        priority: u32,
        capacity_bytes: u64,
        max_item_size: Option<u64>,
        heat: Arc<HeatModel>,
    ) -> Self {
        Self {
            name: name.into(),
            priority,
            capacity_bytes,
            max_item_size,
            entries: DashMap::new(),
            used_bytes: AtomicU64::new(0),
            entry_count: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            heat,
        }
    }

    /// Hits served by this tier since startup
    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Pick the coldest resident entry: minimum heat, ties broken by the
    /// older last access, then lexicographic CID for determinism.
    fn coldest_resident(&self) -> Option<Cid> {
        let mut coldest: Option<(f64, u64, Cid)> = None;
        for entry in self.entries.iter() {
            let cid = Cid::new(entry.key().clone());
            let score = self.heat.heat_score(&cid);
            let last_access = self.heat.record(&cid).map(|r| r.last_access).unwrap_or(0);
            let candidate = (score, last_access, cid);
            coldest = match coldest {
                None => Some(candidate),
                Some(current) => {
                    let replace = candidate.0 < current.0
                        || (candidate.0 == current.0 && candidate.1 < current.1)
                        || (candidate.0 == current.0
                            && candidate.1 == current.1
                            && candidate.2 < current.2);
                    if replace {
                        Some(candidate)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        coldest.map(|(_, _, cid)| cid)
    }

    fn remove_entry(&self, cid: &Cid) -> Option<Bytes> {
        self.entries.remove(cid.as_str()).map(|(_, data)| {
            self.entry_count.fetch_sub(1, Ordering::Relaxed);
            self.used_bytes.fetch_sub(data.len() as u64, Ordering::Relaxed);
            data
        })
    }

    fn make_room(&self, needed: u64) {
        while self.used_bytes.load(Ordering::Relaxed) + needed > self.capacity_bytes {
            let Some(victim) = self.coldest_resident() else {
                break;
            };
            if self.remove_entry(&victim).is_some() {
                debug!(tier = %self.name, cid = %victim, "evicted coldest entry");
            }
        }
    }
}

#[async_trait]
impl Tier for MemoryTier {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TierKind {
        TierKind::Memory
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn capacity_bytes(&self) -> Option<u64> {
        Some(self.capacity_bytes)
    }

    fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }

    fn entry_count(&self) -> u64 {
        self.entry_count.load(Ordering::Relaxed)
    }

    fn max_item_size(&self) -> Option<u64> {
        self.max_item_size
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.entries.contains_key(cid.as_str()))
    }

    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>> {
        match self.entries.get(cid.as_str()) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.value().clone()))
            }
            None => Ok(None),
        }
    }

    async fn peek(&self, cid: &Cid) -> Result<Option<Bytes>> {
        Ok(self.entries.get(cid.as_str()).map(|e| e.value().clone()))
    }

    async fn put(&self, cid: &Cid, data: Bytes, _meta: Option<&ContentMetadata>) -> Result<()> {
        let size = data.len() as u64;
        let limit = self.max_item_size.unwrap_or(self.capacity_bytes).min(self.capacity_bytes);
        if size > limit {
            return Err(Error::TooLarge {
                tier: self.name.clone(),
                size,
                limit,
            });
        }

        // Replacing an identical CID frees its old footprint first
        let old_size = self
            .entries
            .get(cid.as_str())
            .map(|e| e.value().len() as u64)
            .unwrap_or(0);
        let net = size.saturating_sub(old_size);
        if net > 0 {
            self.make_room(net);
        }

        if self
            .entries
            .insert(cid.as_str().to_string(), data)
            .is_none()
        {
            self.entry_count.fetch_add(1, Ordering::Relaxed);
            self.used_bytes.fetch_add(size, Ordering::Relaxed);
        } else if size >= old_size {
            self.used_bytes.fetch_add(size - old_size, Ordering::Relaxed);
        } else {
            self.used_bytes.fetch_sub(old_size - size, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn evict(&self, cid: &Cid) -> Result<bool> {
        Ok(self.remove_entry(cid).is_some())
    }

    async fn cids(&self) -> Result<Vec<Cid>> {
        Ok(self
            .entries
            .iter()
            .map(|e| Cid::new(e.key().clone()))
            .collect())
    }

    async fn health_check(&self) -> Result<bool> {
        // Reaching this code means the process heap is alive
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn tier_with_clock(capacity: u64) -> (MemoryTier, Arc<ManualClock>, Arc<HeatModel>) {
        let clock = Arc::new(ManualClock::at(1_000_000));
        let heat = Arc::new(HeatModel::new(clock.clone(), 10_000));
        let tier = MemoryTier::new("memory", 1, capacity, None, heat.clone());
        (tier, clock, heat)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (tier, _, _) = tier_with_clock(1024);
        let cid = Cid::new("bafyabc");

        tier.put(&cid, Bytes::from("hello world"), None).await.unwrap();
        assert_eq!(tier.used_bytes(), 11);
        assert_eq!(tier.entry_count(), 1);

        let data = tier.get(&cid).await.unwrap().unwrap();
        assert_eq!(data.as_ref(), b"hello world");
        assert_eq!(tier.hit_count(), 1);

        assert!(tier.has(&cid).await.unwrap());
        assert!(tier.evict(&cid).await.unwrap());
        assert_eq!(tier.used_bytes(), 0);
        assert!(!tier.has(&cid).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_length_content_is_cacheable() {
        let (tier, _, _) = tier_with_clock(1024);
        let cid = Cid::new("bafyempty");

        tier.put(&cid, Bytes::new(), None).await.unwrap();
        let data = tier.get(&cid).await.unwrap().unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_too_large_rejected() {
        let (tier, _, _) = tier_with_clock(100);
        let cid = Cid::new("bafybig");

        let err = tier
            .put(&cid, Bytes::from(vec![0u8; 200]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TooLarge { .. }));
        assert_eq!(tier.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_eviction_prefers_lowest_heat() {
        // Capacity 300: three 100-byte items fit, a fourth forces eviction
        let (tier, clock, heat) = tier_with_clock(300);

        let a = Cid::new("bafy-a");
        let b = Cid::new("bafy-b");
        let c = Cid::new("bafy-c");

        for cid in [&a, &b, &c] {
            tier.put(cid, Bytes::from(vec![0u8; 100]), None).await.unwrap();
            heat.record_access(cid);
            clock.advance(1);
        }
        // A is accessed twice: strictly hottest
        heat.record_access(&a);
        clock.advance(1);

        tier.put(&Cid::new("bafy-d"), Bytes::from(vec![0u8; 100]), None)
            .await
            .unwrap();

        // A must survive; exactly one of B/C was evicted (B is older on tie)
        assert!(tier.has(&a).await.unwrap());
        assert!(!tier.has(&b).await.unwrap());
        assert!(tier.has(&c).await.unwrap());
        assert_eq!(tier.entry_count(), 3);
    }

    #[tokio::test]
    async fn test_unscored_resident_evicted_first() {
        let (tier, _, heat) = tier_with_clock(200);

        let tracked = Cid::new("bafy-tracked");
        let orphan = Cid::new("bafy-orphan");

        tier.put(&orphan, Bytes::from(vec![0u8; 100]), None).await.unwrap();
        tier.put(&tracked, Bytes::from(vec![0u8; 100]), None).await.unwrap();
        heat.record_access(&tracked);

        tier.put(&Cid::new("bafy-new"), Bytes::from(vec![0u8; 100]), None)
            .await
            .unwrap();

        assert!(tier.has(&tracked).await.unwrap());
        assert!(!tier.has(&orphan).await.unwrap());
    }

    #[tokio::test]
    async fn test_replacement_does_not_double_count() {
        let (tier, _, _) = tier_with_clock(1024);
        let cid = Cid::new("bafyabc");

        tier.put(&cid, Bytes::from("short"), None).await.unwrap();
        tier.put(&cid, Bytes::from("a longer payload"), None).await.unwrap();

        assert_eq!(tier.entry_count(), 1);
        assert_eq!(tier.used_bytes(), 16);
    }
}
