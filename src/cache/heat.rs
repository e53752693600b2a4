//! Heat model
//!
//! Per-CID access statistics and the heat score that drives eviction,
//! promotion, and replication decisions. Heat is never stored; it is
//! recomputed from the access record on demand:
//!
//! ```text
//! age        = last_access - first_access              (seconds)
//! recency    = 1 / (1 + (now - last_access) / 3600)    (hourly decay)
//! frequency  = access_count
//! age_boost  = 1 + min(10, age / 86400)                (capped at 11x)
//! heat       = frequency * recency * age_boost
//! ```
//!
//! Records outlive the content: a fully evicted CID keeps its history so a
//! refetch starts warm. The record map itself is bounded and sheds its
//! least-recently-accessed entries past a configured ceiling.

use crate::cache::cid::{Cid, CID_SHARD_COUNT};
use crate::clock::ClockRef;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Access Record
// =============================================================================

/// Lifetime access statistics for one CID
#[derive(Debug, Clone)]
pub struct AccessRecord {
    /// Epoch seconds of the first recorded access
    pub first_access: u64,
    /// Epoch seconds of the most recent access
    pub last_access: u64,
    pub count: u64,
    /// Hits broken down by `<tier>_hit` label
    pub per_tier_hits: HashMap<String, u64>,
}

impl AccessRecord {
    fn new(now: u64) -> Self {
        Self {
            first_access: now,
            last_access: now,
            count: 0,
            per_tier_hits: HashMap::new(),
        }
    }

    /// Compute the heat score at `now`
    pub fn heat(&self, now: u64) -> f64 {
        let age = self.last_access.saturating_sub(self.first_access) as f64;
        let idle = now.saturating_sub(self.last_access) as f64;
        let recency = 1.0 / (1.0 + idle / 3600.0);
        let frequency = self.count as f64;
        let age_boost = 1.0 + (age / 86_400.0).min(10.0);
        frequency * recency * age_boost
    }
}

// =============================================================================
// Heat Model
// =============================================================================

struct HeatShard {
    /// LRU order: front = coldest record, back = most recently touched
    records: IndexMap<String, AccessRecord>,
}

impl HeatShard {
    fn touch(&mut self, cid: &Cid, now: u64) -> &mut AccessRecord {
        let key = cid.as_str().to_string();
        let mut record = self
            .records
            .shift_remove(&key)
            .unwrap_or_else(|| AccessRecord::new(now));
        record.last_access = now;
        self.records.insert(key.clone(), record);
        self.records.get_mut(&key).expect("just inserted")
    }

    fn trim_to(&mut self, ceiling: usize) -> usize {
        let mut dropped = 0;
        while self.records.len() > ceiling {
            self.records.shift_remove_index(0);
            dropped += 1;
        }
        dropped
    }
}

/// Sharded, bounded access-statistics store
pub struct HeatModel {
    shards: Box<[RwLock<HeatShard>; CID_SHARD_COUNT]>,
    clock: ClockRef,
    /// Per-shard record ceiling derived from the global one
    shard_ceiling: usize,
    record_count: AtomicU64,
}

impl HeatModel {
    pub fn new(clock: ClockRef, max_records: usize) -> Self {
        let shards: Vec<RwLock<HeatShard>> = (0..CID_SHARD_COUNT)
            .map(|_| {
                RwLock::new(HeatShard {
                    records: IndexMap::new(),
                })
            })
            .collect();
        let shards: Box<[RwLock<HeatShard>; CID_SHARD_COUNT]> =
            shards.into_boxed_slice().try_into().ok().expect("shard count");

        Self {
            shards,
            clock,
            shard_ceiling: (max_records / CID_SHARD_COUNT).max(1),
            record_count: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard_for(&self, cid: &Cid) -> &RwLock<HeatShard> {
        &self.shards[cid.shard_index()]
    }

    /// Record an access attempt (hit or miss)
    pub fn record_access(&self, cid: &Cid) {
        let now = self.clock.now_seconds();
        let mut shard = self.shard_for(cid).write();

        let was_new = !shard.records.contains_key(cid.as_str());
        let record = shard.touch(cid, now);
        record.count += 1;

        if was_new {
            self.record_count.fetch_add(1, Ordering::Relaxed);
        }
        let dropped = shard.trim_to(self.shard_ceiling);
        if dropped > 0 {
            self.record_count.fetch_sub(dropped as u64, Ordering::Relaxed);
        }
    }

    /// Record which tier served a hit, labeled `<tier>_hit`
    pub fn record_tier_hit(&self, cid: &Cid, tier_name: &str) {
        let now = self.clock.now_seconds();
        let mut shard = self.shard_for(cid).write();
        let record = shard.touch(cid, now);
        *record
            .per_tier_hits
            .entry(format!("{tier_name}_hit"))
            .or_insert(0) += 1;
    }

    /// Current heat score; 0.0 for CIDs with no record
    pub fn heat_score(&self, cid: &Cid) -> f64 {
        let now = self.clock.now_seconds();
        self.shard_for(cid)
            .read()
            .records
            .get(cid.as_str())
            .map(|r| r.heat(now))
            .unwrap_or(0.0)
    }

    /// Snapshot of one record
    pub fn record(&self, cid: &Cid) -> Option<AccessRecord> {
        self.shard_for(cid).read().records.get(cid.as_str()).cloned()
    }

    /// Number of CIDs with access history
    pub fn record_count(&self) -> u64 {
        self.record_count.load(Ordering::Relaxed)
    }
}
