//! Tiered cache orchestrator
//!
//! Coordinates lookups and stores across the registered tiers, owns the
//! content metadata index, and drives promotion/demotion. Tiers expose
//! opaque get/put/has/evict; all cross-tier bookkeeping lives here, so no
//! tier ever holds a reference back into the cache.
//!
//! Reads never pay for promotion: a hot hit in a slow tier only *marks*
//! the CID, and the maintenance loop performs the copy later.

use crate::cache::cid::{Cid, CID_SHARD_COUNT};
use crate::cache::entry::ContentMetadata;
use crate::cache::heat::HeatModel;
use crate::cache::registry::TierRegistry;
use crate::cache::tier::TierRef;
use crate::clock::ClockRef;
use crate::error::{Error, Result};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Lookup Result
// =============================================================================

/// A successful cache read with its serving tier
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub bytes: Bytes,
    /// Name of the tier that served the read
    pub tier: String,
}

// =============================================================================
// Promotion Queue
// =============================================================================

/// Pending promotion marks, deduplicated
#[derive(Default)]
struct PromotionQueue {
    order: VecDeque<Cid>,
    queued: HashSet<String>,
}

impl PromotionQueue {
    fn push(&mut self, cid: Cid) -> bool {
        if self.queued.insert(cid.as_str().to_string()) {
            self.order.push_back(cid);
            true
        } else {
            false
        }
    }

    fn drain(&mut self) -> Vec<Cid> {
        self.queued.clear();
        self.order.drain(..).collect()
    }
}

// =============================================================================
// Tiered Cache
// =============================================================================

/// Multi-tier cache over CID-addressed content
pub struct TieredCache {
    registry: Arc<TierRegistry>,
    heat: Arc<HeatModel>,
    /// Single-writer/multi-reader metadata index
    metadata: RwLock<HashMap<String, ContentMetadata>>,
    promotions: Mutex<PromotionQueue>,
    /// Per-CID serialization of cross-tier migrations
    migration_locks: Vec<tokio::sync::Mutex<()>>,
    default_tier: String,
    promotion_threshold: u64,
    clock: ClockRef,
}

impl TieredCache {
    pub fn new(
        registry: Arc<TierRegistry>,
        heat: Arc<HeatModel>,
        clock: ClockRef,
        default_tier: impl Into<String>,
        promotion_threshold: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            heat,
            metadata: RwLock::new(HashMap::new()),
            promotions: Mutex::new(PromotionQueue::default()),
            migration_locks: (0..CID_SHARD_COUNT)
                .map(|_| tokio::sync::Mutex::new(()))
                .collect(),
            default_tier: default_tier.into(),
            promotion_threshold,
            clock,
        })
    }

    pub fn registry(&self) -> &Arc<TierRegistry> {
        &self.registry
    }

    pub fn heat(&self) -> &Arc<HeatModel> {
        &self.heat
    }

    /// Current heat score for a CID
    pub fn heat_score(&self, cid: &Cid) -> f64 {
        self.heat.heat_score(cid)
    }

    /// Snapshot of one metadata record
    pub fn metadata(&self, cid: &Cid) -> Option<ContentMetadata> {
        self.metadata.read().get(cid.as_str()).cloned()
    }

    /// Snapshot of the whole index (maintenance scans)
    pub fn all_metadata(&self) -> Vec<ContentMetadata> {
        self.metadata.read().values().cloned().collect()
    }

    /// CIDs currently known to the cache
    pub fn known_cids(&self) -> Vec<Cid> {
        self.metadata.read().values().map(|m| m.cid.clone()).collect()
    }

    pub fn entry_count(&self) -> usize {
        self.metadata.read().len()
    }

    /// Flip the pinned flag; false when the CID is unknown
    pub fn set_pinned(&self, cid: &Cid, pinned: bool) -> bool {
        let mut index = self.metadata.write();
        match index.get_mut(cid.as_str()) {
            Some(meta) => {
                meta.pinned = pinned;
                true
            }
            None => false,
        }
    }

    /// All CIDs with the pinned flag set
    pub fn pinned_cids(&self) -> Vec<Cid> {
        self.metadata
            .read()
            .values()
            .filter(|m| m.pinned)
            .map(|m| m.cid.clone())
            .collect()
    }

    fn migration_lock(&self, cid: &Cid) -> &tokio::sync::Mutex<()> {
        &self.migration_locks[cid.shard_index()]
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Look up a CID across tiers in priority order
    pub async fn get(&self, cid: &Cid) -> Result<CacheHit> {
        self.heat.record_access(cid);
        let now = self.clock.now_seconds();

        let mut skipped = 0usize;
        for tier in self.registry.tiers_by_priority() {
            if !self.registry.is_healthy(tier.name()) {
                skipped += 1;
                continue;
            }
            match tier.get(cid).await {
                Ok(Some(bytes)) => {
                    self.heat.record_tier_hit(cid, tier.name());
                    self.note_hit(cid, tier.name(), bytes.len() as u64, now);
                    self.maybe_mark_promotion(cid, tier);
                    return Ok(CacheHit {
                        bytes,
                        tier: tier.name().to_string(),
                    });
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(tier = tier.name(), cid = %cid, error = %e, "tier lookup failed");
                    continue;
                }
            }
        }

        Err(Error::not_found(
            cid.as_str(),
            format!(
                "miss across {} tiers ({} unhealthy skipped)",
                self.registry.tiers_by_priority().len() - skipped,
                skipped
            ),
        ))
    }

    /// Look up with a deadline; expiry is a strict `<` comparison, so a
    /// result arriving exactly at the deadline is already too late.
    pub async fn get_with_deadline(&self, cid: &Cid, deadline: Duration) -> Result<CacheHit> {
        match tokio::time::timeout(deadline, self.get(cid)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: "get".into(),
                cid: cid.to_string(),
                elapsed_ms: deadline.as_millis() as u64,
            }),
        }
    }

    /// Record a hit on the metadata index. The serving tier is by
    /// construction the fastest holder, so authority moves to it.
    fn note_hit(&self, cid: &Cid, tier_name: &str, size: u64, now: u64) {
        let mut index = self.metadata.write();
        match index.get_mut(cid.as_str()) {
            Some(meta) => {
                meta.record_access(now);
                meta.current_tier = tier_name.to_string();
            }
            None => {
                // Resident content without metadata (restart): re-adopt it
                let mut meta = ContentMetadata::new(cid.clone(), size, tier_name, now);
                meta.record_access(now);
                index.insert(cid.as_str().to_string(), meta);
            }
        }
    }

    fn maybe_mark_promotion(&self, cid: &Cid, hit_tier: &TierRef) {
        let Some(fastest) = self.registry.fastest() else {
            return;
        };
        if hit_tier.name() == fastest.name() {
            return;
        }
        let count = self.heat.record(cid).map(|r| r.count).unwrap_or(0);
        if count >= self.promotion_threshold && self.promotions.lock().push(cid.clone()) {
            debug!(cid = %cid, from = hit_tier.name(), "marked for promotion");
        }
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Store content, returning the name of the tier that accepted it.
    ///
    /// Re-putting a CID that is still resident is a no-op that refreshes
    /// access statistics.
    pub async fn put(&self, cid: &Cid, data: Bytes, pinned: bool) -> Result<String> {
        let size = data.len() as u64;
        let now = self.clock.now_seconds();

        // Idempotent re-put
        if let Some(meta) = self.metadata(cid) {
            if let Some(tier) = self.registry.get(&meta.current_tier) {
                if tier.has(cid).await.unwrap_or(false) {
                    let mut index = self.metadata.write();
                    if let Some(meta) = index.get_mut(cid.as_str()) {
                        meta.record_access(now);
                        if pinned {
                            meta.pinned = true;
                        }
                    }
                    return Ok(meta.current_tier);
                }
            }
        }

        let mut last_error: Option<Error> = None;
        for tier in self.write_candidates(size) {
            let meta_hint = self.metadata(cid);
            match tier.put(cid, data.clone(), meta_hint.as_ref()).await {
                Ok(()) => {
                    let mut index = self.metadata.write();
                    let meta = index
                        .entry(cid.as_str().to_string())
                        .or_insert_with(|| ContentMetadata::new(cid.clone(), size, tier.name(), now));
                    meta.size = size;
                    meta.current_tier = tier.name().to_string();
                    meta.last_access_at = now;
                    if pinned {
                        meta.pinned = true;
                    }
                    return Ok(tier.name().to_string());
                }
                Err(e) => {
                    warn!(tier = tier.name(), cid = %cid, error = %e, "tier write failed, trying next");
                    if matches!(e, Error::WriteFailed { .. }) {
                        self.registry.mark_unhealthy(tier.name());
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::WriteFailed {
            tier: "<none>".into(),
            cid: cid.to_string(),
            cause: "no healthy tier accepts this item".into(),
        }))
    }

    /// Tiers to try for a write of `size` bytes: the default tier first
    /// when it qualifies, then the rest of the priority order.
    fn write_candidates(&self, size: u64) -> Vec<TierRef> {
        let mut candidates = Vec::new();
        if let Some(default) = self.registry.get(&self.default_tier) {
            if self.registry.is_healthy(default.name()) && default.accepts_size(size) {
                candidates.push(default.clone());
            }
        }
        for tier in self.registry.tiers_by_priority() {
            if tier.name() == self.default_tier {
                continue;
            }
            if self.registry.is_healthy(tier.name()) && tier.accepts_size(size) {
                candidates.push(tier.clone());
            }
        }
        candidates
    }

    /// Remove a CID from every tier and drop its metadata. The access
    /// record survives so a refetch starts with its history intact.
    pub async fn invalidate(&self, cid: &Cid) -> Result<bool> {
        let _guard = self.migration_lock(cid).lock().await;

        let mut removed_any = false;
        for tier in self.registry.tiers_by_priority() {
            match tier.evict(cid).await {
                Ok(removed) => removed_any |= removed,
                Err(e) => {
                    warn!(tier = tier.name(), cid = %cid, error = %e, "invalidate failed on tier")
                }
            }
        }
        let had_metadata = self.metadata.write().remove(cid.as_str()).is_some();
        Ok(removed_any || had_metadata)
    }

    // =========================================================================
    // Migration (maintenance-driven)
    // =========================================================================

    /// Copy a CID from wherever it lives into the fastest healthy tier.
    /// The slower copy stays; only authority moves.
    pub async fn promote(&self, cid: &Cid) -> Result<bool> {
        let _guard = self.migration_lock(cid).lock().await;

        let Some(meta) = self.metadata(cid) else {
            return Ok(false);
        };
        let Some(fastest) = self.registry.fastest().cloned() else {
            return Ok(false);
        };
        if !self.registry.is_healthy(fastest.name()) || !fastest.accepts_size(meta.size) {
            return Ok(false);
        }
        if fastest.has(cid).await.unwrap_or(false) {
            return Ok(false);
        }

        let Some(bytes) = self.read_from_any(cid).await else {
            return Ok(false);
        };
        let from = meta.current_tier.clone();
        fastest.put(cid, bytes, Some(&meta)).await?;

        let now = self.clock.now_seconds();
        let mut index = self.metadata.write();
        if let Some(meta) = index.get_mut(cid.as_str()) {
            meta.record_migration(&from, fastest.name(), now);
        }
        info!(cid = %cid, from = %from, to = fastest.name(), "promoted");
        Ok(true)
    }

    /// Move a CID one level down: copy to the next slower tier, then drop
    /// the fast copy. Two atomic writes plus one index update.
    pub async fn demote(&self, cid: &Cid) -> Result<bool> {
        let _guard = self.migration_lock(cid).lock().await;

        let Some(meta) = self.metadata(cid) else {
            return Ok(false);
        };
        let Some(source) = self.registry.get(&meta.current_tier).cloned() else {
            return Ok(false);
        };
        let Some(target) = self.registry.below(source.name()).cloned() else {
            return Ok(false);
        };
        if !self.registry.is_healthy(target.name()) || !target.accepts_size(meta.size) {
            return Ok(false);
        }

        let Some(bytes) = source.get(cid).await? else {
            return Ok(false);
        };
        target.put(cid, bytes, Some(&meta)).await?;

        {
            let now = self.clock.now_seconds();
            let mut index = self.metadata.write();
            if let Some(meta) = index.get_mut(cid.as_str()) {
                meta.record_migration(source.name(), target.name(), now);
            }
        }
        source.evict(cid).await?;
        info!(cid = %cid, from = source.name(), to = target.name(), "demoted");
        Ok(true)
    }

    /// Promote everything marked since the last drain; returns how many
    /// copies were made.
    pub async fn drain_promotions(&self) -> usize {
        let marked = self.promotions.lock().drain();
        let mut promoted = 0;
        for cid in marked {
            match self.promote(&cid).await {
                Ok(true) => promoted += 1,
                Ok(false) => {}
                Err(e) => warn!(cid = %cid, error = %e, "promotion failed"),
            }
        }
        promoted
    }

    /// Number of CIDs currently marked for promotion
    pub fn pending_promotions(&self) -> usize {
        self.promotions.lock().order.len()
    }

    /// Demote every CID idle past `threshold_seconds` that is not already
    /// on the slowest tier; returns how many moved.
    pub async fn demote_cold(&self, threshold_seconds: u64) -> usize {
        let now = self.clock.now_seconds();
        let slowest = match self.registry.slowest() {
            Some(t) => t.name().to_string(),
            None => return 0,
        };

        let cold: Vec<Cid> = self
            .all_metadata()
            .into_iter()
            .filter(|m| m.current_tier != slowest && m.idle_seconds(now) > threshold_seconds)
            .map(|m| m.cid)
            .collect();

        let mut demoted = 0;
        for cid in cold {
            match self.demote(&cid).await {
                Ok(true) => demoted += 1,
                Ok(false) => {}
                Err(e) => warn!(cid = %cid, error = %e, "demotion failed"),
            }
        }
        demoted
    }

    async fn read_from_any(&self, cid: &Cid) -> Option<Bytes> {
        for tier in self.registry.tiers_by_priority() {
            if !self.registry.is_healthy(tier.name()) {
                continue;
            }
            if let Ok(Some(bytes)) = tier.get(cid).await {
                return Some(bytes);
            }
        }
        None
    }

    // =========================================================================
    // Restart Reconciliation
    // =========================================================================

    /// Repair the index after an unclean shutdown. A migration interrupted
    /// between its two writes is detected by the CID being present in both
    /// the source and the target tier: an interrupted demotion left its
    /// source copy behind after metadata moved to the target, an
    /// interrupted promotion landed the fast copy before metadata ever
    /// pointed there. In both cases the stray is the copy in a tier
    /// faster than the recorded one, and it is dropped. Leftovers are
    /// never in slower tiers (promotion keeps its slower source on
    /// purpose, demotion evicts its faster source), so a slower extra
    /// copy is a replica placement and stays.
    ///
    /// Records whose recorded tier no longer holds the bytes are
    /// finalized against the fastest remaining holder, or dropped when
    /// nothing backs them anymore.
    pub async fn reconcile(&self) -> Result<()> {
        let mut finalized = 0usize;
        let mut dropped = 0usize;
        let mut rolled_back = 0usize;

        for meta in self.all_metadata() {
            let _guard = self.migration_lock(&meta.cid).lock().await;

            let mut holders: Vec<TierRef> = Vec::new();
            for tier in self.registry.tiers_by_priority() {
                if tier.has(&meta.cid).await.unwrap_or(false) {
                    holders.push(tier.clone());
                }
            }

            let recorded = holders.iter().find(|t| t.name() == meta.current_tier);
            match recorded {
                Some(recorded) => {
                    // No completed migration leaves a copy above the
                    // authoritative tier; whatever is there is a stray
                    let recorded_priority = recorded.priority();
                    for tier in &holders {
                        if tier.priority() >= recorded_priority {
                            continue;
                        }
                        match tier.evict(&meta.cid).await {
                            Ok(true) => {
                                rolled_back += 1;
                                info!(
                                    cid = %meta.cid,
                                    tier = tier.name(),
                                    authoritative = %meta.current_tier,
                                    "dropped stray copy from interrupted migration"
                                );
                            }
                            Ok(false) => {}
                            Err(e) => {
                                warn!(cid = %meta.cid, tier = tier.name(), error = %e, "failed to drop stray copy")
                            }
                        }
                    }
                }
                None => {
                    let actual_holder = holders.first().map(|t| t.name().to_string());
                    let mut index = self.metadata.write();
                    match actual_holder {
                        Some(holder) => {
                            if let Some(meta) = index.get_mut(meta.cid.as_str()) {
                                let from = meta.current_tier.clone();
                                meta.record_migration(&from, &holder, self.clock.now_seconds());
                                finalized += 1;
                            }
                        }
                        None => {
                            index.remove(meta.cid.as_str());
                            dropped += 1;
                        }
                    }
                }
            }
        }

        if finalized > 0 || dropped > 0 || rolled_back > 0 {
            info!(finalized, dropped, rolled_back, "reconciled metadata index after restart");
        }
        Ok(())
    }

    /// Adopt content resident in durable tiers but missing from the index
    /// (a fresh process over an existing disk store).
    pub async fn adopt_resident(&self) -> Result<usize> {
        let now = self.clock.now_seconds();
        let mut adopted = 0usize;

        for tier in self.registry.tiers_by_priority() {
            if tier.kind() == crate::config::TierKind::Backend {
                // Backend pin sets can be huge; they are enumerated on
                // demand by list_pins instead.
                continue;
            }
            for cid in tier.cids().await? {
                if self.metadata.read().contains_key(cid.as_str()) {
                    continue;
                }
                let size = match tier.peek(&cid).await {
                    Ok(Some(bytes)) => bytes.len() as u64,
                    _ => continue,
                };
                let mut index = self.metadata.write();
                if !index.contains_key(cid.as_str()) {
                    index.insert(
                        cid.as_str().to_string(),
                        ContentMetadata::new(cid.clone(), size, tier.name(), now),
                    );
                    adopted += 1;
                }
            }
        }
        Ok(adopted)
    }
}
