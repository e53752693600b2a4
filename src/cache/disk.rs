//! Disk tier
//!
//! CID-sharded directory store with an atomic index. Layout:
//!
//! ```text
//! <root>/index.json                      source of truth for listing/accounting
//! <root>/<first-4-of-cid>/<cid>          payload
//! <root>/<first-4-of-cid>/<cid>.metadata per-entry sidecar
//! ```
//!
//! Every write lands in a `.tmp` sibling first and is renamed into place,
//! so a crash can never expose a partial payload. Startup sweeps leftover
//! tempfiles, drops metadata whose payload is missing, and rebuilds the
//! index from sidecars when `index.json` is unreadable.

use crate::cache::cid::Cid;
use crate::cache::entry::ContentMetadata;
use crate::cache::tier::Tier;
use crate::clock::ClockRef;
use crate::config::TierKind;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tracing::{debug, warn};

/// Index format version, bumped on incompatible layout changes
const INDEX_SCHEMA_VERSION: u32 = 1;

const INDEX_FILE: &str = "index.json";
const METADATA_SUFFIX: &str = ".metadata";
const TMP_SUFFIX: &str = ".tmp";

// =============================================================================
// Index Types
// =============================================================================

/// Per-entry record mirrored between the sidecar and the index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskEntryMeta {
    pub cid: Cid,
    pub size: u64,
    pub added_at: u64,
    pub last_access_at: u64,
    pub access_count: u64,
}

/// On-disk index: all sidecars plus running totals
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DiskIndex {
    schema_version: u32,
    metadata: HashMap<String, DiskEntryMeta>,
    used_bytes: u64,
    updated_at: u64,
}

impl DiskIndex {
    fn empty(now: u64) -> Self {
        Self {
            schema_version: INDEX_SCHEMA_VERSION,
            metadata: HashMap::new(),
            used_bytes: 0,
            updated_at: now,
        }
    }
}

// =============================================================================
// Disk Tier
// =============================================================================

/// Local sharded directory cache tier
pub struct DiskTier {
    name: String,
    priority: u32,
    root: PathBuf,
    capacity_bytes: u64,
    max_item_size: Option<u64>,
    index: RwLock<DiskIndex>,
    /// Serializes index.json rewrites
    index_io: tokio::sync::Mutex<()>,
    hits: AtomicU64,
    clock: ClockRef,
}

impl DiskTier {
    /// Open (or create) the store at `root`, reconciling on-disk state
    pub async fn open(
        name: impl Into<String>,
        priority: u32,
        root: impl Into<PathBuf>,
        capacity_bytes: u64,
        max_item_size: Option<u64>,
        clock: ClockRef,
    ) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let tier = Self {
            name: name.into(),
            priority,
            root,
            capacity_bytes,
            max_item_size,
            index: RwLock::new(DiskIndex::empty(clock.now_seconds())),
            index_io: tokio::sync::Mutex::new(()),
            hits: AtomicU64::new(0),
            clock,
        };

        tier.sweep_tempfiles().await?;
        tier.load_index().await?;
        Ok(tier)
    }

    fn content_path(&self, cid: &Cid) -> PathBuf {
        self.root.join(cid.shard_prefix()).join(cid.as_str())
    }

    fn metadata_path(&self, cid: &Cid) -> PathBuf {
        self.root
            .join(cid.shard_prefix())
            .join(format!("{cid}{METADATA_SUFFIX}"))
    }

    /// Remove leftover `.tmp` files from interrupted writes
    async fn sweep_tempfiles(&self) -> Result<()> {
        let mut swept = 0usize;
        let mut dirs = fs::read_dir(&self.root).await?;
        while let Some(dir_entry) = dirs.next_entry().await? {
            let path = dir_entry.path();
            if path.is_file() && path.to_string_lossy().ends_with(TMP_SUFFIX) {
                let _ = fs::remove_file(&path).await;
                swept += 1;
                continue;
            }
            if !path.is_dir() {
                continue;
            }
            let mut files = match fs::read_dir(&path).await {
                Ok(f) => f,
                Err(_) => continue,
            };
            while let Some(file) = files.next_entry().await? {
                let file_path = file.path();
                if file_path.to_string_lossy().ends_with(TMP_SUFFIX) {
                    let _ = fs::remove_file(&file_path).await;
                    swept += 1;
                }
            }
        }
        if swept > 0 {
            warn!(tier = %self.name, swept, "removed leftover tempfiles");
        }
        Ok(())
    }

    /// Load index.json, falling back to a sidecar scan when it is corrupt,
    /// drop entries whose payload is gone, and adopt access stats from any
    /// sidecar fresher than the index (reads refresh sidecars without
    /// rewriting index.json, so after a restart the sidecars are ahead).
    async fn load_index(&self) -> Result<()> {
        let index_path = self.root.join(INDEX_FILE);
        let mut index = match fs::read_to_string(&index_path).await {
            Ok(raw) => match serde_json::from_str::<DiskIndex>(&raw) {
                Ok(index) => index,
                Err(e) => {
                    warn!(
                        tier = %self.name,
                        path = %index_path.display(),
                        error = %e,
                        "index corrupt, rebuilding from metadata files"
                    );
                    self.rebuild_index().await?
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.rebuild_index().await?
            }
            Err(e) => return Err(e.into()),
        };

        // Drop stale metadata: sidecar present, payload missing
        let mut stale = Vec::new();
        for (key, meta) in &index.metadata {
            if !self.content_path(&meta.cid).is_file() {
                stale.push(key.clone());
            }
        }
        for key in stale {
            if let Some(meta) = index.metadata.remove(&key) {
                index.used_bytes = index.used_bytes.saturating_sub(meta.size);
                warn!(tier = %self.name, cid = %key, "dropped metadata without payload");
                let _ = fs::remove_file(self.metadata_path(&meta.cid)).await;
            }
        }

        // The index was last rewritten at the most recent put/evict; every
        // read since then only touched its sidecar. The fresher stats win,
        // or eviction ordering would run on stale counts after restart.
        let mut refreshed = 0usize;
        for meta in index.metadata.values_mut() {
            let raw = match fs::read_to_string(self.metadata_path(&meta.cid)).await {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let Ok(sidecar) = serde_json::from_str::<DiskEntryMeta>(&raw) else {
                continue;
            };
            if sidecar.last_access_at > meta.last_access_at
                || sidecar.access_count > meta.access_count
            {
                meta.last_access_at = meta.last_access_at.max(sidecar.last_access_at);
                meta.access_count = meta.access_count.max(sidecar.access_count);
                refreshed += 1;
            }
        }
        if refreshed > 0 {
            debug!(tier = %self.name, refreshed, "adopted fresher sidecar stats");
        }

        *self.index.write() = index;
        self.persist_index().await
    }

    /// Scan every shard directory's sidecars and reconstruct the index
    async fn rebuild_index(&self) -> Result<DiskIndex> {
        let mut index = DiskIndex::empty(self.clock.now_seconds());
        let mut dirs = fs::read_dir(&self.root).await?;
        while let Some(dir_entry) = dirs.next_entry().await? {
            let shard_path = dir_entry.path();
            if !shard_path.is_dir() {
                continue;
            }
            let mut files = match fs::read_dir(&shard_path).await {
                Ok(f) => f,
                Err(_) => continue,
            };
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                let name = file.file_name().to_string_lossy().to_string();
                let Some(cid_str) = name.strip_suffix(METADATA_SUFFIX) else {
                    continue;
                };
                let raw = match fs::read_to_string(&path).await {
                    Ok(raw) => raw,
                    Err(_) => continue,
                };
                let meta: DiskEntryMeta = match serde_json::from_str(&raw) {
                    Ok(meta) => meta,
                    Err(e) => {
                        warn!(tier = %self.name, cid = cid_str, error = %e, "unreadable sidecar skipped");
                        continue;
                    }
                };
                if shard_path.join(cid_str).is_file() {
                    index.used_bytes += meta.size;
                    index.metadata.insert(cid_str.to_string(), meta);
                }
            }
        }
        debug!(
            tier = %self.name,
            entries = index.metadata.len(),
            used_bytes = index.used_bytes,
            "rebuilt index from sidecars"
        );
        Ok(index)
    }

    /// Write index.json atomically (tempfile + rename)
    async fn persist_index(&self) -> Result<()> {
        let snapshot = {
            let mut index = self.index.write();
            index.updated_at = self.clock.now_seconds();
            serde_json::to_vec(&*index)?
        };
        let _guard = self.index_io.lock().await;
        let final_path = self.root.join(INDEX_FILE);
        let tmp_path = self.root.join(format!("{INDEX_FILE}{TMP_SUFFIX}"));
        fs::write(&tmp_path, &snapshot).await?;
        fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }

    async fn write_atomic(&self, final_path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = final_path.with_file_name(format!(
            "{}{TMP_SUFFIX}",
            final_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        ));
        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, final_path).await?;
        Ok(())
    }

    /// Eviction candidates sorted by ascending `(access_count, last_access_at)`
    /// over an index snapshot taken at call time.
    fn eviction_candidates(&self) -> Vec<DiskEntryMeta> {
        let index = self.index.read();
        let mut candidates: Vec<DiskEntryMeta> = index.metadata.values().cloned().collect();
        candidates.sort_by(|a, b| {
            (a.access_count, a.last_access_at, a.cid.as_str())
                .cmp(&(b.access_count, b.last_access_at, b.cid.as_str()))
        });
        candidates
    }

    async fn remove_files(&self, cid: &Cid) {
        let _ = fs::remove_file(self.content_path(cid)).await;
        let _ = fs::remove_file(self.metadata_path(cid)).await;
    }

    /// Free at least `required` bytes by evicting the coldest entries
    async fn evict_for(&self, required: u64) -> Result<u64> {
        let mut freed = 0u64;
        for candidate in self.eviction_candidates() {
            if freed >= required {
                break;
            }
            self.remove_files(&candidate.cid).await;
            let mut index = self.index.write();
            if index.metadata.remove(candidate.cid.as_str()).is_some() {
                index.used_bytes = index.used_bytes.saturating_sub(candidate.size);
                freed += candidate.size;
            }
            drop(index);
            debug!(tier = %self.name, cid = %candidate.cid, size = candidate.size, "evicted for capacity");
        }
        Ok(freed)
    }

    /// Drop every entry (the defined behavior when a single write exceeds
    /// the tier's total capacity).
    async fn clear_all(&self) -> Result<()> {
        let cids: Vec<Cid> = {
            let index = self.index.read();
            index.metadata.values().map(|m| m.cid.clone()).collect()
        };
        for cid in &cids {
            self.remove_files(cid).await;
        }
        {
            let mut index = self.index.write();
            index.metadata.clear();
            index.used_bytes = 0;
        }
        warn!(tier = %self.name, dropped = cids.len(), "cleared tier for oversized write");
        Ok(())
    }

    /// Hits served by this tier since startup
    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Access statistics for a resident CID
    pub fn entry_meta(&self, cid: &Cid) -> Option<DiskEntryMeta> {
        self.index.read().metadata.get(cid.as_str()).cloned()
    }
}

#[async_trait]
impl Tier for DiskTier {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TierKind {
        TierKind::Disk
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn capacity_bytes(&self) -> Option<u64> {
        Some(self.capacity_bytes)
    }

    fn used_bytes(&self) -> u64 {
        self.index.read().used_bytes
    }

    fn entry_count(&self) -> u64 {
        self.index.read().metadata.len() as u64
    }

    fn max_item_size(&self) -> Option<u64> {
        self.max_item_size
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.index.read().metadata.contains_key(cid.as_str()))
    }

    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>> {
        if !self.index.read().metadata.contains_key(cid.as_str()) {
            return Ok(None);
        }

        let data = match fs::read(self.content_path(cid)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Payload vanished out from under the index
                warn!(tier = %self.name, cid = %cid, "payload missing, dropping stale metadata");
                {
                    let mut index = self.index.write();
                    if let Some(meta) = index.metadata.remove(cid.as_str()) {
                        index.used_bytes = index.used_bytes.saturating_sub(meta.size);
                    }
                }
                let _ = fs::remove_file(self.metadata_path(cid)).await;
                self.persist_index().await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        self.hits.fetch_add(1, Ordering::Relaxed);

        // Refresh access stats. The sidecar carries them durably so that
        // eviction ordering survives restart; index.json is only rewritten
        // on put/evict and catches up from the sidecars at load time.
        let now = self.clock.now_seconds();
        let updated = {
            let mut index = self.index.write();
            index.metadata.get_mut(cid.as_str()).map(|meta| {
                meta.last_access_at = now;
                meta.access_count += 1;
                meta.clone()
            })
        };
        if let Some(meta) = updated {
            if let Ok(raw) = serde_json::to_vec(&meta) {
                // stats only; a failed rewrite costs ordering, not data
                let _ = self.write_atomic(&self.metadata_path(cid), &raw).await;
            }
        }

        Ok(Some(Bytes::from(data)))
    }

    async fn peek(&self, cid: &Cid) -> Result<Option<Bytes>> {
        if !self.index.read().metadata.contains_key(cid.as_str()) {
            return Ok(None);
        }
        match fs::read(self.content_path(cid)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, cid: &Cid, data: Bytes, meta: Option<&ContentMetadata>) -> Result<()> {
        let size = data.len() as u64;
        if let Some(limit) = self.max_item_size {
            if size > limit {
                return Err(Error::TooLarge {
                    tier: self.name.clone(),
                    size,
                    limit,
                });
            }
        }

        if size > self.capacity_bytes {
            self.clear_all().await?;
        } else {
            let used = self.used_bytes();
            let old_size = self.entry_meta(cid).map(|m| m.size).unwrap_or(0);
            let projected = used.saturating_sub(old_size) + size;
            if projected > self.capacity_bytes {
                self.evict_for(projected - self.capacity_bytes).await?;
            }
        }

        let now = self.clock.now_seconds();
        let entry_meta = DiskEntryMeta {
            cid: cid.clone(),
            size,
            added_at: meta.map(|m| m.added_at).unwrap_or(now),
            last_access_at: meta.map(|m| m.last_access_at).unwrap_or(now),
            access_count: meta.map(|m| m.access_count).unwrap_or(0),
        };

        let write = async {
            self.write_atomic(&self.content_path(cid), &data).await?;
            self.write_atomic(&self.metadata_path(cid), &serde_json::to_vec(&entry_meta)?)
                .await
        };
        if let Err(e) = write.await {
            return Err(Error::WriteFailed {
                tier: self.name.clone(),
                cid: cid.to_string(),
                cause: e.to_string(),
            });
        }

        {
            let mut index = self.index.write();
            if let Some(old) = index.metadata.insert(cid.as_str().to_string(), entry_meta) {
                index.used_bytes = index.used_bytes.saturating_sub(old.size);
            }
            index.used_bytes += size;
        }
        self.persist_index().await
    }

    async fn evict(&self, cid: &Cid) -> Result<bool> {
        let removed = {
            let mut index = self.index.write();
            match index.metadata.remove(cid.as_str()) {
                Some(meta) => {
                    index.used_bytes = index.used_bytes.saturating_sub(meta.size);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.remove_files(cid).await;
            self.persist_index().await?;
        }
        Ok(removed)
    }

    async fn cids(&self) -> Result<Vec<Cid>> {
        Ok(self
            .index
            .read()
            .metadata
            .values()
            .map(|m| m.cid.clone())
            .collect())
    }

    async fn health_check(&self) -> Result<bool> {
        let probe = self.root.join(".health_check");
        match fs::write(&probe, b"ok").await {
            Ok(_) => {
                let _ = fs::remove_file(&probe).await;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }
}
