//! Replication & integrity manager
//!
//! Stateless policy evaluator over the cache's CID → (metadata, placements)
//! view. Placement writes go to the most durable tiers first; quorum writes
//! report `UnderReplicated` when they fall short and leave the decision to
//! the caller. Integrity verification hashes every copy against the fastest
//! one and surfaces disagreement without ever auto-repairing it.

use crate::cache::cid::{sha256_hex, Cid};
use crate::cache::manager::TieredCache;
use crate::cache::tier::TierRef;
use crate::config::{ReplicationConfig, ReplicationMode, TierKind};
use crate::error::{Error, Result};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

// =============================================================================
// Reports
// =============================================================================

/// Outcome of one replication pass
#[derive(Debug, Clone)]
pub struct ReplicationReport {
    pub cid: Cid,
    /// Quorum requirement, when the write requested one
    pub required: Option<usize>,
    /// Tiers holding the content after the pass
    pub placements: Vec<String>,
    /// Tiers that rejected or failed the write
    pub failed: Vec<String>,
}

impl ReplicationReport {
    pub fn replica_count(&self) -> usize {
        self.placements.len()
    }

    pub fn is_under_replicated(&self) -> bool {
        match self.required {
            Some(required) => self.placements.len() < required,
            None => false,
        }
    }

    /// Convert a missed quorum into the canonical error
    pub fn quorum_error(&self) -> Option<Error> {
        match self.required {
            Some(required) if self.placements.len() < required => Some(Error::UnderReplicated {
                cid: self.cid.to_string(),
                got: self.placements.len(),
                required,
            }),
            _ => None,
        }
    }
}

/// Outcome of a cross-tier integrity check
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub cid: Cid,
    pub ok: bool,
    /// Tier whose copy provided the reference hash
    pub reference_tier: String,
    /// Every tier whose copy was compared (reference included)
    pub checked_tiers: Vec<String>,
    /// Tiers whose copy disagrees with the reference
    pub corrupted_tiers: Vec<String>,
}

// =============================================================================
// Replication Manager
// =============================================================================

/// Policy-driven placement and verification
pub struct ReplicationManager {
    policy: ReplicationConfig,
    cache: Arc<TieredCache>,
}

impl ReplicationManager {
    pub fn new(policy: ReplicationConfig, cache: Arc<TieredCache>) -> Self {
        Self { policy, cache }
    }

    pub fn policy(&self) -> &ReplicationConfig {
        &self.policy
    }

    /// Quorum floor applied to caller-requested replica counts
    fn effective_required(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.policy.min_factor)
            .max(self.policy.min_factor)
    }

    /// Tiers currently holding the CID, fastest first
    async fn placements(&self, cid: &Cid) -> Vec<String> {
        let mut holders = Vec::new();
        for tier in self.cache.registry().tiers_by_priority() {
            if tier.has(cid).await.unwrap_or(false) {
                holders.push(tier.name().to_string());
            }
        }
        holders
    }

    /// Write the payload onto additional healthy tiers, most durable
    /// first, until `target` placements exist or tiers run out.
    async fn place(
        &self,
        cid: &Cid,
        data: &Bytes,
        target: usize,
        candidates: Vec<TierRef>,
        required: Option<usize>,
    ) -> ReplicationReport {
        let mut placements = self.placements(cid).await;
        let mut failed = Vec::new();
        let meta = self.cache.metadata(cid);

        for tier in candidates {
            if placements.len() >= target {
                break;
            }
            if placements.iter().any(|p| p == tier.name()) {
                continue;
            }
            if !self.cache.registry().is_healthy(tier.name())
                || !tier.accepts_size(data.len() as u64)
            {
                continue;
            }
            match tier.put(cid, data.clone(), meta.as_ref()).await {
                Ok(()) => {
                    debug!(cid = %cid, tier = tier.name(), "replica placed");
                    placements.push(tier.name().to_string());
                }
                Err(e) => {
                    warn!(cid = %cid, tier = tier.name(), error = %e, "replica placement failed");
                    failed.push(tier.name().to_string());
                }
            }
        }

        ReplicationReport {
            cid: cid.clone(),
            required,
            placements,
            failed,
        }
    }

    /// Quorum write: place onto enough tiers to satisfy the requested
    /// replica count (floored at `min_factor`). The report carries the
    /// shortfall; treating it as fatal is the caller's call.
    pub async fn replicate_quorum(
        &self,
        cid: &Cid,
        data: &Bytes,
        requested: Option<usize>,
    ) -> ReplicationReport {
        let required = self.effective_required(requested);
        let candidates = self.cache.registry().tiers_by_durability();
        self.place(cid, data, required, candidates, Some(required))
            .await
    }

    /// Policy pass after a write: what the configured mode says should
    /// exist, without any quorum requirement.
    pub async fn apply_policy(&self, cid: &Cid, data: &Bytes) -> ReplicationReport {
        match self.policy.mode {
            ReplicationMode::None => ReplicationReport {
                cid: cid.clone(),
                required: None,
                placements: self.placements(cid).await,
                failed: Vec::new(),
            },
            ReplicationMode::All => {
                let candidates = self.cache.registry().tiers_by_durability();
                self.place(cid, data, self.policy.max_factor, candidates, None)
                    .await
            }
            ReplicationMode::HighValue => {
                let pinned = self
                    .cache
                    .metadata(cid)
                    .map(|m| m.pinned)
                    .unwrap_or(false);
                let heat = self.cache.heat_score(cid);
                if !pinned && heat < self.policy.heat_threshold {
                    return ReplicationReport {
                        cid: cid.clone(),
                        required: None,
                        placements: self.placements(cid).await,
                        failed: Vec::new(),
                    };
                }
                // High-value content goes to every durable tier
                let candidates: Vec<TierRef> = self
                    .cache
                    .registry()
                    .tiers_by_durability()
                    .into_iter()
                    .filter(|t| t.kind() != TierKind::Memory)
                    .collect();
                self.place(cid, data, self.policy.max_factor, candidates, None)
                    .await
            }
        }
    }

    /// Maintenance top-up: bring a pinned or hot CID back to the target
    /// factor. Returns the number of new placements.
    pub async fn top_up(&self, cid: &Cid) -> Result<usize> {
        let before = self.placements(cid).await;
        if before.len() >= self.policy.target_factor {
            return Ok(0);
        }
        let data = match self.read_any(cid).await {
            Some(data) => data,
            None => return Ok(0),
        };
        let candidates = self.cache.registry().tiers_by_durability();
        let report = self
            .place(&data.0, &data.1, self.policy.target_factor, candidates, None)
            .await;
        Ok(report.placements.len().saturating_sub(before.len()))
    }

    async fn read_any(&self, cid: &Cid) -> Option<(Cid, Bytes)> {
        for tier in self.cache.registry().tiers_by_priority() {
            if let Ok(Some(bytes)) = tier.peek(cid).await {
                return Some((cid.clone(), bytes));
            }
        }
        None
    }

    // =========================================================================
    // Integrity Verification
    // =========================================================================

    /// Hash every tier's copy against the fastest one. Read-only: access
    /// statistics are untouched and disagreement is never repaired here.
    pub async fn verify(&self, cid: &Cid) -> Result<VerifyReport> {
        let mut reference: Option<(String, String)> = None;
        let mut checked = Vec::new();
        let mut corrupted = Vec::new();

        for tier in self.cache.registry().tiers_by_priority() {
            let bytes = match tier.peek(cid).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    warn!(cid = %cid, tier = tier.name(), error = %e, "verify read failed");
                    continue;
                }
            };
            let digest = sha256_hex(&bytes);
            checked.push(tier.name().to_string());
            match &reference {
                None => reference = Some((tier.name().to_string(), digest)),
                Some((_, reference_digest)) => {
                    if digest != *reference_digest {
                        corrupted.push(tier.name().to_string());
                    }
                }
            }
        }

        let Some((reference_tier, _)) = reference else {
            return Err(Error::not_found(cid.as_str(), "verify: no tier holds this CID"));
        };

        Ok(VerifyReport {
            cid: cid.clone(),
            ok: corrupted.is_empty(),
            reference_tier,
            checked_tiers: checked,
            corrupted_tiers: corrupted,
        })
    }
}
