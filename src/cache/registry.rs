//! Tier registry
//!
//! Ordered collection of tiers plus their probed health. The registry owns
//! no content; it answers "which tiers, in what order, and which of them
//! are usable right now".

use crate::cache::tier::{TierRef, TierStatus};
use crate::clock::ClockRef;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Probed health of one tier
#[derive(Debug, Clone)]
struct TierHealth {
    healthy: bool,
    last_probe_at: u64,
}

/// Ordered tier collection with health tracking
pub struct TierRegistry {
    /// Sorted by (priority, name); ties on priority break by name
    tiers: Vec<TierRef>,
    health: RwLock<HashMap<String, TierHealth>>,
    clock: ClockRef,
}

impl TierRegistry {
    pub fn new(mut tiers: Vec<TierRef>, clock: ClockRef) -> Arc<Self> {
        tiers.sort_by(|a, b| {
            (a.priority(), a.name().to_string()).cmp(&(b.priority(), b.name().to_string()))
        });
        Arc::new(Self {
            tiers,
            health: RwLock::new(HashMap::new()),
            clock,
        })
    }

    /// All tiers, fastest first
    pub fn tiers_by_priority(&self) -> &[TierRef] {
        &self.tiers
    }

    /// Same order, slowest first (replication placement order)
    pub fn tiers_by_durability(&self) -> Vec<TierRef> {
        let mut tiers: Vec<TierRef> = self.tiers.clone();
        tiers.reverse();
        tiers
    }

    /// Tier by name
    pub fn get(&self, name: &str) -> Option<&TierRef> {
        self.tiers.iter().find(|t| t.name() == name)
    }

    /// The fastest tier
    pub fn fastest(&self) -> Option<&TierRef> {
        self.tiers.first()
    }

    /// The slowest tier
    pub fn slowest(&self) -> Option<&TierRef> {
        self.tiers.last()
    }

    /// The next tier down from `name`, if any
    pub fn below(&self, name: &str) -> Option<&TierRef> {
        let idx = self.tiers.iter().position(|t| t.name() == name)?;
        self.tiers.get(idx + 1)
    }

    /// Whether a tier is currently usable. Unprobed tiers count as healthy
    /// so a fresh registry serves traffic before the first probe cycle.
    pub fn is_healthy(&self, name: &str) -> bool {
        self.health
            .read()
            .get(name)
            .map(|h| h.healthy)
            .unwrap_or(true)
    }

    /// Mark a tier's health out of band (after a systemic write failure)
    pub fn mark_unhealthy(&self, name: &str) {
        let now = self.clock.now_seconds();
        self.health.write().insert(
            name.to_string(),
            TierHealth {
                healthy: false,
                last_probe_at: now,
            },
        );
        warn!(tier = name, "tier marked unhealthy");
    }

    /// Probe every tier and record the results
    pub async fn probe_all(&self) {
        let now = self.clock.now_seconds();
        for tier in &self.tiers {
            let healthy = tier.health_check().await.unwrap_or(false);
            let previous = {
                let mut health = self.health.write();
                health
                    .insert(
                        tier.name().to_string(),
                        TierHealth {
                            healthy,
                            last_probe_at: now,
                        },
                    )
                    .map(|h| h.healthy)
            };
            if previous == Some(!healthy) {
                if healthy {
                    debug!(tier = tier.name(), "tier recovered");
                } else {
                    warn!(tier = tier.name(), "tier became unhealthy");
                }
            }
        }
    }

    /// Snapshot of every tier for stats reporting
    pub fn health_status(&self) -> Vec<TierStatus> {
        let health = self.health.read();
        self.tiers
            .iter()
            .map(|tier| {
                let probe = health.get(tier.name());
                TierStatus {
                    name: tier.name().to_string(),
                    kind: tier.kind(),
                    priority: tier.priority(),
                    capacity_bytes: tier.capacity_bytes(),
                    used_bytes: tier.used_bytes(),
                    entry_count: tier.entry_count(),
                    healthy: probe.map(|h| h.healthy).unwrap_or(true),
                    last_probe_at: probe.map(|h| h.last_probe_at).unwrap_or(0),
                }
            })
            .collect()
    }

    /// Healthy tiers, fastest first
    pub fn healthy_tiers(&self) -> Vec<TierRef> {
        self.tiers
            .iter()
            .filter(|t| self.is_healthy(t.name()))
            .cloned()
            .collect()
    }
}
