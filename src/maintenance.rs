//! Maintenance loop
//!
//! The one background worker in the system. Each tick, in order: probe
//! tier health, drain the promotion queue, demote idle content, top up
//! under-replicated pinned/hot content, and scrub a bounded sample for
//! integrity. Shutdown is cooperative: the cancel signal is checked
//! between steps and in-flight tier I/O runs to completion.

use crate::cache::manager::TieredCache;
use crate::replication::ReplicationManager;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Knobs for the background worker
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub interval: Duration,
    /// Tier health re-probe cadence, independent of the full cycle
    pub health_interval: Duration,
    /// Idle time after which content migrates down one level
    pub demotion_threshold_seconds: u64,
    /// Heat score above which content gets replication top-ups
    pub heat_threshold: f64,
    /// CIDs verified per cycle
    pub scrub_sample_size: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            health_interval: Duration::from_secs(60),
            demotion_threshold_seconds: 30 * 86_400,
            heat_threshold: 5.0,
            scrub_sample_size: 16,
        }
    }
}

/// What one cycle accomplished
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub promoted: usize,
    pub demoted: usize,
    pub replicas_added: usize,
    pub scrubbed: usize,
    pub corrupted: Vec<String>,
}

// =============================================================================
// Maintenance Loop
// =============================================================================

/// Periodic background worker over the cache and replication manager
pub struct MaintenanceLoop {
    cache: Arc<TieredCache>,
    replication: Arc<ReplicationManager>,
    config: MaintenanceConfig,
    shutdown: CancellationToken,
    /// Rotating offset so successive scrubs cover different CIDs
    scrub_cursor: Mutex<usize>,
}

impl MaintenanceLoop {
    pub fn new(
        cache: Arc<TieredCache>,
        replication: Arc<ReplicationManager>,
        config: MaintenanceConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            replication,
            config,
            shutdown: CancellationToken::new(),
            scrub_cursor: Mutex::new(0),
        })
    }

    /// Token to request a cooperative stop
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until cancelled
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut health_ticker = tokio::time::interval(self.config.health_interval);
        health_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.config.interval.as_secs(), "maintenance loop started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    debug!(
                        promoted = report.promoted,
                        demoted = report.demoted,
                        replicas_added = report.replicas_added,
                        scrubbed = report.scrubbed,
                        corrupted = report.corrupted.len(),
                        "maintenance cycle complete"
                    );
                }
                _ = health_ticker.tick() => {
                    self.cache.registry().probe_all().await;
                }
            }
        }
        info!("maintenance loop stopped");
    }

    /// One full pass; public so tests and operators can force a cycle
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        // 1. tier health
        self.cache.registry().probe_all().await;
        if self.shutdown.is_cancelled() {
            return report;
        }

        // 2. pending promotions
        report.promoted = self.cache.drain_promotions().await;
        if self.shutdown.is_cancelled() {
            return report;
        }

        // 3. idle demotions
        report.demoted = self
            .cache
            .demote_cold(self.config.demotion_threshold_seconds)
            .await;
        if self.shutdown.is_cancelled() {
            return report;
        }

        // 4. replication top-up for pinned and hot content
        for meta in self.cache.all_metadata() {
            if self.shutdown.is_cancelled() {
                return report;
            }
            let hot = self.cache.heat_score(&meta.cid) >= self.config.heat_threshold;
            if !meta.pinned && !hot {
                continue;
            }
            match self.replication.top_up(&meta.cid).await {
                Ok(added) => report.replicas_added += added,
                Err(e) => warn!(cid = %meta.cid, error = %e, "replication top-up failed"),
            }
        }

        // 5. incremental integrity scrub
        let sample = self.scrub_sample();
        for cid in sample {
            if self.shutdown.is_cancelled() {
                return report;
            }
            match self.replication.verify(&cid).await {
                Ok(verdict) => {
                    report.scrubbed += 1;
                    if !verdict.ok {
                        warn!(
                            cid = %cid,
                            corrupted_tiers = ?verdict.corrupted_tiers,
                            reference = %verdict.reference_tier,
                            "integrity scrub found disagreement"
                        );
                        report.corrupted.push(cid.to_string());
                    }
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(cid = %cid, error = %e, "scrub failed"),
            }
        }

        report
    }

    /// Next bounded slice of known CIDs, deterministic order, rotating
    /// across cycles.
    fn scrub_sample(&self) -> Vec<crate::cache::cid::Cid> {
        let mut cids = self.cache.known_cids();
        if cids.is_empty() || self.config.scrub_sample_size == 0 {
            return Vec::new();
        }
        cids.sort();

        let mut cursor = self.scrub_cursor.lock();
        let start = *cursor % cids.len();
        let take = self.config.scrub_sample_size.min(cids.len());
        *cursor = (start + take) % cids.len();

        cids.into_iter().cycle().skip(start).take(take).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::cid::Cid;
    use crate::cache::heat::HeatModel;
    use crate::cache::registry::TierRegistry;
    use crate::cache::tier::testutil::FakeTier;
    use crate::cache::tier::TierRef;
    use crate::clock::ManualClock;
    use crate::config::{ReplicationConfig, TierKind};
    use bytes::Bytes;

    struct Fixture {
        maintenance: Arc<MaintenanceLoop>,
        cache: Arc<TieredCache>,
        clock: Arc<ManualClock>,
        tiers: Vec<Arc<FakeTier>>,
    }

    fn fixture() -> Fixture {
        let clock: Arc<ManualClock> = Arc::new(ManualClock::at(1_000_000));
        let heat = Arc::new(HeatModel::new(clock.clone(), 10_000));

        let memory = Arc::new(FakeTier::new("memory", TierKind::Memory, 1));
        let disk = Arc::new(FakeTier::new("disk", TierKind::Disk, 2));
        let backend = Arc::new(FakeTier::new("ipfs_local", TierKind::Backend, 3));

        let registry = TierRegistry::new(
            vec![
                memory.clone() as TierRef,
                disk.clone() as TierRef,
                backend.clone() as TierRef,
            ],
            clock.clone(),
        );
        let cache = TieredCache::new(registry, heat, clock.clone(), "memory", 3);
        let replication = Arc::new(ReplicationManager::new(
            ReplicationConfig::default(),
            cache.clone(),
        ));
        let maintenance = MaintenanceLoop::new(
            cache.clone(),
            replication,
            MaintenanceConfig {
                interval: Duration::from_millis(10),
                ..Default::default()
            },
        );

        Fixture {
            maintenance,
            cache,
            clock,
            tiers: vec![memory, disk, backend],
        }
    }

    #[tokio::test]
    async fn test_cycle_drains_promotions() {
        let fx = fixture();
        let cid = Cid::new("bafyhot");
        let data = Bytes::from("promoted soon");

        // resident on disk only, read past the threshold
        fx.tiers[1].entries.insert(cid.as_str().to_string(), data.clone());
        fx.cache.adopt_resident().await.unwrap();
        for _ in 0..3 {
            fx.cache.get(&cid).await.unwrap();
            fx.clock.advance(1);
        }
        assert_eq!(fx.cache.pending_promotions(), 1);

        let report = fx.maintenance.run_cycle().await;
        assert_eq!(report.promoted, 1);
        assert!(fx.tiers[0].entries.contains_key(cid.as_str()));
    }

    #[tokio::test]
    async fn test_cycle_demotes_idle() {
        let fx = fixture();
        let cid = Cid::new("bafyidle");
        fx.cache
            .put(&cid, Bytes::from("cooling off"), false)
            .await
            .unwrap();

        fx.clock.advance(31 * 86_400);
        let report = fx.maintenance.run_cycle().await;
        assert_eq!(report.demoted, 1);
        assert!(!fx.tiers[0].entries.contains_key(cid.as_str()));
        assert!(fx.tiers[1].entries.contains_key(cid.as_str()));
    }

    #[tokio::test]
    async fn test_cycle_tops_up_pinned_after_heal() {
        let fx = fixture();
        fx.tiers[2].set_healthy(false);
        fx.cache.registry().probe_all().await;

        let cid = Cid::new("bafypinned");
        fx.cache
            .put(&cid, Bytes::from("durable"), true)
            .await
            .unwrap();
        // only memory holds it; the backend tier was down
        assert!(!fx.tiers[2].entries.contains_key(cid.as_str()));

        fx.tiers[2].set_healthy(true);
        let report = fx.maintenance.run_cycle().await;
        assert!(report.replicas_added >= 1);
        assert!(fx.tiers[2].entries.contains_key(cid.as_str()));
    }

    #[tokio::test]
    async fn test_cycle_scrub_reports_corruption() {
        let fx = fixture();
        let cid = Cid::new("bafyscrub");
        let data = Bytes::from("will be damaged");

        fx.cache.put(&cid, data.clone(), true).await.unwrap();
        fx.tiers[1]
            .entries
            .insert(cid.as_str().to_string(), data.clone());
        fx.tiers[1].corrupt(&cid);

        let report = fx.maintenance.run_cycle().await;
        assert_eq!(report.scrubbed, 1);
        assert_eq!(report.corrupted, vec![cid.to_string()]);

        // scrubbing surfaces, it does not heal
        let damaged = fx.tiers[1].entries.get(cid.as_str()).unwrap().clone();
        assert_ne!(damaged, data);
    }

    #[tokio::test]
    async fn test_scrub_cursor_rotates() {
        let fx = fixture();
        for i in 0..5 {
            fx.cache
                .put(&Cid::new(format!("bafy-{i}")), Bytes::from("x"), false)
                .await
                .unwrap();
        }

        let maintenance = MaintenanceLoop::new(
            fx.cache.clone(),
            Arc::new(ReplicationManager::new(
                ReplicationConfig::default(),
                fx.cache.clone(),
            )),
            MaintenanceConfig {
                scrub_sample_size: 2,
                ..Default::default()
            },
        );

        let first = maintenance.scrub_sample();
        let second = maintenance.scrub_sample();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_shutdown_is_cooperative() {
        let fx = fixture();
        let token = fx.maintenance.shutdown_token();
        let handle = fx.maintenance.clone().spawn();

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop exits after cancel")
            .unwrap();
    }
}
