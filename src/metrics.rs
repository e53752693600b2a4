//! Metrics collector
//!
//! Ring-buffered latency/bandwidth series per operation, cache hit rates
//! by tier, and per-connection-type transfer accounting (unix socket vs
//! HTTP vs public gateway). Recording is best-effort and never blocks a
//! hot path: one lock, bounded hold (insert plus an occasional trim).

use crate::clock::ClockRef;
use crate::config::MetricsConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

// =============================================================================
// Connection Kinds
// =============================================================================

/// Transport used for an external transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    UnixSocket,
    Http,
    Gateway,
}

impl ConnectionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionKind::UnixSocket => "unix_socket",
            ConnectionKind::Http => "http",
            ConnectionKind::Gateway => "gateway",
        }
    }
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// =============================================================================
// Samples
// =============================================================================

#[derive(Debug, Clone)]
struct OpSample {
    latency_ms: f64,
    bytes: u64,
}

#[derive(Debug, Clone)]
struct TransferSample {
    source: String,
    connection: ConnectionKind,
    bytes: u64,
    elapsed_ms: f64,
    ok: bool,
    outcome: &'static str,
}

#[derive(Default)]
struct MetricsInner {
    operations: HashMap<String, VecDeque<OpSample>>,
    transfers: VecDeque<TransferSample>,
    tier_hits: HashMap<String, u64>,
    misses: u64,
    bytes_served: u64,
    bytes_ingested: u64,
    window_start: u64,
    window_bytes_served: u64,
    window_bytes_ingested: u64,
}

// =============================================================================
// Snapshots
// =============================================================================

/// Latency distribution for one operation
#[derive(Debug, Clone, Serialize)]
pub struct OperationSummary {
    pub name: String,
    pub count: usize,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub bytes_total: u64,
}

/// Transfer statistics for one connection type
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub connection: ConnectionKind,
    pub attempts: usize,
    pub successes: usize,
    pub failures: usize,
    pub bytes_total: u64,
    /// Average goodput over successful transfers, MB/s
    pub avg_rate_mbs: f64,
}

/// Point-in-time view of everything the collector tracks
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub operations: Vec<OperationSummary>,
    pub tier_hits: HashMap<String, u64>,
    pub misses: u64,
    pub overall_hit_rate: f64,
    pub connections: Vec<ConnectionSummary>,
    pub bytes_served: u64,
    pub bytes_ingested: u64,
    pub window_bytes_served: u64,
    pub window_bytes_ingested: u64,
}

// =============================================================================
// Collector
// =============================================================================

/// Best-effort metrics recorder
pub struct MetricsCollector {
    inner: Mutex<MetricsInner>,
    config: MetricsConfig,
    clock: ClockRef,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig, clock: ClockRef) -> Self {
        Self {
            inner: Mutex::new(MetricsInner::default()),
            config,
            clock,
        }
    }

    fn roll_window(&self, inner: &mut MetricsInner) {
        let now = self.clock.now_seconds();
        if inner.window_start == 0 {
            inner.window_start = now;
        } else if now.saturating_sub(inner.window_start)
            >= self.config.collection_interval_seconds
        {
            inner.window_start = now;
            inner.window_bytes_served = 0;
            inner.window_bytes_ingested = 0;
        }
    }

    /// Record one timed operation
    pub fn record_operation(&self, name: &str, latency: Duration, bytes: u64) {
        let cap = self.config.max_samples_per_operation;
        let mut inner = self.inner.lock();
        let series = inner.operations.entry(name.to_string()).or_default();
        series.push_back(OpSample {
            latency_ms: latency.as_secs_f64() * 1000.0,
            bytes,
        });
        while series.len() > cap {
            series.pop_front();
        }
    }

    /// Record which tier served a cache read
    pub fn record_tier_hit(&self, tier: &str) {
        let mut inner = self.inner.lock();
        *inner.tier_hits.entry(tier.to_string()).or_insert(0) += 1;
    }

    /// Record a full cache miss
    pub fn record_miss(&self) {
        self.inner.lock().misses += 1;
    }

    /// Record bytes returned to callers
    pub fn record_bytes_served(&self, bytes: u64) {
        let mut inner = self.inner.lock();
        self.roll_window(&mut inner);
        inner.bytes_served += bytes;
        inner.window_bytes_served += bytes;
    }

    /// Record bytes accepted from callers or fetched from outside
    pub fn record_bytes_ingested(&self, bytes: u64) {
        let mut inner = self.inner.lock();
        self.roll_window(&mut inner);
        inner.bytes_ingested += bytes;
        inner.window_bytes_ingested += bytes;
    }

    /// Record one external transfer attempt
    pub fn record_transfer(
        &self,
        source: &str,
        connection: ConnectionKind,
        bytes: u64,
        elapsed: Duration,
        ok: bool,
        outcome: &'static str,
    ) {
        let cap = self.config.max_samples_per_operation;
        let mut inner = self.inner.lock();
        inner.transfers.push_back(TransferSample {
            source: source.to_string(),
            connection,
            bytes,
            elapsed_ms: elapsed.as_secs_f64() * 1000.0,
            ok,
            outcome,
        });
        while inner.transfers.len() > cap {
            inner.transfers.pop_front();
        }
    }

    /// Attempts recorded against one source (tests and diagnostics)
    pub fn transfer_outcomes(&self, source: &str) -> Vec<(&'static str, u64)> {
        self.inner
            .lock()
            .transfers
            .iter()
            .filter(|t| t.source == source)
            .map(|t| (t.outcome, t.bytes))
            .collect()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock();

        let mut operations: Vec<OperationSummary> = inner
            .operations
            .iter()
            .map(|(name, series)| summarize(name, series))
            .collect();
        operations.sort_by(|a, b| a.name.cmp(&b.name));

        let total_hits: u64 = inner.tier_hits.values().sum();
        let lookups = total_hits + inner.misses;
        let overall_hit_rate = if lookups == 0 {
            0.0
        } else {
            total_hits as f64 / lookups as f64
        };

        let mut by_connection: HashMap<ConnectionKind, Vec<&TransferSample>> = HashMap::new();
        for sample in &inner.transfers {
            by_connection.entry(sample.connection).or_default().push(sample);
        }
        let mut connections: Vec<ConnectionSummary> = by_connection
            .into_iter()
            .map(|(connection, samples)| {
                let successes = samples.iter().filter(|s| s.ok).count();
                let bytes_total: u64 = samples.iter().map(|s| s.bytes).sum();
                let ok_time_s: f64 = samples
                    .iter()
                    .filter(|s| s.ok)
                    .map(|s| s.elapsed_ms / 1000.0)
                    .sum();
                let ok_bytes: u64 = samples.iter().filter(|s| s.ok).map(|s| s.bytes).sum();
                let avg_rate_mbs = if ok_time_s > 0.0 {
                    (ok_bytes as f64 / (1024.0 * 1024.0)) / ok_time_s
                } else {
                    0.0
                };
                ConnectionSummary {
                    connection,
                    attempts: samples.len(),
                    successes,
                    failures: samples.len() - successes,
                    bytes_total,
                    avg_rate_mbs,
                }
            })
            .collect();
        connections.sort_by_key(|c| c.connection.label());

        MetricsSnapshot {
            operations,
            tier_hits: inner.tier_hits.clone(),
            misses: inner.misses,
            overall_hit_rate,
            connections,
            bytes_served: inner.bytes_served,
            bytes_ingested: inner.bytes_ingested,
            window_bytes_served: inner.window_bytes_served,
            window_bytes_ingested: inner.window_bytes_ingested,
        }
    }

    /// Human-readable report with a transport comparison, in the spirit of
    /// `ipfs stats`-style summaries
    pub fn render_report(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();

        out.push_str("=== casgate metrics report ===\n");
        out.push_str(&format!(
            "generated at {}\n\n",
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        ));

        out.push_str("Operations:\n");
        if snapshot.operations.is_empty() {
            out.push_str("  (none recorded)\n");
        }
        for op in &snapshot.operations {
            out.push_str(&format!(
                "  {:<16} count={:<7} mean={:.2}ms median={:.2}ms p95={:.2}ms p99={:.2}ms\n",
                op.name, op.count, op.mean_ms, op.median_ms, op.p95_ms, op.p99_ms
            ));
        }

        out.push_str("\nCache:\n");
        let mut tiers: Vec<(&String, &u64)> = snapshot.tier_hits.iter().collect();
        tiers.sort();
        for (tier, hits) in tiers {
            out.push_str(&format!("  {tier:<16} hits={hits}\n"));
        }
        out.push_str(&format!(
            "  misses={} overall hit rate={:.1}%\n",
            snapshot.misses,
            snapshot.overall_hit_rate * 100.0
        ));

        out.push_str("\nTransfers:\n");
        for conn in &snapshot.connections {
            out.push_str(&format!(
                "  {:<12} attempts={:<5} ok={:<5} failed={:<5} {:.2} MB total, {:.2} MB/s\n",
                conn.connection.label(),
                conn.attempts,
                conn.successes,
                conn.failures,
                conn.bytes_total as f64 / (1024.0 * 1024.0),
                conn.avg_rate_mbs
            ));
        }

        // Transport comparison, socket vs HTTP, when both were exercised
        let socket = snapshot
            .connections
            .iter()
            .find(|c| c.connection == ConnectionKind::UnixSocket);
        let http = snapshot
            .connections
            .iter()
            .find(|c| c.connection == ConnectionKind::Http);
        if let (Some(socket), Some(http)) = (socket, http) {
            if socket.avg_rate_mbs > 0.0 && http.avg_rate_mbs > 0.0 {
                let speedup = socket.avg_rate_mbs / http.avg_rate_mbs;
                out.push_str(&format!(
                    "\nUnix socket vs HTTP: {:.2}x ({:.2} MB/s vs {:.2} MB/s)\n",
                    speedup, socket.avg_rate_mbs, http.avg_rate_mbs
                ));
                if speedup >= 1.0 {
                    out.push_str("Recommendation: keep using the unix socket for local reads.\n");
                } else {
                    out.push_str(
                        "Recommendation: HTTP is outperforming the unix socket, which is unusual; check socket permissions, path, and daemon configuration.\n",
                    );
                }
            }
        } else if http.is_some() && socket.is_none() {
            out.push_str(
                "\nRecommendation: configure unix socket support for faster local transfers.\n",
            );
        }

        out.push_str(&format!(
            "\nBytes: served={} ingested={} (window: {}/{})\n",
            snapshot.bytes_served,
            snapshot.bytes_ingested,
            snapshot.window_bytes_served,
            snapshot.window_bytes_ingested
        ));

        out
    }
}

fn summarize(name: &str, series: &VecDeque<OpSample>) -> OperationSummary {
    let mut latencies: Vec<f64> = series.iter().map(|s| s.latency_ms).collect();
    latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let count = latencies.len();
    let mean = if count == 0 {
        0.0
    } else {
        latencies.iter().sum::<f64>() / count as f64
    };
    OperationSummary {
        name: name.to_string(),
        count,
        mean_ms: mean,
        median_ms: percentile(&latencies, 0.50),
        p95_ms: percentile(&latencies, 0.95),
        p99_ms: percentile(&latencies, 0.99),
        bytes_total: series.iter().map(|s| s.bytes).sum(),
    }
}

/// Nearest-rank percentile over a pre-sorted slice
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() as f64) * q).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn collector() -> (MetricsCollector, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at(1_000_000));
        let collector = MetricsCollector::new(MetricsConfig::default(), clock.clone());
        (collector, clock)
    }

    #[test]
    fn test_percentiles() {
        let sorted: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert_eq!(percentile(&sorted, 0.50), 50.0);
        assert_eq!(percentile(&sorted, 0.95), 95.0);
        assert_eq!(percentile(&sorted, 0.99), 99.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
        assert_eq!(percentile(&[7.0], 0.99), 7.0);
    }

    #[test]
    fn test_operation_summary() {
        let (collector, _) = collector();
        for i in 1..=10 {
            collector.record_operation("get_content", Duration::from_millis(i * 10), 100);
        }

        let snapshot = collector.snapshot();
        let op = &snapshot.operations[0];
        assert_eq!(op.name, "get_content");
        assert_eq!(op.count, 10);
        assert!((op.mean_ms - 55.0).abs() < 0.01);
        assert!((op.median_ms - 50.0).abs() < 0.01);
        assert_eq!(op.bytes_total, 1000);
    }

    #[test]
    fn test_hit_rate() {
        let (collector, _) = collector();
        collector.record_tier_hit("memory");
        collector.record_tier_hit("memory");
        collector.record_tier_hit("disk");
        collector.record_miss();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.tier_hits["memory"], 2);
        assert_eq!(snapshot.tier_hits["disk"], 1);
        assert_eq!(snapshot.misses, 1);
        assert!((snapshot.overall_hit_rate - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_transfer_accounting() {
        let (collector, _) = collector();
        collector.record_transfer(
            "https://ipfs.io/ipfs/",
            ConnectionKind::Gateway,
            0,
            Duration::from_millis(120),
            false,
            "connection_error",
        );
        collector.record_transfer(
            "https://cloudflare-ipfs.com/ipfs/",
            ConnectionKind::Gateway,
            128,
            Duration::from_millis(80),
            true,
            "ok",
        );

        let snapshot = collector.snapshot();
        let gateway = snapshot
            .connections
            .iter()
            .find(|c| c.connection == ConnectionKind::Gateway)
            .unwrap();
        assert_eq!(gateway.attempts, 2);
        assert_eq!(gateway.successes, 1);
        assert_eq!(gateway.failures, 1);
        assert_eq!(gateway.bytes_total, 128);

        let outcomes = collector.transfer_outcomes("https://ipfs.io/ipfs/");
        assert_eq!(outcomes, vec![("connection_error", 0)]);
    }

    #[test]
    fn test_ring_buffer_bounded() {
        let clock = Arc::new(ManualClock::at(0));
        let config = MetricsConfig {
            max_samples_per_operation: 8,
            ..Default::default()
        };
        let collector = MetricsCollector::new(config, clock);

        for i in 0..100 {
            collector.record_operation("op", Duration::from_millis(i), 1);
        }
        assert_eq!(collector.snapshot().operations[0].count, 8);
    }

    #[test]
    fn test_byte_window_rolls() {
        let (collector, clock) = collector();
        collector.record_bytes_served(100);
        assert_eq!(collector.snapshot().window_bytes_served, 100);

        clock.advance(120); // past the 60s default window
        collector.record_bytes_served(50);
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.window_bytes_served, 50);
        assert_eq!(snapshot.bytes_served, 150);
    }

    #[test]
    fn test_report_renders_comparison() {
        let (collector, _) = collector();
        collector.record_transfer(
            "daemon",
            ConnectionKind::UnixSocket,
            10 * 1024 * 1024,
            Duration::from_secs(1),
            true,
            "ok",
        );
        collector.record_transfer(
            "daemon",
            ConnectionKind::Http,
            5 * 1024 * 1024,
            Duration::from_secs(1),
            true,
            "ok",
        );

        let report = collector.render_report();
        assert!(report.contains("Unix socket vs HTTP: 2.00x"));
        assert!(report.contains("keep using the unix socket"));
    }
}
