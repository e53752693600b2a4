//! Gateway configuration
//!
//! All recognized options with their defaults. Configuration is loaded from
//! a YAML file and overridable per-field from the CLI; it is never mutated
//! at runtime except through a full reload.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// =============================================================================
// Defaults
// =============================================================================

/// Default memory tier capacity: 100 MB
pub const DEFAULT_MEMORY_CAPACITY: u64 = 100 * 1024 * 1024;

/// Default disk tier capacity: 1 GB
pub const DEFAULT_DISK_CAPACITY: u64 = 1024 * 1024 * 1024;

/// Default per-item size cap for the memory tier: 50 MiB
pub const DEFAULT_MAX_ITEM_SIZE: u64 = 50 * 1024 * 1024;

/// Local daemon HTTP API fallback address
pub const DEFAULT_DAEMON_API: &str = "http://127.0.0.1:5001/api/v0";

// =============================================================================
// Tier Configuration
// =============================================================================

/// Kind of storage backing a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    /// In-process map, fastest, volatile
    Memory,
    /// Local sharded directory store
    Disk,
    /// Remote CAS (daemon or cluster) exposed as a tier
    Backend,
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierKind::Memory => write!(f, "memory"),
            TierKind::Disk => write!(f, "disk"),
            TierKind::Backend => write!(f, "backend"),
        }
    }
}

/// Declaration of a single cache tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSpec {
    /// Unique tier name
    pub name: String,
    /// Storage kind
    pub kind: TierKind,
    /// Lookup priority, lower = faster
    pub priority: u32,
    /// Capacity in bytes; None = unbounded (backend tiers)
    #[serde(default)]
    pub capacity_bytes: Option<u64>,
    /// Root path for disk tiers
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Per-item size cap; items above it skip this tier
    #[serde(default)]
    pub max_item_size: Option<u64>,
}

impl TierSpec {
    pub fn memory(name: impl Into<String>, priority: u32, capacity_bytes: u64) -> Self {
        Self {
            name: name.into(),
            kind: TierKind::Memory,
            priority,
            capacity_bytes: Some(capacity_bytes),
            path: None,
            max_item_size: Some(DEFAULT_MAX_ITEM_SIZE),
        }
    }

    pub fn disk(name: impl Into<String>, priority: u32, capacity_bytes: u64, path: PathBuf) -> Self {
        Self {
            name: name.into(),
            kind: TierKind::Disk,
            priority,
            capacity_bytes: Some(capacity_bytes),
            path: Some(path),
            max_item_size: None,
        }
    }

    pub fn backend(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            kind: TierKind::Backend,
            priority,
            capacity_bytes: None,
            path: None,
            max_item_size: None,
        }
    }
}

// =============================================================================
// Replication Configuration
// =============================================================================

/// Which content the replication manager places on extra tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMode {
    /// Replicate everything that fits
    All,
    /// Replicate pinned content and content above the heat threshold
    #[default]
    HighValue,
    /// No automatic replication
    None,
}

/// Process-wide replication policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub mode: ReplicationMode,
    /// Quorum floor for writes that request durability
    pub min_factor: usize,
    /// Placement count the maintenance loop tops up to
    pub target_factor: usize,
    /// Upper bound on placements
    pub max_factor: usize,
    /// Heat score above which content counts as high-value
    pub heat_threshold: f64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            mode: ReplicationMode::HighValue,
            min_factor: 3,
            target_factor: 3,
            max_factor: 5,
            heat_threshold: 5.0,
        }
    }
}

// =============================================================================
// Fetch Configuration
// =============================================================================

/// External source configuration for the fetch pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Public gateway base URLs, tried in order (e.g. "https://ipfs.io/ipfs/")
    pub gateway_urls: Vec<String>,
    /// Skip the local daemon entirely
    pub gateway_only: bool,
    /// Try gateways when the local daemon misses or fails
    pub use_gateway_fallback: bool,
    /// Explicit unix socket path for the local daemon; autodetected when None
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    /// Local daemon HTTP API base
    pub daemon_api: String,
    /// Per-source request timeout in seconds
    pub source_timeout_seconds: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            gateway_urls: vec![
                "https://ipfs.io/ipfs/".to_string(),
                "https://cloudflare-ipfs.com/ipfs/".to_string(),
            ],
            gateway_only: false,
            use_gateway_fallback: true,
            socket_path: None,
            daemon_api: DEFAULT_DAEMON_API.to_string(),
            source_timeout_seconds: 60,
        }
    }
}

// =============================================================================
// Metrics Configuration
// =============================================================================

/// Collection window settings for the metrics collector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Aggregation window in seconds
    pub collection_interval_seconds: u64,
    /// How long samples are retained
    pub retention_days: u64,
    /// Ring buffer size per operation series
    pub max_samples_per_operation: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            collection_interval_seconds: 60,
            retention_days: 7,
            max_samples_per_operation: 4096,
        }
    }
}

// =============================================================================
// Gateway Configuration
// =============================================================================

/// Top-level configuration for the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Ordered tier declarations
    pub tiers: Vec<TierSpec>,
    /// Name of the tier writes land on first
    pub default_tier: String,
    /// Items above this skip the memory tier
    pub max_item_size: u64,
    /// Accesses before a slower-tier hit is marked for promotion
    pub promotion_threshold: u64,
    /// Days without access before content migrates down a level
    pub demotion_threshold_days: u64,
    /// Ceiling on retained access records before LRU eviction
    pub max_access_records: usize,
    pub replication: ReplicationConfig,
    pub fetch: FetchConfig,
    pub metrics: MetricsConfig,
    /// Maintenance cycle interval
    pub maintenance_interval_seconds: u64,
    /// Tier health re-probe interval
    pub health_interval_seconds: u64,
    /// How many CIDs each maintenance cycle scrubs for integrity
    pub scrub_sample_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let cache_root = dirs_cache_root();
        Self {
            tiers: vec![
                TierSpec::memory("memory", 1, DEFAULT_MEMORY_CAPACITY),
                TierSpec::disk("disk", 2, DEFAULT_DISK_CAPACITY, cache_root.join("disk")),
                TierSpec::backend("ipfs_local", 3),
            ],
            default_tier: "memory".to_string(),
            max_item_size: DEFAULT_MAX_ITEM_SIZE,
            promotion_threshold: 3,
            demotion_threshold_days: 30,
            max_access_records: 100_000,
            replication: ReplicationConfig::default(),
            fetch: FetchConfig::default(),
            metrics: MetricsConfig::default(),
            maintenance_interval_seconds: 3600,
            health_interval_seconds: 60,
            scrub_sample_size: 16,
        }
    }
}

impl GatewayConfig {
    /// Load from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: GatewayConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field consistency
    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            return Err(Error::Configuration("at least one tier is required".into()));
        }
        if !self.tiers.iter().any(|t| t.name == self.default_tier) {
            return Err(Error::Configuration(format!(
                "default_tier '{}' is not a declared tier",
                self.default_tier
            )));
        }
        let mut names: Vec<&str> = self.tiers.iter().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.tiers.len() {
            return Err(Error::Configuration("tier names must be unique".into()));
        }
        for tier in &self.tiers {
            if tier.kind == TierKind::Disk && tier.path.is_none() {
                return Err(Error::Configuration(format!(
                    "disk tier '{}' requires a path",
                    tier.name
                )));
            }
        }
        if self.replication.min_factor == 0 {
            return Err(Error::Configuration(
                "replication.min_factor must be at least 1".into(),
            ));
        }
        if self.replication.target_factor < self.replication.min_factor
            || self.replication.max_factor < self.replication.target_factor
        {
            return Err(Error::Configuration(
                "replication factors must satisfy min <= target <= max".into(),
            ));
        }
        Ok(())
    }

    /// Demotion threshold expressed in seconds
    pub fn demotion_threshold_seconds(&self) -> u64 {
        self.demotion_threshold_days * 86_400
    }

    /// Tier spec by name
    pub fn tier_spec(&self, name: &str) -> Option<&TierSpec> {
        self.tiers.iter().find(|t| t.name == name)
    }
}

fn dirs_cache_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".casgate")
}
