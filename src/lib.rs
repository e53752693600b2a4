//! casgate - Client-Side Gateway to Content-Addressed Storage
//!
//! Serves CAS content with better latency and availability than the raw
//! store by keeping a multi-tier cache in front of it, with automatic
//! promotion/demotion, policy-driven replication, and cross-tier integrity
//! verification.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                             Content Gateway                                  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  Tiered Cache   │  │  Gateway Fetch  │  │  Replication & Integrity    │  │
//! │  │  memory → disk  │  │  daemon-first,  │  │  quorum placement,          │  │
//! │  │  → backend      │  │  public gateway │  │  SHA-256 scrubbing          │  │
//! │  │                 │  │  fallback       │  │                             │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                   │
//! │           └────────────────────┼─────────────────────────┘                   │
//! │                                │                                             │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │   Maintenance Loop    │                                │
//! │                    │ health / promote /    │                                │
//! │                    │ demote / top-up /     │                                │
//! │                    │ scrub                 │                                │
//! │                    └───────────────────────┘                                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                              CAS Backend                                     │
//! │        local daemon (unix socket → HTTP loopback) or cluster                 │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`]: tiers, heat model, and the tiered cache orchestrator
//! - [`fetch`]: external retrieval with per-source accounting
//! - [`replication`]: placement policy, quorum, and verification
//! - [`maintenance`]: the periodic background worker
//! - [`gateway`]: the transport-neutral operation surface
//! - [`backend`]: CAS backend contract and adapters
//! - [`metrics`]: latency/bandwidth/hit-rate collection and reporting

pub mod backend;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod fetch;
pub mod gateway;
pub mod maintenance;
pub mod metrics;
pub mod replication;

// Re-export commonly used types
pub use backend::{BackendRef, CasBackend, DaemonBackend, DaemonTransport, MockBackend, PeerInfo};
pub use cache::{
    derive_cid, CacheHit, Cid, ContentMetadata, DiskTier, HeatModel, MemoryTier, PinInfo, PinKind,
    TierRegistry, TieredCache,
};
pub use clock::{Clock, ClockRef, ManualClock, SystemClock};
pub use config::{GatewayConfig, ReplicationConfig, ReplicationMode, TierKind, TierSpec};
pub use error::{Error, Result};
pub use fetch::{FetchAttempt, FetchOutcome, GatewayFetcher};
pub use gateway::{AddOptions, AddResponse, ContentGateway, GatewayStats};
pub use maintenance::{CycleReport, MaintenanceConfig, MaintenanceLoop};
pub use metrics::{ConnectionKind, MetricsCollector, MetricsSnapshot};
pub use replication::{ReplicationManager, ReplicationReport, VerifyReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
