//! Tiered Cache Engine
//!
//! An adaptive multi-level cache over CID-addressed content:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Tiered Cache                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────────────┐   │
//! │  │   Memory     │  │    Disk      │  │         Backend              │   │
//! │  │  (DashMap)   │  │  (sharded    │  │   (remote CAS daemon or      │   │
//! │  │              │  │   dirs +     │  │    cluster, pass-through)    │   │
//! │  │              │  │   index.json)│  │                              │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────────────────┘   │
//! │         │                  │                       │                     │
//! │         └──────────────────┼───────────────────────┘                     │
//! │                            │                                             │
//! │                  ┌─────────┴──────────┐                                  │
//! │                  │     Heat Model     │                                  │
//! │                  │  (64-way sharded)  │                                  │
//! │                  └────────────────────┘                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  • Priority-ordered lookup        • Heat-scored eviction                 │
//! │  • Deferred promotion marking     • Idle-driven demotion                 │
//! │  • Atomic disk writes             • Crash-safe index reconciliation      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Lookups walk the tiers fastest-first and return on the first hit; the
//! serving tier becomes the authoritative `current_tier` for that CID.
//! Content hot enough to matter is marked for promotion and copied up by
//! the maintenance loop; content idle past the demotion threshold migrates
//! down one level at a time.

pub mod backend_tier;
pub mod cid;
pub mod disk;
pub mod entry;
pub mod heat;
pub mod manager;
pub mod memory;
pub mod registry;
pub mod tier;

pub use backend_tier::BackendTier;
pub use cid::{derive_cid, sha256_hex, Cid};
pub use disk::{DiskEntryMeta, DiskTier};
pub use entry::{ContentMetadata, MigrationRecord, PinInfo, PinKind};
pub use heat::{AccessRecord, HeatModel};
pub use manager::{CacheHit, TieredCache};
pub use memory::MemoryTier;
pub use registry::TierRegistry;
pub use tier::{Tier, TierRef, TierStatus};
