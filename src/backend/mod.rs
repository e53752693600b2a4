//! CAS backend adapters
//!
//! The core never assumes a backend is local. Everything it needs from a
//! remote content-addressed store is captured by the [`CasBackend`] trait;
//! concrete adapters (the HTTP daemon client, the in-memory test backend)
//! are chosen at construction time.

pub mod http;
pub mod mock;

pub use http::{DaemonBackend, DaemonTransport};
pub use mock::MockBackend;

use crate::cache::cid::Cid;
use crate::cache::entry::PinInfo;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Backend Types
// =============================================================================

/// Identity of the remote peer, from the backend's id endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub agent_version: String,
}

/// Size information for a stored block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockStat {
    pub cid: Cid,
    pub size: u64,
}

// =============================================================================
// CasBackend Trait
// =============================================================================

/// Capability set the core expects from a remote CAS
#[async_trait]
pub trait CasBackend: Send + Sync {
    /// Adapter name for logs and error context
    fn name(&self) -> &str;

    /// Whether the backend holds the block locally
    async fn has(&self, cid: &Cid) -> Result<bool>;

    /// Fetch the full payload
    async fn get(&self, cid: &Cid) -> Result<Bytes>;

    /// Store content and receive its CID
    async fn put(&self, data: Bytes) -> Result<Cid>;

    /// Pin the CID for durability
    async fn pin(&self, cid: &Cid) -> Result<()>;

    /// Remove a pin; succeeds when the CID was not pinned
    async fn unpin(&self, cid: &Cid) -> Result<()>;

    /// All pins held by the backend
    async fn list_pins(&self) -> Result<Vec<PinInfo>>;

    /// Cheap identity probe, also used as the health check
    async fn id(&self) -> Result<PeerInfo>;

    /// Backend software version
    async fn version(&self) -> Result<String>;

    /// Size of a stored block without fetching it
    async fn stat_block(&self, cid: &Cid) -> Result<BlockStat>;
}

/// Shared backend handle
pub type BackendRef = Arc<dyn CasBackend>;
