//! In-memory CAS backend
//!
//! Serves two purposes: the fake backend for tests, and the store used in
//! gateway-only deployments where no daemon is reachable but callers still
//! add content locally. CIDs are derived from the payload digest.

use crate::backend::{BlockStat, CasBackend, PeerInfo};
use crate::cache::cid::{derive_cid, Cid};
use crate::cache::entry::{PinInfo, PinKind};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// In-memory backend with scriptable health for tests
pub struct MockBackend {
    name: String,
    blocks: DashMap<String, Bytes>,
    pins: DashMap<String, PinKind>,
    healthy: AtomicBool,
    /// Operation counters for assertions
    get_calls: AtomicU64,
    put_calls: AtomicU64,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::named("mock")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blocks: DashMap::new(),
            pins: DashMap::new(),
            healthy: AtomicBool::new(true),
            get_calls: AtomicU64::new(0),
            put_calls: AtomicU64::new(0),
        }
    }

    /// Script the health probe result
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Seed a block without going through `put`
    pub fn insert_block(&self, cid: &Cid, data: Bytes) {
        self.blocks.insert(cid.as_str().to_string(), data);
    }

    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::Relaxed)
    }

    pub fn put_calls(&self) -> u64 {
        self.put_calls.load(Ordering::Relaxed)
    }

    pub fn is_pinned(&self, cid: &Cid) -> bool {
        self.pins.contains_key(cid.as_str())
    }

    fn ensure_healthy(&self, operation: &str) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Backend {
                backend: self.name.clone(),
                operation: operation.to_string(),
                cause: "backend is down".into(),
            })
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CasBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        self.ensure_healthy("has")?;
        Ok(self.blocks.contains_key(cid.as_str()))
    }

    async fn get(&self, cid: &Cid) -> Result<Bytes> {
        self.ensure_healthy("get")?;
        self.get_calls.fetch_add(1, Ordering::Relaxed);
        self.blocks
            .get(cid.as_str())
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::not_found(cid.as_str(), format!("backend {}", self.name)))
    }

    async fn put(&self, data: Bytes) -> Result<Cid> {
        self.ensure_healthy("put")?;
        self.put_calls.fetch_add(1, Ordering::Relaxed);
        let cid = derive_cid(&data);
        self.blocks.insert(cid.as_str().to_string(), data);
        Ok(cid)
    }

    async fn pin(&self, cid: &Cid) -> Result<()> {
        self.ensure_healthy("pin")?;
        if !self.blocks.contains_key(cid.as_str()) {
            return Err(Error::not_found(cid.as_str(), "pin on unknown block"));
        }
        self.pins
            .insert(cid.as_str().to_string(), PinKind::Recursive);
        Ok(())
    }

    async fn unpin(&self, cid: &Cid) -> Result<()> {
        self.ensure_healthy("unpin")?;
        self.pins.remove(cid.as_str());
        Ok(())
    }

    async fn list_pins(&self) -> Result<Vec<PinInfo>> {
        self.ensure_healthy("list_pins")?;
        Ok(self
            .pins
            .iter()
            .map(|e| PinInfo {
                cid: Cid::new(e.key().clone()),
                kind: *e.value(),
            })
            .collect())
    }

    async fn id(&self) -> Result<PeerInfo> {
        self.ensure_healthy("id")?;
        Ok(PeerInfo {
            id: format!("12D3Koo{}", self.name),
            addresses: vec!["/ip4/127.0.0.1/tcp/4001".into()],
            agent_version: "casgate-mock/0.2.0".into(),
        })
    }

    async fn version(&self) -> Result<String> {
        self.ensure_healthy("version")?;
        Ok("mock-0.2.0".into())
    }

    async fn stat_block(&self, cid: &Cid) -> Result<BlockStat> {
        self.ensure_healthy("stat_block")?;
        let size = self
            .blocks
            .get(cid.as_str())
            .map(|e| e.value().len() as u64)
            .ok_or_else(|| Error::not_found(cid.as_str(), "stat on unknown block"))?;
        Ok(BlockStat {
            cid: cid.clone(),
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_put_assigns_content_derived_cid() {
        let backend = MockBackend::new();
        let cid = backend.put(Bytes::from("hello")).await.unwrap();

        assert!(backend.has(&cid).await.unwrap());
        let data = backend.get(&cid).await.unwrap();
        assert_eq!(data.as_ref(), b"hello");

        // identical content, identical CID
        let again = backend.put(Bytes::from("hello")).await.unwrap();
        assert_eq!(cid, again);
    }

    #[tokio::test]
    async fn test_pin_cycle() {
        let backend = MockBackend::new();
        let cid = backend.put(Bytes::from("pinned data")).await.unwrap();

        backend.pin(&cid).await.unwrap();
        assert!(backend.is_pinned(&cid));

        let pins = backend.list_pins().await.unwrap();
        assert_eq!(pins.len(), 1);
        assert_eq!(pins[0].cid, cid);

        // unpin is idempotent
        backend.unpin(&cid).await.unwrap();
        backend.unpin(&cid).await.unwrap();
        assert!(!backend.is_pinned(&cid));
    }

    #[tokio::test]
    async fn test_unhealthy_backend_errors() {
        let backend = MockBackend::new();
        backend.set_healthy(false);

        assert_matches!(backend.id().await, Err(Error::Backend { .. }));
        assert_matches!(
            backend.get(&Cid::new("bafyanything")).await,
            Err(Error::Backend { .. })
        );
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let backend = MockBackend::new();
        assert_matches!(
            backend.get(&Cid::new("bafymissing")).await,
            Err(Error::NotFound { .. })
        );
    }
}
