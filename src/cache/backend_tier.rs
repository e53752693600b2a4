//! Backend tier
//!
//! Exposes a remote CAS as the slowest cache tier. The adapter caches
//! nothing itself: `put` pins content on the backend, `evict` unpins it,
//! reads pass straight through. Health tracks the backend's identity
//! endpoint.

use crate::backend::BackendRef;
use crate::cache::cid::Cid;
use crate::cache::entry::ContentMetadata;
use crate::cache::tier::Tier;
use crate::config::TierKind;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Remote CAS exposed as a tier
pub struct BackendTier {
    name: String,
    priority: u32,
    backend: BackendRef,
    hits: AtomicU64,
    pins: AtomicU64,
}

impl BackendTier {
    pub fn new(name: impl Into<String>, priority: u32, backend: BackendRef) -> Self {
        Self {
            name: name.into(),
            priority,
            backend,
            hits: AtomicU64::new(0),
            pins: AtomicU64::new(0),
        }
    }

    /// Hits served by this tier since startup
    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn backend(&self) -> &BackendRef {
        &self.backend
    }
}

#[async_trait]
impl Tier for BackendTier {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TierKind {
        TierKind::Backend
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn capacity_bytes(&self) -> Option<u64> {
        // The remote store's capacity is not ours to account
        None
    }

    fn used_bytes(&self) -> u64 {
        0
    }

    fn entry_count(&self) -> u64 {
        self.pins.load(Ordering::Relaxed)
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        self.backend.has(cid).await
    }

    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>> {
        match self.backend.get(cid).await {
            Ok(data) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(data))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put(&self, cid: &Cid, data: Bytes, _meta: Option<&ContentMetadata>) -> Result<()> {
        let assigned = self.backend.put(data).await?;
        if assigned != *cid {
            // Different multihash settings can re-encode the same content;
            // the stored bytes are identical either way.
            debug!(
                tier = %self.name,
                expected = %cid,
                assigned = %assigned,
                "backend assigned a different CID encoding"
            );
        }
        self.backend.pin(&assigned).await?;
        if assigned != *cid {
            // Keep the caller's handle pinned too when the backend knows it
            match self.backend.pin(cid).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        self.pins.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn evict(&self, cid: &Cid) -> Result<bool> {
        let was_present = self.backend.has(cid).await.unwrap_or(false);
        self.backend.unpin(cid).await?;
        if was_present {
            let count = self.pins.load(Ordering::Relaxed);
            if count > 0 {
                self.pins.fetch_sub(1, Ordering::Relaxed);
            }
        }
        Ok(was_present)
    }

    async fn cids(&self) -> Result<Vec<Cid>> {
        Ok(self
            .backend
            .list_pins()
            .await?
            .into_iter()
            .map(|p| p.cid)
            .collect())
    }

    async fn health_check(&self) -> Result<bool> {
        match self.backend.id().await {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!(tier = %self.name, error = %e, "backend identity probe failed");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::cache::cid::derive_cid;
    use std::sync::Arc;

    fn tier_with_backend() -> (BackendTier, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        let tier = BackendTier::new("ipfs_local", 3, backend.clone());
        (tier, backend)
    }

    #[tokio::test]
    async fn test_put_pins_on_backend() {
        let (tier, backend) = tier_with_backend();
        let data = Bytes::from("pin me");
        let cid = derive_cid(&data);

        tier.put(&cid, data.clone(), None).await.unwrap();
        assert!(backend.is_pinned(&cid));
        assert!(tier.has(&cid).await.unwrap());

        let fetched = tier.get(&cid).await.unwrap().unwrap();
        assert_eq!(fetched, data);
        assert_eq!(tier.hit_count(), 1);
    }

    #[tokio::test]
    async fn test_evict_unpins() {
        let (tier, backend) = tier_with_backend();
        let data = Bytes::from("transient");
        let cid = derive_cid(&data);

        tier.put(&cid, data, None).await.unwrap();
        assert!(tier.evict(&cid).await.unwrap());
        assert!(!backend.is_pinned(&cid));

        // evicting again reports absence of a pin, not an error
        // (the block itself stays in the CAS; GC is not our concern)
        tier.evict(&cid).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_miss_is_clean() {
        let (tier, _) = tier_with_backend();
        assert_eq!(tier.get(&Cid::new("bafymissing")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_health_follows_backend() {
        let (tier, backend) = tier_with_backend();
        assert!(tier.health_check().await.unwrap());

        backend.set_healthy(false);
        assert!(!tier.health_check().await.unwrap());
    }
}
