//! xtrack persistence: a store decorator that snapshots the inventory to a
//! single durable object after each clean poll cycle and replays it on start.
//! Reads are always served from memory.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};
use xtrack_core::{ClaimRecord, CompositeRecord, Snapshot, TrackerMetrics};
use xtrack_store::{Durable, Inventory};

mod backend;
mod codec;
pub mod s3;
pub mod sqlite;

pub use backend::{open_backend, BackendConfig, S3Settings, DEFAULT_S3_KEY_PREFIX, DEFAULT_S3_REGION};
pub use codec::{decode_snapshot, encode_snapshot};
pub use s3::S3Backend;
pub use sqlite::SqliteBackend;

/// Upper bound on a restored payload (100 MiB).
pub const MAX_SNAPSHOT_BYTES: usize = 100 << 20;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("snapshot exceeds maximum allowed size of {max} bytes (got {size})")]
    TooLarge { size: u64, max: usize },
    #[error("snapshot codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("snapshot decompression: {0}")]
    Decompress(#[from] std::io::Error),
    #[error("invalid persistence config: {0}")]
    Config(String),
}

/// A single durable object, overwritten in place.
#[async_trait::async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// Human readable location, for logs.
    fn location(&self) -> String;
    /// Fetch the stored bytes; `Ok(None)` when nothing has been persisted yet.
    /// Implementations should refuse payloads larger than `max_bytes` early.
    async fn get(&self, max_bytes: usize) -> Result<Option<Vec<u8>>>;
    async fn put(&self, body: Vec<u8>) -> Result<()>;
}

/// Wraps an [`Inventory`] and forwards every call to it; adds persist/restore.
pub struct PersistentStore<I> {
    inner: I,
    backend: Arc<dyn SnapshotBackend>,
    persist_lock: tokio::sync::Mutex<()>,
    max_bytes: usize,
    metrics: Option<TrackerMetrics>,
}

impl<I: Inventory> PersistentStore<I> {
    pub fn new(inner: I, backend: Arc<dyn SnapshotBackend>) -> Self {
        Self {
            inner,
            backend,
            persist_lock: tokio::sync::Mutex::new(()),
            max_bytes: MAX_SNAPSHOT_BYTES,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: TrackerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn inner(&self) -> &I {
        &self.inner
    }

    async fn write_snapshot(&self) -> Result<(usize, usize)> {
        let _serialized = self.persist_lock.lock().await;
        let snap = Snapshot {
            claims: self.inner.snapshot_claims(),
            composites: self.inner.snapshot_composites(),
            persisted_at: Utc::now(),
        };
        let body = encode_snapshot(&snap)?;
        self.backend
            .put(body)
            .await
            .with_context(|| format!("writing snapshot to {}", self.backend.location()))?;
        Ok((snap.claims.len(), snap.composites.len()))
    }
}

impl<I: Inventory> Inventory for PersistentStore<I> {
    fn replace_claims(&self, gvr: &str, items: Vec<ClaimRecord>) {
        self.inner.replace_claims(gvr, items)
    }
    fn replace_composites(&self, gvr: &str, items: Vec<CompositeRecord>) {
        self.inner.replace_composites(gvr, items)
    }
    fn enrich_claim_compositions(&self) {
        self.inner.enrich_claim_compositions()
    }
    fn snapshot_claims(&self) -> Vec<ClaimRecord> {
        self.inner.snapshot_claims()
    }
    fn snapshot_composites(&self) -> Vec<CompositeRecord> {
        self.inner.snapshot_composites()
    }
    fn claim_count(&self) -> usize {
        self.inner.claim_count()
    }
    fn composite_count(&self) -> usize {
        self.inner.composite_count()
    }
}

#[async_trait::async_trait]
impl<I: Inventory> Durable for PersistentStore<I> {
    async fn persist(&self) -> Result<()> {
        let started = Instant::now();
        match self.write_snapshot().await {
            Ok((claims, composites)) => {
                if let Some(m) = &self.metrics {
                    m.observe_persist(started.elapsed());
                }
                debug!(location = %self.backend.location(), claims, composites, "persisted store snapshot");
                Ok(())
            }
            Err(e) => {
                if let Some(m) = &self.metrics {
                    m.persist_failed();
                }
                Err(e)
            }
        }
    }

    async fn restore(&self) -> Result<()> {
        let location = self.backend.location();
        let Some(body) = self
            .backend
            .get(self.max_bytes)
            .await
            .with_context(|| format!("reading snapshot from {}", location))?
        else {
            warn!(location = %location, "no existing snapshot found, starting with empty store");
            return Ok(());
        };
        if body.len() > self.max_bytes {
            return Err(PersistError::TooLarge { size: body.len() as u64, max: self.max_bytes }.into());
        }
        let snap = decode_snapshot(&body, self.max_bytes)?;
        let (claims, composites) = (snap.claims.len(), snap.composites.len());

        // Replay per GVR so later stale eviction keeps working.
        let mut claims_by_gvr: BTreeMap<String, Vec<ClaimRecord>> = BTreeMap::new();
        for c in snap.claims {
            claims_by_gvr.entry(c.gvr.clone()).or_default().push(c);
        }
        let mut xrs_by_gvr: BTreeMap<String, Vec<CompositeRecord>> = BTreeMap::new();
        for x in snap.composites {
            xrs_by_gvr.entry(x.gvr.clone()).or_default().push(x);
        }
        for (gvr, items) in xrs_by_gvr {
            self.inner.replace_composites(&gvr, items);
        }
        for (gvr, items) in claims_by_gvr {
            self.inner.replace_claims(&gvr, items);
        }
        self.inner.enrich_claim_compositions();

        info!(
            location = %location,
            claims,
            composites,
            persisted_at = %snap.persisted_at,
            "restored store snapshot"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use xtrack_core::Origin;
    use xtrack_store::MemoryStore;

    /// Backend keeping the object in memory; counts writes.
    #[derive(Default)]
    struct MemBackend {
        body: Mutex<Option<Vec<u8>>>,
        puts: Mutex<usize>,
        fail_get: bool,
    }

    #[async_trait::async_trait]
    impl SnapshotBackend for MemBackend {
        fn location(&self) -> String {
            "mem://snapshot.json".into()
        }
        async fn get(&self, _max_bytes: usize) -> Result<Option<Vec<u8>>> {
            if self.fail_get {
                anyhow::bail!("access denied");
            }
            Ok(self.body.lock().unwrap().clone())
        }
        async fn put(&self, body: Vec<u8>) -> Result<()> {
            *self.body.lock().unwrap() = Some(body);
            *self.puts.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn claim(gvr: &str, ns: &str, name: &str, xr_ref: &str) -> ClaimRecord {
        ClaimRecord {
            gvr: gvr.into(),
            group: "g".into(),
            kind: "Widget".into(),
            namespace: ns.into(),
            name: name.into(),
            creator: Some("alice".into()),
            team: Some("platform".into()),
            composition: String::new(),
            source: Origin::Namespace,
            ready: true,
            reason: "Available".into(),
            created_at: Some(Utc::now()),
            xr_ref: xr_ref.into(),
        }
    }

    fn xr(gvr: &str, name: &str, composition: &str) -> CompositeRecord {
        CompositeRecord {
            gvr: gvr.into(),
            group: "g".into(),
            kind: "XWidget".into(),
            namespace: String::new(),
            name: name.into(),
            composition: composition.into(),
            source: Origin::Central,
            ready: false,
            reason: "Creating".into(),
            created_at: None,
        }
    }

    fn seeded(backend: Arc<MemBackend>) -> PersistentStore<MemoryStore> {
        let store = PersistentStore::new(MemoryStore::new(), backend);
        store.replace_composites("g/v1/xwidgets", vec![xr("g/v1/xwidgets", "x1", "prod")]);
        store.replace_claims(
            "g/v1/widgets",
            vec![claim("g/v1/widgets", "team-a", "w1", "x1"), claim("g/v1/widgets", "team-a", "w2", "")],
        );
        store.replace_claims("g/v1/gadgets", vec![claim("g/v1/gadgets", "team-b", "g1", "")]);
        store.enrich_claim_compositions();
        store
    }

    #[tokio::test]
    async fn persist_then_restore_round_trips() {
        let backend = Arc::new(MemBackend::default());
        let first = seeded(Arc::clone(&backend));
        first.persist().await.unwrap();

        let fresh = PersistentStore::new(MemoryStore::new(), backend.clone());
        fresh.restore().await.unwrap();
        assert_eq!(fresh.snapshot_claims(), first.snapshot_claims());
        assert_eq!(fresh.snapshot_composites(), first.snapshot_composites());
        assert_eq!(fresh.snapshot_claims()[0].composition, "prod");
    }

    #[tokio::test]
    async fn restored_partitions_keep_stale_eviction_working() {
        let backend = Arc::new(MemBackend::default());
        seeded(Arc::clone(&backend)).persist().await.unwrap();

        let fresh = PersistentStore::new(MemoryStore::new(), backend);
        fresh.restore().await.unwrap();
        fresh.replace_claims("g/v1/widgets", vec![claim("g/v1/widgets", "team-a", "w1", "x1")]);

        let names: Vec<_> = fresh.snapshot_claims().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["w1", "g1"]);
    }

    #[tokio::test]
    async fn restore_without_object_is_empty_store() {
        let store = PersistentStore::new(MemoryStore::new(), Arc::new(MemBackend::default()));
        store.restore().await.unwrap();
        assert_eq!(store.claim_count(), 0);
        assert_eq!(store.composite_count(), 0);
    }

    #[tokio::test]
    async fn restore_surfaces_backend_errors() {
        let backend = Arc::new(MemBackend { fail_get: true, ..Default::default() });
        let store = PersistentStore::new(MemoryStore::new(), backend);
        let err = store.restore().await.unwrap_err();
        assert!(format!("{err:#}").contains("access denied"));
    }

    #[tokio::test]
    async fn restore_rejects_oversized_and_corrupt_payloads() {
        let backend = Arc::new(MemBackend::default());
        *backend.body.lock().unwrap() = Some(vec![b' '; 64]);
        let store = PersistentStore::new(MemoryStore::new(), backend.clone()).with_max_bytes(32);
        let err = store.restore().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<PersistError>(), Some(PersistError::TooLarge { .. })));

        *backend.body.lock().unwrap() = Some(b"{not json".to_vec());
        let store = PersistentStore::new(MemoryStore::new(), backend);
        let err = store.restore().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<PersistError>(), Some(PersistError::Codec(_))));
        assert_eq!(store.claim_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_persist_calls_are_serialized() {
        let backend = Arc::new(MemBackend::default());
        let store = Arc::new(seeded(Arc::clone(&backend)));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let s = Arc::clone(&store);
            tasks.push(tokio::spawn(async move { s.persist().await }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(*backend.puts.lock().unwrap(), 8);
        let body = backend.body.lock().unwrap().clone().unwrap();
        let snap = decode_snapshot(&body, MAX_SNAPSHOT_BYTES).unwrap();
        assert_eq!(snap.claims.len(), 3);
        assert_eq!(snap.composites.len(), 1);
    }
}
