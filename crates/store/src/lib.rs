//! xtrack store: per-GVR partitioned inventory of claims and composites.

#![forbid(unsafe_code)]

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;
use xtrack_core::{ClaimRecord, CompositeRecord};

/// Store interface consumed by the poller, persistence and readers.
/// Implementations must be safe for concurrent use.
pub trait Inventory: Send + Sync {
    /// Upsert `items` for the `gvr` partition and evict entries of that
    /// partition that are no longer listed. Other partitions are untouched.
    fn replace_claims(&self, gvr: &str, items: Vec<ClaimRecord>);
    fn replace_composites(&self, gvr: &str, items: Vec<CompositeRecord>);
    /// Copy each referenced composite's composition onto its claim.
    fn enrich_claim_compositions(&self);
    fn snapshot_claims(&self) -> Vec<ClaimRecord>;
    fn snapshot_composites(&self) -> Vec<CompositeRecord>;
    fn claim_count(&self) -> usize;
    fn composite_count(&self) -> usize;
}

/// Inventory that can be made durable across restarts.
#[async_trait::async_trait]
pub trait Durable: Inventory {
    /// Write the full current inventory to the durable backend.
    async fn persist(&self) -> anyhow::Result<()>;
    /// Replay the durable inventory, if any, into memory.
    async fn restore(&self) -> anyhow::Result<()>;
}

#[derive(Default)]
struct Maps {
    claims: FxHashMap<String, ClaimRecord>,
    composites: FxHashMap<String, CompositeRecord>,
}

/// Lock-guarded in-memory implementation of [`Inventory`].
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Maps>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Maps> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Maps> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared replace-and-evict step for both maps.
fn replace_partition<T>(
    map: &mut FxHashMap<String, T>,
    gvr: &str,
    items: Vec<T>,
    key: impl Fn(&T) -> String,
    partition: impl Fn(&T) -> &str,
) -> usize {
    let mut incoming: FxHashSet<String> = FxHashSet::default();
    incoming.reserve(items.len());
    for item in items {
        let k = key(&item);
        incoming.insert(k.clone());
        map.insert(k, item);
    }
    let before = map.len();
    map.retain(|k, v| partition(v) != gvr || incoming.contains(k));
    before - map.len()
}

impl Inventory for MemoryStore {
    fn replace_claims(&self, gvr: &str, mut items: Vec<ClaimRecord>) {
        for c in items.iter_mut() {
            c.gvr = gvr.to_string();
        }
        let mut maps = self.write();
        let evicted = replace_partition(&mut maps.claims, gvr, items, ClaimRecord::key, |c| c.gvr.as_str());
        debug!(gvr, evicted, total = maps.claims.len(), "claims replaced");
    }

    fn replace_composites(&self, gvr: &str, mut items: Vec<CompositeRecord>) {
        for x in items.iter_mut() {
            x.gvr = gvr.to_string();
        }
        let mut maps = self.write();
        let evicted =
            replace_partition(&mut maps.composites, gvr, items, CompositeRecord::key, |x| x.gvr.as_str());
        debug!(gvr, evicted, total = maps.composites.len(), "composites replaced");
    }

    fn enrich_claim_compositions(&self) {
        let mut guard = self.write();
        let Maps { claims, composites } = &mut *guard;
        for claim in claims.values_mut() {
            // Composites are cluster-scoped: look up by name only.
            claim.composition = if claim.xr_ref.is_empty() {
                String::new()
            } else {
                composites.get(&claim.xr_ref).map(|x| x.composition.clone()).unwrap_or_default()
            };
        }
    }

    fn snapshot_claims(&self) -> Vec<ClaimRecord> {
        let mut out: Vec<ClaimRecord> = self.read().claims.values().cloned().collect();
        out.sort_unstable_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        out
    }

    fn snapshot_composites(&self) -> Vec<CompositeRecord> {
        let mut out: Vec<CompositeRecord> = self.read().composites.values().cloned().collect();
        out.sort_unstable_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        out
    }

    fn claim_count(&self) -> usize {
        self.read().claims.len()
    }

    fn composite_count(&self) -> usize {
        self.read().composites.len()
    }
}
