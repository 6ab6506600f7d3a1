//! Namespace config registry: labeled ConfigMaps -> published list of
//! [`NamespaceSourceConfig`].
//!
//! A single applier task owns the map and swaps an immutable snapshot after
//! every event, so readers never block the watch feed.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use k8s_openapi::api::core::v1::ConfigMap;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use xtrack_core::{parse_namespace_source, KeyDefaults, NamespaceSourceConfig};

/// Watch feed input, mirroring the watcher's event shapes.
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    Applied(ConfigMap),
    Deleted(ConfigMap),
    /// Full relist; replaces the registry contents.
    Restarted(Vec<ConfigMap>),
}

/// Read side consumed by the poller.
pub trait NamespaceSources: Send + Sync {
    fn snapshot(&self) -> Vec<NamespaceSourceConfig>;
}

fn cm_key(cm: &ConfigMap) -> (String, String) {
    (cm.metadata.namespace.clone().unwrap_or_default(), cm.metadata.name.clone().unwrap_or_default())
}

/// Writer half. Not shared; lives inside the applier task (or a test).
pub struct SourceRegistry {
    configs: FxHashMap<String, NamespaceSourceConfig>,
    defaults: KeyDefaults,
    published: Arc<ArcSwap<Vec<NamespaceSourceConfig>>>,
    synced_tx: watch::Sender<bool>,
}

impl SourceRegistry {
    pub fn new(defaults: KeyDefaults) -> (Self, RegistryHandle) {
        let published = Arc::new(ArcSwap::from_pointee(Vec::new()));
        let (synced_tx, synced_rx) = watch::channel(false);
        let reg = Self { configs: FxHashMap::default(), defaults, published: Arc::clone(&published), synced_tx };
        (reg, RegistryHandle { snap: published, synced_rx })
    }

    pub fn apply(&mut self, ev: ConfigEvent) {
        match ev {
            ConfigEvent::Applied(cm) => self.upsert(&cm),
            ConfigEvent::Deleted(cm) => {
                let (ns, name) = cm_key(&cm);
                if self.configs.remove(&format!("{}/{}", ns, name)).is_some() {
                    info!(namespace = %ns, name = %name, "namespace config removed");
                }
            }
            ConfigEvent::Restarted(list) => {
                debug!(count = list.len(), "config watch relisted");
                self.configs.clear();
                for cm in &list {
                    self.upsert(cm);
                }
                let _ = self.synced_tx.send(true);
            }
        }
        self.publish();
    }

    /// Invalid data drops any previous entry for the same ConfigMap.
    fn upsert(&mut self, cm: &ConfigMap) {
        let (ns, name) = cm_key(cm);
        let key = format!("{}/{}", ns, name);
        match parse_namespace_source(&ns, &name, cm.data.as_ref(), &self.defaults) {
            Ok(cfg) => {
                self.configs.insert(key, cfg);
            }
            Err(e) => {
                warn!(namespace = %ns, name = %name, error = %e, "invalid namespace config; ignoring");
                self.configs.remove(&key);
            }
        }
    }

    fn publish(&self) {
        let mut out: Vec<NamespaceSourceConfig> = self.configs.values().cloned().collect();
        out.sort_by(|a, b| a.namespace.cmp(&b.namespace).then_with(|| a.config_map.cmp(&b.config_map)));
        self.published.store(Arc::new(out));
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

/// Cheap-to-clone reader handle.
#[derive(Clone)]
pub struct RegistryHandle {
    snap: Arc<ArcSwap<Vec<NamespaceSourceConfig>>>,
    synced_rx: watch::Receiver<bool>,
}

impl RegistryHandle {
    /// Current configs, sorted by `namespace/name`.
    pub fn current(&self) -> Arc<Vec<NamespaceSourceConfig>> {
        self.snap.load_full()
    }

    pub fn len(&self) -> usize {
        self.snap.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_synced(&self) -> bool {
        *self.synced_rx.borrow()
    }

    /// Wait for the first full listing. Returns `false` on timeout or when the
    /// applier has gone away without syncing.
    pub async fn wait_synced(&self, timeout: Duration) -> bool {
        let mut rx = self.synced_rx.clone();
        let synced = matches!(tokio::time::timeout(timeout, rx.wait_for(|synced| *synced)).await, Ok(Ok(_)));
        synced
    }
}

impl NamespaceSources for RegistryHandle {
    fn snapshot(&self) -> Vec<NamespaceSourceConfig> {
        self.current().as_ref().clone()
    }
}

/// Spawn the applier loop. Returns the event sender for the watch feed and a
/// reader handle. The loop exits once every sender is dropped.
pub fn spawn_registry(defaults: KeyDefaults, cap: usize) -> (mpsc::Sender<ConfigEvent>, RegistryHandle) {
    let (tx, mut rx) = mpsc::channel::<ConfigEvent>(cap);
    let (mut reg, handle) = SourceRegistry::new(defaults);
    tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            reg.apply(ev);
            debug!(configs = reg.len(), "namespace configs published");
        }
        info!("namespace config registry stopped");
    });
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;
    use xtrack_core::Gvr;

    fn cm(ns: &str, name: &str, data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta { name: Some(name.into()), namespace: Some(ns.into()), ..Default::default() },
            data: Some(data.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<BTreeMap<_, _>>()),
            ..Default::default()
        }
    }

    fn defaults() -> KeyDefaults {
        KeyDefaults {
            creator_annotation_key: Some("example.org/creator".into()),
            team_annotation_key: None,
            composition_label_key: "crossplane.io/composition-name".into(),
        }
    }

    #[test]
    fn applied_config_is_published() {
        let (mut reg, handle) = SourceRegistry::new(defaults());
        reg.apply(ConfigEvent::Applied(cm("team-a", "xp", &[("CLAIM_GVRS", "example.org/v1/widgets")])));
        let snap = handle.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].key(), "team-a/xp");
        assert_eq!(snap[0].claim_gvrs, vec![Gvr::new("example.org", "v1", "widgets")]);
        assert_eq!(snap[0].creator_annotation_key.as_deref(), Some("example.org/creator"));
        assert_eq!(handle.len(), 1);
    }

    #[test]
    fn update_replaces_and_invalid_update_removes() {
        let (mut reg, handle) = SourceRegistry::new(defaults());
        reg.apply(ConfigEvent::Applied(cm("team-a", "xp", &[("CLAIM_GVRS", "example.org/v1/widgets")])));
        reg.apply(ConfigEvent::Applied(cm(
            "team-a",
            "xp",
            &[("XR_GVRS", "example.org/v1/xwidgets"), ("CREATOR_ANNOTATION_KEY", "team-a/owner")],
        )));
        let snap = handle.snapshot();
        assert!(snap[0].claim_gvrs.is_empty());
        assert_eq!(snap[0].xr_gvrs.len(), 1);
        assert_eq!(snap[0].creator_annotation_key.as_deref(), Some("team-a/owner"));

        reg.apply(ConfigEvent::Applied(cm("team-a", "xp", &[("CLAIM_GVRS", "not-a-gvr")])));
        assert!(handle.is_empty());
    }

    #[test]
    fn delete_removes_only_that_config() {
        let (mut reg, handle) = SourceRegistry::new(defaults());
        reg.apply(ConfigEvent::Applied(cm("team-a", "xp", &[("CLAIM_GVRS", "example.org/v1/widgets")])));
        reg.apply(ConfigEvent::Applied(cm("team-b", "xp", &[("CLAIM_GVRS", "example.org/v1/widgets")])));
        reg.apply(ConfigEvent::Deleted(cm("team-a", "xp", &[])));
        let keys: Vec<_> = handle.snapshot().iter().map(|c| c.key()).collect();
        assert_eq!(keys, vec!["team-b/xp"]);
    }

    #[test]
    fn restart_replaces_wholesale_and_marks_synced() {
        let (mut reg, handle) = SourceRegistry::new(defaults());
        assert!(!handle.is_synced());
        reg.apply(ConfigEvent::Applied(cm("stale", "xp", &[("CLAIM_GVRS", "example.org/v1/widgets")])));
        reg.apply(ConfigEvent::Restarted(vec![
            cm("team-b", "xp", &[("CLAIM_GVRS", "example.org/v1/widgets")]),
            cm("team-a", "xp", &[("XR_GVRS", "example.org/v1/xwidgets")]),
            cm("team-c", "broken", &[]),
        ]));
        let keys: Vec<_> = handle.snapshot().iter().map(|c| c.key()).collect();
        assert_eq!(keys, vec!["team-a/xp", "team-b/xp"]);
        assert!(handle.is_synced());
    }

    #[tokio::test]
    async fn wait_synced_tracks_first_relist() {
        let (mut reg, handle) = SourceRegistry::new(defaults());
        assert!(!handle.wait_synced(Duration::from_millis(5)).await);

        let waiter = {
            let h = handle.clone();
            tokio::spawn(async move { h.wait_synced(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        reg.apply(ConfigEvent::Restarted(vec![cm("team-a", "xp", &[("XR_GVRS", "example.org/v1/xwidgets")])]));
        assert!(waiter.await.unwrap());
        assert!(handle.wait_synced(Duration::from_millis(5)).await);

        // writer gone before any relist
        let (reg, handle) = SourceRegistry::new(defaults());
        drop(reg);
        assert!(!handle.wait_synced(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn spawned_registry_serves_concurrent_readers() {
        let (tx, handle) = spawn_registry(defaults(), 16);
        assert!(!handle.wait_synced(Duration::from_millis(10)).await);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let h = handle.clone();
                tokio::spawn(async move {
                    for _ in 0..100 {
                        let snap = h.snapshot();
                        assert!(snap.windows(2).all(|w| w[0].key() <= w[1].key()));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        tx.send(ConfigEvent::Restarted(vec![])).await.unwrap();
        for i in 0..20 {
            let ev = cm(&format!("ns-{i:02}"), "xp", &[("CLAIM_GVRS", "example.org/v1/widgets")]);
            tx.send(ConfigEvent::Applied(ev)).await.unwrap();
        }
        for r in readers {
            r.await.unwrap();
        }
        assert!(handle.wait_synced(Duration::from_secs(1)).await);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), async {
            while handle.len() < 20 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
