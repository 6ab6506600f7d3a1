//! Periodic list-and-replace of configured claim and composite GVRs.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use kube::core::DynamicObject;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use xtrack_core::{ConvertKeys, Gvr, NamespaceSourceConfig, TrackerConfig, TrackerMetrics};
use xtrack_store::{Durable, Inventory};

use crate::convert::{claim_from, composite_from};
use crate::lister::{list_all, ResourceLister};
use crate::NamespaceSources;

/// A failed list call. The GVR's partition is left as it was unless another
/// scope of the same GVR listed successfully.
#[derive(Debug)]
pub struct PollError {
    pub gvr: String,
    pub namespace: Option<String>,
    pub error: anyhow::Error,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub took: Duration,
    pub errors: Vec<PollError>,
    pub claims: usize,
    pub composites: usize,
    /// Namespace-declared GVRs ignored because they are polled centrally.
    pub skipped: Vec<String>,
    /// Namespace-declared GVRs no config declares any more; emptied this cycle.
    pub retired: Vec<String>,
    pub persisted: bool,
}

impl CycleReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// One list target plus the keys used to convert what it returns.
struct Scope<'a> {
    namespace: Option<&'a str>,
    keys: &'a ConvertKeys,
}

/// Per-cycle listing plan for the namespace configs.
#[derive(Default)]
struct NamespacePlan {
    /// Distinct composite GVRs, first declaring config's keys.
    composites: Vec<(Gvr, ConvertKeys)>,
    /// Claim GVR -> one `(namespace, keys)` per declaring namespace.
    claims: Vec<(Gvr, Vec<(String, ConvertKeys)>)>,
    skipped: Vec<String>,
}

/// GVRs listed on behalf of namespace configs in the previous cycle.
#[derive(Default)]
struct NamespaceGvrs {
    claims: FxHashSet<String>,
    composites: FxHashSet<String>,
}

impl NamespacePlan {
    fn build(
        configs: &[NamespaceSourceConfig],
        central: &TrackerConfig,
        central_claims: &FxHashSet<String>,
        central_xrs: &FxHashSet<String>,
    ) -> Self {
        let mut plan = Self::default();
        let mut xr_seen: FxHashSet<String> = FxHashSet::default();
        let mut claim_idx: FxHashMap<String, usize> = FxHashMap::default();

        for cfg in configs {
            let keys = cfg.convert_keys(&central.keys);
            for gvr in &cfg.xr_gvrs {
                let g = gvr.to_string();
                if central_xrs.contains(&g) {
                    debug!(namespace = %cfg.namespace, config = %cfg.config_map, gvr = %g, "composite GVR already polled centrally; skipping");
                    plan.skipped.push(g);
                    continue;
                }
                if xr_seen.insert(g) {
                    plan.composites.push((gvr.clone(), keys.clone()));
                }
            }
            for gvr in &cfg.claim_gvrs {
                let g = gvr.to_string();
                if central_claims.contains(&g) {
                    debug!(namespace = %cfg.namespace, config = %cfg.config_map, gvr = %g, "claim GVR already polled centrally; skipping");
                    plan.skipped.push(g);
                    continue;
                }
                let idx = *claim_idx.entry(g).or_insert_with(|| {
                    plan.claims.push((gvr.clone(), Vec::new()));
                    plan.claims.len() - 1
                });
                let scopes = &mut plan.claims[idx].1;
                // Two configs in one namespace: the first one listed wins.
                if !scopes.iter().any(|(ns, _)| ns == &cfg.namespace) {
                    scopes.push((cfg.namespace.clone(), keys.clone()));
                }
            }
        }
        plan
    }
}

pub struct Poller {
    lister: Arc<dyn ResourceLister>,
    cfg: TrackerConfig,
    store: Arc<dyn Inventory>,
    durable: Option<Arc<dyn Durable>>,
    sources: Option<Arc<dyn NamespaceSources>>,
    metrics: TrackerMetrics,
    cycle_tx: watch::Sender<u64>,
    namespace_gvrs: Mutex<NamespaceGvrs>,
}

impl Poller {
    pub fn new(lister: Arc<dyn ResourceLister>, cfg: TrackerConfig, store: Arc<dyn Inventory>) -> Self {
        let (cycle_tx, _) = watch::channel(0u64);
        Self {
            lister,
            cfg,
            store,
            durable: None,
            sources: None,
            metrics: TrackerMetrics::default(),
            cycle_tx,
            namespace_gvrs: Mutex::new(NamespaceGvrs::default()),
        }
    }

    /// Use a durable store: it becomes the inventory and is persisted after
    /// every error-free cycle.
    pub fn with_persistence<P: Durable + 'static>(mut self, store: Arc<P>) -> Self {
        self.store = store.clone();
        self.durable = Some(store);
        self
    }

    pub fn with_sources(mut self, sources: Arc<dyn NamespaceSources>) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn with_metrics(mut self, metrics: TrackerMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Completed-cycle counter; ticks after every cycle, success or not.
    pub fn subscribe_cycles(&self) -> watch::Receiver<u64> {
        self.cycle_tx.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn Inventory> {
        &self.store
    }

    /// Run one full cycle: central GVRs, namespace configs, enrichment and,
    /// when nothing failed, persistence.
    pub async fn poll_once(&self) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::default();
        debug!("poll cycle started");

        let central_keys = ConvertKeys::central(&self.cfg.keys);
        // The namespace filter scopes claims only; composites are cluster-scoped.
        let cluster_wide = [Scope { namespace: None, keys: &central_keys }];
        let claim_scopes: Vec<Scope<'_>> = if self.cfg.namespaces.is_empty() {
            vec![Scope { namespace: None, keys: &central_keys }]
        } else {
            self.cfg.namespaces.iter().map(|ns| Scope { namespace: Some(ns.as_str()), keys: &central_keys }).collect()
        };

        let mut central_xrs: FxHashSet<String> = FxHashSet::default();
        for gvr in &self.cfg.xr_gvrs {
            central_xrs.insert(gvr.to_string());
            self.poll_composites(gvr, &cluster_wide, &mut report).await;
        }
        let mut central_claims: FxHashSet<String> = FxHashSet::default();
        for gvr in &self.cfg.claim_gvrs {
            central_claims.insert(gvr.to_string());
            self.poll_claims(gvr, &claim_scopes, &mut report).await;
        }

        if let Some(sources) = &self.sources {
            let configs = sources.snapshot();
            self.metrics.set_namespace_configs(configs.len());
            self.poll_namespace_configs(&configs, &central_claims, &central_xrs, &mut report).await;
        }

        self.store.enrich_claim_compositions();
        self.metrics.observe_inventory(&self.store.snapshot_claims(), &self.store.snapshot_composites());

        if !report.is_ok() {
            warn!(errors = report.errors.len(), "poll cycle had errors; skipping persistence");
        } else if let Some(durable) = &self.durable {
            match durable.persist().await {
                Ok(()) => report.persisted = true,
                Err(e) => error!(error = ?e, "persisting inventory failed"),
            }
        }

        report.claims = self.store.claim_count();
        report.composites = self.store.composite_count();
        report.took = started.elapsed();
        self.metrics.observe_cycle(report.took, report.claims, report.composites);
        info!(
            claims = report.claims,
            composites = report.composites,
            errors = report.errors.len(),
            persisted = report.persisted,
            took_ms = %report.took.as_millis(),
            "poll cycle complete"
        );
        report
    }

    async fn poll_namespace_configs(
        &self,
        configs: &[NamespaceSourceConfig],
        central_claims: &FxHashSet<String>,
        central_xrs: &FxHashSet<String>,
        report: &mut CycleReport,
    ) {
        let plan = NamespacePlan::build(configs, &self.cfg, central_claims, central_xrs);
        for g in &plan.skipped {
            self.metrics.namespace_gvr_skipped(g);
        }
        report.skipped.extend(plan.skipped.iter().cloned());

        for (gvr, keys) in &plan.composites {
            let scopes = [Scope { namespace: None, keys }];
            self.poll_composites(gvr, &scopes, report).await;
        }
        for (gvr, targets) in &plan.claims {
            let scopes: Vec<Scope<'_>> =
                targets.iter().map(|(ns, keys)| Scope { namespace: Some(ns.as_str()), keys }).collect();
            self.poll_claims(gvr, &scopes, report).await;
        }

        let now = NamespaceGvrs {
            claims: plan.claims.iter().map(|(g, _)| g.to_string()).collect(),
            composites: plan.composites.iter().map(|(g, _)| g.to_string()).collect(),
        };
        let previous = std::mem::replace(&mut *self.namespace_gvrs.lock().unwrap_or_else(PoisonError::into_inner), now);
        self.retire_namespace_gvrs(previous, central_claims, central_xrs, report);
    }

    /// Empty the partitions of namespace-declared GVRs that no config declares
    /// any more, unless they are polled centrally now.
    fn retire_namespace_gvrs(
        &self,
        previous: NamespaceGvrs,
        central_claims: &FxHashSet<String>,
        central_xrs: &FxHashSet<String>,
        report: &mut CycleReport,
    ) {
        let current = self.namespace_gvrs.lock().unwrap_or_else(PoisonError::into_inner);
        for g in previous.claims {
            if !current.claims.contains(&g) && !central_claims.contains(&g) {
                info!(gvr = %g, "claim GVR no longer declared by any namespace config; evicting");
                self.store.replace_claims(&g, Vec::new());
                report.retired.push(g);
            }
        }
        for g in previous.composites {
            if !current.composites.contains(&g) && !central_xrs.contains(&g) {
                info!(gvr = %g, "composite GVR no longer declared by any namespace config; evicting");
                self.store.replace_composites(&g, Vec::new());
                report.retired.push(g);
            }
        }
    }

    async fn poll_claims(&self, gvr: &Gvr, scopes: &[Scope<'_>], report: &mut CycleReport) {
        if let Some(items) = self.collect(gvr, scopes, report, claim_from).await {
            let n = items.len();
            self.store.replace_claims(&gvr.to_string(), items);
            debug!(gvr = %gvr, claims = n, "claims replaced");
        }
    }

    async fn poll_composites(&self, gvr: &Gvr, scopes: &[Scope<'_>], report: &mut CycleReport) {
        if let Some(items) = self.collect(gvr, scopes, report, composite_from).await {
            let n = items.len();
            self.store.replace_composites(&gvr.to_string(), items);
            debug!(gvr = %gvr, composites = n, "composites replaced");
        }
    }

    /// List every scope and convert. `None` when no scope listed successfully,
    /// so the caller leaves the partition alone.
    async fn collect<T>(
        &self,
        gvr: &Gvr,
        scopes: &[Scope<'_>],
        report: &mut CycleReport,
        convert: fn(&DynamicObject, &Gvr, &ConvertKeys) -> T,
    ) -> Option<Vec<T>> {
        let mut out = Vec::new();
        let mut listed = 0usize;
        for scope in scopes {
            match list_all(self.lister.as_ref(), gvr, scope.namespace).await {
                Ok(objs) => {
                    listed += 1;
                    out.extend(objs.iter().map(|o| convert(o, gvr, scope.keys)));
                }
                Err(e) => {
                    let g = gvr.to_string();
                    warn!(gvr = %g, ns = ?scope.namespace, error = %e, "list failed");
                    self.metrics.poll_error(&g);
                    report.errors.push(PollError { gvr: g, namespace: scope.namespace.map(str::to_string), error: e });
                }
            }
        }
        (listed > 0).then_some(out)
    }

    /// Poll immediately, then every `poll_interval` until `shutdown` fires.
    /// An in-flight cycle is abandoned on shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.cfg.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.cfg.poll_interval.as_secs_f64(), "poller started");
        let mut cycles = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("shutdown during poll cycle");
                    break;
                }
                _ = self.poll_once() => {
                    cycles += 1;
                    self.cycle_tx.send_replace(cycles);
                }
            }
        }
        info!(cycles, "poller stopped");
    }
}
