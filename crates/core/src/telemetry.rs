//! Self metrics for the poll loop and persistence, plus the inventory gauges
//! derived from store snapshots.
//!
//! Handles are registered once and passed around explicitly; without an
//! installed recorder every handle is a no-op.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, register_counter, register_gauge,
    register_histogram, Counter, Gauge, Histogram, Unit,
};

use crate::{ClaimRecord, CompositeRecord};

pub const POLL_DURATION: &str = "xtrack_poll_duration_seconds";
pub const POLL_ERRORS: &str = "xtrack_poll_errors_total";
pub const STORE_CLAIMS: &str = "xtrack_store_claims";
pub const STORE_COMPOSITES: &str = "xtrack_store_composites";
pub const NAMESPACE_CONFIGS: &str = "xtrack_namespace_configs";
pub const NAMESPACE_GVR_SKIPPED: &str = "xtrack_namespace_gvr_skipped_total";
pub const PERSIST_DURATION: &str = "xtrack_persist_duration_seconds";
pub const PERSIST_FAILURES: &str = "xtrack_persist_failures_total";

pub const CLAIMS_TOTAL: &str = "crossplane_claims_total";
pub const CLAIMS_READY: &str = "crossplane_claims_ready";
pub const XR_TOTAL: &str = "crossplane_xr_total";
pub const XR_READY: &str = "crossplane_xr_ready";

/// Label tuple of the claim gauges. Unset creator/team render as "".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClaimLabels {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub composition: String,
    pub creator: String,
    pub team: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompositeLabels {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub composition: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub total: u64,
    pub ready: u64,
}

impl Tally {
    fn add(&mut self, ready: bool) {
        self.total += 1;
        if ready {
            self.ready += 1;
        }
    }
}

pub fn tally_claims(claims: &[ClaimRecord]) -> BTreeMap<ClaimLabels, Tally> {
    let mut out: BTreeMap<ClaimLabels, Tally> = BTreeMap::new();
    for c in claims {
        let key = ClaimLabels {
            group: c.group.clone(),
            kind: c.kind.clone(),
            namespace: c.namespace.clone(),
            composition: c.composition.clone(),
            creator: c.creator.clone().unwrap_or_default(),
            team: c.team.clone().unwrap_or_default(),
        };
        out.entry(key).or_default().add(c.ready);
    }
    out
}

pub fn tally_composites(composites: &[CompositeRecord]) -> BTreeMap<CompositeLabels, Tally> {
    let mut out: BTreeMap<CompositeLabels, Tally> = BTreeMap::new();
    for x in composites {
        let key = CompositeLabels {
            group: x.group.clone(),
            kind: x.kind.clone(),
            namespace: x.namespace.clone(),
            composition: x.composition.clone(),
        };
        out.entry(key).or_default().add(x.ready);
    }
    out
}

/// Tuples published last time that are absent now; their gauges drop to zero.
fn vanished<K: Ord + Clone>(published: &BTreeSet<K>, now: &BTreeMap<K, Tally>) -> Vec<K> {
    published.iter().filter(|k| !now.contains_key(*k)).cloned().collect()
}

#[derive(Default)]
struct Published {
    claims: BTreeSet<ClaimLabels>,
    composites: BTreeSet<CompositeLabels>,
}

#[derive(Clone)]
pub struct TrackerMetrics {
    poll_duration: Histogram,
    store_claims: Gauge,
    store_composites: Gauge,
    namespace_configs: Gauge,
    persist_duration: Histogram,
    persist_failures: Counter,
    published: Arc<Mutex<Published>>,
}

impl TrackerMetrics {
    /// Describe and register all self metrics with the global recorder.
    pub fn register() -> Self {
        describe_histogram!(POLL_DURATION, Unit::Seconds, "Duration of a complete polling cycle.");
        describe_counter!(POLL_ERRORS, "Total number of polling errors, partitioned by GVR.");
        describe_gauge!(STORE_CLAIMS, "Current number of claims in the in-memory store.");
        describe_gauge!(STORE_COMPOSITES, "Current number of composites in the in-memory store.");
        describe_gauge!(NAMESPACE_CONFIGS, "Current number of active per-namespace configurations.");
        describe_counter!(
            NAMESPACE_GVR_SKIPPED,
            "Namespace-declared GVRs skipped because the central configuration already polls them."
        );
        describe_histogram!(PERSIST_DURATION, Unit::Seconds, "Duration of snapshot persist operations.");
        describe_counter!(PERSIST_FAILURES, "Total number of failed snapshot persist operations.");
        describe_gauge!(CLAIMS_TOTAL, "Number of Crossplane claims by group, kind, namespace, composition, creator and team.");
        describe_gauge!(CLAIMS_READY, "Number of Ready Crossplane claims by group, kind, namespace, composition, creator and team.");
        describe_gauge!(XR_TOTAL, "Number of Crossplane composite resources by group, kind, namespace and composition.");
        describe_gauge!(XR_READY, "Number of Ready Crossplane composite resources by group, kind, namespace and composition.");
        Self {
            poll_duration: register_histogram!(POLL_DURATION),
            store_claims: register_gauge!(STORE_CLAIMS),
            store_composites: register_gauge!(STORE_COMPOSITES),
            namespace_configs: register_gauge!(NAMESPACE_CONFIGS),
            persist_duration: register_histogram!(PERSIST_DURATION),
            persist_failures: register_counter!(PERSIST_FAILURES),
            published: Arc::new(Mutex::new(Published::default())),
        }
    }

    /// Publish per-label-tuple counts of the current inventory. Returns the
    /// number of (claim, composite) tuples published.
    pub fn observe_inventory(&self, claims: &[ClaimRecord], composites: &[CompositeRecord]) -> (usize, usize) {
        let claim_tally = tally_claims(claims);
        let xr_tally = tally_composites(composites);
        let mut published = self.published.lock().unwrap_or_else(PoisonError::into_inner);

        for k in vanished(&published.claims, &claim_tally) {
            set_claim_gauges(&k, Tally::default());
        }
        for (k, t) in &claim_tally {
            set_claim_gauges(k, *t);
        }
        for k in vanished(&published.composites, &xr_tally) {
            set_composite_gauges(&k, Tally::default());
        }
        for (k, t) in &xr_tally {
            set_composite_gauges(k, *t);
        }

        published.claims = claim_tally.keys().cloned().collect();
        published.composites = xr_tally.keys().cloned().collect();
        (claim_tally.len(), xr_tally.len())
    }

    pub fn poll_error(&self, gvr: &str) {
        counter!(POLL_ERRORS, 1, "gvr" => gvr.to_string());
    }

    pub fn namespace_gvr_skipped(&self, gvr: &str) {
        counter!(NAMESPACE_GVR_SKIPPED, 1, "gvr" => gvr.to_string());
    }

    pub fn observe_cycle(&self, took: Duration, claims: usize, composites: usize) {
        self.poll_duration.record(took.as_secs_f64());
        self.store_claims.set(claims as f64);
        self.store_composites.set(composites as f64);
    }

    pub fn set_namespace_configs(&self, n: usize) {
        self.namespace_configs.set(n as f64);
    }

    pub fn observe_persist(&self, took: Duration) {
        self.persist_duration.record(took.as_secs_f64());
    }

    pub fn persist_failed(&self) {
        self.persist_failures.increment(1);
    }
}

fn set_claim_gauges(k: &ClaimLabels, t: Tally) {
    let labels = [
        ("group", k.group.clone()),
        ("kind", k.kind.clone()),
        ("namespace", k.namespace.clone()),
        ("composition", k.composition.clone()),
        ("creator", k.creator.clone()),
        ("team", k.team.clone()),
    ];
    gauge!(CLAIMS_TOTAL, t.total as f64, &labels);
    gauge!(CLAIMS_READY, t.ready as f64, &labels);
}

fn set_composite_gauges(k: &CompositeLabels, t: Tally) {
    let labels = [
        ("group", k.group.clone()),
        ("kind", k.kind.clone()),
        ("namespace", k.namespace.clone()),
        ("composition", k.composition.clone()),
    ];
    gauge!(XR_TOTAL, t.total as f64, &labels);
    gauge!(XR_READY, t.ready as f64, &labels);
}

impl Default for TrackerMetrics {
    fn default() -> Self {
        Self::register()
    }
}
