use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use xtrack_core::config::{DEFAULT_COMPOSITION_LABEL_KEY, DEFAULT_POLL_INTERVAL_SECS};
use xtrack_core::{parse_gvrs, ClaimRecord, CompositeRecord, KeyDefaults, TrackerConfig, TrackerMetrics};
use xtrack_kubehub::{spawn_registry, watch_config_maps, KubeLister, Poller, RegistryHandle};
use xtrack_persist::{open_backend, BackendConfig, PersistentStore, S3Settings, DEFAULT_S3_KEY_PREFIX, DEFAULT_S3_REGION};
use xtrack_store::{Durable, Inventory, MemoryStore};

#[derive(Parser, Debug)]
#[command(name = "xtrack", version, about = "Crossplane claim/composite inventory tracker")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(flatten)]
    tracker: TrackerArgs,

    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Args, Debug)]
struct TrackerArgs {
    /// Claim GVRs polled centrally, e.g. "platform.example.org/v1alpha1/postgresqlinstances"
    #[arg(long, env = "CLAIM_GVRS", global = true)]
    claim_gvrs: Option<String>,

    /// Composite GVRs polled centrally
    #[arg(long, env = "XR_GVRS", global = true)]
    xr_gvrs: Option<String>,

    /// Comma separated namespace filter for central claims (default: all)
    #[arg(long = "namespaces", env = "KUBE_NAMESPACE_SCOPE", global = true)]
    namespaces: Option<String>,

    #[arg(long, env = "CREATOR_ANNOTATION_KEY", global = true)]
    creator_annotation_key: Option<String>,

    #[arg(long, env = "TEAM_ANNOTATION_KEY", global = true)]
    team_annotation_key: Option<String>,

    #[arg(long, env = "COMPOSITION_LABEL_KEY", global = true, default_value = DEFAULT_COMPOSITION_LABEL_KEY)]
    composition_label_key: String,

    #[arg(
        long = "poll-interval",
        env = "POLL_INTERVAL_SECONDS",
        global = true,
        default_value_t = DEFAULT_POLL_INTERVAL_SECS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    poll_interval_secs: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum StoreBackend {
    Memory,
    Sqlite,
    S3,
}

#[derive(Args, Debug)]
struct StoreArgs {
    #[arg(long = "store-backend", env = "STORE_BACKEND", value_enum, global = true, default_value_t = StoreBackend::Memory)]
    backend: StoreBackend,

    /// SQLite file (default: $HOME/.xtrack/snapshot.db)
    #[arg(long, env = "SQLITE_PATH", global = true)]
    sqlite_path: Option<String>,

    #[arg(long, env = "S3_BUCKET", global = true)]
    s3_bucket: Option<String>,

    #[arg(long, env = "S3_KEY_PREFIX", global = true, default_value = DEFAULT_S3_KEY_PREFIX)]
    s3_key_prefix: String,

    #[arg(long, env = "S3_REGION", global = true, default_value = DEFAULT_S3_REGION)]
    s3_region: String,

    /// Custom S3 endpoint (MinIO, LocalStack)
    #[arg(long, env = "S3_ENDPOINT", global = true)]
    s3_endpoint: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Poll continuously until interrupted
    Run {
        /// Prometheus exporter listen address
        #[arg(long = "metrics-addr", env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
        metrics_addr: SocketAddr,
        /// Max seconds to wait for namespace config discovery before the first poll
        #[arg(long = "sync-wait-secs", default_value_t = 10)]
        sync_wait_secs: u64,
        /// Skip the namespace ConfigMap watch
        #[arg(long = "no-namespace-configs", action = ArgAction::SetTrue)]
        no_namespace_configs: bool,
    },
    /// Poll once and print the inventory
    Snapshot {
        /// Also discover namespace ConfigMaps before polling
        #[arg(long = "with-namespace-configs", action = ArgAction::SetTrue)]
        with_namespace_configs: bool,
        #[arg(long = "sync-wait-secs", default_value_t = 10)]
        sync_wait_secs: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("XTRACK_LOG").unwrap_or_else(|_| "info".to_string());
    let filter =
        tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("XTRACK_LOG_FORMAT").map(|f| f.eq_ignore_ascii_case("json")).unwrap_or(false);
    // stderr keeps `snapshot -o json` output clean
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
    }
}

fn init_metrics(addr: SocketAddr) {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    match builder.with_http_listener(addr).install() {
        Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
        Err(e) => warn!(error = %e, "failed to install metrics exporter"),
    }
}

fn gvr_list(raw: Option<&str>) -> Result<Vec<xtrack_core::Gvr>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => Ok(parse_gvrs(s)?),
        None => Ok(Vec::new()),
    }
}

fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

fn tracker_config(args: &TrackerArgs) -> Result<TrackerConfig> {
    let cfg = TrackerConfig {
        claim_gvrs: gvr_list(args.claim_gvrs.as_deref()).context("CLAIM_GVRS")?,
        xr_gvrs: gvr_list(args.xr_gvrs.as_deref()).context("XR_GVRS")?,
        namespaces: xtrack_core::config::split_and_trim(args.namespaces.as_deref().unwrap_or("")),
        keys: KeyDefaults {
            creator_annotation_key: non_empty(&args.creator_annotation_key),
            team_annotation_key: non_empty(&args.team_annotation_key),
            composition_label_key: args.composition_label_key.trim().to_string(),
        },
        poll_interval: Duration::from_secs(args.poll_interval_secs),
    };
    cfg.validate()?;
    Ok(cfg)
}

fn backend_config(args: &StoreArgs) -> BackendConfig {
    match args.backend {
        StoreBackend::Memory => BackendConfig::Memory,
        StoreBackend::Sqlite => BackendConfig::Sqlite {
            path: non_empty(&args.sqlite_path).unwrap_or_else(xtrack_persist::sqlite::default_db_path),
        },
        StoreBackend::S3 => BackendConfig::S3(S3Settings {
            bucket: non_empty(&args.s3_bucket).unwrap_or_default(),
            key_prefix: args.s3_key_prefix.clone(),
            region: args.s3_region.clone(),
            endpoint: non_empty(&args.s3_endpoint),
        }),
    }
}

/// Build the store and poller; restores from the backend when one is configured.
async fn build_poller(
    cfg: TrackerConfig,
    backend: &BackendConfig,
    lister: KubeLister,
    metrics: TrackerMetrics,
) -> Result<Poller> {
    let lister = Arc::new(lister);
    let poller = match open_backend(backend).await? {
        Some(b) => {
            let store = Arc::new(PersistentStore::new(MemoryStore::new(), b).with_metrics(metrics.clone()));
            if let Err(e) = store.restore().await {
                error!(error = ?e, "restoring snapshot failed; starting empty");
            }
            Poller::new(lister, cfg, store.clone()).with_persistence(store)
        }
        None => Poller::new(lister, cfg, Arc::new(MemoryStore::new())),
    };
    Ok(poller.with_metrics(metrics))
}

/// Start the ConfigMap watch and wait (bounded) for its first full list.
fn start_registry(client: kube::Client, keys: KeyDefaults, shutdown: &CancellationToken) -> RegistryHandle {
    let (tx, handle) = spawn_registry(keys, 256);
    let token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = watch_config_maps(client, tx, token).await {
            error!(error = ?e, "namespace config watch failed");
        }
    });
    handle
}

async fn wait_for_registry(handle: &RegistryHandle, secs: u64) {
    if handle.wait_synced(Duration::from_secs(secs)).await {
        info!(configs = handle.len(), "namespace configs discovered");
    } else {
        warn!(wait_secs = secs, "namespace config discovery not synced; polling without it for now");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "installing Ctrl-C handler failed");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let term = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "installing SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received"),
        _ = term => info!("SIGTERM received"),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InventoryDoc<'a> {
    claims: &'a [ClaimRecord],
    composites: &'a [CompositeRecord],
    generated_at: DateTime<Utc>,
}

fn render_age(created: Option<DateTime<Utc>>) -> String {
    let Some(created) = created else { return "-".to_string() };
    let mut secs = (Utc::now() - created).num_seconds().max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}

fn dash(s: &str) -> &str {
    if s.is_empty() {
        "-"
    } else {
        s
    }
}

fn print_human(claims: &[ClaimRecord], composites: &[CompositeRecord]) {
    println!("CLAIMS ({})", claims.len());
    println!("{:<20} {:<32} {:<24} {:<16} {:<6} {:<10} AGE", "KIND", "NAMESPACE/NAME", "COMPOSITION", "CREATOR", "READY", "SOURCE");
    for c in claims {
        println!(
            "{:<20} {:<32} {:<24} {:<16} {:<6} {:<10} {}",
            c.kind,
            c.key(),
            dash(&c.composition),
            c.creator.as_deref().unwrap_or("-"),
            c.ready,
            c.source,
            render_age(c.created_at)
        );
    }
    println!();
    println!("COMPOSITES ({})", composites.len());
    println!("{:<24} {:<32} {:<24} {:<6} {:<10} AGE", "KIND", "NAME", "COMPOSITION", "READY", "SOURCE");
    for x in composites {
        println!(
            "{:<24} {:<32} {:<24} {:<6} {:<10} {}",
            x.kind,
            x.key(),
            dash(&x.composition),
            x.ready,
            x.source,
            render_age(x.created_at)
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = tracker_config(&cli.tracker)?;
    let backend = backend_config(&cli.store);

    match cli.command {
        Commands::Run { metrics_addr, sync_wait_secs, no_namespace_configs } => {
            init_metrics(metrics_addr);
            info!(
                claim_gvrs = cfg.claim_gvrs.len(),
                xr_gvrs = cfg.xr_gvrs.len(),
                namespaces = ?cfg.namespaces,
                interval_secs = cfg.poll_interval.as_secs(),
                backend = ?cli.store.backend,
                "xtrack starting"
            );
            let client = xtrack_kubehub::client().await?;
            let shutdown = CancellationToken::new();
            let keys = cfg.keys.clone();
            let lister = KubeLister::new(client.clone());
            let mut poller = build_poller(cfg, &backend, lister, TrackerMetrics::register()).await?;
            if !no_namespace_configs {
                let registry = start_registry(client, keys, &shutdown);
                wait_for_registry(&registry, sync_wait_secs).await;
                poller = poller.with_sources(Arc::new(registry));
            }

            let poll_task = tokio::spawn(poller.run(shutdown.clone()));
            shutdown_signal().await;
            shutdown.cancel();
            if let Err(e) = poll_task.await {
                error!(error = %e, "poller task failed");
            }
            info!("xtrack stopped");
        }
        Commands::Snapshot { with_namespace_configs, sync_wait_secs } => {
            let client = xtrack_kubehub::client().await?;
            let shutdown = CancellationToken::new();
            let keys = cfg.keys.clone();
            // Read-only: never write a one-shot cycle over the daemon's snapshot.
            let lister = KubeLister::new(client.clone());
            let mut poller = build_poller(cfg, &BackendConfig::Memory, lister, TrackerMetrics::register()).await?;
            if !matches!(backend, BackendConfig::Memory) {
                info!("snapshot command ignores the configured store backend");
            }
            if with_namespace_configs {
                let registry = start_registry(client, keys, &shutdown);
                wait_for_registry(&registry, sync_wait_secs).await;
                poller = poller.with_sources(Arc::new(registry));
            }

            let report = poller.poll_once().await;
            shutdown.cancel();
            for e in &report.errors {
                warn!(gvr = %e.gvr, ns = ?e.namespace, error = %e.error, "list failed");
            }
            let store = poller.store();
            let claims = store.snapshot_claims();
            let composites = store.snapshot_composites();
            match cli.output {
                Output::Human => print_human(&claims, &composites),
                Output::Json => {
                    let doc = InventoryDoc { claims: &claims, composites: &composites, generated_at: Utc::now() };
                    println!("{}", serde_json::to_string_pretty(&doc)?);
                }
            }
            if !report.is_ok() {
                anyhow::bail!("{} list call(s) failed; inventory is partial", report.errors.len());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("xtrack").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn flags_build_tracker_config() {
        let cli = parse(&[
            "snapshot",
            "--claim-gvrs",
            "example.org/v1/widgets, example.org/v1/widgets,example.org/v1/gadgets",
            "--namespaces",
            "team-a,,team-b",
            "--creator-annotation-key",
            " ",
            "--poll-interval",
            "5",
        ]);
        let cfg = tracker_config(&cli.tracker).unwrap();
        assert_eq!(cfg.claim_gvrs.len(), 2);
        assert!(cfg.xr_gvrs.is_empty());
        assert_eq!(cfg.namespaces, vec!["team-a", "team-b"]);
        assert_eq!(cfg.keys.creator_annotation_key, None);
        assert_eq!(cfg.keys.composition_label_key, DEFAULT_COMPOSITION_LABEL_KEY);
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn malformed_gvr_and_zero_interval_are_rejected() {
        let cli = parse(&["snapshot", "--xr-gvrs", "example.org/widgets"]);
        assert!(tracker_config(&cli.tracker).is_err());
        assert!(Cli::try_parse_from(["xtrack", "snapshot", "--poll-interval", "0"]).is_err());
    }

    #[test]
    fn backend_selection() {
        let cli = parse(&["--store-backend", "s3", "--s3-bucket", "snaps", "run"]);
        match backend_config(&cli.store) {
            BackendConfig::S3(s) => {
                assert_eq!(s.bucket, "snaps");
                assert_eq!(s.key_prefix, DEFAULT_S3_KEY_PREFIX);
                assert_eq!(s.endpoint, None);
            }
            other => panic!("unexpected backend {other:?}"),
        }
        let cli = parse(&["run", "--store-backend", "sqlite", "--sqlite-path", "/tmp/x.db"]);
        assert_eq!(backend_config(&cli.store), BackendConfig::Sqlite { path: "/tmp/x.db".into() });
    }

    #[test]
    fn age_rendering() {
        assert_eq!(render_age(None), "-");
        let t = Utc::now() - chrono::Duration::seconds(3 * 3600 + 120);
        assert_eq!(render_age(Some(t)), "3h2m");
    }
}
