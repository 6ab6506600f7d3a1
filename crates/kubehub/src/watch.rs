//! ConfigMap watch feeding the namespace config registry.

use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::Api,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xtrack_core::config::{CONFIG_LABEL_KEY, CONFIG_LABEL_VALUE};

use crate::ConfigEvent;

pub fn config_label_selector() -> String {
    format!("{}={}", CONFIG_LABEL_KEY, CONFIG_LABEL_VALUE)
}

/// Watch labeled ConfigMaps in all namespaces and forward events to the
/// registry until `shutdown` fires or the registry goes away. Stream errors
/// are retried with the watcher's default backoff.
pub async fn watch_config_maps(
    client: Client,
    tx: mpsc::Sender<ConfigEvent>,
    shutdown: CancellationToken,
) -> Result<()> {
    let api: Api<ConfigMap> = Api::all(client);
    let selector = config_label_selector();
    let cfg = watcher::Config::default().labels(&selector);
    let stream = watcher::watcher(api, cfg).default_backoff();
    futures::pin_mut!(stream);
    info!(selector = %selector, "namespace config watcher started");

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.next() => next,
        };
        let ev = match next {
            Some(Ok(Event::Applied(cm))) => ConfigEvent::Applied(cm),
            Some(Ok(Event::Deleted(cm))) => ConfigEvent::Deleted(cm),
            Some(Ok(Event::Restarted(list))) => {
                debug!(count = list.len(), "config watch restart");
                ConfigEvent::Restarted(list)
            }
            Some(Err(e)) => {
                warn!(error = %e, "config watch error; retrying");
                continue;
            }
            None => {
                warn!("config watch stream ended");
                break;
            }
        };
        if tx.send(ev).await.is_err() {
            debug!("registry closed; stopping config watch");
            break;
        }
    }
    info!("namespace config watcher stopped");
    Ok(())
}
