//! xtrack kubehub: cluster listing, the poll loop and namespace config discovery.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kube::Client;

pub mod convert;
pub mod lister;
pub mod poller;
pub mod registry;
pub mod watch;

pub use lister::{list_all, KubeLister, Page, ResourceLister, PAGE_SIZE};
pub use poller::{CycleReport, PollError, Poller};
pub use registry::{spawn_registry, ConfigEvent, NamespaceSources, RegistryHandle, SourceRegistry};
pub use watch::watch_config_maps;

/// In-cluster service account first, then the local kubeconfig.
pub async fn client() -> Result<Client> {
    Client::try_default().await.context("building kube client (in-cluster or kubeconfig)")
}
