//! Paged listing of dynamic resources.

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use tracing::trace;
use xtrack_core::Gvr;

/// Server-side page size for every list call.
pub const PAGE_SIZE: u32 = 500;

#[derive(Debug, Default)]
pub struct Page {
    pub items: Vec<DynamicObject>,
    /// `None` on the last page.
    pub continue_token: Option<String>,
}

/// One list request against the cluster. `namespace = None` lists cluster-wide.
#[async_trait]
pub trait ResourceLister: Send + Sync {
    async fn list_page(
        &self,
        gvr: &Gvr,
        namespace: Option<&str>,
        continue_token: Option<&str>,
        limit: u32,
    ) -> Result<Page>;
}

/// Follow continue tokens until the listing is exhausted.
pub async fn list_all(lister: &dyn ResourceLister, gvr: &Gvr, namespace: Option<&str>) -> Result<Vec<DynamicObject>> {
    let mut out = Vec::new();
    let mut token: Option<String> = None;
    let mut pages = 0usize;
    loop {
        let page = lister.list_page(gvr, namespace, token.as_deref(), PAGE_SIZE).await?;
        pages += 1;
        out.extend(page.items);
        match page.continue_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    trace!(gvr = %gvr, ns = ?namespace, pages, items = out.len(), "listed");
    Ok(out)
}

/// The plural name is all the URL needs; `kind` stays empty.
pub fn api_resource(gvr: &Gvr) -> ApiResource {
    ApiResource {
        group: gvr.group.clone(),
        version: gvr.version.clone(),
        api_version: gvr.api_version(),
        kind: String::new(),
        plural: gvr.resource.clone(),
    }
}

#[derive(Clone)]
pub struct KubeLister {
    client: Client,
}

impl KubeLister {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceLister for KubeLister {
    async fn list_page(
        &self,
        gvr: &Gvr,
        namespace: Option<&str>,
        continue_token: Option<&str>,
        limit: u32,
    ) -> Result<Page> {
        let ar = api_resource(gvr);
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        };
        let mut lp = ListParams::default().limit(limit);
        if let Some(token) = continue_token {
            lp = lp.continue_token(token);
        }
        let list = api
            .list(&lp)
            .await
            .with_context(|| format!("listing {} in {}", gvr, namespace.unwrap_or("all namespaces")))?;
        Ok(Page { items: list.items, continue_token: list.metadata.continue_.filter(|t| !t.is_empty()) })
    }
}
