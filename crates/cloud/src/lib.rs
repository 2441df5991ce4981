//! gkeship cloud: compute/container API collaborator, paginated listing and
//! the long-running operation waiter.

#![forbid(unsafe_code)]

use gkeship_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::trace;

#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod gcp;
pub mod waiter;

pub use gcp::{http_timeout, AccessTokenSource, GcpRestApi, StaticToken};
pub use waiter::{OperationWaiter, WaitPolicy};

/// Keys of a fetch map that scope a resource rather than name it.
const SCOPE_KEYS: &[&str] = &["project", "zone", "region"];

/// Address of a compute resource (or of its collection when `name` is None).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    /// API collection, e.g. `backendServices`, `globalAddresses`, `instanceGroups`.
    pub collection: String,
    pub name: Option<String>,
    pub zone: Option<String>,
    pub region: Option<String>,
}

impl ResourceRef {
    pub fn collection(collection: &str) -> Self {
        Self { collection: collection.to_string(), name: None, zone: None, region: None }
    }

    pub fn named(collection: &str, name: &str) -> Self {
        Self { name: Some(name.to_string()), ..Self::collection(collection) }
    }

    pub fn in_zone(mut self, zone: &str) -> Self { self.zone = Some(zone.to_string()); self }

    pub fn in_region(mut self, region: &str) -> Self { self.region = Some(region.to_string()); self }

    /// Build from a script `fetch` map such as `{"backendService": "api-example-com"}`.
    pub fn from_fetch(collection: &str, fetch: &Map<String, Json>) -> Result<Self> {
        let mut r = Self::collection(collection);
        for (k, v) in fetch.iter() {
            let text = match v {
                Json::String(s) => s.clone(),
                Json::Null => continue,
                other => other.to_string(),
            };
            match k.as_str() {
                "zone" => r.zone = Some(text),
                "region" => r.region = Some(text),
                "project" => {}
                _ if r.name.is_none() => r.name = Some(text),
                _ => trace!(key = %k, "ignoring extra fetch key"),
            }
        }
        if r.name.is_none() {
            return Err(Error::config(format!("fetch for {} does not name a resource", collection)));
        }
        Ok(r)
    }

    /// Same collection and scope, no resource name.
    pub fn scope(&self) -> Self { Self { name: None, ..self.clone() } }

    pub fn is_scope_key(key: &str) -> bool { SCOPE_KEYS.contains(&key) }

    pub fn label(&self) -> String {
        match &self.name {
            Some(n) => format!("{}/{}", self.collection, n),
            None => self.collection.clone(),
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.label()) }
}

/// Which status endpoint an operation is polled through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationFamily {
    Compute,
    Container,
}

/// Handle returned by a mutating cloud call. Polled, then discarded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Operation {
    pub kind: String,
    pub name: String,
    pub self_link: String,
    pub target_link: Option<String>,
    pub status: String,
    /// Compute operations carry a zone URL, container operations a bare zone name.
    pub zone: Option<String>,
    pub region: Option<String>,
    pub error: Option<Json>,
}

impl Operation {
    pub const DONE: &'static str = "DONE";

    pub fn family(&self) -> Result<OperationFamily> {
        if self.kind == "compute#operation" {
            Ok(OperationFamily::Compute)
        } else if self.self_link.starts_with("https://container.googleapis.com/") {
            Ok(OperationFamily::Container)
        } else {
            Err(Error::config(format!("Unknown operation type: {}", self.kind)))
        }
    }

    /// Trailing path segment of the zone, if any.
    pub fn zone_name(&self) -> Option<&str> { self.zone.as_deref().and_then(last_segment) }

    pub fn region_name(&self) -> Option<&str> { self.region.as_deref().and_then(last_segment) }

    pub fn is_pending(&self) -> bool { self.status == "RUNNING" || self.status == "PENDING" }
}

fn last_segment(s: &str) -> Option<&str> { s.rsplit('/').next().filter(|p| !p.is_empty()) }

/// One page of a list call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Page {
    pub items: Vec<Json>,
    pub next_page_token: Option<String>,
}

/// Cloud compute/orchestration API. Every mutation returns an [`Operation`]
/// that callers hand to [`OperationWaiter`] before the dependent next step.
#[async_trait::async_trait]
pub trait CloudApi: Send + Sync {
    fn project(&self) -> &str;

    /// Fetch one resource; a missing resource is `Error::NotFound`.
    async fn get(&self, resource: &ResourceRef) -> Result<Json>;
    async fn list_page(&self, collection: &ResourceRef, page_token: Option<&str>) -> Result<Page>;
    async fn insert(&self, collection: &ResourceRef, body: &Json) -> Result<Operation>;
    async fn update(&self, resource: &ResourceRef, body: &Json) -> Result<Operation>;
    async fn delete(&self, resource: &ResourceRef) -> Result<Operation>;
    async fn set_named_ports(&self, zone: &str, group: &str, body: &Json) -> Result<Operation>;

    async fn operation_status(&self, family: OperationFamily, op: &Operation) -> Result<Operation>;

    /// Clusters in a zone; `-` lists every zone.
    async fn list_clusters(&self, zone: &str) -> Result<Vec<Json>>;
    async fn get_cluster(&self, zone: &str, name: &str) -> Result<Json>;
    async fn create_cluster(&self, zone: &str, body: &Json) -> Result<Operation>;
    async fn set_node_pool_management(&self, zone: &str, cluster: &str, pool: &str, body: &Json) -> Result<Operation>;
}

/// Collect every page of a collection.
pub async fn fetch_list(api: &dyn CloudApi, collection: &ResourceRef) -> Result<Vec<Json>> {
    let mut found = Vec::new();
    let mut token: Option<String> = None;
    loop {
        trace!(collection = %collection, page = ?token, "fetching list page");
        let page = api.list_page(collection, token.as_deref()).await?;
        found.extend(page.items);
        match page.next_page_token {
            Some(t) if !t.is_empty() => token = Some(t),
            _ => break,
        }
    }
    Ok(found)
}
