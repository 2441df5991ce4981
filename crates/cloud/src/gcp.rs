//! Google Cloud REST implementation of [`CloudApi`].

use std::{sync::Arc, time::Duration};

use gkeship_core::{Error, Result, Variables};
use metrics::{counter, histogram};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as Json;
use tracing::{debug, trace};

use crate::{CloudApi, Operation, OperationFamily, Page, ResourceRef};

const COMPUTE_ENDPOINT: &str = "https://compute.googleapis.com/compute/v1";
const CONTAINER_ENDPOINT: &str = "https://container.googleapis.com/v1";

/// Supplies OAuth bearer tokens for API calls.
#[async_trait::async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// Fixed token, e.g. from `GOOGLE_OAUTH_ACCESS_TOKEN`.
pub struct StaticToken(pub String);

#[async_trait::async_trait]
impl AccessTokenSource for StaticToken {
    async fn token(&self) -> Result<String> { Ok(self.0.clone()) }
}

pub struct GcpRestApi {
    http: Client,
    project: String,
    tokens: Arc<dyn AccessTokenSource>,
    compute_base: String,
    container_base: String,
}

/// Per-request timeout: `GKESHIP_HTTP_TIMEOUT_SECS`, else 60 seconds.
pub fn http_timeout(vars: &Variables) -> Duration {
    vars.parse::<u64>("GKESHIP_HTTP_TIMEOUT_SECS").filter(|s| *s > 0).map(Duration::from_secs).unwrap_or(Duration::from_secs(60))
}

fn transport(e: reqwest::Error) -> Error {
    Error::Api { code: e.status().map(|s| s.as_u16()).unwrap_or(0), message: e.to_string() }
}

/// Path segment for a compute collection. The `global*` aliases name
/// collections that share a name with a regional counterpart.
fn collection_path(r: &ResourceRef) -> String {
    let (scope, collection) = match r.collection.as_str() {
        "globalAddresses" => ("global".to_string(), "addresses"),
        "globalForwardingRules" => ("global".to_string(), "forwardingRules"),
        c => match (&r.zone, &r.region) {
            (Some(z), _) => (format!("zones/{}", z), c),
            (None, Some(rg)) => (format!("regions/{}", rg), c),
            _ => ("global".to_string(), c),
        },
    };
    match &r.name {
        Some(n) => format!("{}/{}/{}", scope, collection, n),
        None => format!("{}/{}", scope, collection),
    }
}

impl GcpRestApi {
    pub fn new(project: &str, tokens: Arc<dyn AccessTokenSource>, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build().map_err(transport)?;
        Ok(Self {
            http,
            project: project.to_string(),
            tokens,
            compute_base: COMPUTE_ENDPOINT.to_string(),
            container_base: CONTAINER_ENDPOINT.to_string(),
        })
    }

    /// Point at alternative API roots (emulators, recorded fixtures).
    pub fn with_endpoints(mut self, compute: &str, container: &str) -> Self {
        self.compute_base = compute.trim_end_matches('/').to_string();
        self.container_base = container.trim_end_matches('/').to_string();
        self
    }

    fn compute_url(&self, path: &str) -> String { format!("{}/projects/{}/{}", self.compute_base, self.project, path) }

    fn container_url(&self, path: &str) -> String { format!("{}/projects/{}/{}", self.container_base, self.project, path) }

    async fn call<T: DeserializeOwned>(&self, method: Method, url: String, query: &[(&str, &str)], body: Option<&Json>) -> Result<T> {
        let started = std::time::Instant::now();
        let token = self.tokens.token().await?;
        trace!(%method, %url, "cloud request");
        let mut req = self.http.request(method.clone(), &url).bearer_auth(token).query(query);
        if let Some(b) = body {
            req = req.json(b);
        }
        let response = req.send().await.map_err(transport)?;
        let status = response.status();
        histogram!("cloud_request_ms", started.elapsed().as_secs_f64() * 1000.0);
        if status.is_success() {
            counter!("cloud_request_total", 1u64, "outcome" => "ok");
            return response.json().await.map_err(transport);
        }
        counter!("cloud_request_total", 1u64, "outcome" => "error");
        if status == StatusCode::NOT_FOUND {
            debug!(%url, "resource not found");
            return Err(Error::not_found(url));
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Json>(&text)
            .ok()
            .and_then(|v| v.pointer("/error/message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or(text);
        Err(Error::Api { code: status.as_u16(), message })
    }
}

#[async_trait::async_trait]
impl CloudApi for GcpRestApi {
    fn project(&self) -> &str { &self.project }

    async fn get(&self, r: &ResourceRef) -> Result<Json> {
        self.call(Method::GET, self.compute_url(&collection_path(r)), &[], None).await
    }

    async fn list_page(&self, collection: &ResourceRef, page_token: Option<&str>) -> Result<Page> {
        let query: Vec<(&str, &str)> = page_token.map(|t| vec![("pageToken", t)]).unwrap_or_default();
        self.call(Method::GET, self.compute_url(&collection_path(&collection.scope())), &query, None).await
    }

    async fn insert(&self, collection: &ResourceRef, body: &Json) -> Result<Operation> {
        self.call(Method::POST, self.compute_url(&collection_path(&collection.scope())), &[], Some(body)).await
    }

    async fn update(&self, r: &ResourceRef, body: &Json) -> Result<Operation> {
        self.call(Method::PUT, self.compute_url(&collection_path(r)), &[], Some(body)).await
    }

    async fn delete(&self, r: &ResourceRef) -> Result<Operation> {
        self.call(Method::DELETE, self.compute_url(&collection_path(r)), &[], None).await
    }

    async fn set_named_ports(&self, zone: &str, group: &str, body: &Json) -> Result<Operation> {
        let path = format!("zones/{}/instanceGroups/{}/setNamedPorts", zone, group);
        self.call(Method::POST, self.compute_url(&path), &[], Some(body)).await
    }

    async fn operation_status(&self, family: OperationFamily, op: &Operation) -> Result<Operation> {
        let url = match family {
            OperationFamily::Compute => match (op.zone_name(), op.region_name()) {
                (Some(z), _) => self.compute_url(&format!("zones/{}/operations/{}", z, op.name)),
                (None, Some(rg)) => self.compute_url(&format!("regions/{}/operations/{}", rg, op.name)),
                _ => self.compute_url(&format!("global/operations/{}", op.name)),
            },
            OperationFamily::Container => {
                let zone = op.zone_name().unwrap_or("-");
                self.container_url(&format!("zones/{}/operations/{}", zone, op.name))
            }
        };
        self.call(Method::GET, url, &[], None).await
    }

    async fn list_clusters(&self, zone: &str) -> Result<Vec<Json>> {
        let v: Json = self.call(Method::GET, self.container_url(&format!("zones/{}/clusters", zone)), &[], None).await?;
        Ok(v.get("clusters").and_then(|c| c.as_array()).cloned().unwrap_or_default())
    }

    async fn get_cluster(&self, zone: &str, name: &str) -> Result<Json> {
        self.call(Method::GET, self.container_url(&format!("zones/{}/clusters/{}", zone, name)), &[], None).await
    }

    async fn create_cluster(&self, zone: &str, body: &Json) -> Result<Operation> {
        self.call(Method::POST, self.container_url(&format!("zones/{}/clusters", zone)), &[], Some(body)).await
    }

    async fn set_node_pool_management(&self, zone: &str, cluster: &str, pool: &str, body: &Json) -> Result<Operation> {
        let path = format!("zones/{}/clusters/{}/nodePools/{}/setManagement", zone, cluster, pool);
        self.call(Method::POST, self.container_url(&path), &[], Some(body)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_collections() {
        assert_eq!(collection_path(&ResourceRef::named("backendServices", "api-example-com")), "global/backendServices/api-example-com");
        assert_eq!(collection_path(&ResourceRef::named("globalAddresses", "shop-ip")), "global/addresses/shop-ip");
        assert_eq!(collection_path(&ResourceRef::collection("globalForwardingRules")), "global/forwardingRules");
    }

    #[test]
    fn scoped_collections() {
        let r = ResourceRef::named("instanceGroups", "g1").in_zone("us-central1-a");
        assert_eq!(collection_path(&r), "zones/us-central1-a/instanceGroups/g1");
        let r = ResourceRef::collection("addresses").in_region("us-central1");
        assert_eq!(collection_path(&r), "regions/us-central1/addresses");
    }

    #[test]
    fn request_timeout_from_variables() {
        assert_eq!(http_timeout(&Variables::new()), Duration::from_secs(60));
        assert_eq!(http_timeout(&Variables::new().with("GKESHIP_HTTP_TIMEOUT_SECS", "15")), Duration::from_secs(15));
        assert_eq!(http_timeout(&Variables::new().with("GKESHIP_HTTP_TIMEOUT_SECS", "0")), Duration::from_secs(60));
    }

    #[test]
    fn urls_include_project() {
        let api = GcpRestApi::new("my-project", Arc::new(StaticToken("t".into())), Duration::from_secs(5)).unwrap().with_endpoints("http://localhost:9/c/", "http://localhost:9/k");
        assert_eq!(api.compute_url("global/networks/n"), "http://localhost:9/c/projects/my-project/global/networks/n");
        assert_eq!(api.container_url("zones/-/clusters"), "http://localhost:9/k/projects/my-project/zones/-/clusters");
    }
}
