//! Google Endpoints service configuration through `gcloud service-management`.

use std::{path::PathBuf, sync::Arc};

use gkeship_core::{config::GOOGLE_API_SERVICE, load_api_config, Error, Result, Variables};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::shell::{CommandRunner, Echo, ToolCommand};

/// Service name and config id the Endpoints proxy is started with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub version: String,
    pub grpc: bool,
}

impl Endpoint {
    /// `ENDPOINT_NAME`/`ENDPOINT_VERSION` supplied from outside, if any.
    pub fn from_vars(vars: &Variables) -> Option<Self> {
        let name = vars.get_str("ENDPOINT_NAME").filter(|n| !n.is_empty())?;
        Some(Self { name, version: vars.get_str("ENDPOINT_VERSION").unwrap_or_default(), grpc: false })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceDescription {
    service_config: ServiceConfigId,
}

#[derive(Deserialize)]
struct ServiceConfigId {
    name: String,
    id: String,
}

fn load_all(files: &[PathBuf]) -> Result<Vec<Json>> {
    let mut docs = Vec::with_capacity(files.len());
    for f in files {
        if let Some(doc) = load_api_config(f)? {
            docs.push(doc);
        }
    }
    Ok(docs)
}

fn non_empty<'a>(doc: &'a Json, key: &str) -> Option<&'a str> { doc.get(key).and_then(Json::as_str).filter(|s| !s.is_empty()) }

fn is_service_config(doc: &Json) -> bool {
    doc.get("type").and_then(Json::as_str) == Some(GOOGLE_API_SERVICE) && non_empty(doc, "name").is_some()
}

fn is_openapi(doc: &Json) -> bool {
    let version = match doc.get("swagger") {
        Some(Json::String(s)) => s.clone(),
        Some(Json::Number(n)) => n.to_string(),
        _ => return false,
    };
    version.starts_with(|c: char| c.is_ascii_digit())
}

/// Service name declared by the first gRPC service config or OpenAPI document.
fn declared_service(docs: &[Json]) -> Option<(String, bool)> {
    docs.iter()
        .filter(|d| is_service_config(d) || is_openapi(d))
        .find_map(|d| non_empty(d, "name").or_else(|| non_empty(d, "host")).map(|n| (n.to_string(), is_service_config(d))))
}

fn parse_description(out: &str) -> Result<ServiceConfigId> {
    Ok(serde_json::from_str::<ServiceDescription>(out)?.service_config)
}

pub struct EndpointManager {
    runner: Arc<dyn CommandRunner>,
    gcloud: ToolCommand,
    project: String,
}

impl EndpointManager {
    pub fn new(runner: Arc<dyn CommandRunner>, gcloud: ToolCommand, project: impl Into<String>) -> Self {
        Self { runner, gcloud, project: project.into() }
    }

    /// Upload `files` as a new service configuration. No files, no endpoint.
    pub async fn deploy(&self, files: &[PathBuf]) -> Result<Option<Endpoint>> {
        if files.is_empty() {
            return Ok(None);
        }
        info!("Updating endpoint...");
        let grpc = load_all(files)?.iter().any(is_service_config);
        let cmd = self
            .gcloud
            .clone()
            .args(["service-management", "deploy"])
            .args(files.iter().map(|f| f.display().to_string()))
            .args(["--project", self.project.as_str(), "--format=json"]);
        let config = parse_description(&self.runner.run(&cmd, Echo::Quiet).await?)?;
        info!(name = %config.name, version = %config.id, "Endpoint version created");
        Ok(Some(Endpoint { name: config.name, version: config.id, grpc }))
    }

    /// Current configuration of the service declared in `files`.
    pub async fn latest(&self, files: &[PathBuf]) -> Result<Option<Endpoint>> {
        if files.is_empty() {
            return Ok(None);
        }
        let (name, grpc) = declared_service(&load_all(files)?).ok_or_else(|| Error::config("Unable to locate name in any yaml api config."))?;
        let cmd = self
            .gcloud
            .clone()
            .args(["service-management", "describe", name.as_str(), "--project", self.project.as_str(), "--format=json"]);
        let config = parse_description(&self.runner.run(&cmd, Echo::Quiet).await?)?;
        debug!(name = %config.name, version = %config.id, "Using endpoint version");
        Ok(Some(Endpoint { name: config.name, version: config.id, grpc }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::testing::ScriptedRunner;

    const DESCRIBED: &str = r#"{"serviceConfig": {"name": "shop.endpoints.my-project.cloud.goog", "id": "2024-03-05r1", "title": "Shop"}}"#;

    fn manager(runner: Arc<ScriptedRunner>) -> EndpointManager {
        EndpointManager::new(runner, ToolCommand::parse("gcloud").unwrap(), "my-project")
    }

    #[tokio::test]
    async fn deploy_uploads_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let svc = dir.path().join("api_config.yaml");
        let pb = dir.path().join("out.pb");
        std::fs::write(&svc, "type: google.api.Service\nname: shop.endpoints.my-project.cloud.goog\n").unwrap();
        std::fs::write(&pb, "\u{0}\u{1}").unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.ok("gcloud service-management deploy", DESCRIBED);
        let ep = manager(runner.clone()).deploy(&[svc.clone(), pb.clone()]).await.unwrap().unwrap();
        assert_eq!(ep, Endpoint { name: "shop.endpoints.my-project.cloud.goog".into(), version: "2024-03-05r1".into(), grpc: true });
        assert_eq!(
            runner.calls(),
            vec![format!("gcloud service-management deploy {} {} --project my-project --format=json", svc.display(), pb.display())]
        );
    }

    #[tokio::test]
    async fn latest_describes_the_declared_service() {
        let dir = tempfile::tempdir().unwrap();
        let spec = dir.path().join("openapi.json");
        std::fs::write(&spec, r#"{"swagger": "2.0", "host": "shop.endpoints.my-project.cloud.goog"}"#).unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.ok("gcloud service-management describe", DESCRIBED);
        let ep = manager(runner.clone()).latest(&[spec]).await.unwrap().unwrap();
        assert_eq!(ep.version, "2024-03-05r1");
        assert!(!ep.grpc);
        assert_eq!(runner.calls(), vec!["gcloud service-management describe shop.endpoints.my-project.cloud.goog --project my-project --format=json"]);
    }

    #[tokio::test]
    async fn no_files_means_no_endpoint() {
        let runner = Arc::new(ScriptedRunner::new());
        assert_eq!(manager(runner.clone()).deploy(&[]).await.unwrap(), None);
        assert_eq!(manager(runner.clone()).latest(&[]).await.unwrap(), None);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn undeclared_service_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let other = dir.path().join("other.yaml");
        std::fs::write(&other, "kind: Something\n").unwrap();
        let err = manager(Arc::new(ScriptedRunner::new())).latest(&[other]).await.unwrap_err();
        assert!(matches!(err, Error::ConfigurationInvalid(_)), "{}", err);
    }

    #[test]
    fn endpoint_from_variables() {
        assert_eq!(Endpoint::from_vars(&Variables::new().with("ENDPOINT_NAME", "")), None);
        let ep = Endpoint::from_vars(&Variables::new().with("ENDPOINT_NAME", "shop.endpoints").with("ENDPOINT_VERSION", "v7")).unwrap();
        assert_eq!((ep.name.as_str(), ep.version.as_str()), ("shop.endpoints", "v7"));
    }
}
