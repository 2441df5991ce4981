//! Workload manifests rendered from service/deployment templates.

use gkeship_core::{referenced_names, substitute_text, Error, Result, Settings, Variables};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::endpoints::Endpoint;

/// Rendered service + deployment for one workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub name: String,
    pub image: String,
    pub service: Json,
    pub deployment: Json,
}

fn workload_vars(settings: &Settings, image: &str, endpoint: Option<&Endpoint>) -> Variables {
    let d = &settings.deploy;
    let mut vars = settings.vars.clone();
    let (name, version) = endpoint.map(|e| (e.name.as_str(), e.version.as_str())).unwrap_or_default();
    vars.set("ENDPOINT_NAME", name);
    vars.set("ENDPOINT_VERSION", version);
    vars.with("SERVICE_NAME", d.name.clone())
        .with("REPLICAS", d.replicas)
        .with("DOCKER_IMAGE", image)
        .with("APP_PROTOCOL", d.app_protocol.clone())
        .with("APP_PORT", d.port)
        .with("SSL_PORT", d.ssl_port)
        .with("NODE_PORT", settings.node_port)
        .with("PROXY_IMAGE", d.proxy_image.clone())
        .with("LIVENESS_PROBE", d.liveness_probe.clone())
        .with("READINESS_PROBE", d.readiness_probe.clone())
}

/// Render both templates for `image` and attach the workload environment to
/// the first container.
///
/// A deployment template that starts the Endpoints proxy needs `endpoint`;
/// without one it is rejected before anything reaches the cluster.
pub fn render_workload(
    settings: &Settings,
    image: &str,
    endpoint: Option<&Endpoint>,
    service_template: &str,
    deploy_template: &str,
) -> Result<WorkloadSpec> {
    if endpoint.is_none() && referenced_names(deploy_template).iter().any(|n| n == "ENDPOINT_NAME") {
        return Err(Error::config(
            "The deployment template starts the Endpoints proxy but no endpoint is configured; set api-config or ENDPOINT_NAME",
        ));
    }
    let vars = workload_vars(settings, image, endpoint);
    let service: Json = serde_json::from_str(&substitute_text(service_template, &vars)?)?;
    let mut deployment: Json = serde_json::from_str(&substitute_text(deploy_template, &vars)?)?;

    let env: Vec<Json> = settings
        .environment_with(&vars)?
        .into_iter()
        .map(|e| serde_json::json!({"name": e.name, "value": e.value}))
        .collect();
    let container = deployment
        .pointer_mut("/spec/template/spec/containers/0")
        .and_then(|c| c.as_object_mut())
        .ok_or_else(|| Error::config("deployment template has no containers"))?;
    container.insert("env".into(), Json::Array(env));

    Ok(WorkloadSpec { name: settings.deploy.name.clone(), image: image.to_string(), service, deployment })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE: &str = r#"{"kind": "Service", "metadata": {"name": "$SERVICE_NAME"},
        "spec": {"type": "NodePort", "ports": [{"port": $SSL_PORT, "nodePort": $NODE_PORT}]}}"#;
    const DEPLOY: &str = r#"{"kind": "Deployment", "metadata": {"name": "$SERVICE_NAME"},
        "spec": {"replicas": $REPLICAS, "template": {"spec": {"containers": [
            {"name": "$SERVICE_NAME", "image": "$DOCKER_IMAGE", "ports": [{"containerPort": $APP_PORT}]},
            {"name": "esp", "image": "$PROXY_IMAGE", "args": ["-s", "$ENDPOINT_NAME", "-v", "$ENDPOINT_VERSION"]}]}}}}"#;
    const PLAIN_DEPLOY: &str = r#"{"kind": "Deployment", "metadata": {"name": "$SERVICE_NAME"},
        "spec": {"replicas": $REPLICAS, "template": {"spec": {"containers": [
            {"name": "$SERVICE_NAME", "image": "$DOCKER_IMAGE", "ports": [{"containerPort": $APP_PORT}]}]}}}}"#;

    fn endpoint() -> Endpoint {
        Endpoint { name: "shop.endpoints.my-project.cloud.goog".into(), version: "2024-03-05r1".into(), grpc: false }
    }

    fn settings(dir: &std::path::Path) -> Settings {
        let path = dir.join("deploy.yaml");
        std::fs::write(&path, "main:\n  name: shop\n  google-project: my-project\n  host: api.example.com\n  nodePort: 31000\n  env: [LOG_LEVEL=debug]\n").unwrap();
        Settings::load(&path, "main", dir, Variables::new()).unwrap()
    }

    #[test]
    fn renders_templates_and_environment() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path());
        let w = render_workload(&s, "us.gcr.io/my-project/shop:main-1", Some(&endpoint()), SERVICE, DEPLOY).unwrap();
        assert_eq!(w.service["spec"]["ports"][0]["nodePort"], 31000);
        assert_eq!(w.deployment["spec"]["replicas"], 2);
        let app = &w.deployment["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(app["image"], "us.gcr.io/my-project/shop:main-1");
        assert_eq!(app["ports"][0]["containerPort"], 8080);
        assert_eq!(app["env"], serde_json::json!([{"name": "LOG_LEVEL", "value": "debug"}, {"name": "NODE_PORT", "value": "8080"}]));
        let esp = &w.deployment["spec"]["template"]["spec"]["containers"][1];
        assert_eq!(esp["args"], serde_json::json!(["-s", "shop.endpoints.my-project.cloud.goog", "-v", "2024-03-05r1"]));
    }

    #[test]
    fn proxy_template_without_endpoint_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path());
        let err = render_workload(&s, "img", None, SERVICE, DEPLOY).unwrap_err();
        assert!(matches!(err, Error::ConfigurationInvalid(_)), "{}", err);
        assert!(err.to_string().contains("no endpoint is configured"), "{}", err);
    }

    #[test]
    fn plain_template_renders_without_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.yaml");
        std::fs::write(&path, "main:\n  name: shop\n  google-project: my-project\n  host: api.example.com\n  nodePort: 31000\n").unwrap();
        let s = Settings::load(&path, "main", dir.path(), Variables::new().with("BUILD_TIME", "2024-01-01T00-00-00-000Z")).unwrap();
        let w = render_workload(&s, "img", None, SERVICE, PLAIN_DEPLOY).unwrap();
        let containers = w.deployment["spec"]["template"]["spec"]["containers"].as_array().unwrap();
        assert_eq!(containers.len(), 1);
        let env = &containers[0]["env"];
        assert_eq!(env[1], serde_json::json!({"name": "ENDPOINT_NAME", "value": ""}));
        assert_eq!(env[2], serde_json::json!({"name": "ENDPOINT_VERSION", "value": ""}));
    }

    #[test]
    fn deployment_without_containers_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path());
        let err = render_workload(&s, "img", None, SERVICE, r#"{"spec": {}}"#).unwrap_err();
        assert!(matches!(err, Error::ConfigurationInvalid(_)));
    }
}
