//! `kubectl`-backed [`Platform`].

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use gkeship_core::{Cluster, Error, Result};
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Pod};
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    shell::{CommandRunner, Echo, ToolCommand},
    Platform,
};

#[derive(Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

/// Talks to one cluster through a pinned kubeconfig context.
pub struct KubectlPlatform {
    runner: Arc<dyn CommandRunner>,
    kubectl: ToolCommand,
    context: String,
    cluster: String,
}

/// Longest `--timeout` kubectl accepts comfortably; beyond it the flag is left off.
const MAX_TIMEOUT_SECS: u64 = u32::MAX as u64;

/// Whole seconds, rounded up, never zero (kubectl reads `0s` as "no timeout").
fn timeout_secs(t: Duration) -> u64 { (t.as_secs() + u64::from(t.subsec_nanos() > 0)).max(1) }

/// kubeconfig context name written by `get-credentials`.
pub fn context_name(project: &str, cluster: &Cluster) -> String {
    format!("gke_{}_{}_{}", project, cluster.zone, cluster.name)
}

impl KubectlPlatform {
    pub fn new(runner: Arc<dyn CommandRunner>, kubectl: ToolCommand, project: &str, cluster: &Cluster) -> Self {
        Self { runner, kubectl, context: context_name(project, cluster), cluster: cluster.name.clone() }
    }

    /// Fetch credentials for `cluster` and return a platform bound to it.
    pub async fn connect(
        runner: Arc<dyn CommandRunner>,
        gcloud: &ToolCommand,
        kubectl: ToolCommand,
        project: &str,
        cluster: &Cluster,
    ) -> Result<Self> {
        info!(cluster = %cluster.name, "Connecting to cluster");
        let creds = gcloud.clone().args(["container", "clusters", "get-credentials", "--quiet", "--project", project, "--zone"]).args([
            cluster.zone.as_str(),
            cluster.name.as_str(),
        ]);
        runner.run(&creds, Echo::Debug).await?;
        Ok(Self::new(runner, kubectl, project, cluster))
    }

    pub fn context(&self) -> &str { &self.context }

    fn kube<I, S>(&self, args: I) -> ToolCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kubectl.clone().arg("--context").arg(self.context.clone()).args(args)
    }

    async fn run<I, S>(&self, args: I, echo: Echo) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runner.run(&self.kube(args), echo).await
    }
}

#[async_trait::async_trait]
impl Platform for KubectlPlatform {
    fn cluster(&self) -> &str { &self.cluster }

    async fn apply(&self, manifest: &Path) -> Result<()> {
        self.run(["apply".to_string(), "-f".to_string(), manifest.display().to_string()], Echo::Info).await.map(drop)
    }

    async fn set_image(&self, deployment: &str, image: &str) -> Result<()> {
        let (kind, target) = (format!("deploy/{}", deployment), format!("{}={}", deployment, image));
        self.run(["set", "image", kind.as_str(), target.as_str()], Echo::Info).await.map(drop)
    }

    async fn deployment(&self, name: &str) -> Result<Deployment> {
        let out = self.run(["get", "deploy", name, "-o=json"], Echo::Quiet).await?;
        Ok(serde_json::from_str(&out)?)
    }

    async fn pods(&self) -> Result<Vec<Pod>> {
        let out = self.run(["get", "pod", "-o=json"], Echo::Quiet).await?;
        if out.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str::<PodList>(&out)?.items)
    }

    async fn rollout_status(&self, deployment: &str, timeout: Option<Duration>) -> Result<()> {
        let mut args = vec!["rollout".to_string(), "status".into(), format!("deploy/{}", deployment)];
        if let Some(secs) = timeout.map(timeout_secs).filter(|s| *s <= MAX_TIMEOUT_SECS) {
            args.push(format!("--timeout={}s", secs));
        }
        self.run(args, Echo::Info).await.map(drop)
    }

    async fn rollout_undo(&self, deployment: &str) -> Result<()> {
        warn!(cluster = %self.cluster, deployment, "Rolling back");
        self.run(["rollout", "undo", format!("deploy/{}", deployment).as_str()], Echo::Info).await.map(drop)
    }

    async fn rollout_history(&self, deployment: &str) -> Result<String> {
        self.run(["rollout", "history", format!("deploy/{}", deployment).as_str()], Echo::Quiet).await
    }

    async fn secret_exists(&self, name: &str) -> Result<bool> {
        match self.run(["get", "secrets", name], Echo::Quiet).await {
            Ok(_) => Ok(true),
            Err(Error::ExternalToolFailure { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_secret_from_files(&self, name: &str, files: &[PathBuf]) -> Result<()> {
        warn!(cluster = %self.cluster, secret = name, "Installing secret");
        let mut args = vec!["create".to_string(), "secret".into(), "generic".into(), name.to_string()];
        args.extend(files.iter().map(|f| format!("--from-file={}", f.display())));
        self.run(args, Echo::Debug).await.map(drop)
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        warn!(cluster = %self.cluster, service = name, "Removing service");
        self.run(["delete", "service", name], Echo::Info).await.map(drop)
    }

    async fn delete_deployment(&self, name: &str) -> Result<()> {
        warn!(cluster = %self.cluster, deployment = name, "Removing deployment");
        self.run(["delete", "deploy", name], Echo::Info).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::testing::ScriptedRunner;

    fn cluster() -> Cluster {
        Cluster { name: "prod-us-east1-b".into(), zone: "us-east1-b".into(), network: "n".into(), current_node_count: 3, instance_groups: vec![] }
    }

    #[tokio::test]
    async fn connect_fetches_credentials_and_pins_context() {
        let runner = Arc::new(ScriptedRunner::new());
        let gcloud = ToolCommand::parse("gcloud").unwrap();
        let k = KubectlPlatform::connect(runner.clone(), &gcloud, ToolCommand::parse("kubectl").unwrap(), "my-project", &cluster()).await.unwrap();
        k.set_image("shop", "us.gcr.io/my-project/shop:main-1").await.unwrap();
        let calls = runner.calls();
        assert_eq!(calls[0], "gcloud container clusters get-credentials --quiet --project my-project --zone us-east1-b prod-us-east1-b");
        assert_eq!(calls[1], "kubectl --context gke_my-project_us-east1-b_prod-us-east1-b set image deploy/shop shop=us.gcr.io/my-project/shop:main-1");
    }

    #[tokio::test]
    async fn rollout_status_carries_remaining_time() {
        let runner = Arc::new(ScriptedRunner::new());
        let k = KubectlPlatform::new(runner.clone(), ToolCommand::parse("kubectl").unwrap(), "p", &cluster());
        k.rollout_status("shop", Some(Duration::from_millis(34_200))).await.unwrap();
        k.rollout_status("shop", Some(Duration::from_millis(10))).await.unwrap();
        k.rollout_status("shop", None).await.unwrap();
        k.rollout_status("shop", Some(Duration::from_secs(u64::MAX / 2))).await.unwrap();
        let ctx = "kubectl --context gke_p_us-east1-b_prod-us-east1-b rollout status deploy/shop";
        assert_eq!(runner.calls(), vec![format!("{} --timeout=35s", ctx), format!("{} --timeout=1s", ctx), ctx.to_string(), ctx.to_string()]);
    }

    #[tokio::test]
    async fn pods_parse_kubectl_list() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.ok("kubectl --context gke_p_us-east1-b_prod-us-east1-b get pod", r#"{"apiVersion":"v1","kind":"List","items":[
            {"apiVersion":"v1","kind":"Pod","metadata":{"name":"shop-1","labels":{"app":"shop"}},"status":{"phase":"Running"}}]}"#);
        let k = KubectlPlatform::new(runner, ToolCommand::parse("kubectl").unwrap(), "p", &cluster());
        let pods = k.pods().await.unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].metadata.name.as_deref(), Some("shop-1"));
    }

    #[tokio::test]
    async fn missing_secret_is_not_an_error() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("kubectl --context gke_p_us-east1-b_prod-us-east1-b get secrets");
        let k = KubectlPlatform::new(runner, ToolCommand::parse("kubectl").unwrap(), "p", &cluster());
        assert!(!k.secret_exists("nginx").await.unwrap());
    }
}
