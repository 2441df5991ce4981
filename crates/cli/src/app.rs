//! Per-run context: resolved settings, tool command lines and collaborator wiring.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gkeship_cloud::{http_timeout, CloudApi, GcpRestApi, OperationWaiter, WaitPolicy};
use gkeship_core::{Cluster, Settings, Variables};
use gkeship_ops::{CommandRunner, Echo, EndpointManager, ImageRepo, KubectlPlatform, ProcessRunner, RolloutController, ToolCommand};
use gkeship_reconcile::{ClusterDefaults, ClusterReconciler, OpensslCertificates, ReconciliationEngine, Script, SystemResolver};
use tracing::{debug, info};

use crate::{auth, GlobalArgs};

pub const CLUSTER_TEMPLATE: &str = include_str!("../../../templates/cluster.json");
pub const DEPLOY_TEMPLATE: &str = include_str!("../../../templates/deployment.json");
pub const SERVICE_TEMPLATE: &str = include_str!("../../../templates/service.json");
pub const LOAD_BALANCER_TEMPLATE: &str = include_str!("../../../templates/load-balancer.json");

pub const LOAD_BALANCER_SCRIPT: &str = "httpsLoadBalancer";

/// `2024-03-05T14:02:11.026Z` with every non-word run replaced by `-`.
pub fn build_time(now: DateTime<Utc>) -> String { now.format("%Y-%m-%dT%H-%M-%S-%3fZ").to_string() }

/// `--artifacts`/`ARTIFACTS`, else `CIRCLE_ARTIFACTS`, else `./artifacts`.
pub fn artifacts_dir(flag: Option<&Path>, vars: &Variables) -> PathBuf {
    flag.map(Path::to_path_buf)
        .or_else(|| vars.get_str("CIRCLE_ARTIFACTS").filter(|s| !s.is_empty()).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("artifacts"))
}

/// Contents of a configured template file, or the embedded default.
pub fn read_template(settings: &Settings, configured: &str, embedded: &'static str) -> Result<String> {
    match settings.template_override(configured) {
        Some(path) => {
            debug!(template = %path.display(), "using template override");
            std::fs::read_to_string(&path).with_context(|| format!("reading template {}", path.display()))
        }
        None => Ok(embedded.to_string()),
    }
}

pub struct Tools {
    pub gcloud: ToolCommand,
    pub kubectl: ToolCommand,
    pub docker: ToolCommand,
}

impl Tools {
    pub fn from_args(args: &GlobalArgs) -> Result<Self> {
        Ok(Self {
            gcloud: ToolCommand::parse(&args.gcloud)?,
            kubectl: ToolCommand::parse(&args.kubectl)?,
            docker: ToolCommand::parse(&args.docker)?,
        })
    }
}

pub struct App {
    pub settings: Settings,
    pub tools: Tools,
    pub runner: Arc<dyn CommandRunner>,
}

impl App {
    /// Resolve configuration for the selected branch and save it to the
    /// artifacts directory.
    pub fn load(args: &GlobalArgs, mut vars: Variables) -> Result<Self> {
        let tools = Tools::from_args(args)?;
        let artifacts = artifacts_dir(args.artifacts.as_deref(), &vars);
        std::fs::create_dir_all(&artifacts).with_context(|| format!("creating {}", artifacts.display()))?;
        if !vars.contains("BUILD_TIME") {
            vars.set("BUILD_TIME", build_time(Utc::now()));
        }
        let branch = args.branch.as_deref().unwrap_or_default();
        let settings = Settings::load(&args.config, branch, &artifacts, vars)?;
        let saved = settings.save()?;
        debug!(file = %saved.display(), "saved resolved configuration");
        Ok(Self { settings, tools, runner: Arc::new(ProcessRunner) })
    }

    pub fn project(&self) -> &str { self.settings.project() }

    pub fn service(&self) -> &str { self.settings.service_name() }

    pub async fn authenticate(&self, args: &GlobalArgs) -> Result<()> {
        let (vars, gcloud) = (&self.settings.vars, &self.tools.gcloud);
        auth::authenticate(self.runner.as_ref(), gcloud, args.auth_env.as_deref(), args.auth_file.as_deref(), vars, self.project())
            .await
            .context("authenticating with gcloud")
    }

    pub fn template(&self, configured: &str, embedded: &'static str) -> Result<String> {
        read_template(&self.settings, configured, embedded)
    }

    pub fn load_balancer_script(&self) -> Result<Script> {
        let script = match self.settings.template_override(&self.settings.deploy.load_balancer_template) {
            Some(path) => Script::load(&path, LOAD_BALANCER_SCRIPT)?,
            None => Script::parse(LOAD_BALANCER_TEMPLATE, LOAD_BALANCER_SCRIPT)?,
        };
        Ok(script)
    }

    pub fn cloud(&self) -> Result<Arc<dyn CloudApi>> {
        let tokens = Arc::new(auth::GcloudToken::new(self.runner.clone(), self.tools.gcloud.clone()));
        Ok(Arc::new(GcpRestApi::new(self.project(), tokens, http_timeout(&self.settings.vars))?))
    }

    pub fn waiter(&self, api: &Arc<dyn CloudApi>) -> OperationWaiter {
        OperationWaiter::new(api.clone()).with_policy(WaitPolicy::from_vars(&self.settings.vars))
    }

    pub fn images(&self) -> ImageRepo {
        ImageRepo::new(self.runner.clone(), self.tools.gcloud.clone(), self.tools.docker.clone(), self.project())
    }

    pub fn endpoints(&self) -> EndpointManager {
        EndpointManager::new(self.runner.clone(), self.tools.gcloud.clone(), self.project())
    }

    pub fn clusters(&self, api: &Arc<dyn CloudApi>) -> Result<ClusterReconciler> {
        let template = self.template(&self.settings.deploy.cluster_template, CLUSTER_TEMPLATE)?;
        Ok(ClusterReconciler::new(api.clone(), self.waiter(api), template, ClusterDefaults::from_settings(&self.settings)))
    }

    pub fn engine(&self, api: &Arc<dyn CloudApi>) -> ReconciliationEngine {
        let certs = OpensslCertificates::new(self.runner.clone(), self.settings.artifacts.clone());
        ReconciliationEngine::new(api.clone(), self.waiter(api), Arc::new(SystemResolver), Arc::new(certs))
    }

    /// Fetch credentials for `cluster` and return a controller bound to it.
    pub async fn connect(&self, cluster: &Cluster) -> Result<RolloutController> {
        let platform =
            KubectlPlatform::connect(self.runner.clone(), &self.tools.gcloud, self.tools.kubectl.clone(), self.project(), cluster).await?;
        if self.tools.gcloud.is_sudo() {
            self.reclaim_credentials().await?;
        }
        Ok(RolloutController::new(Arc::new(platform), &self.settings.artifacts))
    }

    /// `sudo gcloud` leaves root-owned kube and gcloud credentials behind.
    async fn reclaim_credentials(&self) -> Result<()> {
        let vars = &self.settings.vars;
        let (Some(user), Some(home)) = (vars.get_str("USER"), vars.get_str("HOME")) else {
            return Ok(());
        };
        let home = PathBuf::from(home);
        info!(user = %user, "Restoring credential ownership");
        let chown = ToolCommand::parse("sudo")?.args(["chown", "-R", user.as_str()]).args([
            home.join(".kube").display().to_string(),
            home.join(".config").join("gcloud").display().to_string(),
        ]);
        self.runner.run(&chown, Echo::Debug).await?;
        Ok(())
    }
}
