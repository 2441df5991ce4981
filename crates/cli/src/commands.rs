//! Command drivers. Cluster-scoped work runs cluster by cluster; a failure is
//! recorded and the next cluster still runs. Configuration and script errors
//! abort before any cluster is touched.

use std::{
    io::{BufRead, Write},
    sync::Arc,
};

use anyhow::{anyhow, bail, Context, Result};
use futures::future::BoxFuture;
use gkeship_cloud::{CloudApi, OperationWaiter};
use gkeship_core::{BackendConfig, Cluster, ClusterSet, Variables};
use gkeship_ops::{render_workload, ssl, Endpoint, RolloutController, WorkloadSpec};
use gkeship_reconcile::{configure_named_port, ensure_network, Mode};
use metrics::counter;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    app::{App, DEPLOY_TEMPLATE, SERVICE_TEMPLATE},
    Cli, Commands, Output,
};

/// Per-cluster results of one command.
#[derive(Debug, Default)]
pub struct Outcome {
    failed: Vec<(String, anyhow::Error)>,
}

impl Outcome {
    pub fn record(&mut self, cluster: &str, res: Result<()>) {
        if let Err(e) = res {
            self.fail(cluster, e);
        }
    }

    pub fn fail(&mut self, cluster: &str, e: anyhow::Error) {
        error!(cluster, error = %format!("{:#}", e), "cluster failed");
        self.failed.push((cluster.to_string(), e));
    }

    pub fn is_ok(&self) -> bool { self.failed.is_empty() }

    /// Fail with every recorded cluster error, if any.
    pub fn finish(self, what: &str) -> Result<()> {
        if self.failed.is_empty() {
            return Ok(());
        }
        let lines: Vec<String> = self.failed.iter().map(|(c, e)| format!("  {}: {:#}", c, e)).collect();
        bail!("{} failed on {} cluster(s):\n{}", what, self.failed.len(), lines.join("\n"))
    }
}

/// Ask on the terminal; only `y`/`yes` confirms.
async fn confirm(prompt: String) -> Result<bool> {
    tokio::task::spawn_blocking(move || -> Result<bool> {
        let mut out = std::io::stdout();
        write!(out, "{} [y/N] ", prompt)?;
        out.flush()?;
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(is_yes(&line))
    })
    .await?
}

fn is_yes(answer: &str) -> bool { matches!(answer.trim().to_lowercase().as_str(), "y" | "yes") }

pub async fn run(cli: Cli) -> Result<()> {
    counter!("command_total", 1u64, "command" => cli.command.name());
    let app = App::load(&cli.global, Variables::from_env())?;
    info!(command = cli.command.name(), service = app.service(), branch = %app.settings.branch, "gkeship");

    if matches!(cli.command, Commands::TestConfig) {
        return test_config(&app, cli.global.output);
    }
    app.authenticate(&cli.global).await?;

    match &cli.command {
        Commands::TestConfig => Ok(()),
        Commands::FullDeploy { image } => full_deploy(&app, image.as_deref()).await,
        Commands::DeployTag { tag } => {
            let image = app.images().find_tag(app.service(), tag).await?;
            update_image(&app, &image).await
        }
        Commands::DeployImage { image } => update_image(&app, image).await,
        Commands::KubeImages => kube_images(&app, cli.global.output).await,
        Commands::KubeStatus => kube_status(&app, cli.global.output).await,
        Commands::KubeHistory => kube_history(&app).await,
        Commands::KubeRollback => kube_rollback(&app).await,
        Commands::ListImages => list_images(&app, cli.global.output).await,
        Commands::RemoveDeployment => remove_deployment(&app, cli.global.confirm).await,
    }
}

fn test_config(app: &App, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            print!("{}", serde_yaml::to_string(&app.settings.deploy)?);
            println!("nodePort: {}", app.settings.node_port);
        }
        Output::Json => {
            let body = serde_json::json!({"branch": app.settings.branch, "nodePort": app.settings.node_port, "current": app.settings.deploy});
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }
    info!("Configuration is valid");
    Ok(())
}

/// Existing configured clusters; nothing is created.
async fn existing_clusters(app: &App, api: &Arc<dyn CloudApi>) -> Result<ClusterSet> {
    let report = app.clusters(api)?.reconcile(false).await?;
    for name in report.missing(&app.settings.deploy.clusters) {
        warn!(cluster = name, "Cluster not found");
    }
    if report.clusters.is_empty() {
        bail!("None of the configured clusters exist: {}", app.settings.deploy.clusters.join(", "));
    }
    Ok(report.clusters)
}

/// Push `--image` when it is local, use it as given otherwise, or pick the
/// newest image for the branch.
async fn resolve_image(app: &App, image: Option<&str>) -> Result<String> {
    let repo = app.images();
    match image {
        Some(img) if repo.is_local_image(img).await? => {
            let tag = app.settings.docker_tag()?;
            Ok(repo.push_local_image(img, app.service(), &app.settings.branch, &tag).await?)
        }
        Some(img) => Ok(img.to_string()),
        None => Ok(repo.latest_image(app.service(), &app.settings.branch).await?),
    }
}

/// A new Endpoints configuration when deploying a given image, the current one
/// otherwise. `ENDPOINT_NAME` from the environment applies when no api-config
/// is set.
async fn resolve_endpoint(app: &App, deploy_new: bool) -> Result<Option<Endpoint>> {
    let files = app.settings.api_files()?;
    if files.is_empty() {
        return Ok(Endpoint::from_vars(&app.settings.vars));
    }
    let manager = app.endpoints();
    Ok(if deploy_new { manager.deploy(&files).await? } else { manager.latest(&files).await? })
}

async fn full_deploy(app: &App, image: Option<&str>) -> Result<()> {
    let settings = &app.settings;
    let script = app.load_balancer_script()?;
    let service_tpl = app.template(&settings.deploy.service_template, SERVICE_TEMPLATE)?;
    let deploy_tpl = app.template(&settings.deploy.deploy_template, DEPLOY_TEMPLATE)?;

    let resolved = resolve_image(app, image).await.context("resolving docker image")?;
    let endpoint = resolve_endpoint(app, image.is_some()).await.context("resolving endpoint")?;
    let workload = render_workload(settings, &resolved, endpoint.as_ref(), &service_tpl, &deploy_tpl)?;
    info!(image = %resolved, endpoint = ?endpoint.as_ref().map(|e| &e.name), "Deploying");

    let api = app.cloud()?;
    let waiter = app.waiter(&api);
    ensure_network(api.as_ref(), &waiter, &settings.deploy.network, true).await?;

    let report = app.clusters(&api)?.reconcile(true).await?;
    let mut outcome = Outcome::default();
    for f in report.failures {
        outcome.fail(&f.cluster, anyhow!(f.error).context("creating cluster"));
    }
    let mut backend = BackendConfig::new(settings, &report.clusters);
    let port_name = backend.port_name();
    for cluster in report.clusters.values() {
        let res = deploy_cluster(app, api.as_ref(), &waiter, cluster, &workload, &port_name).await;
        outcome.record(&cluster.name, res);
    }

    let state = app.engine(&api).run(&script, Mode::Create, &mut backend).await.context("configuring load balancer")?;
    if let Some(addr) = state.get_str("GLOBALADDRESSES") {
        info!(host = %settings.deploy.host, address = %addr, "Load balancer ready");
    }
    outcome.finish("full-deploy")
}

async fn deploy_cluster(
    app: &App,
    api: &dyn CloudApi,
    waiter: &OperationWaiter,
    cluster: &Cluster,
    workload: &WorkloadSpec,
    port_name: &str,
) -> Result<()> {
    let ctl = app.connect(cluster).await?;
    ssl::ensure_ssl_secret(ctl.platform(), app.runner.as_ref(), &app.settings.artifacts, ssl::SSL_SECRET).await?;
    ctl.deploy(workload, app.settings.deploy.wait_time).await?;
    configure_named_port(api, waiter, cluster, port_name, app.settings.node_port).await?;
    info!(cluster = %cluster.name, "Deployed");
    Ok(())
}

/// Run `f` against a controller for every existing cluster, collecting the
/// successful results.
async fn each_cluster<T, F>(app: &App, mut f: F) -> Result<(Vec<T>, Outcome)>
where
    T: Send,
    F: for<'a> FnMut(&'a App, &'a Cluster, RolloutController) -> BoxFuture<'a, Result<T>>,
{
    let api = app.cloud()?;
    let clusters = existing_clusters(app, &api).await?;
    let mut found = Vec::with_capacity(clusters.len());
    let mut outcome = Outcome::default();
    for cluster in clusters.values() {
        let res = match app.connect(cluster).await {
            Ok(ctl) => f(app, cluster, ctl).await,
            Err(e) => Err(e),
        };
        match res {
            Ok(v) => found.push(v),
            Err(e) => outcome.fail(&cluster.name, e),
        }
    }
    Ok((found, outcome))
}

async fn update_image(app: &App, image: &str) -> Result<()> {
    info!(image, "Updating image");
    let image = image.to_string();
    let (_, outcome) = each_cluster(app, move |app, _cluster, ctl| {
        let image = image.clone();
        Box::pin(async move { Ok(ctl.update_image(app.service(), &image, app.settings.deploy.wait_time).await?) })
    })
    .await?;
    outcome.finish("image update")
}

async fn kube_rollback(app: &App) -> Result<()> {
    let (_, outcome) = each_cluster(app, |app, _cluster, ctl| {
        Box::pin(async move { Ok(ctl.rollback(app.service(), app.settings.deploy.wait_time).await?) })
    })
    .await?;
    outcome.finish("rollback")
}

async fn kube_history(app: &App) -> Result<()> {
    let (_, outcome) = each_cluster(app, |app, cluster, ctl| {
        Box::pin(async move {
            let history = ctl.history(app.service()).await?;
            println!("{}:\n{}", cluster.name, history);
            Ok(())
        })
    })
    .await?;
    outcome.finish("history")
}

#[derive(Debug, Serialize)]
struct ImageRow {
    cluster: String,
    container: String,
    image: String,
}

async fn kube_images(app: &App, output: Output) -> Result<()> {
    let (found, outcome) = each_cluster(app, |app, cluster, ctl| {
        Box::pin(async move {
            let images = ctl.deployed_images(app.service()).await?;
            Ok(images
                .into_iter()
                .map(|(container, image)| {
                    info!("{}/{} = {}", cluster.name, container, image);
                    ImageRow { cluster: cluster.name.clone(), container, image }
                })
                .collect::<Vec<_>>())
        })
    })
    .await?;
    if output == Output::Json {
        let rows: Vec<ImageRow> = found.into_iter().flatten().collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    }
    outcome.finish("kube-images")
}

async fn kube_status(app: &App, output: Output) -> Result<()> {
    let (reports, outcome) =
        each_cluster(app, |app, _cluster, ctl| Box::pin(async move { Ok(ctl.report_status(app.service()).await?) })).await?;
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
        Output::Human => {
            for r in reports.iter() {
                println!("{:<32} replicas={} unavailable={} pods={}", r.cluster, r.replicas, r.unavailable, r.pods.len());
                for m in r.messages() {
                    println!("  {}", m);
                }
            }
        }
    }
    outcome.finish("kube-status")
}

async fn list_images(app: &App, output: Output) -> Result<()> {
    let repo = app.images();
    let uri = repo.uri(app.service(), None);
    let images = repo.list_tags(&uri, 25, Some(&format!("{}-", app.settings.branch))).await?;
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&images)?),
        Output::Human => {
            for img in images.iter() {
                let name = if img.tags.is_empty() { img.digest.clone() } else { img.tags.join(", ") };
                let when = img
                    .timestamp
                    .as_ref()
                    .and_then(|t| t.get("datetime"))
                    .and_then(|d| d.as_str())
                    .unwrap_or_default();
                println!("{:<60} {}", name, when);
            }
        }
    }
    Ok(())
}

async fn remove_deployment(app: &App, confirmed: bool) -> Result<()> {
    let settings = &app.settings;
    let script = app.load_balancer_script()?;
    let api = app.cloud()?;
    let clusters = existing_clusters(app, &api).await?;
    let names: Vec<&str> = clusters.values().map(|c| c.name.as_str()).collect();

    if !confirmed && !confirm(format!("Remove {} from {}?", app.service(), names.join(", "))).await? {
        warn!("Aborted");
        return Ok(());
    }
    let mut outcome = Outcome::default();
    for cluster in clusters.values() {
        let res = async {
            let ctl = app.connect(cluster).await?;
            ctl.platform().delete_service(app.service()).await?;
            ctl.platform().delete_deployment(app.service()).await?;
            info!(cluster = %cluster.name, "Removed deployment");
            Ok::<(), anyhow::Error>(())
        }
        .await;
        outcome.record(&cluster.name, res);
    }

    if !confirmed && !confirm(format!("Remove the load balancer for {}?", settings.deploy.host)).await? {
        warn!("Load balancer left in place");
        return outcome.finish("remove-deployment");
    }
    let mut backend = BackendConfig::new(settings, &clusters);
    app.engine(&api).run(&script, Mode::Delete, &mut backend).await.context("removing load balancer")?;
    debug!(ok = outcome.is_ok(), "remove-deployment finished");
    outcome.finish("remove-deployment")
}
