use std::{path::PathBuf, str::FromStr};

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

mod app;
mod auth;
mod commands;

#[derive(Parser, Debug)]
#[command(name = "gkeshipctl", version, about = "Deploy one service to many GKE clusters behind an HTTPS load balancer")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    pub output: Output,

    /// Deployment section of the config file to use
    #[arg(long, global = true)]
    pub branch: Option<String>,

    /// Deployment configuration file (.yaml, .yml or .json)
    #[arg(long, global = true, default_value = "deploy.yaml")]
    pub config: PathBuf,

    /// Directory for rendered manifests and the resolved configuration
    #[arg(long, global = true, env = "ARTIFACTS")]
    pub artifacts: Option<PathBuf>,

    /// Environment variable holding a base64 service-account key
    #[arg(long = "auth-env", global = true)]
    pub auth_env: Option<String>,

    /// Service-account key file
    #[arg(long = "auth-file", global = true)]
    pub auth_file: Option<PathBuf>,

    /// Log filter, overrides GKESHIP_LOG (e.g. "debug" or "gkeship_ops=trace")
    #[arg(long, global = true)]
    pub log: Option<String>,

    /// Skip interactive confirmations
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub confirm: bool,

    #[arg(long, global = true, env = "GCLOUD_COMMAND", default_value = "gcloud")]
    pub gcloud: String,

    #[arg(long, global = true, env = "KUBECTL_COMMAND", default_value = "kubectl")]
    pub kubectl: String,

    #[arg(long, global = true, env = "DOCKER_COMMAND", default_value = "docker")]
    pub docker: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Output { Human, Json }

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load and validate the configuration, then print it
    TestConfig,
    /// Push or pick an image, ensure network and clusters, deploy everywhere and configure the load balancer
    FullDeploy {
        /// Local image to tag and push, or a full image URI
        #[arg(long)]
        image: Option<String>,
    },
    /// Roll an existing registry tag out to every cluster
    DeployTag {
        #[arg(long)]
        tag: String,
    },
    /// Roll a full image URI out to every cluster
    DeployImage {
        #[arg(long)]
        image: String,
    },
    /// Print the images deployed in each cluster
    KubeImages,
    /// Print deployment and pod status for each cluster
    KubeStatus,
    /// Print rollout history for each cluster
    KubeHistory,
    /// Revert each cluster to its previous revision
    KubeRollback,
    /// List recent registry images for the branch
    ListImages,
    /// Delete the workload from every cluster and tear down the load balancer
    RemoveDeployment,
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::TestConfig => "test-config",
            Commands::FullDeploy { .. } => "full-deploy",
            Commands::DeployTag { .. } => "deploy-tag",
            Commands::DeployImage { .. } => "deploy-image",
            Commands::KubeImages => "kube-images",
            Commands::KubeStatus => "kube-status",
            Commands::KubeHistory => "kube-history",
            Commands::KubeRollback => "kube-rollback",
            Commands::ListImages => "list-images",
            Commands::RemoveDeployment => "remove-deployment",
        }
    }
}

fn init_tracing(level: Option<&str>) {
    let env = level
        .map(str::to_string)
        .or_else(|| std::env::var("GKESHIP_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("GKESHIP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid GKESHIP_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.global.log.as_deref());
    init_metrics();
    commands::run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_work_after_the_subcommand() {
        let cli = Cli::try_parse_from(["gkeshipctl", "deploy-tag", "--tag", "main-42", "--branch", "production", "-o", "json", "--confirm"]).unwrap();
        assert_eq!(cli.global.branch.as_deref(), Some("production"));
        assert_eq!(cli.global.output, Output::Json);
        assert!(cli.global.confirm);
        assert_eq!(cli.global.config, PathBuf::from("deploy.yaml"));
        match cli.command {
            Commands::DeployTag { tag } => assert_eq!(tag, "main-42"),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn full_deploy_image_is_optional() {
        let cli = Cli::try_parse_from(["gkeshipctl", "--branch", "staging", "full-deploy"]).unwrap();
        assert!(matches!(cli.command, Commands::FullDeploy { image: None }));
        assert_eq!(cli.command.name(), "full-deploy");
        let cli = Cli::try_parse_from(["gkeshipctl", "full-deploy", "--image", "shop:dev", "--auth-env", "GCLOUD_KEY"]).unwrap();
        assert!(matches!(cli.command, Commands::FullDeploy { image: Some(ref i) } if i == "shop:dev"));
        assert_eq!(cli.global.auth_env.as_deref(), Some("GCLOUD_KEY"));
    }

    #[test]
    fn required_subcommand_arguments() {
        assert!(Cli::try_parse_from(["gkeshipctl", "deploy-tag"]).is_err());
        assert!(Cli::try_parse_from(["gkeshipctl", "deploy-image"]).is_err());
        assert!(Cli::try_parse_from(["gkeshipctl", "--branch", "x"]).is_err());
        assert!(Cli::try_parse_from(["gkeshipctl", "kube-status", "-o", "yaml"]).is_err());
    }

    #[test]
    fn command_names_match_subcommands() {
        for (arg, name) in [("kube-images", "kube-images"), ("remove-deployment", "remove-deployment"), ("list-images", "list-images")] {
            let cli = Cli::try_parse_from(["gkeshipctl", arg]).unwrap();
            assert_eq!(cli.command.name(), name);
        }
    }
}
