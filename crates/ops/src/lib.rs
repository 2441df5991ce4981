//! gkeship ops: platform tools (kubectl, gcloud, docker, openssl) and the
//! rollout controller that drives a workload to a stable state.

#![forbid(unsafe_code)]

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use gkeship_core::Result;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Pod};

pub mod diagnostics;
pub mod endpoints;
pub mod kubectl;
pub mod manifests;
pub mod registry;
pub mod rollout;
pub mod shell;
pub mod ssl;

pub use diagnostics::PodMessages;
pub use endpoints::{Endpoint, EndpointManager};
pub use kubectl::KubectlPlatform;
pub use manifests::{render_workload, WorkloadSpec};
pub use registry::ImageRepo;
pub use rollout::{RolloutController, RolloutPhase, RolloutPolicy, RolloutState, StatusReport};
pub use shell::{CommandRunner, Echo, ProcessRunner, ToolCommand};

/// Cluster control-plane operations for one cluster.
#[async_trait::async_trait]
pub trait Platform: Send + Sync {
    /// Cluster name, for log context.
    fn cluster(&self) -> &str;

    async fn apply(&self, manifest: &Path) -> Result<()>;
    async fn set_image(&self, deployment: &str, image: &str) -> Result<()>;
    async fn deployment(&self, name: &str) -> Result<Deployment>;
    async fn pods(&self) -> Result<Vec<Pod>>;
    /// Blocks until the platform reports the rollout mechanically complete,
    /// giving up after `timeout` when one is set.
    async fn rollout_status(&self, deployment: &str, timeout: Option<Duration>) -> Result<()>;
    async fn rollout_undo(&self, deployment: &str) -> Result<()>;
    async fn rollout_history(&self, deployment: &str) -> Result<String>;
    async fn secret_exists(&self, name: &str) -> Result<bool>;
    async fn create_secret_from_files(&self, name: &str, files: &[PathBuf]) -> Result<()>;
    async fn delete_service(&self, name: &str) -> Result<()>;
    async fn delete_deployment(&self, name: &str) -> Result<()>;
}
