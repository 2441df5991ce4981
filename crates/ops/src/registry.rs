//! Container image registry (gcr.io) through gcloud and docker.

use std::sync::Arc;

use gkeship_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::shell::{CommandRunner, Echo, ToolCommand};

/// One entry of `gcloud container images list-tags --format=json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageTag {
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub timestamp: Option<Json>,
}

impl ImageTag {
    /// First tag, or the digest for untagged images.
    pub fn reference(&self) -> Option<&str> {
        self.tags.first().map(String::as_str).or(Some(self.digest.as_str())).filter(|s| !s.is_empty())
    }
}

pub struct ImageRepo {
    runner: Arc<dyn CommandRunner>,
    gcloud: ToolCommand,
    docker: ToolCommand,
    project: String,
}

impl ImageRepo {
    pub fn new(runner: Arc<dyn CommandRunner>, gcloud: ToolCommand, docker: ToolCommand, project: impl Into<String>) -> Self {
        Self { runner, gcloud, docker, project: project.into() }
    }

    pub fn project(&self) -> &str { &self.project }

    pub fn uri(&self, repo: &str, tag: Option<&str>) -> String {
        match tag.filter(|t| !t.is_empty()) {
            Some(t) => format!("us.gcr.io/{}/{}:{}", self.project, repo, t),
            None => format!("us.gcr.io/{}/{}", self.project, repo),
        }
    }

    /// Tags on `uri`, newest first. `limit == 0` means no limit.
    pub async fn list_tags(&self, uri: &str, limit: usize, filter: Option<&str>) -> Result<Vec<ImageTag>> {
        let mut cmd = self.gcloud.clone().args(["--quiet", "container", "images", "list-tags", uri, "--format=json"]);
        if limit > 0 {
            cmd = cmd.arg(format!("--limit={}", limit));
        }
        if let Some(f) = filter.filter(|f| !f.is_empty()) {
            cmd = cmd.arg(format!("--filter=tags:{}", f));
        }
        let out = self.runner.run(&cmd, Echo::Quiet).await?;
        if out.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&out)?)
    }

    /// Most recent image pushed for `branch`.
    pub async fn latest_image(&self, repo: &str, branch: &str) -> Result<String> {
        let base = self.uri(repo, None);
        let images = self.list_tags(&base, 1, Some(&format!("{}-", branch))).await?;
        let img = images.first().ok_or_else(|| Error::not_found(format!("No images found in: {}", base)))?;
        let tag = img.reference().ok_or_else(|| Error::not_found(format!("Image missing tags: {}", base)))?;
        let uri = self.uri(repo, Some(tag));
        debug!(image = %uri, "Using docker image");
        Ok(uri)
    }

    /// The single image carrying `tag`.
    pub async fn find_tag(&self, repo: &str, tag: &str) -> Result<String> {
        let base = self.uri(repo, None);
        let images = self.list_tags(&base, 0, Some(tag)).await?;
        let hits: Vec<&ImageTag> = images.iter().filter(|i| i.tags.iter().any(|t| t == tag)).collect();
        match hits.as_slice() {
            [_] => Ok(self.uri(repo, Some(tag))),
            [] => Err(Error::not_found(format!("Unable to find image {}:{}", base, tag))),
            _ => Err(Error::config(format!("Tag {} matches {} images in {}", tag, hits.len(), base))),
        }
    }

    /// Tag a local image, push it and move `<branch>-latest` onto it.
    pub async fn push_local_image(&self, image: &str, repo: &str, branch: &str, tag: &str) -> Result<String> {
        let target = self.uri(repo, Some(tag));
        let latest = self.uri(repo, Some(&format!("{}-latest", branch)));
        info!(source = image, target = %target, "Tagging docker image");
        self.runner.run(&self.docker.clone().args(["tag", image, target.as_str()]), Echo::Debug).await?;
        info!(image = %target, "Pushing docker image");
        self.runner.run(&self.gcloud.clone().args(["docker", "--", "push", target.as_str()]), Echo::Info).await?;
        info!(tag = %latest, "Applying image label");
        let add = self.gcloud.clone().args(["--quiet", "container", "images", "add-tag", target.as_str(), latest.as_str()]);
        self.runner.run(&add, Echo::Info).await?;
        Ok(target)
    }

    pub async fn is_local_image(&self, image: &str) -> Result<bool> {
        let out = self.runner.run(&self.docker.clone().args(["images", "-q", image]), Echo::Quiet).await?;
        Ok(!out.trim().is_empty())
    }
}
