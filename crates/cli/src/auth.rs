//! gcloud authentication and the bearer token used for REST calls.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine as _;
use gkeship_cloud::AccessTokenSource;
use gkeship_core::Variables;
use gkeship_ops::{CommandRunner, Echo, ToolCommand};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, trace};

/// Tokens from `print-access-token` live for an hour; refresh well before.
const TOKEN_TTL: Duration = Duration::from_secs(45 * 60);

/// Decode a base64 service-account key held in env var `name` and write it
/// under `key_dir`. Returns the key file path.
pub fn key_file_from_env(name: &str, encoded: &str, key_dir: &Path) -> Result<PathBuf> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .with_context(|| format!("decoding {}", name))?;
    let key: serde_json::Value = serde_json::from_slice(&raw).with_context(|| format!("parsing service account key from {}", name))?;
    std::fs::create_dir_all(key_dir)?;
    let path = key_dir.join(format!("{}.json", name.to_lowercase()));
    std::fs::write(&path, serde_json::to_string(&key)?)?;
    Ok(path)
}

/// Activate a service account (from `--auth-env` or `--auth-file`) and select
/// the project. The key variable and `HOME` are looked up in `vars`.
pub async fn authenticate(
    runner: &dyn CommandRunner,
    gcloud: &ToolCommand,
    auth_env: Option<&str>,
    auth_file: Option<&Path>,
    vars: &Variables,
    project: &str,
) -> Result<()> {
    let version = runner.run(&gcloud.clone().arg("version"), Echo::Quiet).await?;
    trace!("gcloud version:\n{}", version);
    if let Some(sdk) = version.lines().find_map(|l| l.strip_prefix("Google Cloud SDK ")) {
        debug!(version = sdk.trim(), "Google Cloud SDK");
    }

    let mut key_file = auth_file.map(Path::to_path_buf);
    if let Some(name) = auth_env {
        let encoded = vars.get_str(name).ok_or_else(|| anyhow!("Authentication environment not found: {}", name))?;
        let home = vars.get_str("HOME").map(PathBuf::from).unwrap_or_else(std::env::temp_dir);
        key_file = Some(key_file_from_env(name, &encoded, &home.join(".gcloud-key"))?);
    }
    if let Some(file) = key_file {
        if !file.exists() {
            bail!("Unable to locate authentication file: {}", file.display());
        }
        let activate = gcloud.clone().args(["auth", "activate-service-account", "--key-file"]).arg(file.display().to_string());
        runner.run(&activate, Echo::Debug).await?;
    }

    info!(project, "Connecting to project");
    runner.run(&gcloud.clone().args(["config", "set", "project", project]), Echo::Debug).await?;
    Ok(())
}

/// Access token from `gcloud auth print-access-token`, cached.
pub struct GcloudToken {
    runner: Arc<dyn CommandRunner>,
    gcloud: ToolCommand,
    cached: Mutex<Option<(String, Instant)>>,
}

impl GcloudToken {
    pub fn new(runner: Arc<dyn CommandRunner>, gcloud: ToolCommand) -> Self {
        Self { runner, gcloud, cached: Mutex::new(None) }
    }
}

#[async_trait::async_trait]
impl AccessTokenSource for GcloudToken {
    async fn token(&self) -> gkeship_core::Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some((tok, at)) = cached.as_ref() {
            if at.elapsed() < TOKEN_TTL {
                return Ok(tok.clone());
            }
        }
        let out = self.runner.run(&self.gcloud.clone().args(["auth", "print-access-token"]), Echo::Quiet).await?;
        let tok = out.trim().to_string();
        *cached = Some((tok.clone(), Instant::now()));
        Ok(tok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gkeship_ops::shell::testing::ScriptedRunner;

    #[test]
    fn decodes_key_from_env_value() {
        let dir = tempfile::tempdir().unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode(r#"{"type": "service_account", "project_id": "p"}"#);
        let path = key_file_from_env("GCLOUD_KEY", &encoded, dir.path()).unwrap();
        assert_eq!(path, dir.path().join("gcloud_key.json"));
        let v: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(v["project_id"], "p");
        assert!(key_file_from_env("BAD", "not base64!", dir.path()).is_err());
    }

    #[tokio::test]
    async fn activates_key_file_then_selects_project() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("key.json");
        std::fs::write(&key, "{}").unwrap();
        let runner = ScriptedRunner::new();
        runner.ok("gcloud version", "Google Cloud SDK 470.0.0\nkubectl 1.29.2");
        let gcloud = ToolCommand::parse("gcloud").unwrap();
        authenticate(&runner, &gcloud, None, Some(&key), &Variables::new(), "my-project").await.unwrap();
        let calls = runner.calls();
        assert_eq!(calls[1], format!("gcloud auth activate-service-account --key-file {}", key.display()));
        assert_eq!(calls[2], "gcloud config set project my-project");

        let missing = dir.path().join("nope.json");
        assert!(authenticate(&runner, &gcloud, None, Some(&missing), &Variables::new(), "my-project").await.is_err());
    }

    #[tokio::test]
    async fn key_from_variable_is_written_under_home() {
        let home = tempfile::tempdir().unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode(r#"{"type": "service_account"}"#);
        let vars = Variables::new().with("HOME", home.path().display().to_string()).with("GCLOUD_KEY", encoded);
        let runner = ScriptedRunner::new();
        let gcloud = ToolCommand::parse("gcloud").unwrap();
        authenticate(&runner, &gcloud, Some("GCLOUD_KEY"), None, &vars, "my-project").await.unwrap();
        let key = home.path().join(".gcloud-key").join("gcloud_key.json");
        assert!(key.exists());
        assert_eq!(runner.calls()[1], format!("gcloud auth activate-service-account --key-file {}", key.display()));

        let err = authenticate(&runner, &gcloud, Some("UNSET_KEY"), None, &vars, "my-project").await.unwrap_err();
        assert!(err.to_string().contains("UNSET_KEY"), "{}", err);
    }

    #[tokio::test(start_paused = true)]
    async fn token_is_cached() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.ok("gcloud auth print-access-token", "ya29.first\n").ok("gcloud auth print-access-token", "ya29.second");
        let src = GcloudToken::new(runner.clone(), ToolCommand::parse("gcloud").unwrap());
        assert_eq!(src.token().await.unwrap(), "ya29.first");
        assert_eq!(src.token().await.unwrap(), "ya29.first");
        tokio::time::advance(TOKEN_TTL + Duration::from_secs(1)).await;
        assert_eq!(src.token().await.unwrap(), "ya29.second");
        assert_eq!(runner.calls().len(), 2);
    }
}
