//! Self-signed TLS secret used by the in-pod proxy.

use std::path::{Path, PathBuf};

use gkeship_core::Result;
use tracing::{debug, warn};

use crate::{
    shell::{CommandRunner, Echo, ToolCommand},
    Platform,
};

pub const SSL_SECRET: &str = "nginx";
const SUBJECT: &str = "/C=US/ST=Delaware/L=Dover/O=ops/OU=dev/CN=example.org";

/// Install secret `name` from a freshly generated key pair unless it already
/// exists. Key material is written under `workdir`.
pub async fn ensure_ssl_secret(platform: &dyn Platform, runner: &dyn CommandRunner, workdir: &Path, name: &str) -> Result<bool> {
    if platform.secret_exists(name).await? {
        debug!(cluster = platform.cluster(), secret = name, "ssl secret present");
        return Ok(false);
    }
    warn!(cluster = platform.cluster(), secret = name, "Generating missing SSL certificate");
    std::fs::create_dir_all(workdir)?;
    let key: PathBuf = workdir.join(format!("{}.key", name));
    let crt: PathBuf = workdir.join(format!("{}.crt", name));
    let openssl = ToolCommand::parse("openssl")?;
    runner.run(&openssl.clone().arg("version"), Echo::Debug).await?;
    let req = openssl.args(["req", "-x509", "-nodes", "-days", "1825", "-newkey", "rsa:2048", "-subj", SUBJECT, "-keyout"]).args([
        key.display().to_string(),
        "-out".to_string(),
        crt.display().to_string(),
    ]);
    runner.run(&req, Echo::Debug).await?;
    platform.create_secret_from_files(name, &[key, crt]).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{shell::testing::ScriptedRunner, KubectlPlatform};
    use gkeship_core::Cluster;
    use std::sync::Arc;

    fn platform(runner: Arc<ScriptedRunner>) -> KubectlPlatform {
        let c = Cluster { name: "c1".into(), zone: "us-east1-b".into(), network: String::new(), current_node_count: 1, instance_groups: vec![] };
        KubectlPlatform::new(runner, ToolCommand::parse("kubectl").unwrap(), "proj-123", &c)
    }

    #[tokio::test]
    async fn existing_secret_is_left_alone() {
        let runner = Arc::new(ScriptedRunner::new());
        let p = platform(runner.clone());
        let dir = tempfile::tempdir().unwrap();
        assert!(!ensure_ssl_secret(&p, runner.as_ref(), dir.path(), SSL_SECRET).await.unwrap());
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn missing_secret_is_generated_and_installed() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("kubectl --context gke_proj-123_us-east1-b_c1 get secrets nginx");
        let p = platform(runner.clone());
        let dir = tempfile::tempdir().unwrap();
        assert!(ensure_ssl_secret(&p, runner.as_ref(), dir.path(), SSL_SECRET).await.unwrap());
        let calls = runner.calls();
        assert_eq!(calls[1], "openssl version");
        assert!(calls[2].starts_with("openssl req -x509 -nodes -days 1825 -newkey rsa:2048"));
        assert!(calls[3].starts_with("kubectl --context gke_proj-123_us-east1-b_c1 create secret generic nginx --from-file="));
        assert!(calls[3].ends_with("nginx.crt"));
    }
}
