//! SSL certificate discovery: which uploaded certificate covers a hostname.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use gkeship_cloud::{fetch_list, CloudApi, ResourceRef};
use gkeship_core::{Error, Result};
use gkeship_ops::{CommandRunner, Echo, ToolCommand};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Reads the DNS names a PEM certificate is valid for.
#[async_trait::async_trait]
pub trait CertificateReader: Send + Sync {
    async fn dns_names(&self, name: &str, pem: &str) -> Result<Vec<String>>;
}

static CN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"CN\s*=\s*([^,/\s]+)").expect("static regex"));

/// Names from `openssl x509 -noout -text` output: the subject alternative
/// DNS names, or the subject common name when there are none.
pub fn parse_x509_text(text: &str) -> Vec<String> {
    let mut lines = text.lines();
    let mut common = None;
    let mut san = Vec::new();
    while let Some(line) = lines.next() {
        let l = line.trim();
        if l.starts_with("Subject:") {
            common = CN_RE.captures(l).map(|c| c[1].to_string());
        } else if l.starts_with("X509v3 Subject Alternative Name") {
            if let Some(next) = lines.next() {
                san.extend(next.split(',').filter_map(|e| e.trim().strip_prefix("DNS:")).map(str::to_string));
            }
        }
    }
    if san.is_empty() {
        common.into_iter().collect()
    } else {
        san
    }
}

/// Shells out to `openssl x509`. PEM bodies are written under `workdir`.
pub struct OpensslCertificates {
    runner: Arc<dyn CommandRunner>,
    workdir: PathBuf,
}

impl OpensslCertificates {
    pub fn new(runner: Arc<dyn CommandRunner>, workdir: impl Into<PathBuf>) -> Self {
        Self { runner, workdir: workdir.into() }
    }
}

#[async_trait::async_trait]
impl CertificateReader for OpensslCertificates {
    async fn dns_names(&self, name: &str, pem: &str) -> Result<Vec<String>> {
        let dir = self.workdir.join("certs");
        tokio::fs::create_dir_all(&dir).await?;
        let file = dir.join(format!("{}.pem", name));
        tokio::fs::write(&file, pem).await?;
        let cmd = ToolCommand::parse("openssl")?.args(["x509", "-noout", "-text", "-in"]).arg(file.display().to_string());
        let out = self.runner.run(&cmd, Echo::Quiet).await?;
        Ok(parse_x509_text(&out))
    }
}

/// Certificate chosen for a hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRef {
    pub name: String,
    pub self_link: String,
    /// DNS name that matched, possibly a wildcard.
    pub domain: String,
}

/// Every uploaded certificate indexed by the DNS names it covers.
pub async fn certificate_map(api: &dyn CloudApi, reader: &dyn CertificateReader) -> Result<BTreeMap<String, CertificateRef>> {
    debug!("Fetching certificates list...");
    let certs = fetch_list(api, &ResourceRef::collection("sslCertificates")).await?;
    trace!(count = certs.len(), "certificates found");
    let mut map = BTreeMap::new();
    for cert in certs.iter() {
        let name = cert["name"].as_str().unwrap_or_default();
        let pem = cert["certificate"].as_str().unwrap_or_default();
        let names = reader.dns_names(name, pem).await?;
        trace!(cert = name, domains = %names.join(","), "certificate domains");
        for dns in names {
            let entry = CertificateRef {
                name: name.to_string(),
                self_link: cert["selfLink"].as_str().unwrap_or_default().to_string(),
                domain: dns.clone(),
            };
            map.insert(dns, entry);
        }
    }
    debug!(certificates = certs.len(), "Found certificates");
    Ok(map)
}

/// Exact hostname first, then the wildcard for its parent domain.
pub fn select_certificate(map: &BTreeMap<String, CertificateRef>, hostname: &str) -> Result<CertificateRef> {
    let host = hostname.to_lowercase();
    let wildcard = match host.split_once('.') {
        Some((_, rest)) => format!("*.{}", rest),
        None => "*".to_string(),
    };
    let cert = map
        .get(&host)
        .or_else(|| map.get(&wildcard))
        .ok_or_else(|| Error::config(format!("Unable to locate a certificate for {}.", hostname)))?;
    debug!(domain = %cert.domain, host = hostname, "Using certificate");
    Ok(cert.clone())
}
