//! Deployment configuration: named sections, `extends` chains, validation,
//! and the values derived from it (node port, workload environment, tag format).

use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as Json};
use tracing::{debug, trace};

use crate::{
    template::{substitute_text, substitute_value, Variables},
    Error, Result,
};

pub const NODE_PORT_MIN: u16 = 30000;
pub const NODE_PORT_MAX: u16 = 32767;
const NODE_PORT_SPAN: u32 = 2768;

/// Fields that keep their variable references until they are rendered.
const DEFERRED_FIELDS: &[&str] = &["env", "tagFormat", "endpointFormat"];

/// One deployment section as read from the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeployConfig {
    #[serde(skip)]
    pub path: PathBuf,
    /// Kubernetes deployment and service name.
    pub name: String,
    #[serde(rename = "google-project")]
    pub google_project: String,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosts: Option<Vec<String>>,
    pub env: Vec<Json>,
    #[serde(deserialize_with = "lenient_i64")]
    pub replicas: i64,
    pub clusters: Vec<String>,
    #[serde(deserialize_with = "lenient_i64")]
    pub node_port: i64,
    pub network: String,
    pub machine_type: String,
    #[serde(deserialize_with = "lenient_i64")]
    pub disk_size_gb: i64,
    pub auto_upgrade: bool,
    pub auto_repair: bool,
    /// Port the service listens on inside the pod.
    #[serde(deserialize_with = "lenient_i64")]
    pub port: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub ssl_port: i64,
    #[serde(rename = "enableCDN")]
    pub enable_cdn: bool,
    #[serde(deserialize_with = "lenient_i64")]
    pub timeout_sec: i64,
    pub liveness_probe: String,
    pub readiness_probe: String,
    /// Milliseconds to wait for a rollout to stabilize; <= 0 skips verification.
    #[serde(deserialize_with = "lenient_i64")]
    pub wait_time: i64,
    pub tag_format: String,
    pub app_protocol: String,
    pub proxy_image: String,
    pub cluster_template: String,
    pub deploy_template: String,
    pub service_template: String,
    pub load_balancer_template: String,
    /// Google Endpoints service configuration files.
    #[serde(rename = "api-config", deserialize_with = "one_or_many")]
    pub api_config: Vec<String>,
    /// Service name written into `google.api.Service` configs before deploy.
    pub endpoint_format: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            name: "$SERVICE_NAME".into(),
            google_project: "$GCLOUD_PROJECT".into(),
            host: String::new(),
            hosts: None,
            env: vec!["NODE_ENV=$BRANCH".into(), "ENDPOINT_NAME".into(), "ENDPOINT_VERSION".into()],
            replicas: 2,
            clusters: Vec::new(),
            node_port: -1,
            network: "kube-vpc-net".into(),
            machine_type: "n1-highmem-2".into(),
            disk_size_gb: 500,
            auto_upgrade: true,
            auto_repair: true,
            port: 8080,
            ssl_port: 9443,
            enable_cdn: true,
            timeout_sec: 120,
            liveness_probe: "/_ah/health".into(),
            readiness_probe: "/_ah/health?isReady=true".into(),
            wait_time: 600_000,
            tag_format: String::new(),
            app_protocol: "http".into(),
            proxy_image: "gcr.io/endpoints-release/endpoints-runtime:1".into(),
            cluster_template: String::new(),
            deploy_template: String::new(),
            service_template: String::new(),
            load_balancer_template: String::new(),
            api_config: Vec::new(),
            endpoint_format: String::new(),
        }
    }
}

fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<i64, D::Error> {
    use serde::de::Error as _;
    match Json::deserialize(d)? {
        Json::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).ok_or_else(|| D::Error::custom("integer out of range")),
        Json::String(s) => s.trim().parse::<i64>().map_err(|_| D::Error::custom(format!("expected an integer, got \"{}\"", s))),
        other => Err(D::Error::custom(format!("expected an integer, got {}", other))),
    }
}

fn one_or_many<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<String>, D::Error> {
    use serde::de::Error as _;
    match Json::deserialize(d)? {
        Json::Null => Ok(Vec::new()),
        Json::String(s) => Ok(vec![s]),
        Json::Array(items) => items
            .into_iter()
            .map(|v| match v {
                Json::String(s) => Ok(s),
                other => Err(D::Error::custom(format!("expected a file name, got {}", other))),
            })
            .collect(),
        other => Err(D::Error::custom(format!("expected a file name or list, got {}", other))),
    }
}

static SERVICE_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\w[\w-]{1,64}\w$").expect("static regex"));
static PROJECT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\w[\w-]{5,64}\w$").expect("static regex"));
static ENV_ENTRY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([\w-]+)(=(.*))?$").expect("static regex"));

impl DeployConfig {
    /// Apply defaults and reject invalid values.
    fn normalize(&mut self) -> Result<()> {
        if self.host.is_empty() {
            if let Some(first) = self.hosts.as_ref().and_then(|h| h.first()) {
                self.host = first.clone();
            }
        }
        self.hosts = None;
        if !SERVICE_NAME_RE.is_match(&self.name) {
            return Err(Error::config(format!("Invalid service name: {}", self.name)));
        }
        if !PROJECT_RE.is_match(&self.google_project) {
            return Err(Error::config(format!("Invalid google project name: {}", self.google_project)));
        }
        if self.host.is_empty() {
            return Err(Error::config("The host property must include a domain that you have a certificate for."));
        }
        self.host = self.host.to_lowercase();
        if self.network.is_empty() {
            self.network = "kube-vpc-net".into();
        }
        self.clusters = self.clusters.iter().filter(|c| !c.is_empty()).map(|c| c.to_lowercase()).collect();
        if self.replicas < 1 {
            self.replicas = 1;
        }
        Ok(())
    }

    /// Configured node port, or one derived from the service name.
    pub fn resolve_node_port(&mut self) -> Result<u16> {
        if self.node_port <= 0 {
            self.node_port = hashed_node_port(&self.name) as i64;
        }
        if self.node_port < NODE_PORT_MIN as i64 || self.node_port > NODE_PORT_MAX as i64 {
            return Err(Error::config(format!("The node port {} is invalid.", self.node_port)));
        }
        Ok(self.node_port as u16)
    }
}

/// Leading decimal digits of `s`, 0 when there are none.
fn leading_decimal(s: &str) -> u32 {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

/// Deterministic node port for a service name.
///
/// The MD5 hex digest is cut into four 8-character slices; each slice is
/// read as its leading decimal digits (0 if it starts with a hex letter) and
/// the four values are XORed. Redeploys of existing services depend on this
/// exact derivation.
pub fn hashed_node_port(service_name: &str) -> u16 {
    let digest = hex::encode(Md5::digest(service_name.as_bytes()));
    let digit = (0..4).map(|i| leading_decimal(&digest[i * 8..i * 8 + 8])).fold(0u32, |acc, v| acc ^ v);
    NODE_PORT_MIN + (digit % NODE_PORT_SPAN) as u16
}

/// `type` of a gRPC/service-config style Endpoints document.
pub const GOOGLE_API_SERVICE: &str = "google.api.Service";

enum ApiFormat {
    Json,
    Yaml,
}

fn api_config_format(path: &Path) -> Option<ApiFormat> {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("json") => Some(ApiFormat::Json),
        Some("yaml") | Some("yml") => Some(ApiFormat::Yaml),
        _ => None,
    }
}

/// Parse an Endpoints configuration file (`.json`, `.yaml`, `.yml`). Other
/// file types (e.g. compiled descriptor sets) yield `None`.
pub fn load_api_config(path: &Path) -> Result<Option<Json>> {
    let Some(format) = api_config_format(path) else { return Ok(None) };
    let raw = std::fs::read_to_string(path).map_err(|e| Error::config(format!("Unable to read api config {}: {}", path.display(), e)))?;
    Ok(Some(match format {
        ApiFormat::Json => serde_json::from_str(&raw)?,
        ApiFormat::Yaml => serde_yaml::from_str(&raw)?,
    }))
}

/// Read a configuration file into its named sections.
pub fn load_sections(path: &Path) -> Result<Map<String, Json>> {
    let raw = std::fs::read_to_string(path)?;
    let ext = path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase());
    let doc: Json = match ext.as_deref() {
        Some("json") => serde_json::from_str(&raw)?,
        Some("yaml") | Some("yml") => serde_yaml::from_str(&raw)?,
        _ => return Err(Error::config("Unknown configuration type, supported types are (json|yaml).")),
    };
    match doc {
        Json::Object(m) => Ok(m),
        _ => Err(Error::config("The configuration file must contain a mapping of deployments.")),
    }
}

/// Flatten a section's `extends` chain, base fields beneath derived ones.
pub fn resolve_section(sections: &Map<String, Json>, name: &str) -> Result<Map<String, Json>> {
    let mut current = sections
        .get(name)
        .and_then(|v| v.as_object())
        .cloned()
        .ok_or_else(|| Error::config(format!("The config file does not have a deployment called \"{}\".", name)))?;
    let mut chain = vec![name.to_string()];
    loop {
        let extend = current.remove("extend");
        let extends = current.remove("extends");
        let base = match extend.or(extends) {
            None => break,
            Some(Json::String(b)) => b,
            Some(other) => return Err(Error::config(format!("extends must name a deployment, got {}", other))),
        };
        if chain.contains(&base) {
            return Err(Error::config(format!("The deployment extends itself through \"{}\".", base)));
        }
        let base_map = sections
            .get(&base)
            .and_then(|v| v.as_object())
            .ok_or_else(|| Error::config(format!("The deployment extends unknown deployment called \"{}\".", base)))?;
        trace!(section = %name, base = %base, "merging base deployment");
        let mut merged = base_map.clone();
        for (k, v) in current {
            merged.insert(k, v);
        }
        current = merged;
        chain.push(base);
    }
    Ok(current)
}

/// A workload environment entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Explicit run configuration threaded through every constructor.
#[derive(Debug, Clone)]
pub struct Settings {
    pub branch: String,
    pub artifacts: PathBuf,
    pub deploy: DeployConfig,
    pub node_port: u16,
    /// Variables visible to templates: the startup environment snapshot plus
    /// run values (`BRANCH`, `SERVICE_NAME`, `GCLOUD_PROJECT`, `HOSTNAME`, `NODE_PORT`, ...).
    pub vars: Variables,
}

impl Settings {
    pub fn load(path: &Path, branch: &str, artifacts: &Path, env: Variables) -> Result<Self> {
        if !path.exists() {
            return Err(Error::config(format!("The configuration file was not found at:\n{}", path.display())));
        }
        if branch.is_empty() {
            return Err(Error::config("Specify a deployment/branch name with --branch=[NAME]"));
        }
        let mut vars = env;
        vars.set("BRANCH", branch);
        vars.set("ARTIFACTS", artifacts.display().to_string());

        let sections = load_sections(path)?;
        let section = resolve_section(&sections, branch)?;
        let mut raw = match serde_json::to_value(DeployConfig::default())? {
            Json::Object(m) => m,
            _ => Map::new(),
        };
        for (k, v) in section {
            raw.insert(k, v);
        }
        for (k, v) in raw.iter_mut() {
            if !DEFERRED_FIELDS.contains(&k.as_str()) {
                *v = substitute_value(v, &vars)?;
            }
        }
        let mut deploy: DeployConfig = serde_json::from_value(Json::Object(raw))?;
        deploy.path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        deploy.normalize()?;
        let node_port = deploy.resolve_node_port()?;

        vars.set("SERVICE_NAME", deploy.name.clone());
        vars.set("GCLOUD_PROJECT", deploy.google_project.clone());
        vars.set("HOSTNAME", deploy.host.clone());
        vars.set("NODE_PORT", node_port);
        debug!(name = %deploy.name, project = %deploy.google_project, node_port, "configuration loaded");

        Ok(Self { branch: branch.to_string(), artifacts: artifacts.to_path_buf(), deploy, node_port, vars })
    }

    pub fn project(&self) -> &str { &self.deploy.google_project }

    pub fn service_name(&self) -> &str { &self.deploy.name }

    /// Resolve `configured` relative to the configuration file.
    pub fn config_relative(&self, configured: &str) -> PathBuf {
        let p = PathBuf::from(configured);
        if p.is_absolute() {
            return p;
        }
        self.deploy.path.parent().map(|base| base.join(&p)).unwrap_or(p)
    }

    /// Resolve a template override relative to the configuration file.
    pub fn template_override(&self, configured: &str) -> Option<PathBuf> {
        (!configured.is_empty()).then(|| self.config_relative(configured))
    }

    /// Endpoint service configuration files to deploy.
    ///
    /// With `endpointFormat` set, every `google.api.Service` config is copied
    /// into the artifacts directory with its `name` replaced by the rendered
    /// format, and the copy is deployed instead.
    pub fn api_files(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::with_capacity(self.deploy.api_config.len());
        for configured in self.deploy.api_config.iter().filter(|c| !c.is_empty()) {
            let path = self.config_relative(configured);
            if self.deploy.endpoint_format.is_empty() {
                out.push(path);
                continue;
            }
            let mut doc = match load_api_config(&path)? {
                Some(doc) if doc.get("type").and_then(Json::as_str) == Some(GOOGLE_API_SERVICE) => doc,
                _ => {
                    out.push(path);
                    continue;
                }
            };
            let name = substitute_text(&self.deploy.endpoint_format, &self.vars)?;
            if let Some(m) = doc.as_object_mut() {
                m.insert("name".into(), Json::String(name.clone()));
            }
            let file_name = path.file_name().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("api_config.yaml"));
            let copy = self.artifacts.join(file_name);
            let body = match api_config_format(&copy) {
                Some(ApiFormat::Json) => serde_json::to_string_pretty(&doc)?,
                _ => serde_yaml::to_string(&doc)?,
            };
            std::fs::write(&copy, body)?;
            debug!(old = %path.display(), new = %copy.display(), name = %name, "replaced service endpoint name");
            out.push(copy);
        }
        Ok(out)
    }

    /// Workload environment list rendered against the run variables.
    pub fn environment(&self) -> Result<Vec<EnvVar>> { self.environment_with(&self.vars) }

    /// Workload environment list rendered against `vars`.
    pub fn environment_with(&self, vars: &Variables) -> Result<Vec<EnvVar>> {
        let mut out = Vec::with_capacity(self.deploy.env.len() + 1);
        let mut has_port = false;
        for item in self.deploy.env.iter() {
            let (name, value) = match item {
                Json::String(s) => {
                    let caps = ENV_ENTRY_RE
                        .captures(s)
                        .ok_or_else(|| Error::config(format!("Invalid env entry: {}", s)))?;
                    (caps[1].to_string(), caps.get(3).map(|m| m.as_str().to_string()))
                }
                Json::Object(m) => match m.get("name").and_then(|n| n.as_str()) {
                    Some(n) => (n.to_string(), m.get("value").map(|v| match v {
                        Json::String(s) => s.clone(),
                        other => other.to_string(),
                    })),
                    None => continue,
                },
                _ => continue,
            };
            let name = name.to_uppercase();
            let value = value.unwrap_or_else(|| format!("${}", name));
            has_port |= name == "NODE_PORT";
            out.push(EnvVar { value: substitute_text(&value, vars)?, name });
        }
        if !has_port {
            out.push(EnvVar { name: "NODE_PORT".into(), value: self.deploy.port.to_string() });
        }
        Ok(out)
    }

    /// Tag format for pushed images.
    pub fn docker_tag_format(&self) -> String {
        if !self.deploy.tag_format.is_empty() {
            return self.deploy.tag_format.clone();
        }
        if self.vars.contains("CIRCLE_SHA1") && self.vars.contains("CIRCLE_BUILD_NUM") {
            return "$BRANCH-$CIRCLE_SHA1-$CIRCLE_BUILD_NUM".into();
        }
        "$BRANCH-$BUILD_TIME".into()
    }

    /// Rendered image tag.
    pub fn docker_tag(&self) -> Result<String> { substitute_text(&self.docker_tag_format(), &self.vars) }

    /// Persist the resolved configuration next to other run artifacts.
    pub fn save(&self) -> Result<PathBuf> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Saved<'a> {
            branch: &'a str,
            path: &'a Path,
            node_port: u16,
            current: &'a DeployConfig,
        }
        let out = self.artifacts.join("deployConfig.json");
        let body = serde_json::to_string_pretty(&Saved { branch: &self.branch, path: &self.deploy.path, node_port: self.node_port, current: &self.deploy })?;
        std::fs::write(&out, body)?;
        Ok(out)
    }
}
