//! Data model: clusters and the backend-service record derived from config.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};

use crate::{template::Variables, Error, Result};

/// A managed Kubernetes cluster as seen by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub name: String,
    pub zone: String,
    pub network: String,
    pub current_node_count: i64,
    /// Instance group links (never the group managers).
    pub instance_groups: Vec<String>,
}

impl Cluster {
    /// Map a container-API cluster resource.
    pub fn from_api(v: &Json) -> Result<Self> {
        let name = v.get("name").and_then(|n| n.as_str()).ok_or_else(|| Error::config("cluster resource missing name"))?;
        let zone = v
            .get("zone")
            .or_else(|| v.get("location"))
            .and_then(|z| z.as_str())
            .unwrap_or_default();
        let instance_groups = v
            .get("instanceGroupUrls")
            .and_then(|u| u.as_array())
            .map(|urls| {
                urls.iter()
                    .filter_map(|u| u.as_str())
                    .map(|u| u.replace("/instanceGroupManagers/", "/instanceGroups/"))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            name: name.to_string(),
            zone: zone.to_string(),
            network: v.get("network").and_then(|n| n.as_str()).unwrap_or_default().to_string(),
            current_node_count: v.get("currentNodeCount").and_then(|c| c.as_i64()).unwrap_or(0),
            instance_groups,
        })
    }

    /// Lowercase key used in cluster maps.
    pub fn key(&self) -> String { self.name.to_lowercase() }
}

/// Clusters keyed by lowercase name.
pub type ClusterSet = BTreeMap<String, Cluster>;

static NON_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)[^a-z0-9-]+").expect("static regex"));

/// Value object describing the load balancer's backend service.
///
/// Computed from deployment configuration plus the current cluster set;
/// never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    pub service_name: String,
    pub hostname: String,
    pub name: String,
    pub node_port: u16,
    pub timeout_sec: u32,
    pub liveness_probe: String,
    #[serde(rename = "enableCDN")]
    pub enable_cdn: bool,
    pub health_check: Option<String>,
    pub instance_groups: Vec<String>,
}

impl BackendConfig {
    pub fn new(settings: &crate::config::Settings, clusters: &ClusterSet) -> Self {
        let d = &settings.deploy;
        Self {
            service_name: d.name.clone(),
            hostname: d.host.clone(),
            name: Self::backend_name(&d.host),
            node_port: settings.node_port,
            timeout_sec: d.timeout_sec.max(0) as u32,
            liveness_probe: d.liveness_probe.clone(),
            enable_cdn: d.enable_cdn,
            health_check: None,
            instance_groups: clusters.values().flat_map(|c| c.instance_groups.iter().cloned()).collect(),
        }
    }

    /// `api.example.com` becomes `api-example-com`.
    pub fn backend_name(hostname: &str) -> String {
        NON_NAME.replace_all(&hostname.replace('.', "-"), "-").into_owned()
    }

    pub fn port_name(&self) -> String { format!("{}-port", self.service_name) }

    /// Desired backend-service resource body.
    pub fn desired_record(&self) -> Result<Json> {
        let hc = self.health_check.as_deref().ok_or_else(|| Error::config("healthCheck was not provided."))?;
        let backends: Vec<Json> = self
            .instance_groups
            .iter()
            .map(|g| json!({"group": g, "balancingMode": "UTILIZATION", "maxUtilization": 0.8}))
            .collect();
        Ok(json!({
            "name": self.name,
            "description": format!("Generated backend for {}", self.service_name),
            "port": self.node_port,
            "portName": self.port_name(),
            "protocol": "HTTPS",
            "enableCDN": self.enable_cdn,
            "backends": backends,
            "healthChecks": [hc],
            "timeoutSec": if self.timeout_sec == 0 { 150 } else { self.timeout_sec },
        }))
    }

    /// Initial state for a reconciliation script run.
    pub fn seed_variables(&self) -> Variables {
        Variables::new()
            .with("NAME", self.name.clone())
            .with("HOSTNAME", self.hostname.clone())
            .with("NODE_PORT", self.node_port)
            .with("SERVICE_NAME", self.service_name.clone())
            .with("LIVENESSPROBE", self.liveness_probe.clone())
    }
}
