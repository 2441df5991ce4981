//! Cluster existence reconciliation and node-port wiring.

use std::sync::Arc;

use futures::future::join_all;
use gkeship_cloud::{CloudApi, OperationWaiter, ResourceRef};
use gkeship_core::{substitute_text, Cluster, ClusterSet, Error, Result, Settings, Variables};
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value as Json};
use tracing::{debug, error, info, trace, warn};

static ZONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([a-z]+-(?:north|south|east|west|central)+\d{1,2})-[a-z]").expect("static regex"));

const DEFAULT_POOL: &str = "default-pool";

/// `(region, zone)` encoded in a cluster name such as `prod-us-central1-a`.
pub fn region_zone(name: &str) -> Option<(String, String)> {
    ZONE_RE.captures(name).map(|c| (c[1].to_string(), c[0].to_string()))
}

/// Inputs for new clusters, taken from the deployment config.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterDefaults {
    pub names: Vec<String>,
    pub network: String,
    pub size: i64,
    pub machine_type: String,
    pub disk_size_gb: i64,
    pub auto_upgrade: bool,
    pub auto_repair: bool,
}

impl ClusterDefaults {
    pub fn from_settings(settings: &Settings) -> Self {
        let d = &settings.deploy;
        Self {
            names: d.clusters.clone(),
            network: d.network.clone(),
            size: d.replicas,
            machine_type: d.machine_type.clone(),
            disk_size_gb: d.disk_size_gb,
            auto_upgrade: d.auto_upgrade,
            auto_repair: d.auto_repair,
        }
    }
}

/// A cluster that could not be created.
#[derive(Debug)]
pub struct ClusterFailure {
    pub cluster: String,
    pub error: Error,
}

/// Clusters found or created, plus the ones that failed.
#[derive(Debug, Default)]
pub struct ClusterReport {
    pub clusters: ClusterSet,
    pub failures: Vec<ClusterFailure>,
}

impl ClusterReport {
    /// Desired names absent from the result.
    pub fn missing<'a>(&self, desired: &'a [String]) -> Vec<&'a str> {
        desired.iter().filter(|n| !self.clusters.contains_key(n.as_str())).map(String::as_str).collect()
    }
}

pub struct ClusterReconciler {
    api: Arc<dyn CloudApi>,
    waiter: OperationWaiter,
    template: String,
    defaults: ClusterDefaults,
}

impl ClusterReconciler {
    /// `template` is the cluster-create body with `$CLUSTER_NAME`, `$ZONE_NAME`,
    /// `$NETWORK_NAME`, `$CLUSTER_SIZE`, `$MACHINE_TYPE` and `$DISK_SIZE` references.
    pub fn new(api: Arc<dyn CloudApi>, waiter: OperationWaiter, template: impl Into<String>, defaults: ClusterDefaults) -> Self {
        Self { api, waiter, template: template.into(), defaults }
    }

    /// Existing clusters whose lowercase name is configured.
    pub async fn matching_clusters(&self) -> Result<Vec<Cluster>> {
        let all = self.api.list_clusters("-").await?;
        let mut out = Vec::new();
        for raw in all.iter() {
            let c = Cluster::from_api(raw)?;
            if self.defaults.names.contains(&c.key()) {
                out.push(c);
            }
        }
        Ok(out)
    }

    /// Ensure the configured clusters exist. Missing clusters are created
    /// concurrently when `create_missing` is set, otherwise they are only logged
    /// and left out of the result. A failed create is reported per cluster.
    pub async fn reconcile(&self, create_missing: bool) -> Result<ClusterReport> {
        let mut report = ClusterReport::default();
        for c in self.matching_clusters().await? {
            report.clusters.insert(c.key(), c);
        }
        let missing: Vec<String> = self.defaults.names.iter().filter(|n| !report.clusters.contains_key(n.as_str())).cloned().collect();
        if missing.is_empty() {
            debug!(existing = ?report.clusters.keys().collect::<Vec<_>>(), "Clusters found");
            return Ok(report);
        }
        debug!(existing = ?report.clusters.keys().collect::<Vec<_>>(), ?missing, "Some clusters are missing");
        if !create_missing {
            return Ok(report);
        }

        let results = join_all(missing.iter().map(|name| self.create_cluster(name))).await;
        for (name, res) in missing.into_iter().zip(results) {
            match res {
                Ok(c) => {
                    report.clusters.insert(c.key(), c);
                }
                Err(e) => {
                    error!(cluster = %name, error = %e, "cluster creation failed");
                    report.failures.push(ClusterFailure { cluster: name, error: e });
                }
            }
        }
        trace!(clusters = ?report.clusters.keys().collect::<Vec<_>>(), expected = ?self.defaults.names, "clusters loaded");
        Ok(report)
    }

    fn render_template(&self, name: &str, zone: &str) -> Result<Json> {
        let d = &self.defaults;
        let vars = Variables::new()
            .with("CLUSTER_NAME", name)
            .with("NETWORK_NAME", d.network.clone())
            .with("ZONE_NAME", zone)
            .with("CLUSTER_SIZE", d.size)
            .with("MACHINE_TYPE", d.machine_type.clone())
            .with("DISK_SIZE", d.disk_size_gb);
        Ok(serde_json::from_str(&substitute_text(&self.template, &vars)?)?)
    }

    /// Create one cluster, then set its default pool's management policy.
    pub async fn create_cluster(&self, name: &str) -> Result<Cluster> {
        let (_, zone) = region_zone(name)
            .ok_or_else(|| Error::config(format!("Unable to determine the zone for cluster {}.", name)))?;
        let body = self.render_template(name, &zone)?;
        trace!(cluster = name, body = %body, "creating cluster");

        warn!(cluster = name, zone = %zone, "Creating cluster...");
        counter!("cluster_create_total", 1u64);
        let op = self.api.create_cluster(&zone, &body).await?;
        self.waiter.wait(&op).await?;

        info!(cluster = name, "Updating management policy...");
        let management = json!({"management": {"autoUpgrade": self.defaults.auto_upgrade, "autoRepair": self.defaults.auto_repair}});
        let op = self.api.set_node_pool_management(&zone, name, DEFAULT_POOL, &management).await?;
        self.waiter.wait(&op).await?;

        Cluster::from_api(&self.api.get_cluster(&zone, name).await?)
    }
}

fn has_named_port(group: &Json, name: &str, port: u16) -> bool {
    group
        .get("namedPorts")
        .and_then(|p| p.as_array())
        .map(|ports| ports.iter().any(|p| p["name"].as_str() == Some(name) && p["port"].as_u64() == Some(port as u64)))
        .unwrap_or(false)
}

/// Give every instance group of `cluster` the named port `name = port`,
/// replacing any entry with the same name and keeping the rest.
pub async fn configure_named_port(api: &dyn CloudApi, waiter: &OperationWaiter, cluster: &Cluster, name: &str, port: u16) -> Result<()> {
    for link in cluster.instance_groups.iter() {
        let group = link.rsplit('/').next().unwrap_or(link.as_str());
        let info = api.get(&ResourceRef::named("instanceGroups", group).in_zone(&cluster.zone)).await?;
        if has_named_port(&info, name, port) {
            trace!(group, port = name, "named port already set");
            continue;
        }
        info!(group, port = name, value = port, "Updating named port");
        let mut ports: Vec<Json> = info
            .get("namedPorts")
            .and_then(|p| p.as_array())
            .map(|p| p.iter().filter(|e| e["name"].as_str() != Some(name)).cloned().collect())
            .unwrap_or_default();
        ports.push(json!({"name": name, "port": port}));
        let body = json!({"namedPorts": ports, "fingerprint": info.get("fingerprint").cloned().unwrap_or(Json::Null)});
        let op = api.set_named_ports(&cluster.zone, group, &body).await?;
        waiter.wait(&op).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gkeship_cloud::fake::FakeCloud;

    const TEMPLATE: &str = r#"{"cluster": {"name": "$CLUSTER_NAME", "zone": "$ZONE_NAME", "network": "$NETWORK_NAME",
        "initialNodeCount": $CLUSTER_SIZE, "nodeConfig": {"machineType": "$MACHINE_TYPE", "diskSizeGb": $DISK_SIZE}}}"#;

    fn defaults(names: &[&str]) -> ClusterDefaults {
        ClusterDefaults {
            names: names.iter().map(|s| s.to_string()).collect(),
            network: "kube-vpc-net".into(),
            size: 2,
            machine_type: "n1-highmem-2".into(),
            disk_size_gb: 500,
            auto_upgrade: true,
            auto_repair: false,
        }
    }

    fn reconciler(cloud: &Arc<FakeCloud>, names: &[&str]) -> ClusterReconciler {
        ClusterReconciler::new(cloud.clone(), OperationWaiter::new(cloud.clone()), TEMPLATE, defaults(names))
    }

    #[test]
    fn zone_from_cluster_name() {
        assert_eq!(region_zone("prod-us-central1-a"), Some(("us-central1".into(), "us-central1-a".into())));
        assert_eq!(region_zone("eu-europe-west1-b-blue"), Some(("europe-west1".into(), "europe-west1-b".into())));
        assert_eq!(region_zone("staging"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_cluster_is_omitted_without_create() {
        let cloud = Arc::new(FakeCloud::new("my-project"));
        cloud.put_cluster("Prod-US-East1-B", "us-east1-b", &["gke-a"]);
        cloud.put_cluster("unrelated-us-east1-c", "us-east1-c", &["gke-b"]);
        let names = ["prod-us-east1-b", "prod-us-west1-a"];
        let report = reconciler(&cloud, &names).reconcile(false).await.unwrap();
        assert_eq!(report.clusters.keys().collect::<Vec<_>>(), vec!["prod-us-east1-b"]);
        assert!(report.failures.is_empty());
        assert_eq!(report.missing(&names.map(String::from)), vec!["prod-us-west1-a"]);
        assert!(cloud.mutations().is_empty());
        let groups = &report.clusters["prod-us-east1-b"].instance_groups;
        assert!(groups[0].ends_with("/zones/us-east1-b/instanceGroups/gke-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn creates_missing_clusters_and_sets_management() {
        let cloud = Arc::new(FakeCloud::new("my-project"));
        let report = reconciler(&cloud, &["prod-us-west1-a"]).reconcile(true).await.unwrap();
        let c = &report.clusters["prod-us-west1-a"];
        assert_eq!(c.zone, "us-west1-a");
        assert_eq!(c.current_node_count, 2);
        assert!(c.instance_groups[0].contains("/instanceGroups/gke-prod-us-west1-a-default-pool"));
        assert_eq!(cloud.mutations(), vec!["createCluster prod-us-west1-a", "setManagement prod-us-west1-a/default-pool"]);
    }

    #[tokio::test(start_paused = true)]
    async fn one_failed_create_does_not_stop_siblings() {
        let cloud = Arc::new(FakeCloud::new("my-project"));
        cloud.fail_on("createCluster prod-us-west1-a", Error::Api { code: 403, message: "quota".into() });
        let report = reconciler(&cloud, &["prod-us-west1-a", "prod-us-east1-b", "nozone"]).reconcile(true).await.unwrap();
        assert_eq!(report.clusters.keys().collect::<Vec<_>>(), vec!["prod-us-east1-b"]);
        let mut failed: Vec<&str> = report.failures.iter().map(|f| f.cluster.as_str()).collect();
        failed.sort();
        assert_eq!(failed, vec!["nozone", "prod-us-west1-a"]);
        let nozone = report.failures.iter().find(|f| f.cluster == "nozone").unwrap();
        assert!(matches!(nozone.error, Error::ConfigurationInvalid(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn named_port_is_added_once() {
        let cloud = Arc::new(FakeCloud::new("my-project"));
        let group = ResourceRef::named("instanceGroups", "gke-a").in_zone("us-east1-b");
        cloud.put(&group, json!({"name": "gke-a", "fingerprint": "f1", "namedPorts": [
            {"name": "http", "port": 80}, {"name": "shop-port", "port": 30001}]}));
        let cluster = Cluster {
            name: "prod-us-east1-b".into(),
            zone: "us-east1-b".into(),
            network: String::new(),
            current_node_count: 3,
            instance_groups: vec!["https://x/zones/us-east1-b/instanceGroups/gke-a".into()],
        };
        let waiter = OperationWaiter::new(cloud.clone());
        configure_named_port(cloud.as_ref(), &waiter, &cluster, "shop-port", 31234).await.unwrap();
        let after = cloud.resource(&group).unwrap();
        assert_eq!(after["namedPorts"], json!([{"name": "http", "port": 80}, {"name": "shop-port", "port": 31234}]));

        configure_named_port(cloud.as_ref(), &waiter, &cluster, "shop-port", 31234).await.unwrap();
        assert_eq!(cloud.mutations(), vec!["setNamedPorts us-east1-b/gke-a"]);
    }
}
