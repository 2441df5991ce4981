//! VPC network bootstrap.

use gkeship_cloud::{CloudApi, OperationWaiter, ResourceRef};
use gkeship_core::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tracing::{trace, warn};

/// Source ranges allowed to reach node ports: the VPC plus the load balancer
/// and health-check ranges.
const INGRESS_SOURCES: &[&str] = &["10.0.0.0/8", "130.211.0.0/22", "35.191.0.0/16"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRef {
    pub name: String,
    pub self_link: String,
}

impl NetworkRef {
    fn from_api(v: &Json) -> Self {
        Self {
            name: v["name"].as_str().unwrap_or_default().to_string(),
            self_link: v["selfLink"].as_str().unwrap_or_default().to_string(),
        }
    }
}

async fn fetch(api: &dyn CloudApi, name: &str) -> Result<Option<Json>> {
    match api.get(&ResourceRef::named("networks", name)).await {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Fetch network `name`, creating it and its node-port ingress firewall when
/// absent and `create` is set. `None` only when absent and not created.
pub async fn ensure_network(api: &dyn CloudApi, waiter: &OperationWaiter, name: &str, create: bool) -> Result<Option<NetworkRef>> {
    if let Some(net) = fetch(api, name).await? {
        return Ok(Some(NetworkRef::from_api(&net)));
    }
    if !create {
        return Ok(None);
    }

    let body = json!({"name": name, "description": "Kubernetes VPC network", "autoCreateSubnetworks": true});
    trace!(config = %body, "network config");
    warn!(network = name, "Creating network...");
    let op = api.insert(&ResourceRef::collection("networks"), &body).await?;
    waiter.wait(&op).await?;
    let net = NetworkRef::from_api(&api.get(&ResourceRef::named("networks", name)).await?);

    let fw_name = format!("{}-ingress", net.name);
    let fw = json!({
        "name": fw_name,
        "description": "Kubernetes VPC firewall rules",
        "network": net.self_link,
        "sourceRanges": INGRESS_SOURCES,
        "sourceTags": [],
        "targetTags": ["kube"],
        "allowed": [{"IPProtocol": "tcp", "ports": ["30000-32767"]}],
    });
    trace!(config = %fw, "firewall config");
    warn!(firewall = %fw_name, "Creating firewall...");
    let op = api.insert(&ResourceRef::collection("firewalls"), &fw).await?;
    waiter.wait(&op).await?;
    Ok(Some(net))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gkeship_cloud::fake::FakeCloud;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn creates_network_then_firewall() {
        let cloud = Arc::new(FakeCloud::new("my-project"));
        let waiter = OperationWaiter::new(cloud.clone());
        let net = ensure_network(cloud.as_ref(), &waiter, "kube-vpc-net", true).await.unwrap().unwrap();
        assert_eq!(net.name, "kube-vpc-net");
        assert!(net.self_link.ends_with("/global/networks/kube-vpc-net"));
        assert_eq!(cloud.mutations(), vec!["insert networks/kube-vpc-net", "insert firewalls/kube-vpc-net-ingress"]);
        let fw = cloud.resource(&ResourceRef::named("firewalls", "kube-vpc-net-ingress")).unwrap();
        assert_eq!(fw["network"], net.self_link.as_str());
        assert_eq!(fw["allowed"][0]["ports"][0], "30000-32767");
    }

    #[tokio::test(start_paused = true)]
    async fn existing_network_is_left_alone() {
        let cloud = Arc::new(FakeCloud::new("my-project"));
        cloud.put(&ResourceRef::named("networks", "kube-vpc-net"), json!({"name": "kube-vpc-net", "selfLink": "link"}));
        let waiter = OperationWaiter::new(cloud.clone());
        let net = ensure_network(cloud.as_ref(), &waiter, "kube-vpc-net", true).await.unwrap();
        assert_eq!(net.map(|n| n.self_link), Some("link".to_string()));
        assert!(cloud.mutations().is_empty());
        assert!(ensure_network(cloud.as_ref(), &waiter, "other", false).await.unwrap().is_none());
    }
}
