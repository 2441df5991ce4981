//! In-memory [`CloudApi`] used by tests across the workspace.
//!
//! Mutations take effect immediately and return an operation whose status is
//! `DONE` unless a status sequence was scripted for it. Every call is recorded
//! as a short label (`get backendServices/foo`, `createCluster prod-us-east1-b`)
//! and errors can be injected per label.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use gkeship_core::{Error, Result};
use serde_json::{json, Value as Json};

use crate::{CloudApi, Operation, OperationFamily, Page, ResourceRef};

#[derive(Default)]
struct State {
    resources: Vec<(ResourceRef, Json)>,
    clusters: Vec<Json>,
    calls: Vec<String>,
    failures: HashMap<String, Error>,
    statuses: HashMap<String, VecDeque<String>>,
    status_calls: HashMap<String, u32>,
    status_failures: HashMap<String, Error>,
    op_errors: HashMap<String, Json>,
    next_op: u32,
    page_size: usize,
}

pub struct FakeCloud {
    project: String,
    state: Mutex<State>,
}

impl FakeCloud {
    pub fn new(project: &str) -> Self {
        Self { project: project.to_string(), state: Mutex::new(State { page_size: 500, ..Default::default() }) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Seed a resource.
    pub fn put(&self, r: &ResourceRef, body: Json) {
        let mut st = self.lock();
        st.resources.retain(|(k, _)| k != r);
        st.resources.push((r.clone(), body));
    }

    pub fn resource(&self, r: &ResourceRef) -> Option<Json> {
        self.lock().resources.iter().find(|(k, _)| k == r).map(|(_, v)| v.clone())
    }

    /// Seed a cluster as the container API would return it.
    pub fn put_cluster(&self, name: &str, zone: &str, groups: &[&str]) {
        let urls: Vec<String> = groups
            .iter()
            .map(|g| format!("https://www.googleapis.com/compute/v1/projects/{}/zones/{}/instanceGroupManagers/{}", self.project, zone, g))
            .collect();
        self.lock().clusters.push(json!({
            "name": name, "zone": zone, "network": "kube-vpc-net", "currentNodeCount": 3,
            "status": "RUNNING", "instanceGroupUrls": urls,
        }));
    }

    pub fn set_page_size(&self, n: usize) { self.lock().page_size = n.max(1); }

    /// Fail the next call whose label equals `call`.
    pub fn fail_on(&self, call: &str, err: Error) { self.lock().failures.insert(call.to_string(), err); }

    /// Statuses returned by successive polls of `op`.
    pub fn script_status<I, S>(&self, op: &str, seq: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock().statuses.insert(op.to_string(), seq.into_iter().map(Into::into).collect());
    }

    pub fn fail_status(&self, op: &str, err: Error) { self.lock().status_failures.insert(op.to_string(), err); }

    pub fn set_operation_error(&self, op: &str, err: Json) { self.lock().op_errors.insert(op.to_string(), err); }

    pub fn status_calls(&self, op: &str) -> u32 { self.lock().status_calls.get(op).copied().unwrap_or(0) }

    pub fn calls(&self) -> Vec<String> { self.lock().calls.clone() }

    /// Mutating calls only, in order.
    pub fn mutations(&self) -> Vec<String> {
        const READS: &[&str] = &["get ", "list ", "getCluster ", "listClusters ", "status "];
        self.calls().into_iter().filter(|c| !READS.iter().any(|p| c.starts_with(p))).collect()
    }

    fn record(&self, call: String) -> Result<()> {
        let mut st = self.lock();
        st.calls.push(call.clone());
        match st.failures.remove(&call) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn compute_op(&self, target: &ResourceRef) -> Operation {
        let mut st = self.lock();
        st.next_op += 1;
        let name = format!("operation-{}", st.next_op);
        Operation {
            kind: "compute#operation".into(),
            self_link: format!("https://www.googleapis.com/compute/v1/projects/{}/global/operations/{}", self.project, name),
            target_link: Some(self.self_link(target)),
            status: "PENDING".into(),
            zone: target.zone.as_ref().map(|z| format!("https://www.googleapis.com/compute/v1/projects/{}/zones/{}", self.project, z)),
            name,
            ..Default::default()
        }
    }

    fn container_op(&self, zone: &str) -> Operation {
        let mut st = self.lock();
        st.next_op += 1;
        let name = format!("operation-{}", st.next_op);
        Operation {
            self_link: format!("https://container.googleapis.com/v1/projects/{}/zones/{}/operations/{}", self.project, zone, name),
            status: "RUNNING".into(),
            zone: Some(zone.to_string()),
            name,
            ..Default::default()
        }
    }

    fn self_link(&self, r: &ResourceRef) -> String {
        let scope = match (&r.zone, &r.region) {
            (Some(z), _) => format!("zones/{}", z),
            (None, Some(rg)) => format!("regions/{}", rg),
            _ => "global".to_string(),
        };
        format!("https://www.googleapis.com/compute/v1/projects/{}/{}/{}/{}", self.project, scope, r.collection, r.name.as_deref().unwrap_or(""))
    }

    fn cluster_index(st: &State, zone: &str, name: &str) -> Option<usize> {
        st.clusters.iter().position(|c| {
            c["name"].as_str() == Some(name) && (zone == "-" || c["zone"].as_str() == Some(zone))
        })
    }
}

#[async_trait::async_trait]
impl CloudApi for FakeCloud {
    fn project(&self) -> &str { &self.project }

    async fn get(&self, r: &ResourceRef) -> Result<Json> {
        self.record(format!("get {}", r))?;
        self.resource(r).ok_or_else(|| Error::not_found(r.label()))
    }

    async fn list_page(&self, collection: &ResourceRef, page_token: Option<&str>) -> Result<Page> {
        self.record(format!("list {}", collection.collection))?;
        let st = self.lock();
        let all: Vec<Json> = st
            .resources
            .iter()
            .filter(|(k, _)| k.scope() == collection.scope())
            .map(|(_, v)| v.clone())
            .collect();
        let start: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = (start + st.page_size).min(all.len());
        let next_page_token = if end < all.len() { Some(end.to_string()) } else { None };
        Ok(Page { items: all[start.min(end)..end].to_vec(), next_page_token })
    }

    async fn insert(&self, collection: &ResourceRef, body: &Json) -> Result<Operation> {
        let name = body.get("name").and_then(|n| n.as_str()).unwrap_or_default().to_string();
        self.record(format!("insert {}/{}", collection.collection, name))?;
        let target = ResourceRef { name: Some(name), ..collection.scope() };
        if self.resource(&target).is_some() {
            return Err(Error::Api { code: 409, message: format!("The resource '{}' already exists", target) });
        }
        let op = self.compute_op(&target);
        let mut stored = body.clone();
        if let Some(obj) = stored.as_object_mut() {
            obj.insert("selfLink".into(), Json::String(self.self_link(&target)));
        }
        self.put(&target, stored);
        Ok(op)
    }

    async fn update(&self, r: &ResourceRef, body: &Json) -> Result<Operation> {
        self.record(format!("update {}", r))?;
        let prev = self.resource(r).ok_or_else(|| Error::not_found(r.label()))?;
        let mut stored = body.clone();
        if let (Some(obj), Some(link)) = (stored.as_object_mut(), prev.get("selfLink")) {
            obj.entry("selfLink").or_insert_with(|| link.clone());
        }
        self.put(r, stored);
        Ok(self.compute_op(r))
    }

    async fn delete(&self, r: &ResourceRef) -> Result<Operation> {
        self.record(format!("delete {}", r))?;
        let mut st = self.lock();
        let before = st.resources.len();
        st.resources.retain(|(k, _)| k != r);
        if st.resources.len() == before {
            return Err(Error::not_found(r.label()));
        }
        drop(st);
        Ok(self.compute_op(r))
    }

    async fn set_named_ports(&self, zone: &str, group: &str, body: &Json) -> Result<Operation> {
        self.record(format!("setNamedPorts {}/{}", zone, group))?;
        let r = ResourceRef::named("instanceGroups", group).in_zone(zone);
        let mut current = self.resource(&r).ok_or_else(|| Error::not_found(r.label()))?;
        if current.get("fingerprint") != body.get("fingerprint") {
            return Err(Error::Api { code: 412, message: "fingerprint mismatch".into() });
        }
        current["namedPorts"] = body["namedPorts"].clone();
        current["fingerprint"] = Json::String(format!("fp-{}", self.calls().len()));
        self.put(&r, current);
        Ok(self.compute_op(&r))
    }

    async fn operation_status(&self, _family: OperationFamily, op: &Operation) -> Result<Operation> {
        self.record(format!("status {}", op.name))?;
        let mut st = self.lock();
        *st.status_calls.entry(op.name.clone()).or_insert(0) += 1;
        if let Some(err) = st.status_failures.remove(&op.name) {
            return Err(err);
        }
        let status = st.statuses.get_mut(&op.name).and_then(|q| q.pop_front()).unwrap_or_else(|| Operation::DONE.to_string());
        let error = if status == Operation::DONE { st.op_errors.get(&op.name).cloned() } else { None };
        Ok(Operation { status, error, ..op.clone() })
    }

    async fn list_clusters(&self, zone: &str) -> Result<Vec<Json>> {
        self.record(format!("listClusters {}", zone))?;
        let st = self.lock();
        Ok(st.clusters.iter().filter(|c| zone == "-" || c["zone"].as_str() == Some(zone)).cloned().collect())
    }

    async fn get_cluster(&self, zone: &str, name: &str) -> Result<Json> {
        self.record(format!("getCluster {}", name))?;
        let st = self.lock();
        Self::cluster_index(&st, zone, name).map(|i| st.clusters[i].clone()).ok_or_else(|| Error::not_found(format!("cluster {}", name)))
    }

    async fn create_cluster(&self, zone: &str, body: &Json) -> Result<Operation> {
        let cluster = body.get("cluster").unwrap_or(body);
        let name = cluster.get("name").and_then(|n| n.as_str()).unwrap_or_default().to_string();
        self.record(format!("createCluster {}", name))?;
        {
            let mut st = self.lock();
            if Self::cluster_index(&st, "-", &name).is_some() {
                return Err(Error::Api { code: 409, message: format!("cluster {} already exists", name) });
            }
            let mut created = cluster.clone();
            created["zone"] = Json::String(zone.to_string());
            created["currentNodeCount"] = cluster.get("initialNodeCount").cloned().unwrap_or(json!(3));
            created["instanceGroupUrls"] = json!([format!(
                "https://www.googleapis.com/compute/v1/projects/{}/zones/{}/instanceGroupManagers/gke-{}-default-pool",
                self.project, zone, name
            )]);
            st.clusters.push(created);
        }
        Ok(self.container_op(zone))
    }

    async fn set_node_pool_management(&self, zone: &str, cluster: &str, pool: &str, body: &Json) -> Result<Operation> {
        self.record(format!("setManagement {}/{}", cluster, pool))?;
        {
            let mut st = self.lock();
            let i = Self::cluster_index(&st, zone, cluster).ok_or_else(|| Error::not_found(format!("cluster {}", cluster)))?;
            st.clusters[i]["management"] = body.get("management").cloned().unwrap_or(Json::Null);
        }
        Ok(self.container_op(zone))
    }
}
