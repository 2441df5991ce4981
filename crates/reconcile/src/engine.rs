//! Script-driven reconciliation of load-balancer resources.
//!
//! A script is an ordered list of task groups; each group maps a resource
//! collection (`globalAddresses`, `backendServices`, ...) to a task. Create
//! mode walks the groups in order, fetching each resource and creating it when
//! absent. Delete mode walks them backwards and removes what it finds. A task
//! that names a `returns` field publishes that field of its result under the
//! uppercased group key, for later tasks to reference as `$KEY`.

use std::{path::Path, sync::Arc};

use gkeship_cloud::{CloudApi, OperationWaiter, ResourceRef};
use gkeship_core::{substitute_value, BackendConfig, Error, Result, Variables};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::{debug, error, info, trace, warn};

use crate::{
    certs::{certificate_map, select_certificate, CertificateReader},
    differ::backend_update,
    dns::DnsResolver,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Create,
    Delete,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Create => "create",
            Mode::Delete => "delete",
        }
    }
}

/// Side computations a task may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Invoke {
    /// Warn when `params.host` does not resolve to `params.address`.
    CheckDnsEntry,
    /// Create or update the backend service using `params.healthCheck`.
    ConfigureBackend,
    /// Pick the uploaded certificate covering the backend's hostname.
    SelectCertificate,
}

/// One resolved script step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    #[serde(rename = "type")]
    pub kind: String,
    pub mode: Mode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch: Option<Map<String, Json>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoke: Option<Invoke>,
    pub preserve: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returns: Option<String>,
}

impl Task {
    fn fetch_ref(&self) -> Result<Option<ResourceRef>> {
        self.fetch.as_ref().map(|f| ResourceRef::from_fetch(&self.kind, f)).transpose()
    }
}

/// A named script loaded from a script document.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub name: String,
    groups: Vec<Map<String, Json>>,
}

impl Script {
    /// Select script `name` from a document of named scripts. Every task is
    /// checked up front so an unknown invoke fails before any cloud work.
    pub fn from_document(doc: &Json, name: &str) -> Result<Self> {
        let entries = doc
            .get(name)
            .and_then(|s| s.as_array())
            .ok_or_else(|| Error::config(format!("Unable to locate script: {}", name)))?;
        let mut groups = Vec::with_capacity(entries.len());
        for (ix, entry) in entries.iter().enumerate() {
            let group = entry
                .as_object()
                .ok_or_else(|| Error::config(format!("Script {} step {} is not an object", name, ix)))?;
            for (key, body) in group.iter() {
                if !body.is_object() {
                    return Err(Error::config(format!("Script {} task {} is not an object", name, key)));
                }
                task_from(key, body.clone(), Mode::Create)
                    .map_err(|e| Error::config(format!("Script {} task {}: {}", name, key, e)))?;
            }
            groups.push(group.clone());
        }
        Ok(Self { name: name.to_string(), groups })
    }

    pub fn parse(text: &str, name: &str) -> Result<Self> {
        let doc: Json = serde_json::from_str(text)?;
        Self::from_document(&doc, name)
    }

    pub fn load(path: &Path, name: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Unable to read script file {}: {}", path.display(), e)))?;
        Self::parse(&text, name)
    }

    pub fn len(&self) -> usize { self.groups.iter().map(Map::len).sum() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

fn task_from(key: &str, mut body: Json, mode: Mode) -> Result<Task> {
    if let Some(obj) = body.as_object_mut() {
        obj.insert("type".into(), Json::String(key.to_string()));
        obj.insert("mode".into(), Json::String(mode.as_str().to_string()));
    }
    Ok(serde_json::from_value(body)?)
}

/// A task body ready for substitution, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTask {
    /// Group key; also the state name its `returns` value is published under.
    pub key: String,
    pub body: Json,
}

/// Execution order for `mode`. Delete reverses the groups and strips
/// `create` and `params` from every task.
pub fn plan(script: &Script, mode: Mode) -> Vec<PlannedTask> {
    let groups: Box<dyn Iterator<Item = &Map<String, Json>>> = match mode {
        Mode::Create => Box::new(script.groups.iter()),
        Mode::Delete => Box::new(script.groups.iter().rev()),
    };
    let mut out = Vec::new();
    for group in groups {
        for (key, body) in group.iter() {
            let mut body = body.clone();
            if let Some(obj) = body.as_object_mut() {
                obj.insert("type".into(), Json::String(key.clone()));
                obj.insert("mode".into(), Json::String(mode.as_str().to_string()));
                if mode == Mode::Delete {
                    obj.remove("create");
                    obj.remove("params");
                }
            }
            out.push(PlannedTask { key: key.clone(), body });
        }
    }
    out
}

pub struct ReconciliationEngine {
    api: Arc<dyn CloudApi>,
    waiter: OperationWaiter,
    dns: Arc<dyn DnsResolver>,
    certs: Arc<dyn CertificateReader>,
}

impl ReconciliationEngine {
    pub fn new(api: Arc<dyn CloudApi>, waiter: OperationWaiter, dns: Arc<dyn DnsResolver>, certs: Arc<dyn CertificateReader>) -> Self {
        Self { api, waiter, dns, certs }
    }

    /// Run `script` and return the final variable state.
    pub async fn run(&self, script: &Script, mode: Mode, backend: &mut BackendConfig) -> Result<Variables> {
        info!(script = %script.name, mode = mode.as_str(), tasks = script.len(), "Running script");
        let mut state = backend.seed_variables();
        for planned in plan(script, mode) {
            let resolved = substitute_value(&planned.body, &state)?;
            let task: Task = serde_json::from_value(resolved)?;
            let result = self.exec_task(&task, backend).await?;
            if let (Some(field), Some(found)) = (task.returns.as_deref(), result.as_ref()) {
                if let Some(v) = found.get(field) {
                    trace!(key = %planned.key, field, value = %v, "publishing task result");
                    state.set(&planned.key, v.clone());
                }
            }
        }
        Ok(state)
    }

    async fn get_opt(&self, r: &ResourceRef) -> Result<Option<Json>> {
        match self.api.get(r).await {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => {
                debug!(resource = %r, "not found");
                Ok(None)
            }
            Err(e) => {
                error!(resource = %r, error = %e, "Unable to get resource");
                Err(e)
            }
        }
    }

    /// Execute one resolved task, returning its final resource (if any).
    pub async fn exec_task(&self, task: &Task, backend: &mut BackendConfig) -> Result<Option<Json>> {
        debug!(task = %task.kind, mode = task.mode.as_str(), "starting compute task");
        counter!("reconcile_task_total", 1u64, "type" => task.kind.clone(), "mode" => task.mode.as_str());
        match task.mode {
            Mode::Delete => self.exec_delete(task).await,
            Mode::Create => self.exec_create(task, backend).await,
        }
    }

    async fn exec_delete(&self, task: &Task) -> Result<Option<Json>> {
        if task.preserve {
            return Ok(None);
        }
        let Some(r) = task.fetch_ref()? else { return Ok(None) };
        warn!(kind = %task.kind, name = r.name.as_deref().unwrap_or_default(), "Removing");
        if self.get_opt(&r).await?.is_some() {
            let op = self.api.delete(&r).await?;
            self.waiter.wait(&op).await?;
        }
        Ok(None)
    }

    async fn exec_create(&self, task: &Task, backend: &mut BackendConfig) -> Result<Option<Json>> {
        let target = task.fetch_ref()?;
        let mut result = match &target {
            Some(r) => self.get_opt(r).await?,
            None => None,
        };
        if let Some(which) = task.invoke {
            result = self.invoke(which, backend, task.params.as_ref()).await?;
        }
        if let (true, Some(body)) = (result.is_none(), &task.create) {
            let collection = target.as_ref().map(ResourceRef::scope).unwrap_or_else(|| ResourceRef::collection(&task.kind));
            warn!(kind = %task.kind, "Creating...");
            let op = self.api.insert(&collection, body).await?;
            self.waiter.wait(&op).await?;
            let created = match target {
                Some(r) => r,
                None => {
                    let name = body.get("name").and_then(|n| n.as_str()).unwrap_or_default();
                    ResourceRef { name: Some(name.to_string()), ..collection }
                }
            };
            result = Some(self.api.get(&created).await?);
        }
        trace!(kind = %task.kind, result = ?result, "compute task result");
        Ok(result)
    }

    async fn invoke(&self, which: Invoke, backend: &mut BackendConfig, params: Option<&Json>) -> Result<Option<Json>> {
        let param = |k: &str| params.and_then(|p| p.get(k)).and_then(|v| v.as_str()).map(str::to_string);
        match which {
            Invoke::CheckDnsEntry => {
                self.check_dns_entry(&param("host").unwrap_or_default(), &param("address").unwrap_or_default()).await;
                Ok(None)
            }
            Invoke::ConfigureBackend => {
                backend.health_check = param("healthCheck");
                self.configure_backend(backend).await.map(Some)
            }
            Invoke::SelectCertificate => {
                let map = certificate_map(self.api.as_ref(), self.certs.as_ref()).await?;
                let cert = select_certificate(&map, &backend.hostname)?;
                Ok(Some(serde_json::to_value(cert)?))
            }
        }
    }

    async fn check_dns_entry(&self, host: &str, address: &str) {
        let actual = match self.dns.lookup_v4(host).await {
            Ok(Some(ip)) => ip,
            Ok(None) => "[ENOTFOUND]".to_string(),
            Err(e) => {
                trace!(host, error = %e, "dns lookup error");
                format!("[{}]", e)
            }
        };
        if actual != address {
            warn!(host, address, actual = %actual, "Missing DNS record");
        }
    }

    /// Create the backend service or bring it in line with the desired record.
    pub async fn configure_backend(&self, backend: &BackendConfig) -> Result<Json> {
        let desired = backend.desired_record()?;
        let r = ResourceRef::named("backendServices", &backend.name);
        match self.get_opt(&r).await? {
            None => {
                warn!(backend = %backend.name, "Creating service backend...");
                let op = self.api.insert(&r.scope(), &desired).await?;
                self.waiter.wait(&op).await?;
                self.api.get(&r).await
            }
            Some(existing) => match backend_update(&desired, &existing) {
                None => {
                    debug!(backend = %backend.name, "backend service up to date");
                    Ok(existing)
                }
                Some(update) => {
                    warn!(backend = %backend.name, "Updating service backend...");
                    let op = self.api.update(&r, &update).await?;
                    self.waiter.wait(&op).await?;
                    self.api.get(&r).await
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn script() -> Script {
        Script::from_document(&json!({"lb": [
            {"A": {"fetch": {"a": "x"}, "create": {"name": "x"}, "params": {"p": 1}}},
            {"B": {"fetch": {"b": "y"}, "create": {"name": "y"}}},
            {"C": {"fetch": {"c": "z"}, "create": {"name": "z"}, "returns": "selfLink"}}
        ]}), "lb")
        .unwrap()
    }

    #[test]
    fn create_plan_keeps_order_and_bodies() {
        let p = plan(&script(), Mode::Create);
        assert_eq!(p.iter().map(|t| t.key.as_str()).collect::<Vec<_>>(), vec!["A", "B", "C"]);
        assert_eq!(p[0].body["create"], json!({"name": "x"}));
        assert_eq!(p[0].body["mode"], "create");
        assert_eq!(p[0].body["type"], "A");
    }

    #[test]
    fn delete_plan_reverses_and_strips() {
        let p = plan(&script(), Mode::Delete);
        assert_eq!(p.iter().map(|t| t.key.as_str()).collect::<Vec<_>>(), vec!["C", "B", "A"]);
        for t in p.iter() {
            assert!(t.body.get("create").is_none());
            assert!(t.body.get("params").is_none());
            assert_eq!(t.body["mode"], "delete");
        }
        assert_eq!(p[0].body["returns"], "selfLink");
    }

    #[test]
    fn unknown_script_or_invoke_is_rejected() {
        let doc = json!({"lb": [{"dns": {"invoke": "flushCaches"}}], "other": {"x": 1}});
        assert!(matches!(Script::from_document(&doc, "lb"), Err(Error::ConfigurationInvalid(_))));
        let e = Script::from_document(&doc, "missing").unwrap_err();
        assert_eq!(e.to_string(), "configuration: Unable to locate script: missing");
        assert!(Script::from_document(&doc, "other").is_err());
    }

    #[test]
    fn task_deserializes_invoke_names() {
        let t = task_from("sslCertificates", json!({"invoke": "selectCertificate", "preserve": true, "returns": "selfLink"}), Mode::Create).unwrap();
        assert_eq!(t.invoke, Some(Invoke::SelectCertificate));
        assert!(t.preserve);
        assert_eq!(t.kind, "sslCertificates");
        assert!(t.fetch_ref().unwrap().is_none());
    }
}
