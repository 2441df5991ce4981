//! Pod diagnostics: actionable status messages from typed pod status.

use k8s_openapi::api::core::v1::{ContainerState, ContainerStatus, Pod};
use serde::{Deserialize, Serialize};

/// Messages found on one pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodMessages {
    pub pod: String,
    pub phase: Option<String>,
    pub messages: Vec<String>,
}

fn push_message(reason: Option<&String>, message: Option<&String>, out: &mut Vec<String>) {
    if let Some(m) = message.filter(|m| !m.is_empty()) {
        match reason.filter(|r| !r.is_empty()) {
            Some(r) => out.push(format!("{}: {}", r, m)),
            None => out.push(m.clone()),
        }
    }
}

fn state_messages(state: Option<&ContainerState>, out: &mut Vec<String>) {
    let Some(s) = state else { return };
    if let Some(t) = &s.terminated {
        push_message(t.reason.as_ref(), t.message.as_ref(), out);
    }
    if let Some(w) = &s.waiting {
        push_message(w.reason.as_ref(), w.message.as_ref(), out);
    }
}

fn container_messages(statuses: Option<&Vec<ContainerStatus>>, out: &mut Vec<String>) {
    for cs in statuses.into_iter().flatten() {
        state_messages(cs.last_state.as_ref(), out);
        state_messages(cs.state.as_ref(), out);
    }
}

/// Every message on a pod's status: the pod's own message first, then the
/// nested ones in the key order of kubectl's JSON output (conditions,
/// containerStatuses, ephemeralContainerStatuses, initContainerStatuses;
/// lastState before state; terminated before waiting).
pub fn pod_messages(pod: &Pod) -> Vec<String> {
    let mut out = Vec::new();
    let Some(status) = pod.status.as_ref() else { return out };
    push_message(status.reason.as_ref(), status.message.as_ref(), &mut out);
    for c in status.conditions.iter().flatten() {
        push_message(c.reason.as_ref(), c.message.as_ref(), &mut out);
    }
    container_messages(status.container_statuses.as_ref(), &mut out);
    container_messages(status.ephemeral_container_statuses.as_ref(), &mut out);
    container_messages(status.init_container_statuses.as_ref(), &mut out);
    out
}

fn is_app(pod: &Pod, app: &str) -> bool {
    pod.metadata.labels.as_ref().and_then(|l| l.get("app")).map(|v| v == app).unwrap_or(false)
}

/// Per-pod messages for every pod labelled `app=<app>`.
pub fn app_pods(pods: &[Pod], app: &str) -> Vec<PodMessages> {
    pods.iter()
        .filter(|p| is_app(p, app))
        .map(|p| PodMessages {
            pod: p.metadata.name.clone().unwrap_or_default(),
            phase: p.status.as_ref().and_then(|s| s.phase.clone()),
            messages: pod_messages(p),
        })
        .collect()
}

/// Only the pods that currently report something.
pub fn faulty_pods(pods: &[Pod], app: &str) -> Vec<PodMessages> {
    app_pods(pods, app).into_iter().filter(|p| !p.messages.is_empty()).collect()
}
