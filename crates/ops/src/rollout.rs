//! Rollout controller: apply a workload, wait for it to settle, roll back once
//! on failure.
//!
//! The platform's own "rollout complete" signal can arrive before readiness
//! probes have cycled, so stabilization also requires several consecutive
//! clean pod observations.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use gkeship_core::{Error, Result};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::{
    diagnostics::{app_pods, faulty_pods, PodMessages},
    manifests::WorkloadSpec,
    Platform,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RolloutPhase {
    Rolling,
    Stabilizing,
    Stable,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloutPolicy {
    pub poll_interval: Duration,
    /// Consecutive clean observations required for `Stable`.
    pub success_target: u32,
    /// Log a representative pod message every this many faults.
    pub fault_log_every: u32,
}

impl Default for RolloutPolicy {
    fn default() -> Self { Self { poll_interval: Duration::from_secs(10), success_target: 3, fault_log_every: 3 } }
}

/// One `wait_for_rollout` call's state machine.
#[derive(Debug, Clone)]
pub struct RolloutState {
    pub phase: RolloutPhase,
    pub success_count: u32,
    pub fault_count: u32,
    pub observations: u32,
    pub started: Instant,
}

impl RolloutState {
    pub fn new() -> Self {
        Self { phase: RolloutPhase::Rolling, success_count: 0, fault_count: 0, observations: 0, started: Instant::now() }
    }

    /// Fold one pod observation into the state and return the new phase.
    pub fn observe(&mut self, faults: &[PodMessages], policy: &RolloutPolicy) -> RolloutPhase {
        self.observations += 1;
        if faults.is_empty() {
            self.success_count += 1;
            if self.success_count >= policy.success_target {
                trace!(successes = self.success_count, "target success count reached");
                self.phase = RolloutPhase::Stable;
            }
        } else {
            self.success_count = 0;
            self.fault_count += 1;
            trace!(pods = ?faults, "waiting on pods");
            if policy.fault_log_every > 0 && self.fault_count % policy.fault_log_every == 0 {
                let first = &faults[0];
                debug!(pod = %first.pod, msg = %first.messages.first().map(String::as_str).unwrap_or_default(), "waiting on pod");
            }
        }
        self.phase
    }

    pub fn elapsed_secs(&self) -> u64 { self.started.elapsed().as_secs() }
}

impl Default for RolloutState {
    fn default() -> Self { Self::new() }
}

/// Deployment and pod summary for operators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub cluster: String,
    pub replicas: i32,
    pub unavailable: i32,
    pub pods: Vec<PodMessages>,
}

impl StatusReport {
    pub fn messages(&self) -> impl Iterator<Item = &String> { self.pods.iter().flat_map(|p| p.messages.iter()) }
}

pub struct RolloutController {
    platform: Arc<dyn Platform>,
    artifacts: PathBuf,
    policy: RolloutPolicy,
}

impl RolloutController {
    pub fn new(platform: Arc<dyn Platform>, artifacts: &Path) -> Self {
        Self { platform, artifacts: artifacts.to_path_buf(), policy: RolloutPolicy::default() }
    }

    pub fn with_policy(mut self, policy: RolloutPolicy) -> Self { self.policy = policy; self }

    pub fn platform(&self) -> &dyn Platform { self.platform.as_ref() }

    fn write_manifest(&self, file: &str, body: &serde_json::Value) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.artifacts)?;
        let path = self.artifacts.join(file);
        std::fs::write(&path, serde_json::to_string_pretty(body)?)?;
        Ok(path)
    }

    /// Apply service and deployment, then verify the rollout.
    pub async fn deploy(&self, spec: &WorkloadSpec, timeout_ms: i64) -> Result<()> {
        counter!("rollout_total", 1u64, "kind" => "deploy");
        let cluster = self.platform.cluster();
        debug!(cluster, name = %spec.name, image = %spec.image, "preparing deployment");
        let svc = self.write_manifest(&format!("{}-svc.json", spec.name), &spec.service)?;
        let dep = self.write_manifest(&format!("{}-deploy.json", spec.name), &spec.deployment)?;

        info!(cluster, name = %spec.name, "Deploying service");
        self.platform.apply(&svc).await?;
        info!(cluster, name = %spec.name, "Deploying container");
        self.platform.apply(&dep).await?;

        self.verify_or_rollback(&spec.name, timeout_ms).await
    }

    /// Swap the running image, then verify the rollout.
    pub async fn update_image(&self, name: &str, image: &str, timeout_ms: i64) -> Result<()> {
        counter!("rollout_total", 1u64, "kind" => "image");
        info!(cluster = self.platform.cluster(), name, image, "Updating image");
        self.platform.set_image(name, image).await?;
        self.verify_or_rollback(name, timeout_ms).await
    }

    /// Revert to the previous revision and wait for it.
    pub async fn rollback(&self, name: &str, timeout_ms: i64) -> Result<()> {
        counter!("rollout_rollback_total", 1u64);
        self.platform.rollout_undo(name).await?;
        self.wait_for_rollout(name, timeout_ms).await.map(drop)
    }

    async fn verify_or_rollback(&self, name: &str, timeout_ms: i64) -> Result<()> {
        let err = match self.wait_for_rollout(name, timeout_ms).await {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };
        let cluster = self.platform.cluster();
        counter!("rollout_failed_total", 1u64);
        error!(cluster, name, error = %err, "Rolling back due to failed rollout");
        if let Err(e) = self.report_status(name).await {
            warn!(cluster, name, error = %e, "unable to capture rollout diagnostics");
        }
        counter!("rollout_rollback_total", 1u64);
        if let Err(e) = self.platform.rollout_undo(name).await {
            error!(cluster, name, error = %e, "rollback failed");
        }
        Err(err)
    }

    /// Drive `name` from the platform's mechanical rollout to `Stable`.
    ///
    /// `timeout_ms` bounds the whole wait; a non-positive value skips
    /// stabilization and returns after the mechanical wait.
    pub async fn wait_for_rollout(&self, name: &str, timeout_ms: i64) -> Result<RolloutState> {
        let cluster = self.platform.cluster();
        let mut state = RolloutState::new();
        if timeout_ms <= 0 {
            self.platform.rollout_status(name, None).await?;
            debug!(cluster, name, "skipping rollout verify, waitTime <= 0");
            state.phase = RolloutPhase::Stable;
            return Ok(state);
        }

        info!(cluster, name, "Waiting on rollout");
        let started = state.started;
        let deadline = started.checked_add(Duration::from_millis(timeout_ms as u64));
        if deadline.is_none() {
            warn!(cluster, name, timeout_ms, "rollout timeout out of range, waiting without a deadline");
        }
        let expiry = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        let outcome = tokio::select! {
            r = self.stabilize(name, &mut state, deadline) => r,
            _ = expiry => Err(Error::Timeout(format!("Timeout exceeded ({} seconds).", started.elapsed().as_secs()))),
        };
        match outcome {
            Ok(()) => {
                debug!(cluster, name, secs = state.elapsed_secs(), "Rollout successful");
                Ok(state)
            }
            Err(e) => {
                state.phase = RolloutPhase::Failed;
                Err(e)
            }
        }
    }

    async fn stabilize(&self, name: &str, state: &mut RolloutState, deadline: Option<Instant>) -> Result<()> {
        state.phase = RolloutPhase::Rolling;
        let remaining = deadline.map(|at| at.saturating_duration_since(Instant::now()));
        self.platform.rollout_status(name, remaining).await?;
        state.phase = RolloutPhase::Stabilizing;
        debug!(cluster = self.platform.cluster(), name, "Rollout completed, checking pods");
        loop {
            let pods = self.platform.pods().await?;
            if state.observe(&faulty_pods(&pods, name), &self.policy) == RolloutPhase::Stable {
                return Ok(());
            }
            tokio::time::sleep(self.policy.poll_interval).await;
        }
    }

    /// Log and return deployment/pod status.
    pub async fn report_status(&self, name: &str) -> Result<StatusReport> {
        let cluster = self.platform.cluster().to_string();
        let deploy = self.platform.deployment(name).await?;
        let status = deploy.status.unwrap_or_default();
        let replicas = status.replicas.unwrap_or(0);
        let unavailable = status.unavailable_replicas.unwrap_or(0);
        info!(cluster = %cluster, replicas, unavailable, "deployment status");
        let pods = app_pods(&self.platform.pods().await?, name);
        for p in pods.iter() {
            info!(cluster = %cluster, pod = %p.pod, phase = ?p.phase, "pod status");
            for m in p.messages.iter() {
                warn!(cluster = %cluster, pod = %p.pod, "{}", m);
            }
        }
        Ok(StatusReport { cluster, replicas, unavailable, pods })
    }

    /// `(container, image)` pairs of the deployed pod template.
    pub async fn deployed_images(&self, name: &str) -> Result<Vec<(String, String)>> {
        let deploy = self.platform.deployment(name).await?;
        Ok(deploy
            .spec
            .and_then(|s| s.template.spec)
            .map(|s| s.containers.into_iter().map(|c| (c.name, c.image.unwrap_or_default())).collect())
            .unwrap_or_default())
    }

    pub async fn history(&self, name: &str) -> Result<String> { self.platform.rollout_history(name).await }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::{apps::v1::Deployment, core::v1::Pod};
    use serde_json::json;
    use std::{collections::VecDeque, sync::Mutex};

    fn pod(healthy: bool) -> Pod {
        let status = if healthy {
            json!({"phase": "Running"})
        } else {
            json!({"phase": "Pending", "conditions": [{"type": "Ready", "status": "False", "reason": "Unschedulable", "message": "0/3 nodes available"}]})
        };
        serde_json::from_value(json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "shop-abc", "labels": {"app": "shop"}}, "status": status})).unwrap()
    }

    #[derive(Default)]
    struct FakePlatform {
        observations: Mutex<VecDeque<bool>>,
        calls: Mutex<Vec<String>>,
        fail_rollout_status: bool,
        fail_undo: bool,
        rollout_delay: Option<Duration>,
        status_timeouts: Mutex<Vec<Option<Duration>>>,
    }

    impl FakePlatform {
        fn with_observations(seq: &[bool]) -> Self {
            Self { observations: Mutex::new(seq.iter().copied().collect()), ..Default::default() }
        }
        fn calls(&self) -> Vec<String> { self.calls.lock().unwrap().clone() }
        fn count(&self, prefix: &str) -> usize { self.calls().iter().filter(|c| c.starts_with(prefix)).count() }
        fn record(&self, c: String) { self.calls.lock().unwrap().push(c); }
    }

    fn tool_failure(cmd: &str) -> Error { Error::ExternalToolFailure { command: cmd.into(), code: Some(1), stderr: String::new() } }

    #[async_trait::async_trait]
    impl Platform for FakePlatform {
        fn cluster(&self) -> &str { "prod-us-east1-b" }
        async fn apply(&self, manifest: &Path) -> Result<()> {
            self.record(format!("apply {}", manifest.file_name().unwrap().to_string_lossy()));
            Ok(())
        }
        async fn set_image(&self, d: &str, image: &str) -> Result<()> { self.record(format!("set_image {} {}", d, image)); Ok(()) }
        async fn deployment(&self, name: &str) -> Result<Deployment> {
            self.record(format!("deployment {}", name));
            Ok(serde_json::from_value(json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": name},
                "spec": {"selector": {}, "template": {"spec": {"containers": [{"name": name, "image": "us.gcr.io/p/shop:v2"}]}}},
                "status": {"replicas": 2, "unavailableReplicas": 1}})).unwrap())
        }
        async fn pods(&self) -> Result<Vec<Pod>> {
            self.record("pods".into());
            let healthy = self.observations.lock().unwrap().pop_front().unwrap_or(true);
            Ok(vec![pod(healthy)])
        }
        async fn rollout_status(&self, d: &str, timeout: Option<Duration>) -> Result<()> {
            self.record(format!("rollout_status {}", d));
            self.status_timeouts.lock().unwrap().push(timeout);
            if let Some(delay) = self.rollout_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_rollout_status { Err(tool_failure("kubectl rollout status")) } else { Ok(()) }
        }
        async fn rollout_undo(&self, d: &str) -> Result<()> {
            self.record(format!("rollout_undo {}", d));
            if self.fail_undo { Err(tool_failure("kubectl rollout undo")) } else { Ok(()) }
        }
        async fn rollout_history(&self, _d: &str) -> Result<String> { Ok("REVISION 1\nREVISION 2".into()) }
        async fn secret_exists(&self, _n: &str) -> Result<bool> { Ok(true) }
        async fn create_secret_from_files(&self, _n: &str, _f: &[PathBuf]) -> Result<()> { Ok(()) }
        async fn delete_service(&self, _n: &str) -> Result<()> { Ok(()) }
        async fn delete_deployment(&self, _n: &str) -> Result<()> { Ok(()) }
    }

    fn controller(p: Arc<FakePlatform>) -> RolloutController {
        RolloutController::new(p, &std::env::temp_dir())
    }

    #[tokio::test(start_paused = true)]
    async fn stabilizes_only_after_three_consecutive_clean_polls() {
        let p = Arc::new(FakePlatform::with_observations(&[true, true, false, true, true, true]));
        let state = controller(p.clone()).wait_for_rollout("shop", 600_000).await.unwrap();
        assert_eq!(state.phase, RolloutPhase::Stable);
        assert_eq!(state.observations, 6);
        assert_eq!(state.fault_count, 1);
        assert_eq!(p.count("pods"), 6);
        assert_eq!(state.started.elapsed(), Duration::from_secs(50));
    }

    #[test]
    fn fault_resets_success_count() {
        let policy = RolloutPolicy::default();
        let mut s = RolloutState::new();
        let fault = vec![PodMessages { pod: "p".into(), phase: None, messages: vec!["m".into()] }];
        assert_eq!(s.observe(&[], &policy), RolloutPhase::Rolling);
        assert_eq!(s.observe(&[], &policy), RolloutPhase::Rolling);
        s.observe(&fault, &policy);
        assert_eq!((s.success_count, s.fault_count), (0, 1));
        s.observe(&[], &policy);
        s.observe(&[], &policy);
        assert_eq!(s.observe(&[], &policy), RolloutPhase::Stable);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_bounds_the_whole_wait() {
        let p = Arc::new(FakePlatform::with_observations(&[false; 100]));
        let err = controller(p.clone()).wait_for_rollout("shop", 35_000).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(ref m) if m.contains("35 seconds")), "{}", err);
        // polls at 0s, 10s, 20s, 30s; none after the deadline
        assert_eq!(p.count("pods"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_covers_mechanical_wait() {
        let p = Arc::new(FakePlatform { rollout_delay: Some(Duration::from_secs(120)), ..Default::default() });
        let err = controller(p.clone()).wait_for_rollout("shop", 60_000).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(p.count("pods"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn non_positive_timeout_skips_verification() {
        let p = Arc::new(FakePlatform::with_observations(&[false]));
        let state = controller(p.clone()).wait_for_rollout("shop", 0).await.unwrap();
        assert_eq!(state.phase, RolloutPhase::Stable);
        assert_eq!(p.calls(), vec!["rollout_status shop"]);
        assert_eq!(*p.status_timeouts.lock().unwrap(), vec![None]);
    }

    #[tokio::test(start_paused = true)]
    async fn mechanical_wait_is_bounded_by_the_deadline() {
        let p = Arc::new(FakePlatform::with_observations(&[true, true, true]));
        controller(p.clone()).wait_for_rollout("shop", 35_000).await.unwrap();
        assert_eq!(*p.status_timeouts.lock().unwrap(), vec![Some(Duration::from_secs(35))]);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_timeout_does_not_overflow() {
        let p = Arc::new(FakePlatform::with_observations(&[true, true, true]));
        let state = controller(p.clone()).wait_for_rollout("shop", i64::MAX).await.unwrap();
        assert_eq!(state.phase, RolloutPhase::Stable);
        assert_eq!(p.count("pods"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_update_rolls_back_once_and_returns_original_error() {
        let p = Arc::new(FakePlatform { fail_rollout_status: true, fail_undo: true, ..Default::default() });
        let err = controller(p.clone()).update_image("shop", "us.gcr.io/p/shop:v3", 60_000).await.unwrap_err();
        assert!(matches!(err, Error::ExternalToolFailure { ref command, .. } if command == "kubectl rollout status"), "{}", err);
        assert_eq!(p.count("rollout_undo"), 1);
        assert_eq!(p.count("deployment shop"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deploy_writes_and_applies_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let p = Arc::new(FakePlatform::with_observations(&[true, true, true]));
        let spec = WorkloadSpec { name: "shop".into(), image: "img".into(), service: json!({"kind": "Service"}), deployment: json!({"kind": "Deployment"}) };
        RolloutController::new(p.clone(), dir.path()).deploy(&spec, 600_000).await.unwrap();
        assert!(dir.path().join("shop-svc.json").exists());
        assert!(dir.path().join("shop-deploy.json").exists());
        assert_eq!(&p.calls()[..3], &["apply shop-svc.json", "apply shop-deploy.json", "rollout_status shop"]);
        assert_eq!(p.count("rollout_undo"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_deploy_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let p = Arc::new(FakePlatform::with_observations(&[false; 100]));
        let spec = WorkloadSpec { name: "shop".into(), image: "img".into(), service: json!({}), deployment: json!({}) };
        let err = RolloutController::new(p.clone(), dir.path()).deploy(&spec, 25_000).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(p.count("rollout_undo"), 1);
    }

    #[tokio::test]
    async fn report_and_images_read_deployment() {
        let p = Arc::new(FakePlatform::with_observations(&[false]));
        let c = controller(p.clone());
        let r = c.report_status("shop").await.unwrap();
        assert_eq!((r.replicas, r.unavailable), (2, 1));
        assert_eq!(r.messages().count(), 1);
        assert_eq!(c.deployed_images("shop").await.unwrap(), vec![("shop".to_string(), "us.gcr.io/p/shop:v2".to_string())]);
    }
}
