//! Long-running operation waiter.

use std::{sync::Arc, time::Duration};

use gkeship_core::{Error, Result, Variables};
use metrics::{counter, histogram};
use tracing::{debug, info, trace};

use crate::{CloudApi, Operation};

/// Poll cadence and iteration cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub interval: Duration,
    /// Status calls allowed before giving up with `Timeout`.
    pub max_polls: u32,
    /// Emit a progress line every this many polls.
    pub progress_every: u32,
}

impl Default for WaitPolicy {
    fn default() -> Self { Self { interval: Duration::from_secs(1), max_polls: 900, progress_every: 30 } }
}

impl WaitPolicy {
    /// Defaults overridable through `GKESHIP_OP_POLL_MS` and `GKESHIP_OP_MAX_POLLS`.
    pub fn from_vars(vars: &Variables) -> Self {
        let mut p = Self::default();
        if let Some(ms) = vars.parse::<u64>("GKESHIP_OP_POLL_MS") {
            p.interval = Duration::from_millis(ms);
        }
        if let Some(n) = vars.parse::<u32>("GKESHIP_OP_MAX_POLLS").filter(|n| *n > 0) {
            p.max_polls = n;
        }
        p
    }
}

/// Suspends the caller until a cloud operation reaches a terminal state.
#[derive(Clone)]
pub struct OperationWaiter {
    api: Arc<dyn CloudApi>,
    policy: WaitPolicy,
}

impl OperationWaiter {
    pub fn new(api: Arc<dyn CloudApi>) -> Self { Self { api, policy: WaitPolicy::default() } }

    pub fn with_policy(mut self, policy: WaitPolicy) -> Self { self.policy = policy; self }

    pub fn policy(&self) -> WaitPolicy { self.policy }

    /// Poll `op` until DONE. Transport errors from the status call propagate
    /// without retry; a DONE operation carrying an error is `OperationFailed`.
    pub async fn wait(&self, op: &Operation) -> Result<()> {
        if op.name.is_empty() && op.self_link.is_empty() {
            trace!("no operation to wait for");
            return Ok(());
        }
        let family = op.family()?;
        let started = tokio::time::Instant::now();
        counter!("operation_wait_total", 1u64);
        debug!(operation = %op.name, ?family, target = ?op.target_link, "begin async wait");

        let mut polls = 0u32;
        loop {
            tokio::time::sleep(self.policy.interval).await;
            let status = self.api.operation_status(family, op).await?;
            polls += 1;
            if !status.is_pending() {
                histogram!("operation_wait_ms", started.elapsed().as_secs_f64() * 1000.0);
                debug!(operation = %op.name, status = %status.status, polls, "completed async wait");
                return match (status.status.as_str(), &status.error) {
                    (Operation::DONE, None) => Ok(()),
                    (s, Some(err)) => Err(Error::OperationFailed { operation: op.name.clone(), status: format!("{} {}", s, err) }),
                    (s, None) => Err(Error::OperationFailed { operation: op.name.clone(), status: s.to_string() }),
                };
            }
            if polls >= self.policy.max_polls {
                counter!("operation_wait_timeout_total", 1u64);
                return Err(Error::Timeout(format!("Timeout exceeded waiting for async operation {}.", op.name)));
            }
            if self.policy.progress_every > 0 && polls % self.policy.progress_every == 0 {
                info!(operation = %op.name, polls, "waiting for async operation");
            }
        }
    }
}
