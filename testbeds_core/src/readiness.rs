//! Client-side readiness polling.
//!
//! `Unknown -> InfraPending -> InfraReady -> AppHealthy`, or `TimedOut` once the
//! deadline passes. Infrastructure readiness alone never counts as success: the
//! in-sandbox agent must also answer its health probe positively.

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    Unknown,
    InfraPending,
    InfraReady,
    AppHealthy,
    TimedOut,
}

/// What the cluster reports about a sandbox at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfraSnapshot {
    pub pod_phase: String,
    pub testbed_ready: bool,
    pub sidecar_ready: bool,
    pub endpoint_ready: bool,
}

impl InfraSnapshot {
    pub fn is_ready(&self) -> bool {
        self.pod_phase == "Running" && self.testbed_ready && self.sidecar_ready && self.endpoint_ready
    }
}

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// `None` while the sandbox is not visible.
    async fn infra(&self) -> Result<Option<InfraSnapshot>>;
    /// Direct call to the in-sandbox health endpoint.
    async fn app_healthy(&self) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct ReadinessReport {
    pub state: ReadinessState,
    pub polls: u32,
    pub elapsed: Duration,
    /// Distinct states in the order they were observed.
    pub transitions: Vec<ReadinessState>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadinessMonitor {
    pub poll_interval: Duration,
    pub deadline: Duration,
    /// Consecutive "not visible" polls tolerated before giving up with `NotFound`.
    pub max_not_found: u32,
}

impl Default for ReadinessMonitor {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            deadline: Duration::from_secs(600),
            max_not_found: 10,
        }
    }
}

impl ReadinessMonitor {
    pub fn new(poll_interval: Duration, deadline: Duration) -> Self {
        Self {
            poll_interval,
            deadline,
            ..Self::default()
        }
    }

    async fn evaluate(probe: &dyn ReadinessProbe) -> (ReadinessState, Option<InfraSnapshot>) {
        let snapshot = match probe.infra().await {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(error = %e, "infra status unavailable");
                return (ReadinessState::Unknown, None);
            }
        };
        let Some(snapshot) = snapshot else {
            return (ReadinessState::Unknown, None);
        };
        if !snapshot.is_ready() {
            return (ReadinessState::InfraPending, Some(snapshot));
        }
        match probe.app_healthy().await {
            Ok(true) => (ReadinessState::AppHealthy, Some(snapshot)),
            Ok(false) => (ReadinessState::InfraReady, Some(snapshot)),
            Err(e) => {
                tracing::debug!(error = %e, "health probe failed");
                (ReadinessState::InfraReady, Some(snapshot))
            }
        }
    }

    /// Block until the sandbox is healthy. Fails with `Error::Unreachable` at the
    /// deadline and `Error::NotFound` if the sandbox never shows up.
    #[tracing::instrument(level = "info", skip(self, probe))]
    pub async fn wait(&self, probe: &dyn ReadinessProbe, testbed_id: &str) -> Result<ReadinessReport> {
        let started = Instant::now();
        let deadline = started + self.deadline;
        let mut polls = 0u32;
        let mut not_found = 0u32;
        let mut transitions = Vec::new();
        let mut last: Option<(ReadinessState, Option<InfraSnapshot>)> = None;

        loop {
            polls += 1;
            let (state, snapshot) = Self::evaluate(probe).await;

            let current = (state, snapshot);
            if last.as_ref() != Some(&current) {
                let (state, snapshot) = &current;
                match snapshot {
                    Some(s) => tracing::info!(
                        ?state,
                        pod_phase = %s.pod_phase,
                        testbed_ready = s.testbed_ready,
                        sidecar_ready = s.sidecar_ready,
                        endpoint_ready = s.endpoint_ready,
                        "testbed status changed"
                    ),
                    None => tracing::info!(?state, "testbed status changed"),
                }
                if transitions.last() != Some(state) {
                    transitions.push(*state);
                }
                last = Some(current.clone());
            }

            match current {
                (ReadinessState::AppHealthy, _) => {
                    return Ok(ReadinessReport {
                        state: ReadinessState::AppHealthy,
                        polls,
                        elapsed: started.elapsed(),
                        transitions,
                    });
                }
                (ReadinessState::Unknown, None) => {
                    not_found += 1;
                    if not_found > self.max_not_found {
                        return Err(Error::NotFound(format!(
                            "testbed {testbed_id} not found after {not_found} polls"
                        )));
                    }
                }
                _ => not_found = 0,
            }

            if Instant::now() + self.poll_interval > deadline {
                tracing::warn!(polls, "testbed not ready before deadline");
                return Err(Error::Unreachable(format!(
                    "testbed {testbed_id} not ready within {}s",
                    self.deadline.as_secs()
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedProbe {
        /// Polls before infra reports ready.
        infra_after: u32,
        /// Health calls before the agent answers positively; `u32::MAX` never does.
        healthy_after: u32,
        infra_calls: AtomicU32,
        health_calls: AtomicU32,
        visible: bool,
    }

    impl ScriptedProbe {
        fn new(infra_after: u32, healthy_after: u32) -> Self {
            Self {
                infra_after,
                healthy_after,
                infra_calls: AtomicU32::new(0),
                health_calls: AtomicU32::new(0),
                visible: true,
            }
        }
    }

    #[async_trait]
    impl ReadinessProbe for ScriptedProbe {
        async fn infra(&self) -> Result<Option<InfraSnapshot>> {
            if !self.visible {
                return Ok(None);
            }
            let n = self.infra_calls.fetch_add(1, Ordering::SeqCst);
            let ready = n >= self.infra_after;
            Ok(Some(InfraSnapshot {
                pod_phase: if ready { "Running" } else { "Pending" }.to_string(),
                testbed_ready: ready,
                sidecar_ready: ready,
                endpoint_ready: ready,
            }))
        }

        async fn app_healthy(&self) -> Result<bool> {
            let n = self.health_calls.fetch_add(1, Ordering::SeqCst);
            Ok(n >= self.healthy_after)
        }
    }

    fn monitor(deadline_ms: u64) -> ReadinessMonitor {
        ReadinessMonitor {
            poll_interval: Duration::from_millis(2),
            deadline: Duration::from_millis(deadline_ms),
            max_not_found: 3,
        }
    }

    #[tokio::test]
    async fn walks_through_states_in_order() {
        let probe = ScriptedProbe::new(2, 3);
        let report = monitor(5_000).wait(&probe, "tb").await.expect("ready");
        assert_eq!(report.state, ReadinessState::AppHealthy);
        assert_eq!(
            report.transitions,
            vec![
                ReadinessState::InfraPending,
                ReadinessState::InfraReady,
                ReadinessState::AppHealthy
            ]
        );
        // Success only after the fourth health call returned positive.
        assert_eq!(probe.health_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn infra_ready_without_health_times_out() {
        let probe = ScriptedProbe::new(0, u32::MAX);
        let err = monitor(50).wait(&probe, "tb").await.expect_err("never healthy");
        assert!(matches!(err, Error::Unreachable(_)));
        assert!(probe.health_calls.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn invisible_sandbox_is_not_found() {
        let mut probe = ScriptedProbe::new(0, 0);
        probe.visible = false;
        let err = monitor(5_000).wait(&probe, "tb").await.expect_err("missing");
        assert!(matches!(err, Error::NotFound(_)));
    }
}
