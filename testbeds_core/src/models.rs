use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// One SWE-bench evaluation unit. Loaded once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub instance_id: String,
    /// `owner/name`, e.g. `django/django`.
    pub repo: String,
    pub base_commit: String,
    /// Canonical ("gold") patch.
    #[serde(default)]
    pub patch: String,
    #[serde(default)]
    pub test_patch: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub environment_setup_commit: Option<String>,
    #[serde(default)]
    pub problem_statement: Option<String>,
    #[serde(
        rename = "FAIL_TO_PASS",
        alias = "fail_to_pass",
        default,
        deserialize_with = "string_or_list"
    )]
    pub fail_to_pass: Vec<String>,
    #[serde(
        rename = "PASS_TO_PASS",
        alias = "pass_to_pass",
        default,
        deserialize_with = "string_or_list"
    )]
    pub pass_to_pass: Vec<String>,
}

/// SWE-bench dumps ship the test-id sets either as JSON lists or as JSON-encoded strings.
fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Encoded(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::List(v) => Ok(v),
        Raw::Encoded(s) if s.trim().is_empty() => Ok(Vec::new()),
        Raw::Encoded(s) => serde_json::from_str(&s).map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestStatus {
    Passed,
    Failed,
    Error,
    Skipped,
}

impl TestStatus {
    pub const ALL: [TestStatus; 4] = [Self::Passed, Self::Failed, Self::Error, Self::Skipped];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed test outcome. Only log parsers construct these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub status: TestStatus,
    pub name: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub failure_output: Option<String>,
}

impl TestResult {
    pub fn new(status: TestStatus, name: impl Into<String>) -> Self {
        Self {
            status,
            name: name.into(),
            file_path: None,
            method: None,
            failure_output: None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Waiting,
    Terminated,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub ready: bool,
    pub started: bool,
    pub restart_count: u32,
    pub state: ContainerState,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ContainerStatus {
    pub fn unknown() -> Self {
        Self {
            ready: false,
            started: false,
            restart_count: 0,
            state: ContainerState::Unknown,
            reason: None,
            message: None,
        }
    }
}

/// Ranked composite status of a sandbox. Ordering follows readiness.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestbedState {
    NotFound,
    Pending,
    RunningUnverified,
    RunningHealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestbedStatusSummary {
    pub pod_phase: String,
    pub testbed_ready: bool,
    pub sidecar_ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestbedStatusDetailed {
    pub pod_phase: String,
    pub testbed: ContainerStatus,
    pub sidecar: ContainerStatus,
}

impl TestbedStatusDetailed {
    pub fn summary(&self) -> TestbedStatusSummary {
        TestbedStatusSummary {
            pod_phase: self.pod_phase.clone(),
            testbed_ready: self.testbed.ready,
            sidecar_ready: self.sidecar.ready,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestbedSummary {
    pub testbed_id: String,
    pub instance_id: String,
    pub status: TestbedStatusSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestbedDetailed {
    pub testbed_id: String,
    pub instance_id: String,
    pub status: TestbedStatusDetailed,
    #[serde(default)]
    pub external_ip: Option<String>,
    pub state: TestbedState,
}

impl TestbedDetailed {
    pub fn summary(&self) -> TestbedSummary {
        TestbedSummary {
            testbed_id: self.testbed_id.clone(),
            instance_id: self.instance_id.clone(),
            status: self.status.summary(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResolvedStatus {
    Full,
    Partial,
    None,
}

/// Names that made the expected transition (`success`) and those that did not (`failure`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub success: Vec<String>,
    pub failure: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestsStatus {
    #[serde(rename = "FAIL_TO_PASS")]
    pub fail_to_pass: TransitionOutcome,
    #[serde(rename = "PASS_TO_PASS")]
    pub pass_to_pass: TransitionOutcome,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationOutcome {
    Graded,
    PatchFailed,
    TimedOut,
}

/// Terminal result of one evaluation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub run_id: String,
    pub instance_id: String,
    pub outcome: EvaluationOutcome,
    pub patch_applied: bool,
    pub resolved: bool,
    pub resolution: ResolvedStatus,
    /// No start-of-tests marker was found in the output.
    pub tests_not_found: bool,
    pub tests_status: TestsStatus,
    pub test_results: Vec<TestResult>,
    pub output: String,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestRunOutcome {
    Completed,
    PatchFailed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunResponse {
    pub outcome: TestRunOutcome,
    pub test_results: Vec<TestResult>,
    pub output: String,
}

/// Outcome of applying a patch to a testbed's checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchApplication {
    pub applied: bool,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitDiff {
    pub diff: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_instance_accepts_encoded_test_lists() {
        let raw = serde_json::json!({
            "instance_id": "django__django-11099",
            "repo": "django/django",
            "base_commit": "abc123",
            "version": "3.0",
            "FAIL_TO_PASS": "[\"test_a (x.Y)\", \"test_b (x.Y)\"]",
            "PASS_TO_PASS": ["test_c (x.Y)"]
        });
        let inst: TaskInstance = serde_json::from_value(raw).expect("decode");
        assert_eq!(inst.fail_to_pass, vec!["test_a (x.Y)", "test_b (x.Y)"]);
        assert_eq!(inst.pass_to_pass, vec!["test_c (x.Y)"]);
        assert!(inst.patch.is_empty());
    }

    #[test]
    fn testbed_state_is_ranked() {
        assert!(TestbedState::NotFound < TestbedState::Pending);
        assert!(TestbedState::Pending < TestbedState::RunningUnverified);
        assert!(TestbedState::RunningUnverified < TestbedState::RunningHealthy);
    }

    #[test]
    fn tests_status_uses_swebench_keys() {
        let v = serde_json::to_value(TestsStatus::default()).expect("encode");
        assert!(v.get("FAIL_TO_PASS").is_some());
        assert!(v.get("PASS_TO_PASS").is_some());
    }
}
