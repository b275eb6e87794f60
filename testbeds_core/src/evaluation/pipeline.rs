use crate::dataset::IgnoredTests;
use crate::models::{
    EvaluationOutcome, EvaluationResult, PatchApplication, TaskInstance, TestResult,
    TestRunOutcome, TestRunResponse,
};
use crate::protocol::client::TestbedClient;
use crate::swebench::grading::{GradeReport, grade, slice_test_output};
use crate::swebench::{ParserRegistry, TestOutputParser, TestSpec};
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Bound on the test execution itself.
    pub exec_timeout: Duration,
    /// Bound on the short reset, patch and diff commands.
    pub command_timeout: Duration,
    /// Directory both sandbox containers see; patches are staged here.
    pub shared_dir: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            exec_timeout: Duration::from_secs(1800),
            command_timeout: Duration::from_secs(300),
            shared_dir: "/shared".to_string(),
        }
    }
}

/// Drives one task instance through reset, patch, test and grade on a testbed.
pub struct EvaluationPipeline {
    client: TestbedClient,
    instance: TaskInstance,
    spec: TestSpec,
    parser: Arc<dyn TestOutputParser>,
    ignored: Arc<IgnoredTests>,
    config: PipelineConfig,
}

impl EvaluationPipeline {
    pub fn new(
        client: TestbedClient,
        instance: TaskInstance,
        parsers: &ParserRegistry,
        ignored: Arc<IgnoredTests>,
        config: PipelineConfig,
    ) -> Self {
        let spec = TestSpec::new(&instance);
        let parser = parsers.for_repo(&instance.repo);
        Self {
            client,
            instance,
            spec,
            parser,
            ignored,
            config,
        }
    }

    pub fn test_spec(&self) -> &TestSpec {
        &self.spec
    }

    /// Full evaluation of `patch`, or of the task's gold patch when none is given.
    ///
    /// A patch that does not apply, or a test run that times out, is reported in
    /// the result's `outcome`; only infrastructure failures are errors.
    #[tracing::instrument(
        level = "info",
        skip(self, patch),
        fields(testbed_id = %self.client.testbed_id(), instance_id = %self.instance.instance_id)
    )]
    pub async fn run_evaluation(&self, run_id: &str, patch: Option<&str>) -> Result<EvaluationResult> {
        let patch = match patch.filter(|p| !p.trim().is_empty()) {
            Some(p) => p,
            None => {
                tracing::info!("no patch given, evaluating gold patch");
                self.instance.patch.as_str()
            }
        };
        if patch.trim().is_empty() {
            return Err(Error::InvalidInput(format!(
                "instance {} has no patch to evaluate",
                self.instance.instance_id
            )));
        }

        self.reset().await?;

        let attempt = self.apply_patch(run_id, patch).await?;
        if !attempt.applied {
            return Ok(self.result(
                run_id,
                EvaluationOutcome::PatchFailed,
                false,
                Vec::new(),
                self.ungraded(),
                attempt.output,
            ));
        }

        let diff_before = self.git_diff().await;

        tracing::info!(stage = "tests", "running evaluation script");
        let output = match self
            .client
            .run_to_completion(self.spec.eval_script_list.clone(), self.config.exec_timeout)
            .await
        {
            Ok(status) => status.output,
            Err(Error::Timeout(detail)) => {
                tracing::warn!(%detail, "evaluation timed out");
                let output = self.partial_output().await;
                return Ok(self.result(
                    run_id,
                    EvaluationOutcome::TimedOut,
                    true,
                    Vec::new(),
                    self.ungraded(),
                    output,
                ));
            }
            Err(e) => return Err(e),
        };

        let diff_after = self.git_diff().await;
        if let (Some(before), Some(after)) = (&diff_before, &diff_after) {
            if before != after {
                tracing::info!("git diff changed after running the evaluation script");
            }
        }

        let (test_results, tests_found) = self.parse(&output);
        let report = grade(
            &self.spec.fail_to_pass,
            &self.spec.pass_to_pass,
            &test_results,
            tests_found,
        );
        tracing::info!(
            resolution = ?report.resolution,
            tests = test_results.len(),
            tests_not_found = report.tests_not_found,
            "evaluation graded"
        );
        Ok(self.result(
            run_id,
            EvaluationOutcome::Graded,
            true,
            test_results,
            report,
            output,
        ))
    }

    /// Run `test_files` (or the test patch's targets) after an optional patch.
    #[tracing::instrument(
        level = "info",
        skip(self, test_files, patch),
        fields(testbed_id = %self.client.testbed_id(), files = test_files.len())
    )]
    pub async fn run_tests(&self, test_files: &[String], patch: Option<&str>) -> Result<TestRunResponse> {
        self.reset().await?;

        if let Some(patch) = patch.filter(|p| !p.trim().is_empty()) {
            let run_id = uuid::Uuid::new_v4().to_string();
            let attempt = self.apply_patch(&run_id, patch).await?;
            if !attempt.applied {
                return Ok(TestRunResponse {
                    outcome: TestRunOutcome::PatchFailed,
                    test_results: Vec::new(),
                    output: attempt.output,
                });
            }
        }

        let commands = self.spec.run_tests_commands(test_files);
        match self
            .client
            .run_to_completion(commands, self.config.exec_timeout)
            .await
        {
            Ok(status) => {
                let (test_results, _) = self.parse(&status.output);
                Ok(TestRunResponse {
                    outcome: TestRunOutcome::Completed,
                    test_results,
                    output: status.output,
                })
            }
            Err(Error::Timeout(detail)) => {
                tracing::warn!(%detail, "test run timed out");
                Ok(TestRunResponse {
                    outcome: TestRunOutcome::TimedOut,
                    test_results: Vec::new(),
                    output: self.partial_output().await,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Check the test patch's files back out at the base commit.
    async fn reset(&self) -> Result<()> {
        tracing::info!(stage = "reset", files = self.spec.test_files.len(), "resetting test files");
        let status = self
            .client
            .run_to_completion(self.spec.reset_commands.clone(), self.config.command_timeout)
            .await?;
        if status.exit_code != Some(0) {
            tracing::warn!(exit_code = ?status.exit_code, output = %status.output, "reset exited non-zero");
        }
        Ok(())
    }

    async fn apply_patch(&self, run_id: &str, patch: &str) -> Result<PatchApplication> {
        let path = format!(
            "{}/{}/patch.diff",
            self.config.shared_dir.trim_end_matches('/'),
            run_id
        );
        let attempt = self
            .client
            .apply_patch(patch, &path, self.config.command_timeout)
            .await?;
        if attempt.applied {
            tracing::info!(stage = "patch", %path, "patch applied");
        } else {
            tracing::error!(stage = "patch", %path, output = %attempt.output, "patch failed to apply");
        }
        Ok(attempt)
    }

    /// Diagnostic snapshot only; failures are logged and yield `None`.
    async fn git_diff(&self) -> Option<String> {
        match self.client.get_diff(self.config.command_timeout).await {
            Ok(diff) => Some(diff),
            Err(e) => {
                tracing::warn!(error = %e, "failed to capture git diff");
                None
            }
        }
    }

    async fn partial_output(&self) -> String {
        match self.client.status(None).await {
            Ok(status) => status.output,
            Err(e) => {
                tracing::warn!(error = %e, "could not fetch output of timed out execution");
                String::new()
            }
        }
    }

    /// Parse the marked test section and drop ignored tests. The flag is false
    /// when the start marker never appeared.
    fn parse(&self, output: &str) -> (Vec<TestResult>, bool) {
        let Some(section) = slice_test_output(output) else {
            tracing::warn!("no test output marker found");
            return (Vec::new(), false);
        };
        let mut results = self.parser.parse(section);
        let parsed = results.len();
        let ignored = self.ignored.filter(&self.instance.instance_id, &mut results);
        if ignored > 0 {
            tracing::info!(parser = self.parser.name(), parsed, ignored, "ignored known flaky tests");
        } else {
            tracing::info!(parser = self.parser.name(), parsed, "parsed test output");
        }
        (results, true)
    }

    fn ungraded(&self) -> GradeReport {
        grade(&self.spec.fail_to_pass, &self.spec.pass_to_pass, &[], false)
    }

    fn result(
        &self,
        run_id: &str,
        outcome: EvaluationOutcome,
        patch_applied: bool,
        test_results: Vec<TestResult>,
        report: GradeReport,
        output: String,
    ) -> EvaluationResult {
        EvaluationResult {
            run_id: run_id.to_string(),
            instance_id: self.instance.instance_id.clone(),
            outcome,
            patch_applied,
            resolved: report.resolved,
            resolution: report.resolution,
            tests_not_found: report.tests_not_found,
            tests_status: report.tests_status,
            test_results,
            output,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::service::ExecutionService;
    use crate::exec::service::tests::ScriptedChannel;
    use crate::models::{ResolvedStatus, TestStatus};
    use crate::protocol::transport::LocalTransport;
    use crate::swebench::constants::START_TEST_OUTPUT;

    const TEST_OUTPUT: &str = "\
+ pytest -rA tests/test_api.py
>>>>> Start Test Output
=========================== short test summary info ============================
PASSED tests/test_api.py::test_fix
PASSED tests/test_api.py::test_ok
FAILED tests/test_api.py::test_flaky - ConnectionError
>>>>> End Test Output
";

    fn instance() -> TaskInstance {
        TaskInstance {
            instance_id: "psf__requests-2317".into(),
            repo: "psf/requests".into(),
            base_commit: "abc123".into(),
            patch: "diff --git a/requests/sessions.py b/requests/sessions.py\n--- a/requests/sessions.py\n+++ b/requests/sessions.py\n".into(),
            test_patch: "diff --git a/tests/test_api.py b/tests/test_api.py\n--- a/tests/test_api.py\n+++ b/tests/test_api.py\n".into(),
            version: "2.4".into(),
            environment_setup_commit: None,
            problem_statement: None,
            fail_to_pass: vec!["tests/test_api.py::test_fix".into()],
            pass_to_pass: vec!["tests/test_api.py::test_ok".into()],
        }
    }

    fn pipeline(channel: Arc<ScriptedChannel>, config: PipelineConfig) -> EvaluationPipeline {
        let service = ExecutionService::new(channel, Duration::from_secs(60));
        let client = TestbedClient::new("tb-1", Arc::new(LocalTransport::new(service)))
            .with_poll_interval(Duration::from_millis(10));
        let mut ignored = IgnoredTests::default();
        ignored.insert("psf__requests-2317", "tests/test_api.py", "test_flaky");
        EvaluationPipeline::new(
            client,
            instance(),
            &ParserRegistry::swebench(),
            Arc::new(ignored),
            config,
        )
    }

    #[tokio::test]
    async fn gold_patch_grades_full_and_drops_ignored_tests() {
        let channel = Arc::new(
            ScriptedChannel::default()
                .respond(START_TEST_OUTPUT, TEST_OUTPUT, 0)
                .respond("git apply -v /shared", ">>>>> Applied Patch\n", 0),
        );
        let p = pipeline(channel.clone(), PipelineConfig::default());

        let result = p.run_evaluation("run-1", None).await.expect("evaluation");
        assert_eq!(result.outcome, EvaluationOutcome::Graded);
        assert!(result.patch_applied);
        assert_eq!(result.resolution, ResolvedStatus::Full);
        assert!(result.resolved);
        assert_eq!(result.test_results.len(), 2);
        assert!(result.test_results.iter().all(|r| r.status == TestStatus::Passed));

        let staged = channel.files.lock().await;
        let written = staged.get("/shared/run-1/patch.diff").expect("patch staged");
        assert_eq!(written.as_slice(), instance().patch.as_bytes());
    }

    #[tokio::test]
    async fn failed_patch_stops_before_tests() {
        let channel = Arc::new(
            ScriptedChannel::default()
                .respond(START_TEST_OUTPUT, TEST_OUTPUT, 0)
                .respond("git apply -v /shared", "error: corrupt patch\n>>>>> Patch Apply Failed\n", 0),
        );
        let p = pipeline(channel.clone(), PipelineConfig::default());

        let result = p
            .run_evaluation("run-2", Some("not a diff"))
            .await
            .expect("evaluation");
        assert_eq!(result.outcome, EvaluationOutcome::PatchFailed);
        assert!(!result.patch_applied);
        assert!(!result.resolved);
        assert_eq!(result.resolution, ResolvedStatus::None);
        assert!(result.output.contains("corrupt patch"));

        let scripts = channel.scripts.lock().await;
        assert!(!scripts.iter().any(|s| s.contains(START_TEST_OUTPUT)));
        let staged = channel.files.lock().await;
        assert_eq!(
            staged.get("/shared/run-2/patch.diff").map(Vec::as_slice),
            Some("not a diff\n".as_bytes())
        );
    }

    #[tokio::test]
    async fn missing_patch_marker_counts_as_failure() {
        let channel = Arc::new(ScriptedChannel::default().respond(START_TEST_OUTPUT, TEST_OUTPUT, 0));
        let p = pipeline(channel, PipelineConfig::default());
        let result = p.run_evaluation("run-3", None).await.expect("evaluation");
        assert_eq!(result.outcome, EvaluationOutcome::PatchFailed);
    }

    #[tokio::test]
    async fn missing_test_marker_is_not_found() {
        let channel = Arc::new(
            ScriptedChannel::default()
                .respond(START_TEST_OUTPUT, "conda: command not found\n", 127)
                .respond("git apply -v /shared", ">>>>> Applied Patch\n", 0),
        );
        let p = pipeline(channel, PipelineConfig::default());
        let result = p.run_evaluation("run-4", None).await.expect("evaluation");
        assert_eq!(result.outcome, EvaluationOutcome::Graded);
        assert!(result.tests_not_found);
        assert_eq!(result.resolution, ResolvedStatus::None);
        assert_eq!(
            result.tests_status.fail_to_pass.failure,
            vec!["tests/test_api.py::test_fix".to_string()]
        );
    }

    #[tokio::test]
    async fn slow_test_run_is_timed_out_result() {
        let channel = Arc::new(
            ScriptedChannel::default()
                .respond("git apply -v /shared", ">>>>> Applied Patch\n", 0)
                .slow_on(START_TEST_OUTPUT, Duration::from_secs(30)),
        );
        let config = PipelineConfig {
            exec_timeout: Duration::from_secs(1),
            ..PipelineConfig::default()
        };
        let p = pipeline(channel, config);
        let result = p.run_evaluation("run-5", None).await.expect("evaluation");
        assert_eq!(result.outcome, EvaluationOutcome::TimedOut);
        assert!(result.patch_applied);
        assert!(!result.resolved);
        assert!(result.output.contains("Timeout error: 1 seconds exceeded."));
    }

    #[tokio::test]
    async fn empty_gold_patch_is_rejected() {
        let channel = Arc::new(ScriptedChannel::default());
        let mut p = pipeline(channel, PipelineConfig::default());
        p.instance.patch.clear();
        let err = p.run_evaluation("run-6", None).await.expect_err("no patch");
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn run_tests_parses_selected_files() {
        let channel = Arc::new(ScriptedChannel::default().respond(START_TEST_OUTPUT, TEST_OUTPUT, 1));
        let p = pipeline(channel.clone(), PipelineConfig::default());
        let files = vec!["tests/test_api.py".to_string()];
        let response = p.run_tests(&files, None).await.expect("run tests");
        assert_eq!(response.outcome, TestRunOutcome::Completed);
        assert_eq!(response.test_results.len(), 2);

        let scripts = channel.scripts.lock().await;
        assert!(!scripts.iter().any(|s| s.contains("git apply -v /shared")));
        assert!(scripts.iter().any(|s| s.contains("pytest -rA tests/test_api.py")));
    }

    #[tokio::test]
    async fn run_tests_reports_patch_failure() {
        let channel = Arc::new(
            ScriptedChannel::default()
                .respond("git apply -v /shared", ">>>>> Patch Apply Failed\n", 0),
        );
        let p = pipeline(channel, PipelineConfig::default());
        let response = p.run_tests(&[], Some("bad")).await.expect("run tests");
        assert_eq!(response.outcome, TestRunOutcome::PatchFailed);
        assert!(response.test_results.is_empty());
    }
}
