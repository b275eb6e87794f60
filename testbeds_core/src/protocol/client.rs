use crate::models::PatchApplication;
use crate::protocol::models::{ExecRequest, ExecSubmitted, ExecutionState, ExecutionStatus};
use crate::protocol::transport::SandboxTransport;
use crate::swebench::constants::{APPLY_PATCH_FAIL, APPLY_PATCH_PASS, REPO_DIRECTORY};
use crate::swebench::test_spec::patch_commands;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Slack past the execution timeout before the client gives up on its own, so a
/// server-side timeout report normally arrives first.
const DEADLINE_SLACK: Duration = Duration::from_secs(30);

/// Protocol client bound to one testbed.
#[derive(Clone)]
pub struct TestbedClient {
    testbed_id: String,
    transport: Arc<dyn SandboxTransport>,
    poll_interval: Duration,
}

impl std::fmt::Debug for TestbedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestbedClient")
            .field("testbed_id", &self.testbed_id)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl TestbedClient {
    pub fn new(testbed_id: impl Into<String>, transport: Arc<dyn SandboxTransport>) -> Self {
        Self {
            testbed_id: testbed_id.into(),
            transport,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn testbed_id(&self) -> &str {
        &self.testbed_id
    }

    pub async fn health(&self) -> Result<bool> {
        self.transport.health().await
    }

    /// Submit under a fresh execution id, so transport retries stay idempotent.
    pub async fn submit(&self, commands: Vec<String>, timeout: Duration) -> Result<ExecSubmitted> {
        self.submit_with_id(commands, timeout, uuid::Uuid::new_v4().to_string())
            .await
    }

    pub async fn submit_with_id(
        &self,
        commands: Vec<String>,
        timeout: Duration,
        execution_id: String,
    ) -> Result<ExecSubmitted> {
        self.transport
            .submit(&ExecRequest {
                commands,
                timeout: Some(timeout.as_secs().max(1)),
                execution_id: Some(execution_id),
            })
            .await
    }

    pub async fn status(&self, execution_id: Option<&str>) -> Result<ExecutionStatus> {
        self.transport.status(execution_id).await
    }

    /// Submit and poll until terminal. A run that exceeds `timeout` ends in
    /// `Error::Timeout`, whichever side notices first.
    #[tracing::instrument(level = "info", skip(self, commands), fields(testbed_id = %self.testbed_id))]
    pub async fn run_to_completion(
        &self,
        commands: Vec<String>,
        timeout: Duration,
    ) -> Result<ExecutionStatus> {
        let submitted = self.submit(commands, timeout).await?;
        let execution_id = submitted.execution_id;
        let deadline = Instant::now() + timeout + DEADLINE_SLACK;

        loop {
            let status = self.status(Some(&execution_id)).await?;
            match status.status {
                ExecutionState::Running => {}
                ExecutionState::Failed if status.timed_out => {
                    return Err(Error::Timeout(format!(
                        "execution {execution_id} exceeded {}s",
                        timeout.as_secs()
                    )));
                }
                _ => return Ok(status),
            }
            if Instant::now() >= deadline {
                tracing::warn!(%execution_id, "execution still running past client deadline");
                return Err(Error::Timeout(format!(
                    "execution {execution_id} did not finish within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.transport.read_file(path).await
    }

    /// Working-tree diff of the repository checkout.
    #[tracing::instrument(level = "debug", skip(self), fields(testbed_id = %self.testbed_id))]
    pub async fn get_diff(&self, timeout: Duration) -> Result<String> {
        let commands = vec![format!("cd {REPO_DIRECTORY}"), "git diff".to_string()];
        let status = self.run_to_completion(commands, timeout).await?;
        if status.exit_code != Some(0) {
            return Err(Error::BackendMessage(format!(
                "git diff exited with {:?}: {}",
                status.exit_code,
                status.output.trim()
            )));
        }
        Ok(status.output.trim().to_string())
    }

    /// Stage `patch` at `patch_path` and apply it to the checkout. A patch that
    /// does not apply is reported, not an error.
    #[tracing::instrument(level = "info", skip(self, patch), fields(testbed_id = %self.testbed_id))]
    pub async fn apply_patch(
        &self,
        patch: &str,
        patch_path: &str,
        timeout: Duration,
    ) -> Result<PatchApplication> {
        let mut content = patch.to_string();
        if !content.ends_with('\n') {
            content.push('\n');
        }
        self.write_file(patch_path, content.as_bytes()).await?;

        let status = self.run_to_completion(patch_commands(patch_path), timeout).await?;
        let applied = if status.output.contains(APPLY_PATCH_FAIL) {
            false
        } else if status.output.contains(APPLY_PATCH_PASS) {
            true
        } else {
            tracing::warn!(output = %status.output, "patch step printed neither marker");
            false
        };
        Ok(PatchApplication {
            applied,
            output: status.output,
        })
    }

    /// Write, then read back and compare when the bytes crossed the network.
    #[tracing::instrument(level = "debug", skip(self, content), fields(testbed_id = %self.testbed_id, bytes = content.len()))]
    pub async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        self.transport.write_file(path, content).await?;
        if !self.transport.crosses_network() {
            return Ok(());
        }
        let echoed = self.transport.read_file(path).await?;
        if echoed != content {
            tracing::error!(
                path,
                expected = content.len(),
                actual = echoed.len(),
                "file verification failed"
            );
            return Err(Error::BackendMessage(format!(
                "file verification failed for {path}: wrote {} bytes, read back {}",
                content.len(),
                echoed.len()
            )));
        }
        Ok(())
    }
}
