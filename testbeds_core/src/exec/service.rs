//! Async submit/poll execution service with the single-flight rule.

use crate::exec::{ExecutionChannel, OutputSink};
use crate::protocol::models::{ExecSubmitted, ExecutionState, ExecutionStatus};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct Outcome {
    state: ExecutionState,
    exit_code: Option<i32>,
    timed_out: bool,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Execution {
    id: String,
    started_at: DateTime<Utc>,
    output: OutputSink,
    outcome: RwLock<Outcome>,
    cancel: CancellationToken,
}

impl Execution {
    async fn status(&self) -> ExecutionStatus {
        let outcome = self.outcome.read().await.clone();
        ExecutionStatus {
            execution_id: self.id.clone(),
            status: outcome.state,
            output: self.output.snapshot().await,
            exit_code: outcome.exit_code,
            timed_out: outcome.timed_out,
            started_at: self.started_at,
            finished_at: outcome.finished_at,
        }
    }
}

/// Owns the one execution slot of a sandbox.
#[derive(Clone)]
pub struct ExecutionService {
    channel: Arc<dyn ExecutionChannel>,
    default_timeout: Duration,
    current: Arc<Mutex<Option<Arc<Execution>>>>,
}

impl ExecutionService {
    pub fn new(channel: Arc<dyn ExecutionChannel>, default_timeout: Duration) -> Self {
        Self {
            channel,
            default_timeout,
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn channel(&self) -> &Arc<dyn ExecutionChannel> {
        &self.channel
    }

    /// Start `commands` as one script. Fails with `Error::Busy` while another
    /// execution is still running.
    pub async fn submit(&self, commands: &[String], timeout: Option<Duration>) -> Result<ExecSubmitted> {
        self.submit_with_id(commands, timeout, None).await
    }

    /// Like [`Self::submit`], under a caller-chosen id. Resubmitting the id of the
    /// current execution returns it instead of starting another, so a client may
    /// retry a submission whose response it never saw.
    #[tracing::instrument(level = "info", skip(self, commands), fields(commands = commands.len()))]
    pub async fn submit_with_id(
        &self,
        commands: &[String],
        timeout: Option<Duration>,
        execution_id: Option<&str>,
    ) -> Result<ExecSubmitted> {
        if commands.is_empty() {
            return Err(Error::InvalidInput("commands must not be empty".to_string()));
        }
        if execution_id.is_some_and(|id| id.trim().is_empty()) {
            return Err(Error::InvalidInput("execution_id must not be blank".to_string()));
        }

        let mut slot = self.current.lock().await;
        if let Some(existing) = slot.as_ref() {
            let state = existing.outcome.read().await.state;
            if execution_id == Some(existing.id.as_str()) {
                tracing::info!(execution_id = %existing.id, "duplicate submission, returning existing execution");
                return Ok(ExecSubmitted {
                    execution_id: existing.id.clone(),
                    status: state,
                });
            }
            if state == ExecutionState::Running {
                return Err(Error::Busy(format!("execution {} is still running", existing.id)));
            }
        }

        let timeout = timeout.unwrap_or(self.default_timeout);
        let execution = Arc::new(Execution {
            id: execution_id
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            started_at: Utc::now(),
            output: OutputSink::new(),
            outcome: RwLock::new(Outcome {
                state: ExecutionState::Running,
                exit_code: None,
                timed_out: false,
                finished_at: None,
            }),
            cancel: CancellationToken::new(),
        });
        *slot = Some(execution.clone());
        drop(slot);

        let script = commands.join("\n");
        let channel = self.channel.clone();
        let exec = execution.clone();
        tokio::spawn(async move {
            run_execution(channel, exec, script, timeout).await;
        });

        tracing::info!(execution_id = %execution.id, timeout_secs = timeout.as_secs(), "execution started");
        Ok(ExecSubmitted {
            execution_id: execution.id.clone(),
            status: ExecutionState::Running,
        })
    }

    /// Status of the latest execution, or of `execution_id` if given.
    pub async fn status(&self, execution_id: Option<&str>) -> Result<ExecutionStatus> {
        let current = self.current.lock().await.clone();
        let Some(exec) = current else {
            return Err(Error::NotFound("no execution has been submitted".to_string()));
        };
        if let Some(id) = execution_id {
            if id != exec.id {
                return Err(Error::NotFound(format!("execution {id}")));
            }
        }
        Ok(exec.status().await)
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        validate_path(path)?;
        self.channel.read_file(path).await
    }

    pub async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        validate_path(path)?;
        self.channel.write_file(path, content).await
    }

    pub async fn is_healthy(&self) -> bool {
        self.channel.is_reachable().await
    }
}

fn validate_path(path: &str) -> Result<()> {
    if path.trim().is_empty() {
        return Err(Error::InvalidInput("file_path is required".to_string()));
    }
    Ok(())
}

#[tracing::instrument(level = "info", skip_all, fields(execution_id = %exec.id))]
async fn run_execution(
    channel: Arc<dyn ExecutionChannel>,
    exec: Arc<Execution>,
    script: String,
    timeout: Duration,
) {
    let cancel = exec.cancel.clone();
    let timer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cancel.cancel();
        })
    };

    let res = channel.execute(&script, exec.output.clone(), cancel).await;
    timer.abort();

    let mut outcome = exec.outcome.write().await;
    outcome.finished_at = Some(Utc::now());
    match res {
        Ok(code) => {
            outcome.state = ExecutionState::Completed;
            outcome.exit_code = Some(code);
            tracing::info!(exit_code = code, "execution completed");
        }
        Err(Error::Timeout(_)) => {
            outcome.state = ExecutionState::Failed;
            outcome.timed_out = true;
            exec.output
                .push(&format!("\nTimeout error: {} seconds exceeded.\n", timeout.as_secs()))
                .await;
            tracing::warn!(timeout_secs = timeout.as_secs(), "execution timed out");
        }
        Err(e) => {
            outcome.state = ExecutionState::Failed;
            exec.output.push(&format!("\nExecution error: {e}\n")).await;
            tracing::error!(error = %e, "execution failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Channel that replays canned output and keeps files in memory.
    #[derive(Default)]
    pub(crate) struct ScriptedChannel {
        /// (substring of script, output, exit code); first match wins.
        pub responses: Vec<(String, String, i32)>,
        pub delay: Duration,
        /// When set, only scripts containing this needle are delayed.
        pub slow_needle: Option<String>,
        pub scripts: Mutex<Vec<String>>,
        pub files: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl ScriptedChannel {
        pub fn respond(mut self, needle: &str, output: &str, exit_code: i32) -> Self {
            self.responses
                .push((needle.to_string(), output.to_string(), exit_code));
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn slow_on(mut self, needle: &str, delay: Duration) -> Self {
            self.slow_needle = Some(needle.to_string());
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl ExecutionChannel for ScriptedChannel {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn execute(
            &self,
            script: &str,
            sink: OutputSink,
            cancel: CancellationToken,
        ) -> Result<i32> {
            self.scripts.lock().await.push(script.to_string());
            let delay = match &self.slow_needle {
                Some(needle) if !script.contains(needle.as_str()) => Duration::ZERO,
                _ => self.delay,
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(Error::Timeout("cancelled".into())),
            }
            for (needle, output, code) in &self.responses {
                if script.contains(needle.as_str()) {
                    sink.push(output).await;
                    return Ok(*code);
                }
            }
            Ok(0)
        }

        async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
            self.files
                .lock()
                .await
                .get(path)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("file {path}")))
        }

        async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
            self.files
                .lock()
                .await
                .insert(path.to_string(), content.to_vec());
            Ok(())
        }

        async fn is_reachable(&self) -> bool {
            true
        }
    }

    async fn wait_terminal(svc: &ExecutionService) -> ExecutionStatus {
        loop {
            let st = svc.status(None).await.expect("status");
            if st.status.is_terminal() {
                return st;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn second_submit_while_running_is_busy() {
        let ch = ScriptedChannel::default()
            .respond("first", "one\n", 0)
            .with_delay(Duration::from_millis(200));
        let svc = ExecutionService::new(Arc::new(ch), Duration::from_secs(10));

        let first = svc.submit(&["echo first".into()], None).await.expect("first");
        let err = svc
            .submit(&["echo second".into()], None)
            .await
            .expect_err("busy");
        assert!(matches!(err, Error::Busy(_)));

        let done = wait_terminal(&svc).await;
        assert_eq!(done.execution_id, first.execution_id);
        assert_eq!(done.status, ExecutionState::Completed);
        assert_eq!(done.output, "one\n");

        // Slot is free again once the first run is terminal.
        svc.submit(&["echo third".into()], None).await.expect("third");
    }

    #[tokio::test]
    async fn timeout_marks_execution_failed() {
        let ch = ScriptedChannel::default().with_delay(Duration::from_secs(30));
        let svc = ExecutionService::new(Arc::new(ch), Duration::from_secs(30));
        svc.submit(&["sleep 30".into()], Some(Duration::from_millis(50)))
            .await
            .expect("submit");

        let done = wait_terminal(&svc).await;
        assert_eq!(done.status, ExecutionState::Failed);
        assert!(done.timed_out);
        assert!(done.output.contains("Timeout error"));
    }

    #[tokio::test]
    async fn status_checks_execution_id() {
        let svc = ExecutionService::new(
            Arc::new(ScriptedChannel::default()),
            Duration::from_secs(5),
        );
        assert!(matches!(svc.status(None).await, Err(Error::NotFound(_))));
        let sub = svc.submit(&["true".into()], None).await.expect("submit");
        assert!(svc.status(Some(&sub.execution_id)).await.is_ok());
        assert!(matches!(
            svc.status(Some("other")).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn resubmitting_the_same_id_is_idempotent() {
        let ch = Arc::new(ScriptedChannel::default().with_delay(Duration::from_millis(200)));
        let svc = ExecutionService::new(ch.clone(), Duration::from_secs(10));

        let first = svc
            .submit_with_id(&["make test".into()], None, Some("run-1"))
            .await
            .expect("first");
        assert_eq!(first.execution_id, "run-1");
        let again = svc
            .submit_with_id(&["make test".into()], None, Some("run-1"))
            .await
            .expect("retry of the same submission");
        assert_eq!(again, first);
        assert!(matches!(
            svc.submit_with_id(&["make test".into()], None, Some("run-2")).await,
            Err(Error::Busy(_))
        ));

        let done = wait_terminal(&svc).await;
        assert_eq!(done.execution_id, "run-1");
        let late = svc
            .submit_with_id(&["make test".into()], None, Some("run-1"))
            .await
            .expect("late retry");
        assert_eq!(late.status, ExecutionState::Completed);
        assert_eq!(ch.scripts.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn rejects_empty_commands() {
        let svc = ExecutionService::new(
            Arc::new(ScriptedChannel::default()),
            Duration::from_secs(5),
        );
        assert!(matches!(
            svc.submit(&[], None).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
