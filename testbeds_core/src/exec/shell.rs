//! Runs scripts with a local `bash`, in the same filesystem as the agent.

use crate::exec::{ExecutionChannel, OutputSink};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// How long output may keep flowing once the script itself has exited.
const PUMP_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ShellChannel {
    workdir: PathBuf,
    shell: String,
}

impl ShellChannel {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            shell: "bash".to_string(),
        }
    }

    /// Relative paths resolve against the working directory.
    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workdir.join(p)
        }
    }
}

async fn pump<R>(reader: R, sink: OutputSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => sink.push_bytes(&line).await,
            Err(e) => {
                tracing::warn!(error = %e, "output stream read failed");
                break;
            }
        }
    }
}

/// SIGKILL the process group led by `pid`: the script plus anything it forked.
async fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    let res = Command::new("kill")
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = res {
        tracing::warn!(pid, error = %e, "failed to signal process group");
    }
}

async fn drain(pumps: Vec<tokio::task::JoinHandle<()>>) {
    for p in pumps {
        let abort = p.abort_handle();
        match tokio::time::timeout(PUMP_DRAIN, p).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "output pump task failed"),
            Err(_) => {
                tracing::warn!("output still open after script exit; dropping the rest");
                abort.abort();
            }
        }
    }
}

#[async_trait]
impl ExecutionChannel for ShellChannel {
    fn name(&self) -> &'static str {
        "shell"
    }

    #[tracing::instrument(level = "debug", skip_all, fields(workdir = %self.workdir.display()))]
    async fn execute(
        &self,
        script: &str,
        sink: OutputSink,
        cancel: CancellationToken,
    ) -> Result<i32> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(script)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd.spawn()?;
        let pid = child.id();

        let mut pumps = Vec::new();
        if let Some(out) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(out, sink.clone())));
        }
        if let Some(err) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(err, sink.clone())));
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                kill_group(pid).await;
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill cancelled script");
                }
                for p in &pumps {
                    p.abort();
                }
                return Err(Error::Timeout("script cancelled".to_string()));
            }
        };

        // Background jobs left behind would otherwise hold the pipes open.
        kill_group(pid).await;
        tokio::select! {
            _ = drain(pumps) => {}
            _ = cancel.cancelled() => return Err(Error::Timeout("script cancelled".to_string())),
        }
        Ok(status.code().unwrap_or(-1))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        match tokio::fs::read(self.resolve(path)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("file {path}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        Ok(())
    }

    async fn is_reachable(&self) -> bool {
        tokio::fs::metadata(&self.workdir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }
}
