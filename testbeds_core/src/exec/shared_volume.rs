//! Execution through a volume shared with the testbed container.
//!
//! The sidecar agent cannot exec into its neighbour, so the two containers talk
//! through trigger files. The testbed container runs [`testbed_loop_script`]; the
//! agent writes `commands.sh`, touches `run_cmd`, and tails `cmd_output.txt` until
//! `complete_cmd` appears. Files outside the shared volume are copied in or out by
//! the same loop through request files under `fileops/`.

use crate::exec::{ExecutionChannel, OutputSink};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SHARED_DIR: &str = "/shared";
pub const READY_MARKER: &str = ".testbed_ready";

const COMMANDS_FILE: &str = "commands.sh";
const OUTPUT_FILE: &str = "cmd_output.txt";
const RUN_TRIGGER: &str = "run_cmd";
const COMPLETE_MARKER: &str = "complete_cmd";
const EXIT_CODE_FILE: &str = "exit_code";
const KILL_TRIGGER: &str = "kill_cmd";
const FILEOPS_DIR: &str = "fileops";

const LOOP_TEMPLATE: &str = r#"S="__SHARED__"
mkdir -p "$S/fileops"
handle_fileops() {
  for req in "$S"/fileops/*.req; do
    [ -e "$req" ] || continue
    id=$(basename "$req" .req)
    read -r op target < "$req"
    if [ "$op" = "read" ]; then
      if [ -f "$target" ]; then
        cp "$target" "$S/fileops/$id.data" && echo ok > "$S/fileops/$id.tmp" || echo error > "$S/fileops/$id.tmp"
      else
        echo missing > "$S/fileops/$id.tmp"
      fi
    else
      mkdir -p "$(dirname "$target")" && cp "$S/fileops/$id.data" "$target" && echo ok > "$S/fileops/$id.tmp" || echo error > "$S/fileops/$id.tmp"
    fi
    rm -f "$req"
    mv "$S/fileops/$id.tmp" "$S/fileops/$id.done"
  done
}
touch "$S/.testbed_ready"
while true; do
  handle_fileops
  if [ -f "$S/run_cmd" ]; then
    rm -f "$S/run_cmd" "$S/complete_cmd" "$S/kill_cmd" "$S/exit_code"
    cd /testbed 2>/dev/null || cd /
    setsid bash "$S/commands.sh" > "$S/cmd_output.txt" 2>&1 &
    pid=$!
    while kill -0 "$pid" 2>/dev/null; do
      handle_fileops
      if [ -f "$S/kill_cmd" ]; then
        kill -9 -- "-$pid" 2>/dev/null || kill -9 "$pid" 2>/dev/null
        rm -f "$S/kill_cmd"
      fi
      sleep 0.1
    done
    wait "$pid"
    echo $? > "$S/exit_code"
    touch "$S/complete_cmd"
  fi
  sleep 0.1
done
"#;

/// Entrypoint of the testbed container: serve trigger files under `shared_dir`.
pub fn testbed_loop_script(shared_dir: &str) -> String {
    LOOP_TEMPLATE.replace("__SHARED__", shared_dir)
}

#[derive(Debug, Clone)]
pub struct SharedVolumeChannel {
    shared_dir: PathBuf,
    poll_interval: Duration,
    /// Upper bound for one file copy through the testbed loop.
    file_op_timeout: Duration,
    /// How long to wait for the loop to acknowledge a kill.
    kill_grace: Duration,
}

impl SharedVolumeChannel {
    pub fn new(shared_dir: impl Into<PathBuf>) -> Self {
        Self {
            shared_dir: shared_dir.into(),
            poll_interval: Duration::from_millis(100),
            file_op_timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(5),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn path(&self, name: &str) -> PathBuf {
        self.shared_dir.join(name)
    }

    /// Paths inside the shared volume are served directly.
    fn local_path(&self, path: &str) -> Option<PathBuf> {
        let p = Path::new(path);
        p.starts_with(&self.shared_dir).then(|| p.to_path_buf())
    }

    async fn remove_if_exists(path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_output(&self, sink: &OutputSink) {
        if let Ok(bytes) = tokio::fs::read(self.path(OUTPUT_FILE)).await {
            sink.replace(String::from_utf8_lossy(&bytes).into_owned()).await;
        }
    }

    async fn read_exit_code(&self) -> i32 {
        tokio::fs::read_to_string(self.path(EXIT_CODE_FILE))
            .await
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(-1)
    }

    /// Hand a file copy to the testbed loop and wait for its verdict.
    async fn file_op(&self, op: &str, target: &str, payload: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        let dir = self.path(FILEOPS_DIR);
        tokio::fs::create_dir_all(&dir).await?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        let data = dir.join(format!("{id}.data"));
        let done = dir.join(format!("{id}.done"));

        if let Some(bytes) = payload {
            tokio::fs::write(&data, bytes).await?;
        }
        // Write then rename so the loop never sees a half-written request.
        let staging = dir.join(format!("{id}.staging"));
        tokio::fs::write(&staging, format!("{op} {target}\n")).await?;
        tokio::fs::rename(&staging, dir.join(format!("{id}.req"))).await?;

        let deadline = Instant::now() + self.file_op_timeout;
        let verdict = loop {
            if let Ok(v) = tokio::fs::read_to_string(&done).await {
                break v.trim().to_string();
            }
            if Instant::now() >= deadline {
                // Withdraw the request so a late loop never acts on it.
                for stale in [dir.join(format!("{id}.req")), data.clone(), done.clone()] {
                    if let Err(e) = Self::remove_if_exists(&stale).await {
                        tracing::warn!(path = %stale.display(), error = %e, "could not withdraw file request");
                    }
                }
                return Err(Error::transient_message(
                    format!("{op} {target}"),
                    "testbed did not answer the file request",
                ));
            }
            tokio::time::sleep(self.poll_interval).await;
        };

        let result = match verdict.as_str() {
            "ok" if op == "read" => Ok(Some(tokio::fs::read(&data).await?)),
            "ok" => Ok(None),
            "missing" => Err(Error::NotFound(format!("file {target}"))),
            other => Err(Error::BackendMessage(format!("{op} {target} failed: {other}"))),
        };
        Self::remove_if_exists(&data).await?;
        Self::remove_if_exists(&done).await?;
        result
    }
}

#[async_trait]
impl ExecutionChannel for SharedVolumeChannel {
    fn name(&self) -> &'static str {
        "shared-volume"
    }

    #[tracing::instrument(level = "debug", skip_all, fields(shared_dir = %self.shared_dir.display()))]
    async fn execute(
        &self,
        script: &str,
        sink: OutputSink,
        cancel: CancellationToken,
    ) -> Result<i32> {
        for name in [COMPLETE_MARKER, EXIT_CODE_FILE, KILL_TRIGGER] {
            Self::remove_if_exists(&self.path(name)).await?;
        }
        tokio::fs::write(self.path(OUTPUT_FILE), b"").await?;
        tokio::fs::write(self.path(COMMANDS_FILE), script).await?;
        tokio::fs::write(self.path(RUN_TRIGGER), b"").await?;
        tracing::info!("triggered commands.sh");

        loop {
            if tokio::fs::try_exists(self.path(COMPLETE_MARKER)).await? {
                self.read_output(&sink).await;
                return Ok(self.read_exit_code().await);
            }
            self.read_output(&sink).await;

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => break,
            }
        }

        tokio::fs::write(self.path(KILL_TRIGGER), b"").await?;
        tracing::warn!("kill requested for running commands.sh");
        let deadline = Instant::now() + self.kill_grace;
        while Instant::now() < deadline {
            if tokio::fs::try_exists(self.path(COMPLETE_MARKER)).await? {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        self.read_output(&sink).await;
        Err(Error::Timeout("script cancelled".to_string()))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        if let Some(local) = self.local_path(path) {
            return match tokio::fs::read(&local).await {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(Error::NotFound(format!("file {path}")))
                }
                Err(e) => Err(e.into()),
            };
        }
        self.file_op("read", path, None)
            .await?
            .ok_or_else(|| Error::BackendMessage(format!("read {path} returned no data")))
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        if let Some(local) = self.local_path(path) {
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&local, content).await?;
            return Ok(());
        }
        self.file_op("write", path, Some(content)).await.map(|_| ())
    }

    async fn is_reachable(&self) -> bool {
        tokio::fs::try_exists(self.path(READY_MARKER))
            .await
            .unwrap_or(false)
    }
}
