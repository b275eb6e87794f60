//! Sandbox-side command execution.
//!
//! An [`ExecutionChannel`] knows how to run one shell script inside the sandbox and
//! stream its combined stdout/stderr. [`service::ExecutionService`] layers the async
//! submit/poll contract and the single-flight rule on top of a channel.

pub mod service;
pub mod shared_volume;
pub mod shell;

use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Accumulated output of one execution, shared between the runner and pollers.
#[derive(Debug, Clone, Default)]
pub struct OutputSink {
    buf: Arc<Mutex<String>>,
}

impl OutputSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, chunk: &str) {
        self.buf.lock().await.push_str(chunk);
    }

    pub async fn push_bytes(&self, chunk: &[u8]) {
        self.push(&String::from_utf8_lossy(chunk)).await;
    }

    /// Replace everything seen so far, for channels that re-read a whole output file.
    pub async fn replace(&self, content: String) {
        *self.buf.lock().await = content;
    }

    pub async fn snapshot(&self) -> String {
        self.buf.lock().await.clone()
    }
}

#[async_trait]
pub trait ExecutionChannel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run `script` to completion, streaming output into `sink`, and return the exit
    /// code. When `cancel` fires the channel must stop the script and return
    /// `Error::Timeout`.
    async fn execute(&self, script: &str, sink: OutputSink, cancel: CancellationToken)
    -> Result<i32>;

    /// `Error::NotFound` when the file does not exist.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Creates parent directories as needed.
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Whether the execution target can accept work right now.
    async fn is_reachable(&self) -> bool;
}
