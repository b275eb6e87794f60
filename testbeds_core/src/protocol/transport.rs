use crate::Result;
use crate::exec::service::ExecutionService;
use crate::protocol::models::{ExecRequest, ExecSubmitted, ExecutionStatus};
use async_trait::async_trait;
use std::time::Duration;

/// One way of reaching a sandbox's execution agent.
#[async_trait]
pub trait SandboxTransport: Send + Sync {
    /// Application-level health: `Ok(true)` only on a positive payload.
    async fn health(&self) -> Result<bool>;
    async fn submit(&self, request: &ExecRequest) -> Result<ExecSubmitted>;
    async fn status(&self, execution_id: Option<&str>) -> Result<ExecutionStatus>;
    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Writes over a network boundary get verified by a read-back.
    fn crosses_network(&self) -> bool {
        true
    }
}

/// In-process transport straight onto an [`ExecutionService`].
#[derive(Clone)]
pub struct LocalTransport {
    service: ExecutionService,
}

impl LocalTransport {
    pub fn new(service: ExecutionService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl SandboxTransport for LocalTransport {
    async fn health(&self) -> Result<bool> {
        Ok(self.service.is_healthy().await)
    }

    async fn submit(&self, request: &ExecRequest) -> Result<ExecSubmitted> {
        self.service
            .submit_with_id(
                &request.commands,
                request.timeout.map(Duration::from_secs),
                request.execution_id.as_deref(),
            )
            .await
    }

    async fn status(&self, execution_id: Option<&str>) -> Result<ExecutionStatus> {
        self.service.status(execution_id).await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.service.read_file(path).await
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        self.service.write_file(path, content).await
    }

    fn crosses_network(&self) -> bool {
        false
    }
}
