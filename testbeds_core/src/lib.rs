//! Testbeds core library: sandbox orchestration, remote execution and SWE-bench
//! evaluation.

pub mod cluster;
pub mod config;
pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod exec;
pub mod models;
pub mod o11y;
pub mod orchestrator;
pub mod protocol;
pub mod readiness;
pub mod retry;
pub mod swebench;

pub use cluster::ClusterApi;
pub use config::TestbedsConfig;
pub use dataset::{IgnoredTests, InstanceStore};
pub use error::{Error, Result};
pub use evaluation::{EvaluationPipeline, PipelineConfig};
pub use models::{
    EvaluationResult, ResolvedStatus, TaskInstance, TestResult, TestRunResponse, TestStatus,
    TestbedDetailed, TestbedSummary,
};
pub use orchestrator::{OrchestratorConfig, TestbedManager};
pub use protocol::client::TestbedClient;
pub use readiness::{ReadinessMonitor, ReadinessState};
pub use retry::RetryPolicy;
