use crate::evaluation::PipelineConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::readiness::ReadinessMonitor;
use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Control-plane settings read from the process environment.
#[derive(Debug, Clone)]
pub struct TestbedsConfig {
    pub namespace: String,
    pub orchestrator: OrchestratorConfig,
    pub pipeline: PipelineConfig,
    pub readiness: ReadinessMonitor,
    /// JSON object mapping API key to owner id.
    pub api_keys_path: PathBuf,
    /// SWE-bench instances as a JSON array. Without it, evaluation routes are unavailable.
    pub instances_path: Option<PathBuf>,
    pub ignored_tests_path: Option<PathBuf>,
}

impl Default for TestbedsConfig {
    fn default() -> Self {
        Self {
            namespace: "testbeds".to_string(),
            orchestrator: OrchestratorConfig::default(),
            pipeline: PipelineConfig::default(),
            readiness: ReadinessMonitor::default(),
            api_keys_path: PathBuf::from("/app/api_keys.json"),
            instances_path: None,
            ignored_tests_path: None,
        }
    }
}

impl TestbedsConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with an injectable variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        let get = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(ns) = get("KUBE_NAMESPACE") {
            cfg.namespace = ns;
        }
        if let Some(prefix) = get("TESTBED_IMAGE_PREFIX") {
            cfg.orchestrator.image_prefix = prefix;
        }
        if let Some(image) = get("TESTBED_SIDECAR_IMAGE") {
            cfg.orchestrator.sidecar_image = image;
        }
        if let Some(raw) = get("TESTBED_IN_CLUSTER") {
            cfg.orchestrator.in_cluster = parse_bool("TESTBED_IN_CLUSTER", &raw)?;
        }
        if let Some(raw) = get("TESTBED_AGENT_PORT") {
            cfg.orchestrator.agent_port = raw.trim().parse().map_err(|_| {
                Error::InvalidInput(format!("TESTBED_AGENT_PORT must be a port number, got {raw}"))
            })?;
        }
        if let Some(raw) = get("TESTBED_EXEC_TIMEOUT_SECS") {
            cfg.pipeline.exec_timeout = parse_secs("TESTBED_EXEC_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = get("TESTBED_READY_TIMEOUT_SECS") {
            cfg.readiness.deadline = parse_secs("TESTBED_READY_TIMEOUT_SECS", &raw)?;
        }
        if let Some(path) = get("API_KEYS_PATH") {
            cfg.api_keys_path = PathBuf::from(path);
        }
        cfg.instances_path = get("INSTANCES_PATH").map(PathBuf::from);
        cfg.ignored_tests_path = get("IGNORED_TESTS_PATH").map(PathBuf::from);

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(Error::InvalidInput("namespace is empty".to_string()));
        }
        if self.orchestrator.image_prefix.trim().is_empty() {
            return Err(Error::InvalidInput("image prefix is empty".to_string()));
        }
        if self.orchestrator.agent_port == 0 {
            return Err(Error::InvalidInput("agent port must be > 0".to_string()));
        }
        if self.pipeline.exec_timeout.is_zero() {
            return Err(Error::InvalidInput("exec timeout must be > 0".to_string()));
        }
        if self.readiness.deadline.is_zero() {
            return Err(Error::InvalidInput("ready timeout must be > 0".to_string()));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(Error::InvalidInput(format!("{key} must be a boolean, got {raw}"))),
    }
}

fn parse_secs(key: &str, raw: &str) -> Result<Duration> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| Error::InvalidInput(format!("{key} must be whole seconds, got {raw}")))
}
