//! Global tracing bootstrap.
//!
//! Logs go to stdout through `tracing-subscriber`, filtered by `RUST_LOG`
//! (default `info`). JSON is the default format since sandboxes and the control
//! plane both run under a log collector; `TESTBEDS_LOG_FORMAT=pretty` switches to
//! human-readable output for local work.

use crate::{Error, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" | "text" => Some(Self::Pretty),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Directive used when `RUST_LOG` is unset.
    pub default_directive: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            default_directive: "info".to_string(),
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Ok(raw) = std::env::var("TESTBEDS_LOG_FORMAT") {
            cfg.format = LogFormat::parse(&raw).ok_or_else(|| {
                Error::InvalidInput(format!("TESTBEDS_LOG_FORMAT must be json or pretty, got {raw}"))
            })?;
        }
        Ok(cfg)
    }
}

pub fn init_global_from_env() -> Result<()> {
    init_global(LogConfig::from_env()?)
}

/// Install the global subscriber. Fails with `Conflict` if one is already set.
#[tracing::instrument(level = "info", skip_all)]
pub fn init_global(cfg: LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.default_directive.as_str()));

    let res = match cfg.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
    };
    res.map_err(|e| Error::Conflict(format!("tracing already initialized: {e}")))
}
