use std::error::Error as StdError;

/// Common error type for `testbeds_core`.
///
/// Evaluation-domain outcomes (patch did not apply, tests failed, run timed out)
/// are result values, not errors. This enum covers infrastructure and protocol
/// failures only.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Missing, or owned by another caller. The two are deliberately indistinguishable.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// An execution is already in flight on the sandbox.
    #[error("busy: {0}")]
    Busy(String),

    #[error("execution timed out: {0}")]
    Timeout(String),

    /// The readiness deadline passed before the sandbox became healthy.
    #[error("sandbox unreachable: {0}")]
    Unreachable(String),

    #[error("transient error: {context}")]
    Transient {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    #[tracing::instrument(level = "debug", name = "testbeds.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Classify a reqwest failure. Connection resets and socket timeouts are retryable,
    /// everything else (bad URL, body decode) is not.
    pub fn from_reqwest(context: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_connect() || source.is_timeout() || source.is_request() {
            Self::Transient {
                context: context.into(),
                source: Box::new(source),
            }
        } else {
            Self::Backend {
                context: context.into(),
                source: Box::new(source),
            }
        }
    }

    pub fn transient_message(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Transient {
            context: context.into(),
            source: Box::new(std::io::Error::other(detail.into())),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
