//! HTTP transport to a sandbox agent, or to the control plane's per-testbed proxy.
//!
//! Both expose the same relative routes (`/health`, `/exec`, `/file`), so one
//! client serves both: point `base_url` at `http://{sandbox}:8000` or at
//! `{control_plane}/testbeds/{id}` with an API key.

use crate::protocol::models::{
    ExecRequest, ExecSubmitted, ExecutionStatus, FileContent, HealthStatus,
};
use crate::protocol::transport::SandboxTransport;
use crate::retry::RetryPolicy;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

pub const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Map a non-success response onto the error taxonomy. 5xx (other than an
/// explicit gateway timeout) is transient; 4xx never is.
async fn error_for_response(operation: &str, resp: Response) -> Error {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(|b| b.error.or(b.message))
        .unwrap_or(text);
    let detail = format!("{operation}: {message}");
    match status {
        StatusCode::BAD_REQUEST => Error::InvalidInput(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Unauthorized(detail),
        StatusCode::NOT_FOUND => Error::NotFound(detail),
        StatusCode::CONFLICT if message.starts_with("busy") => Error::Busy(detail),
        StatusCode::CONFLICT => Error::Conflict(detail),
        StatusCode::GATEWAY_TIMEOUT => Error::Timeout(detail),
        s if s.is_server_error() => Error::transient_message(operation, format!("{s}: {message}")),
        s => Error::BackendMessage(format!("{detail} ({s})")),
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    http: Client,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl HttpTransport {
    /// `request_timeout` bounds each HTTP call on its own; the retry policy bounds the
    /// whole operation.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        retry: RetryPolicy,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::backend("build sandbox http client", e))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            api_key,
            retry,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn apply_auth(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.header(API_KEY_HEADER, key),
            None => req,
        }
    }

    async fn send_json<T, F>(&self, operation: &str, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let build = &build;
        self.retry
            .run(operation, || async move {
                let resp = self
                    .apply_auth(build())
                    .send()
                    .await
                    .map_err(|e| Error::from_reqwest(operation, e))?;
                if !resp.status().is_success() {
                    return Err(error_for_response(operation, resp).await);
                }
                resp.json::<T>()
                    .await
                    .map_err(|e| Error::from_reqwest(operation, e))
            })
            .await
    }
}

#[async_trait]
impl SandboxTransport for HttpTransport {
    #[tracing::instrument(level = "debug", skip(self), fields(base_url = %self.base_url))]
    async fn health(&self) -> Result<bool> {
        let resp = self
            .apply_auth(self.http.get(self.url("/health")))
            .send()
            .await
            .map_err(|e| Error::from_reqwest("GET /health", e))?;
        match resp.status() {
            s if s.is_success() => {
                let body: HealthStatus = resp
                    .json()
                    .await
                    .map_err(|e| Error::from_reqwest("GET /health", e))?;
                Ok(body.is_ok())
            }
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => Ok(false),
            _ => Err(error_for_response("GET /health", resp).await),
        }
    }

    /// Retried like any other call. Requests always carry an `execution_id`, which
    /// makes a resubmission after a lost response idempotent on the agent.
    #[tracing::instrument(level = "info", skip(self, request), fields(base_url = %self.base_url))]
    async fn submit(&self, request: &ExecRequest) -> Result<ExecSubmitted> {
        let request = ExecRequest {
            execution_id: Some(
                request
                    .execution_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            ),
            ..request.clone()
        };
        self.send_json("POST /exec", || self.http.post(self.url("/exec")).json(&request))
            .await
    }

    async fn status(&self, execution_id: Option<&str>) -> Result<ExecutionStatus> {
        self.send_json("GET /exec", || {
            let req = self.http.get(self.url("/exec"));
            match execution_id {
                Some(id) => req.query(&[("execution_id", id)]),
                None => req,
            }
        })
        .await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let body: FileContent = self
            .send_json("GET /file", || {
                self.http
                    .get(self.url("/file"))
                    .query(&[("file_path", path)])
            })
            .await?;
        body.decode()
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let payload = FileContent::encode(path, content);
        let _: serde_json::Value = self
            .send_json("POST /file", || self.http.post(self.url("/file")).json(&payload))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_trailing_slash() {
        let t = HttpTransport::new(
            "http://10.0.0.5:8000/",
            None,
            RetryPolicy::none(),
            Duration::from_secs(5),
        )
        .expect("client");
        assert_eq!(t.base_url(), "http://10.0.0.5:8000");
        assert_eq!(t.url("/exec"), "http://10.0.0.5:8000/exec");
    }

    #[tokio::test]
    async fn unreachable_agent_is_transient() {
        // Port 9 on localhost is discard; nothing listens there in test sandboxes.
        let t = HttpTransport::new(
            "http://127.0.0.1:9",
            None,
            RetryPolicy::none(),
            Duration::from_secs(2),
        )
        .expect("client");
        let err = t.status(None).await.expect_err("no agent");
        assert!(err.is_transient(), "got {err:?}");
    }
}
