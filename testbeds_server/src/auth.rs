use crate::error::ApiError;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use std::collections::HashMap;
use std::future;
use std::path::Path;
use std::sync::Arc;
use testbeds_core::protocol::http::API_KEY_HEADER;

/// Static mapping of opaque API key to owner id.
#[derive(Debug, Default, Clone)]
pub struct ApiKeys {
    owners: HashMap<String, String>,
}

impl ApiKeys {
    pub fn new(owners: HashMap<String, String>) -> Self {
        Self { owners }
    }

    /// Load `{"<key>": "<owner>"}`. A missing or malformed file yields an empty
    /// map, so every request is rejected until the file is fixed.
    #[tracing::instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(error = %e, "api keys file not readable");
                return Self::default();
            }
        };
        match serde_json::from_slice::<HashMap<String, String>>(&raw) {
            Ok(owners) => {
                tracing::info!(keys = owners.len(), "loaded api keys");
                Self::new(owners)
            }
            Err(e) => {
                tracing::error!(error = %e, "api keys file is not a JSON object of strings");
                Self::default()
            }
        }
    }

    pub fn owner(&self, key: &str) -> Option<&str> {
        self.owners
            .get(key)
            .map(String::as_str)
            .filter(|o| !o.is_empty())
    }
}

#[derive(Clone)]
pub struct ApiKeysExt(pub Arc<ApiKeys>);

/// Owner resolved from the `X-API-Key` header.
#[derive(Debug, Clone)]
pub struct Owner(pub String);

impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    #[tracing::instrument(level = "debug", name = "extract.owner", skip_all)]
    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let res = (|| {
            let keys = parts
                .extensions
                .get::<ApiKeysExt>()
                .ok_or(ApiError::InvalidApiKey)?;
            let key = parts
                .headers
                .get(API_KEY_HEADER)
                .and_then(|v| v.to_str().ok())
                .ok_or(ApiError::InvalidApiKey)?;
            let owner = keys.0.owner(key.trim()).ok_or(ApiError::InvalidApiKey)?;
            Ok(Self(owner.to_string()))
        })();
        future::ready(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_key_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("api_keys.json");
        tokio::fs::write(&path, r#"{"k-1": "alice", "k-2": ""}"#)
            .await
            .expect("write");
        let keys = ApiKeys::load(&path).await;
        assert_eq!(keys.owner("k-1"), Some("alice"));
        assert_eq!(keys.owner("k-2"), None);
        assert_eq!(keys.owner("nope"), None);
    }

    #[tokio::test]
    async fn missing_or_malformed_file_rejects_everyone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = ApiKeys::load(dir.path().join("absent.json")).await;
        assert!(keys.owner("k-1").is_none());

        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, "[1, 2]").await.expect("write");
        assert!(ApiKeys::load(&path).await.owner("1").is_none());
    }
}
