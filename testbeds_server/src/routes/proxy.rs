//! Per-testbed agent routes, forwarded after the ownership check. The exec,
//! file and health paths match the agent's own, so one client speaks to either.
//! Diff and patch application are composed from those primitives.

use crate::auth::Owner;
use crate::error::ApiError;
use crate::server::AppState;
use axum::Extension;
use axum::Json;
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use testbeds_core::models::{GitDiff, PatchApplication};
use testbeds_core::protocol::models::{
    ExecRequest, ExecStatusQuery, ExecSubmitted, ExecutionStatus, FileContent, FileQuery,
    HealthStatus,
};

#[derive(Debug, Serialize)]
pub struct FileWritten {
    pub file_path: String,
    pub bytes: usize,
}

#[derive(Debug, Deserialize)]
pub struct ApplyPatchRequest {
    pub patch: String,
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/testbeds/{id}/health", get(health))
        .route("/testbeds/{id}/exec", get(exec_status).post(exec))
        .route("/testbeds/{id}/file", get(read_file).post(write_file))
        .route("/testbeds/{id}/diff", get(diff))
        .route("/testbeds/{id}/apply-patch", post(apply_patch))
}

#[tracing::instrument(level = "debug", skip_all, fields(owner = %owner, testbed_id = %id))]
pub async fn health(
    Owner(owner): Owner,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<HealthStatus>), ApiError> {
    let client = state.manager.create_client(&id, &owner, None).await?;
    let healthy = match client.health().await {
        Ok(healthy) => healthy,
        Err(e) if e.is_transient() => false,
        Err(e) => return Err(e.into()),
    };
    Ok(if healthy {
        (StatusCode::OK, Json(HealthStatus::ok()))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthStatus::error("testbed agent is not healthy")),
        )
    })
}

#[tracing::instrument(level = "debug", skip_all, fields(owner = %owner, testbed_id = %id))]
pub async fn exec(
    Owner(owner): Owner,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ExecRequest>,
) -> Result<Json<ExecSubmitted>, ApiError> {
    if req.commands.is_empty() {
        return Err(ApiError::InvalidInput("commands must not be empty".to_string()));
    }
    let timeout = req
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(state.pipeline.exec_timeout);
    let execution_id = req
        .execution_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let client = state.manager.create_client(&id, &owner, None).await?;
    Ok(Json(client.submit_with_id(req.commands, timeout, execution_id).await?))
}

#[tracing::instrument(level = "debug", skip_all, fields(owner = %owner, testbed_id = %id))]
pub async fn exec_status(
    Owner(owner): Owner,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<ExecStatusQuery>,
) -> Result<Json<ExecutionStatus>, ApiError> {
    let client = state.manager.create_client(&id, &owner, None).await?;
    Ok(Json(client.status(q.execution_id.as_deref()).await?))
}

#[tracing::instrument(level = "debug", skip_all, fields(owner = %owner, testbed_id = %id))]
pub async fn read_file(
    Owner(owner): Owner,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<FileQuery>,
) -> Result<Json<FileContent>, ApiError> {
    let client = state.manager.create_client(&id, &owner, None).await?;
    let bytes = client.read_file(&q.file_path).await?;
    Ok(Json(FileContent::encode(q.file_path, &bytes)))
}

#[tracing::instrument(level = "debug", skip_all, fields(owner = %owner, testbed_id = %id))]
pub async fn write_file(
    Owner(owner): Owner,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<FileContent>,
) -> Result<Json<FileWritten>, ApiError> {
    let bytes = body.decode()?;
    let client = state.manager.create_client(&id, &owner, None).await?;
    client.write_file(&body.file_path, &bytes).await?;
    Ok(Json(FileWritten {
        file_path: body.file_path,
        bytes: bytes.len(),
    }))
}

#[tracing::instrument(level = "debug", skip_all, fields(owner = %owner, testbed_id = %id))]
pub async fn diff(
    Owner(owner): Owner,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<GitDiff>, ApiError> {
    let client = state.manager.create_client(&id, &owner, None).await?;
    let diff = client.get_diff(state.pipeline.command_timeout).await?;
    Ok(Json(GitDiff { diff }))
}

/// Stages the patch on the shared volume and applies it without resetting first.
#[tracing::instrument(level = "info", skip_all, fields(owner = %owner, testbed_id = %id))]
pub async fn apply_patch(
    Owner(owner): Owner,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ApplyPatchRequest>,
) -> Result<Json<PatchApplication>, ApiError> {
    if req.patch.trim().is_empty() {
        return Err(ApiError::InvalidInput("patch must not be empty".to_string()));
    }
    let path = format!(
        "{}/{}/patch.diff",
        state.pipeline.shared_dir.trim_end_matches('/'),
        uuid::Uuid::new_v4().simple()
    );
    let client = state.manager.create_client(&id, &owner, None).await?;
    let outcome = client
        .apply_patch(&req.patch, &path, state.pipeline.command_timeout)
        .await?;
    tracing::info!(applied = outcome.applied, %path, "patch application finished");
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support::{ALICE, BOB, TestApp, app, call};
    use axum::http::StatusCode;
    use serde_json::{Value, json};
    use std::time::Duration;

    async fn create(app: &TestApp) -> String {
        let (_, created) = call(
            app,
            "POST",
            "/testbeds",
            Some(ALICE),
            Some(json!({"instance_id": "psf__requests-2317"})),
        )
        .await;
        created["testbed_id"].as_str().expect("id").to_string()
    }

    async fn wait_done(app: &TestApp, id: &str, execution_id: &str) -> Value {
        for _ in 0..200 {
            let uri = format!("/testbeds/{id}/exec?execution_id={execution_id}");
            let (status, body) = call(app, "GET", &uri, Some(ALICE), None).await;
            assert_eq!(status, StatusCode::OK);
            if body["status"] != "running" {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("execution {execution_id} never finished");
    }

    #[tokio::test]
    async fn health_is_proxied() {
        let app = app();
        let id = create(&app).await;
        let (status, body) = call(&app, "GET", &format!("/testbeds/{id}/health"), Some(ALICE), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "OK");
    }

    #[tokio::test]
    async fn exec_runs_and_rejects_concurrent_submit() {
        let app = app();
        let id = create(&app).await;
        let uri = format!("/testbeds/{id}/exec");

        let (status, submitted) = call(
            &app,
            "POST",
            &uri,
            Some(ALICE),
            Some(json!({"commands": ["sleep 1", "echo done"], "timeout": 30})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(submitted["status"], "running");

        let (status, _) = call(
            &app,
            "POST",
            &uri,
            Some(ALICE),
            Some(json!({"commands": ["echo second"]})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let execution_id = submitted["execution_id"].as_str().expect("execution id");
        let done = wait_done(&app, &id, execution_id).await;
        assert_eq!(done["status"], "completed");
        assert_eq!(done["exit_code"], 0);
        assert!(done["output"].as_str().unwrap_or_default().contains("done"));
    }

    #[tokio::test]
    async fn file_round_trip() {
        let app = app();
        let id = create(&app).await;
        let uri = format!("/testbeds/{id}/file");
        // "a\0b\n" in base64.
        let (status, _) = call(
            &app,
            "POST",
            &uri,
            Some(ALICE),
            Some(json!({"file_path": "data/blob.bin", "content": "YQBiCg=="})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &app,
            "GET",
            &format!("{uri}?file_path=data/blob.bin"),
            Some(ALICE),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["content"], "YQBiCg==");

        let (status, _) = call(
            &app,
            "GET",
            &format!("{uri}?file_path=missing.txt"),
            Some(ALICE),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &app,
            "POST",
            &uri,
            Some(ALICE),
            Some(json!({"file_path": "x", "content": "%%%"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    #[tokio::test]
    async fn diff_shows_working_tree_changes() {
        if !git_available() {
            return;
        }
        let app = app();
        let id = create(&app).await;
        let (status, submitted) = call(
            &app,
            "POST",
            &format!("/testbeds/{id}/exec"),
            Some(ALICE),
            Some(json!({"commands": [
                "git init -q .",
                "printf 'one\\n' > tracked.txt",
                "git add tracked.txt",
                "printf 'two\\n' > tracked.txt"
            ]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let execution_id = submitted["execution_id"].as_str().expect("execution id");
        assert_eq!(wait_done(&app, &id, execution_id).await["exit_code"], 0);

        let (status, body) = call(&app, "GET", &format!("/testbeds/{id}/diff"), Some(ALICE), None).await;
        assert_eq!(status, StatusCode::OK);
        let diff = body["diff"].as_str().expect("diff");
        assert!(diff.contains("-one"), "{diff}");
        assert!(diff.contains("+two"), "{diff}");
    }

    #[tokio::test]
    async fn apply_patch_reports_rejection() {
        let app = app();
        let id = create(&app).await;
        let uri = format!("/testbeds/{id}/apply-patch");

        let (status, body) = call(&app, "POST", &uri, Some(ALICE), Some(json!({"patch": "not a diff"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["applied"], false);
        assert!(body["output"].as_str().unwrap_or_default().contains("Patch Apply Failed"));

        let (status, _) = call(&app, "POST", &uri, Some(ALICE), Some(json!({"patch": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, "POST", &uri, Some(BOB), Some(json!({"patch": "x"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn foreign_testbed_is_not_found() {
        let app = app();
        let id = create(&app).await;
        let (status, _) = call(&app, "GET", &format!("/testbeds/{id}/exec"), Some(BOB), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
