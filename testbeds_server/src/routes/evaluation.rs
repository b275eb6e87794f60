use crate::auth::Owner;
use crate::error::ApiError;
use crate::server::AppState;
use axum::Extension;
use axum::Json;
use axum::body::Bytes;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::post;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use testbeds_core::evaluation::EvaluationPipeline;
use testbeds_core::models::{EvaluationResult, TestRunOutcome, TestRunResponse};

#[derive(Debug, Default, Deserialize)]
pub struct RunTestsRequest {
    #[serde(default)]
    pub test_files: Option<Vec<String>>,
    #[serde(default)]
    pub patch: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunEvaluationRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    /// Defaults to the instance's gold patch.
    #[serde(default)]
    pub patch: Option<String>,
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/testbeds/{id}/run-tests", post(run_tests))
        .route("/testbeds/{id}/run-evaluation", post(run_evaluation))
}

/// An empty body means all defaults.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::InvalidInput(format!("invalid json body: {e}")))
}

/// Resolve the testbed's task, bind a client (recreating the testbed if it went
/// missing) and wait until its agent is healthy.
async fn ready_pipeline(state: &AppState, id: &str, owner: &str) -> Result<EvaluationPipeline, ApiError> {
    let Some(testbed) = state.manager.get(id, owner).await? else {
        return Err(testbeds_core::Error::NotFound("Testbed not found".to_string()).into());
    };
    let instance = state.instances.require(&testbed.instance_id)?.clone();
    let client = state
        .manager
        .create_client(id, owner, Some(&instance.instance_id))
        .await?;
    let report = state
        .manager
        .wait_until_ready(client.testbed_id(), owner, &state.readiness)
        .await?;
    tracing::info!(
        testbed_id = client.testbed_id(),
        polls = report.polls,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "testbed ready"
    );
    Ok(EvaluationPipeline::new(
        client,
        instance,
        &state.parsers,
        state.ignored.clone(),
        state.pipeline.clone(),
    ))
}

#[tracing::instrument(level = "info", skip_all, fields(owner = %owner, testbed_id = %id))]
pub async fn run_tests(
    Owner(owner): Owner,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<TestRunResponse>), ApiError> {
    let req: RunTestsRequest = parse_body(&body)?;
    let pipeline = ready_pipeline(&state, &id, &owner).await?;
    let response = pipeline
        .run_tests(&req.test_files.unwrap_or_default(), req.patch.as_deref())
        .await?;
    let code = match response.outcome {
        TestRunOutcome::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        TestRunOutcome::Completed | TestRunOutcome::PatchFailed => StatusCode::OK,
    };
    Ok((code, Json(response)))
}

#[tracing::instrument(level = "info", skip_all, fields(owner = %owner, testbed_id = %id))]
pub async fn run_evaluation(
    Owner(owner): Owner,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<EvaluationResult>, ApiError> {
    let req: RunEvaluationRequest = parse_body(&body)?;
    let run_id = req
        .run_id
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    let pipeline = ready_pipeline(&state, &id, &owner).await?;
    let result = pipeline.run_evaluation(&run_id, req.patch.as_deref()).await?;
    tracing::info!(
        run_id = %result.run_id,
        outcome = ?result.outcome,
        resolution = ?result.resolution,
        "evaluation finished"
    );
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support::{ALICE, BOB, TestApp, app, call};
    use axum::http::StatusCode;
    use serde_json::json;

    async fn create(app: &TestApp, instance_id: &str) -> String {
        let (_, created) = call(
            app,
            "POST",
            "/testbeds",
            Some(ALICE),
            Some(json!({ "instance_id": instance_id })),
        )
        .await;
        created["testbed_id"].as_str().expect("id").to_string()
    }

    #[tokio::test]
    async fn unappliable_patch_is_reported_not_raised() {
        let app = app();
        let id = create(&app, "psf__requests-2317").await;
        let (status, body) = call(
            &app,
            "POST",
            &format!("/testbeds/{id}/run-evaluation"),
            Some(ALICE),
            Some(json!({"run_id": "r1", "patch": "this is not a diff"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["run_id"], "r1");
        assert_eq!(body["outcome"], "patch_failed");
        assert_eq!(body["patch_applied"], false);
        assert_eq!(body["resolved"], false);
        assert!(body["output"].as_str().unwrap_or_default().contains(">>>>> Patch Apply Failed"));
        assert!(app._workdir.path().join("shared/r1/patch.diff").exists());
    }

    #[tokio::test]
    async fn run_tests_brackets_output() {
        let app = app();
        let id = create(&app, "psf__requests-2317").await;
        let (status, body) = call(
            &app,
            "POST",
            &format!("/testbeds/{id}/run-tests"),
            Some(ALICE),
            Some(json!({"test_files": ["tests/test_missing.py"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "completed");
        let output = body["output"].as_str().unwrap_or_default();
        assert!(output.contains(">>>>> Start Test Output"));
        assert!(output.contains(">>>>> End Test Output"));
    }

    #[tokio::test]
    async fn unknown_instance_is_not_found() {
        let app = app();
        let id = create(&app, "astropy__astropy-12907").await;
        let (status, _) = call(
            &app,
            "POST",
            &format!("/testbeds/{id}/run-evaluation"),
            Some(ALICE),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn foreign_testbed_is_not_found() {
        let app = app();
        let id = create(&app, "psf__requests-2317").await;
        let (status, _) = call(
            &app,
            "POST",
            &format!("/testbeds/{id}/run-tests"),
            Some(BOB),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let app = app();
        let id = create(&app, "psf__requests-2317").await;
        let req = axum::http::Request::builder()
            .method("POST")
            .uri(format!("/testbeds/{id}/run-tests"))
            .header("x-api-key", ALICE)
            .body(axum::body::Body::from("{not json"))
            .expect("request");
        let resp = tower::ServiceExt::oneshot(app.router.clone(), req)
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
