use crate::auth::Owner;
use crate::error::ApiError;
use crate::server::AppState;
use axum::Extension;
use axum::Json;
use axum::extract::Path;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use testbeds_core::models::{TestbedDetailed, TestbedSummary};

#[derive(Debug, Deserialize)]
pub struct CreateTestbedRequest {
    #[serde(default)]
    pub instance_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route(
            "/testbeds",
            get(list_testbeds)
                .post(get_or_create_testbed)
                .delete(delete_all_testbeds),
        )
        .route("/testbeds/{id}", get(get_testbed).delete(delete_testbed))
        .route("/cleanup", post(cleanup))
}

#[tracing::instrument(level = "debug", skip_all, fields(owner = %owner))]
pub async fn list_testbeds(
    Owner(owner): Owner,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<TestbedSummary>>, ApiError> {
    Ok(Json(state.manager.list(&owner).await?))
}

#[tracing::instrument(level = "debug", skip_all, fields(owner = %owner))]
pub async fn get_or_create_testbed(
    Owner(owner): Owner,
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<CreateTestbedRequest>,
) -> Result<Json<TestbedSummary>, ApiError> {
    let instance_id = req
        .instance_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::InvalidInput("Missing instance_id parameter".to_string()))?;
    Ok(Json(state.manager.find_or_create(instance_id, &owner).await?))
}

#[tracing::instrument(level = "debug", skip_all, fields(owner = %owner, testbed_id = %id))]
pub async fn get_testbed(
    Owner(owner): Owner,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TestbedDetailed>, ApiError> {
    let Some(testbed) = state.manager.get(&id, &owner).await? else {
        return Err(testbeds_core::Error::NotFound("Testbed not found".to_string()).into());
    };
    Ok(Json(testbed))
}

#[tracing::instrument(level = "debug", skip_all, fields(owner = %owner, testbed_id = %id))]
pub async fn delete_testbed(
    Owner(owner): Owner,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.manager.delete(&id, &owner).await?;
    Ok(Json(MessageResponse {
        message: "Testbed killed".to_string(),
        count: None,
    }))
}

#[tracing::instrument(level = "debug", skip_all, fields(owner = %owner))]
pub async fn delete_all_testbeds(
    Owner(owner): Owner,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<MessageResponse>, ApiError> {
    let deleted = state.manager.delete_all(&owner).await?;
    Ok(Json(MessageResponse {
        message: format!("Deleted {deleted} testbeds"),
        count: Some(deleted),
    }))
}

#[tracing::instrument(level = "debug", skip_all, fields(owner = %owner))]
pub async fn cleanup(
    Owner(owner): Owner,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<MessageResponse>, ApiError> {
    let deleted = state.manager.cleanup(&owner).await?;
    Ok(Json(MessageResponse {
        message: format!("Cleaned up {deleted} resources"),
        count: Some(deleted),
    }))
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support::{ALICE, BOB, app, call};
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn unknown_key_is_rejected() {
        let app = app();
        let (status, body) = call(&app, "GET", "/testbeds", Some("wrong"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Invalid API key");

        let (status, _) = call(&app, "GET", "/testbeds", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_is_idempotent_per_owner() {
        let app = app();
        let body = json!({"instance_id": "psf__requests-2317"});
        let (status, first) = call(&app, "POST", "/testbeds", Some(ALICE), Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        let (_, second) = call(&app, "POST", "/testbeds", Some(ALICE), Some(body.clone())).await;
        assert_eq!(first["testbed_id"], second["testbed_id"]);

        let (_, other) = call(&app, "POST", "/testbeds", Some(BOB), Some(body)).await;
        assert_ne!(first["testbed_id"], other["testbed_id"]);

        let (_, listed) = call(&app, "GET", "/testbeds", Some(ALICE), None).await;
        assert_eq!(listed.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn missing_instance_id_is_bad_request() {
        let app = app();
        let (status, body) = call(&app, "POST", "/testbeds", Some(ALICE), Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap_or_default().contains("instance_id"));
    }

    #[tokio::test]
    async fn other_owners_see_not_found() {
        let app = app();
        let (_, created) = call(
            &app,
            "POST",
            "/testbeds",
            Some(ALICE),
            Some(json!({"instance_id": "psf__requests-2317"})),
        )
        .await;
        let id = created["testbed_id"].as_str().expect("id").to_string();

        let (status, detail) = call(&app, "GET", &format!("/testbeds/{id}"), Some(ALICE), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["instance_id"], "psf__requests-2317");

        let (status, _) = call(&app, "GET", &format!("/testbeds/{id}"), Some(BOB), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // Bob's delete is a no-op on Alice's testbed.
        let (status, _) = call(&app, "DELETE", &format!("/testbeds/{id}"), Some(BOB), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(app.cluster.job_names().await, vec![id]);
    }

    #[tokio::test]
    async fn delete_all_reports_count() {
        let app = app();
        for key in [ALICE, BOB] {
            call(
                &app,
                "POST",
                "/testbeds",
                Some(key),
                Some(json!({"instance_id": "psf__requests-2317"})),
            )
            .await;
        }
        let (status, body) = call(&app, "DELETE", "/testbeds", Some(ALICE), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Deleted 1 testbeds");
        assert_eq!(app.cluster.job_names().await.len(), 1);

        let (status, body) = call(&app, "POST", "/cleanup", Some(BOB), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["count"].as_u64().unwrap_or_default() >= 1);
        assert!(app.cluster.job_names().await.is_empty());
    }
}
