//! Sandbox agent: the execution service of one testbed over HTTP. Runs as the
//! sidecar next to the testbed container and is reached only from the cluster.

use crate::error::ApiError;
use axum::Extension;
use axum::Json;
use axum::Router;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::routing::get;
use std::net::SocketAddr;
use std::time::Duration;
use testbeds_core::exec::ExecutionChannel as _;
use testbeds_core::exec::service::ExecutionService;
use testbeds_core::protocol::models::{
    ExecRequest, ExecStatusQuery, ExecSubmitted, ExecutionStatus, FileContent, FileQuery,
    HealthStatus,
};
use tower_http::request_id::{MakeRequestUuid, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router(service: ExecutionService) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/exec", get(exec_status).post(exec))
        .route("/file", get(read_file).post(write_file))
        .layer(Extension(service))
        .layer(SetRequestIdLayer::new(
            axum::http::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(TraceLayer::new_for_http())
}

#[tracing::instrument(level = "info", skip_all, fields(%addr))]
pub async fn serve(addr: SocketAddr, service: ExecutionService) -> anyhow::Result<()> {
    let app = router(service);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("sandbox agent listening");
    axum::serve(listener, app).await?;
    Ok(())
}

pub async fn health(Extension(service): Extension<ExecutionService>) -> (StatusCode, Json<HealthStatus>) {
    if service.is_healthy().await {
        (StatusCode::OK, Json(HealthStatus::ok()))
    } else {
        tracing::warn!(channel = service.channel().name(), "execution channel unreachable");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthStatus::error("execution channel unreachable")),
        )
    }
}

pub async fn exec(
    Extension(service): Extension<ExecutionService>,
    Json(req): Json<ExecRequest>,
) -> Result<Json<ExecSubmitted>, ApiError> {
    let timeout = req.timeout.map(Duration::from_secs);
    Ok(Json(
        service
            .submit_with_id(&req.commands, timeout, req.execution_id.as_deref())
            .await?,
    ))
}

pub async fn exec_status(
    Extension(service): Extension<ExecutionService>,
    Query(q): Query<ExecStatusQuery>,
) -> Result<Json<ExecutionStatus>, ApiError> {
    Ok(Json(service.status(q.execution_id.as_deref()).await?))
}

pub async fn read_file(
    Extension(service): Extension<ExecutionService>,
    Query(q): Query<FileQuery>,
) -> Result<Json<FileContent>, ApiError> {
    let bytes = service.read_file(&q.file_path).await?;
    Ok(Json(FileContent::encode(q.file_path, &bytes)))
}

pub async fn write_file(
    Extension(service): Extension<ExecutionService>,
    Json(body): Json<FileContent>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let bytes = body.decode()?;
    service.write_file(&body.file_path, &bytes).await?;
    Ok(Json(serde_json::json!({ "file_path": body.file_path, "bytes": bytes.len() })))
}
