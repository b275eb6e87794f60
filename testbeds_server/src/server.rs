use crate::auth::{ApiKeys, ApiKeysExt};
use crate::routes;
use axum::routing::get;
use axum::{Extension, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use testbeds_core::dataset::{IgnoredTests, InstanceStore};
use testbeds_core::evaluation::PipelineConfig;
use testbeds_core::orchestrator::TestbedManager;
use testbeds_core::readiness::ReadinessMonitor;
use testbeds_core::swebench::ParserRegistry;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TestbedManager>,
    pub instances: Arc<InstanceStore>,
    pub ignored: Arc<IgnoredTests>,
    pub parsers: Arc<ParserRegistry>,
    pub pipeline: PipelineConfig,
    /// Bound on waiting for a testbed before running tests on it.
    pub readiness: ReadinessMonitor,
    pub started_at: Instant,
}

impl AppState {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(
        manager: Arc<TestbedManager>,
        instances: Arc<InstanceStore>,
        ignored: Arc<IgnoredTests>,
        pipeline: PipelineConfig,
        readiness: ReadinessMonitor,
    ) -> Self {
        Self {
            manager,
            instances,
            ignored,
            parsers: Arc::new(ParserRegistry::swebench()),
            pipeline,
            readiness,
            started_at: Instant::now(),
        }
    }
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router(state: AppState, api_keys: ApiKeys) -> Router {
    let state = Arc::new(state);
    let api_keys = ApiKeysExt(Arc::new(api_keys));

    Router::new()
        .merge(routes::router())
        .route("/health", get(routes::health::get_health))
        .layer(Extension(state))
        .layer(Extension(api_keys))
        .layer(SetRequestIdLayer::new(
            axum::http::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

#[tracing::instrument(level = "info", skip_all, fields(%addr))]
pub async fn serve(addr: SocketAddr, state: AppState, api_keys: ApiKeys) -> anyhow::Result<()> {
    let app = router(state, api_keys);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("control plane listening");
    axum::serve(listener, app).await?;
    Ok(())
}
