use axum::Router;

pub mod evaluation;
pub mod health;
pub mod proxy;
pub mod testbeds;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> Router {
    Router::new()
        .merge(testbeds::router())
        .merge(proxy::router())
        .merge(evaluation::router())
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::auth::ApiKeys;
    use crate::server::{AppState, router};
    use axum::Router;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, Response};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use testbeds_core::cluster::memory::{InMemoryCluster, InMemoryOptions};
    use testbeds_core::dataset::{IgnoredTests, InstanceStore};
    use testbeds_core::evaluation::PipelineConfig;
    use testbeds_core::exec::shell::ShellChannel;
    use testbeds_core::orchestrator::{LocalTransportFactory, OrchestratorConfig, TestbedManager};
    use testbeds_core::readiness::ReadinessMonitor;
    use testbeds_core::TaskInstance;
    use tower::ServiceExt;

    pub const ALICE: &str = "key-alice";
    pub const BOB: &str = "key-bob";

    pub struct TestApp {
        pub router: Router,
        pub cluster: InMemoryCluster,
        pub _workdir: tempfile::TempDir,
    }

    pub fn instance() -> TaskInstance {
        TaskInstance {
            instance_id: "psf__requests-2317".into(),
            repo: "psf/requests".into(),
            base_commit: "abc123".into(),
            patch: "diff --git a/requests/sessions.py b/requests/sessions.py\n".into(),
            test_patch: String::new(),
            version: "2.4".into(),
            environment_setup_commit: None,
            problem_statement: None,
            fail_to_pass: vec!["tests/test_api.py::test_fix".into()],
            pass_to_pass: vec![],
        }
    }

    /// Control plane over an in-memory cluster whose testbeds each get a
    /// local shell agent rooted in one scratch directory.
    pub fn app() -> TestApp {
        let workdir = tempfile::tempdir().expect("tempdir");
        let cluster = InMemoryCluster::new("testbeds", InMemoryOptions::default());
        let transports = LocalTransportFactory::new(
            Arc::new(ShellChannel::new(workdir.path())),
            Duration::from_secs(30),
        );
        let manager = TestbedManager::new(
            Arc::new(cluster.clone()),
            Arc::new(transports),
            OrchestratorConfig::default(),
        );
        let state = AppState::new(
            Arc::new(manager),
            Arc::new(InstanceStore::new([instance()])),
            Arc::new(IgnoredTests::default()),
            PipelineConfig {
                shared_dir: "shared".to_string(),
                ..PipelineConfig::default()
            },
            ReadinessMonitor::new(Duration::from_millis(10), Duration::from_secs(5)),
        );
        let keys = ApiKeys::new(HashMap::from([
            (ALICE.to_string(), "alice".to_string()),
            (BOB.to_string(), "bob".to_string()),
        ]));
        TestApp {
            router: router(state, keys),
            cluster,
            _workdir: workdir,
        }
    }

    pub async fn call(
        app: &TestApp,
        method: &str,
        uri: &str,
        key: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (axum::http::StatusCode, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            req = req.header("x-api-key", key);
        }
        let req = match body {
            Some(json) => req
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => req.body(Body::empty()),
        }
        .expect("request");
        let resp: Response<Body> = app.router.clone().oneshot(req).await.expect("response");
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, json)
    }
}
