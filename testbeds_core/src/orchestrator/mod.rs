//! Sandbox orchestration: one testbed per (instance, owner), backed by a cluster
//! job plus a service that exposes its execution agent.

pub mod manager;
pub mod profiles;

pub use manager::TestbedManager;

use crate::cluster::Labels;
use crate::exec::ExecutionChannel;
use crate::exec::service::ExecutionService;
use crate::protocol::http::HttpTransport;
use crate::protocol::transport::{LocalTransport, SandboxTransport};
use crate::retry::RetryPolicy;
use crate::Result;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const LABEL_APP: &str = "app";
pub const LABEL_APP_VALUE: &str = "testbed";
pub const LABEL_TESTBED_ID: &str = "testbed-id";
pub const LABEL_INSTANCE_ID: &str = "instance-id";
pub const LABEL_USER_ID: &str = "user-id";
/// Set on pods by the job controller.
pub const LABEL_JOB_NAME: &str = "job-name";

const ID_SUFFIX_LEN: usize = 5;
const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Running inside the cluster: services are ClusterIP and addressed by DNS.
    pub in_cluster: bool,
    /// Testbed image is `{image_prefix}{instance_id}`.
    pub image_prefix: String,
    pub sidecar_image: String,
    pub agent_port: u16,
    /// Bound on waiting for a freshly created job to become visible.
    pub create_timeout: Duration,
    pub create_poll_interval: Duration,
    /// Bound on a single health probe against the agent.
    pub health_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            in_cluster: false,
            image_prefix: "moatless.azurecr.io/sweb.eval.x86_64.".to_string(),
            sidecar_image: "aorwall/moatless-testbed-sidecar:latest".to_string(),
            agent_port: 8000,
            create_timeout: Duration::from_secs(60),
            create_poll_interval: Duration::from_millis(100),
            health_timeout: Duration::from_secs(5),
        }
    }
}

impl OrchestratorConfig {
    pub fn testbed_image(&self, instance_id: &str) -> String {
        format!("{}{}", self.image_prefix, instance_id)
    }
}

/// `django__django-11099` becomes `django-django-11099-testbed-x7k2p`.
pub fn generate_testbed_id(instance_id: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    let name = instance_id.replace("__", "-").to_lowercase().replace('_', "-");
    format!("{name}-testbed-{suffix}")
}

pub fn owner_selector(owner: &str) -> Labels {
    let mut labels = Labels::new();
    labels.insert(LABEL_APP.to_string(), LABEL_APP_VALUE.to_string());
    labels.insert(LABEL_USER_ID.to_string(), owner.to_string());
    labels
}

pub fn pair_selector(instance_id: &str, owner: &str) -> Labels {
    let mut labels = owner_selector(owner);
    labels.insert(LABEL_INSTANCE_ID.to_string(), instance_id.to_string());
    labels
}

pub fn testbed_labels(testbed_id: &str, instance_id: &str, owner: &str) -> Labels {
    let mut labels = pair_selector(instance_id, owner);
    labels.insert(LABEL_TESTBED_ID.to_string(), testbed_id.to_string());
    labels
}

/// Opens a protocol transport to a sandbox agent at a resolved address.
pub trait TransportFactory: Send + Sync {
    fn connect(&self, testbed_id: &str, base_url: &str) -> Result<Arc<dyn SandboxTransport>>;
}

#[derive(Debug, Clone)]
pub struct HttpTransportFactory {
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
}

impl Default for HttpTransportFactory {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl TransportFactory for HttpTransportFactory {
    fn connect(&self, _testbed_id: &str, base_url: &str) -> Result<Arc<dyn SandboxTransport>> {
        let transport = HttpTransport::new(base_url, None, self.retry, self.request_timeout)?;
        Ok(Arc::new(transport))
    }
}

/// Gives every testbed its own in-process agent over a shared channel.
/// Used with the in-memory cluster.
#[derive(Clone)]
pub struct LocalTransportFactory {
    channel: Arc<dyn ExecutionChannel>,
    default_timeout: Duration,
    services: Arc<Mutex<HashMap<String, ExecutionService>>>,
}

impl LocalTransportFactory {
    pub fn new(channel: Arc<dyn ExecutionChannel>, default_timeout: Duration) -> Self {
        Self {
            channel,
            default_timeout,
            services: Arc::default(),
        }
    }

    fn service_for(&self, testbed_id: &str) -> ExecutionService {
        let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());
        services
            .entry(testbed_id.to_string())
            .or_insert_with(|| ExecutionService::new(self.channel.clone(), self.default_timeout))
            .clone()
    }
}

impl TransportFactory for LocalTransportFactory {
    fn connect(&self, testbed_id: &str, _base_url: &str) -> Result<Arc<dyn SandboxTransport>> {
        Ok(Arc::new(LocalTransport::new(self.service_for(testbed_id))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn testbed_id_is_dns_safe() {
        let id = generate_testbed_id("django__django_11099");
        let (prefix, suffix) = id.rsplit_once("-testbed-").expect("marker");
        assert_eq!(prefix, "django-django-11099");
        assert_eq!(suffix.len(), ID_SUFFIX_LEN);
        assert!(suffix.bytes().all(|b| ID_ALPHABET.contains(&b)));
    }

    #[test]
    fn ids_differ_between_calls() {
        let a = generate_testbed_id("psf__requests-2317");
        let b = generate_testbed_id("psf__requests-2317");
        // 36^5 possibilities; a collision here means the suffix is not random.
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn local_testbeds_do_not_share_a_slot() {
        let channel = crate::exec::service::tests::ScriptedChannel::default()
            .with_delay(Duration::from_millis(300));
        let factory = LocalTransportFactory::new(Arc::new(channel), Duration::from_secs(5));
        let a = factory.connect("tb-a", "local").expect("tb-a");
        let b = factory.connect("tb-b", "local").expect("tb-b");
        let request = |id: &str| crate::protocol::models::ExecRequest {
            commands: vec!["sleep 1".to_string()],
            timeout: None,
            execution_id: Some(id.to_string()),
        };

        a.submit(&request("run-a")).await.expect("tb-a runs");
        b.submit(&request("run-b")).await.expect("tb-b is not busy");

        // Reconnecting reaches the same agent, so the slot is still taken.
        let again = factory.connect("tb-a", "local").expect("tb-a again");
        let err = again.submit(&request("run-c")).await.expect_err("tb-a is busy");
        assert!(matches!(err, crate::Error::Busy(_)));
    }

    #[test]
    fn labels_nest() {
        let labels = testbed_labels("tb", "inst", "alice");
        assert_eq!(labels.get(LABEL_APP).map(String::as_str), Some("testbed"));
        assert_eq!(labels.get(LABEL_TESTBED_ID).map(String::as_str), Some("tb"));
        assert!(crate::cluster::matches_selector(&labels, &pair_selector("inst", "alice")));
        assert!(!crate::cluster::matches_selector(&labels, &owner_selector("bob")));
    }
}
