//! In-process cluster used for local development and tests.
//!
//! Mirrors the conditional semantics of the real API: creating an existing name is
//! a conflict, deleting a missing name reports `false`. Each job gets one pod whose
//! phase and container readiness can be driven from the outside.

use crate::cluster::manifests::{SIDECAR_CONTAINER, TESTBED_CONTAINER};
use crate::cluster::{
    ClusterApi, ContainerInfo, JobInfo, JobRequest, Labels, PodInfo, ServiceInfo, ServiceRequest,
    matches_selector,
};
use crate::models::{ContainerState, ContainerStatus};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct InMemoryOptions {
    /// New pods start `Running` with both containers ready.
    pub auto_ready: bool,
    /// Address handed out as the LoadBalancer ingress of every service.
    pub external_ip: Option<String>,
}

impl Default for InMemoryOptions {
    fn default() -> Self {
        Self {
            auto_ready: true,
            external_ip: Some("127.0.0.1".to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    jobs: BTreeMap<String, JobInfo>,
    requests: BTreeMap<String, JobRequest>,
    services: BTreeMap<String, ServiceInfo>,
    pods: BTreeMap<String, PodInfo>,
    failing_service_creates: u32,
}

#[derive(Debug, Clone)]
pub struct InMemoryCluster {
    namespace: String,
    options: InMemoryOptions,
    state: Arc<RwLock<ClusterState>>,
}

impl InMemoryCluster {
    pub fn new(namespace: impl Into<String>, options: InMemoryOptions) -> Self {
        Self {
            namespace: namespace.into(),
            options,
            state: Arc::new(RwLock::new(ClusterState::default())),
        }
    }

    fn container(name: &str, ready: bool) -> ContainerInfo {
        ContainerInfo {
            name: name.to_string(),
            status: ContainerStatus {
                ready,
                started: ready,
                restart_count: 0,
                state: if ready {
                    ContainerState::Running
                } else {
                    ContainerState::Waiting
                },
                reason: (!ready).then(|| "ContainerCreating".to_string()),
                message: None,
            },
        }
    }

    fn pod_name(job: &str) -> String {
        format!("{job}-pod")
    }

    /// Drive the pod of `job` to `phase` with the given container readiness.
    pub async fn set_pod_state(&self, job: &str, phase: &str, testbed_ready: bool, sidecar_ready: bool) {
        let mut st = self.state.write().await;
        if let Some(pod) = st.pods.get_mut(&Self::pod_name(job)) {
            pod.phase = phase.to_string();
            pod.containers = vec![
                Self::container(TESTBED_CONTAINER, testbed_ready),
                Self::container(SIDECAR_CONTAINER, sidecar_ready),
            ];
        }
        if phase == "Failed" {
            if let Some(j) = st.jobs.get_mut(job) {
                j.failed = 1;
                j.active = 0;
            }
        }
    }

    /// Make the next `n` service creations fail with a backend error.
    pub async fn fail_service_creates(&self, n: u32) {
        self.state.write().await.failing_service_creates = n;
    }

    /// Drop a service behind the orchestrator's back.
    pub async fn remove_service(&self, name: &str) -> bool {
        self.state.write().await.services.remove(name).is_some()
    }

    pub async fn job_names(&self) -> Vec<String> {
        self.state.read().await.jobs.keys().cloned().collect()
    }

    pub async fn service_names(&self) -> Vec<String> {
        self.state.read().await.services.keys().cloned().collect()
    }

    pub async fn job_request(&self, name: &str) -> Option<JobRequest> {
        self.state.read().await.requests.get(name).cloned()
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn create_job(&self, request: &JobRequest) -> Result<JobInfo> {
        let mut st = self.state.write().await;
        if st.jobs.contains_key(&request.name) {
            return Err(Error::Conflict(format!("job {} already exists", request.name)));
        }
        let job = JobInfo {
            name: request.name.clone(),
            labels: request.labels.clone(),
            created_at: Some(Utc::now()),
            active: 1,
            failed: 0,
        };
        let ready = self.options.auto_ready;
        let mut pod_labels = request.labels.clone();
        pod_labels.insert("job-name".to_string(), request.name.clone());
        st.pods.insert(
            Self::pod_name(&request.name),
            PodInfo {
                name: Self::pod_name(&request.name),
                labels: pod_labels,
                phase: if ready { "Running" } else { "Pending" }.to_string(),
                containers: vec![
                    Self::container(TESTBED_CONTAINER, ready),
                    Self::container(SIDECAR_CONTAINER, ready),
                ],
            },
        );
        st.jobs.insert(request.name.clone(), job.clone());
        st.requests.insert(request.name.clone(), request.clone());
        Ok(job)
    }

    async fn get_job(&self, name: &str) -> Result<Option<JobInfo>> {
        Ok(self.state.read().await.jobs.get(name).cloned())
    }

    async fn list_jobs(&self, selector: &Labels) -> Result<Vec<JobInfo>> {
        Ok(self
            .state
            .read()
            .await
            .jobs
            .values()
            .filter(|j| matches_selector(&j.labels, selector))
            .cloned()
            .collect())
    }

    async fn delete_job(&self, name: &str) -> Result<bool> {
        let mut st = self.state.write().await;
        st.pods.remove(&Self::pod_name(name));
        st.requests.remove(name);
        Ok(st.jobs.remove(name).is_some())
    }

    async fn create_service(&self, request: &ServiceRequest) -> Result<ServiceInfo> {
        let mut st = self.state.write().await;
        if st.failing_service_creates > 0 {
            st.failing_service_creates -= 1;
            return Err(Error::BackendMessage(format!(
                "service {} rejected by admission",
                request.name
            )));
        }
        if st.services.contains_key(&request.name) {
            return Err(Error::Conflict(format!("service {} already exists", request.name)));
        }
        let svc = ServiceInfo {
            name: request.name.clone(),
            labels: request.labels.clone(),
            cluster_ip: Some("10.0.0.1".to_string()),
            external_ip: if request.expose_externally {
                self.options.external_ip.clone()
            } else {
                None
            },
            port: request.port,
        };
        st.services.insert(request.name.clone(), svc.clone());
        Ok(svc)
    }

    async fn get_service(&self, name: &str) -> Result<Option<ServiceInfo>> {
        Ok(self.state.read().await.services.get(name).cloned())
    }

    async fn list_services(&self, selector: &Labels) -> Result<Vec<ServiceInfo>> {
        Ok(self
            .state
            .read()
            .await
            .services
            .values()
            .filter(|s| matches_selector(&s.labels, selector))
            .cloned()
            .collect())
    }

    async fn delete_service(&self, name: &str) -> Result<bool> {
        Ok(self.state.write().await.services.remove(name).is_some())
    }

    async fn list_pods(&self, selector: &Labels) -> Result<Vec<PodInfo>> {
        Ok(self
            .state
            .read()
            .await
            .pods
            .values()
            .filter(|p| matches_selector(&p.labels, selector))
            .cloned()
            .collect())
    }
}
