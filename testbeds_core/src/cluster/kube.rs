//! Kubernetes backend over the REST API.
//!
//! Speaks plain JSON to the API server with a bearer token, the same way the
//! service-account credentials are meant to be used from inside a pod. Only the
//! handful of Job/Service/Pod calls the orchestrator needs are implemented.

use crate::cluster::manifests::{foreground_delete_options, job_manifest, service_manifest};
use crate::cluster::{
    ClusterApi, ContainerInfo, JobInfo, JobRequest, Labels, PodInfo, ServiceInfo, ServiceRequest,
    selector_string,
};
use crate::models::{ContainerState, ContainerStatus};
use crate::retry::RetryPolicy;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Connection settings for the API server.
#[derive(Debug, Clone)]
pub struct KubeConfig {
    pub api_url: String,
    pub token: Option<String>,
    pub ca_cert_path: Option<PathBuf>,
    pub namespace: String,
    /// Per-request timeout, independent of any caller deadline.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl KubeConfig {
    /// `KUBE_API_URL` (+ `KUBE_TOKEN`, `KUBE_CA_PATH`) wins; otherwise fall back to the
    /// in-cluster service account.
    pub fn from_env(namespace: &str) -> Result<Self> {
        let base = Self {
            api_url: String::new(),
            token: None,
            ca_cert_path: None,
            namespace: namespace.to_string(),
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        };

        if let Ok(api_url) = std::env::var("KUBE_API_URL") {
            return Ok(Self {
                api_url: api_url.trim_end_matches('/').to_string(),
                token: std::env::var("KUBE_TOKEN").ok().filter(|t| !t.trim().is_empty()),
                ca_cert_path: std::env::var("KUBE_CA_PATH").ok().map(PathBuf::from),
                ..base
            });
        }
        Self::in_cluster(base)
    }

    fn in_cluster(base: Self) -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            Error::InvalidInput(
                "neither KUBE_API_URL nor KUBERNETES_SERVICE_HOST is set".to_string(),
            )
        })?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let sa = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(sa.join("token"))?;
        Ok(Self {
            api_url: format!("https://{host}:{port}"),
            token: Some(token.trim().to_string()),
            ca_cert_path: Some(sa.join("ca.crt")),
            ..base
        })
    }
}

#[derive(Debug, Clone)]
pub struct KubeCluster {
    cfg: KubeConfig,
    http: Client,
}

impl KubeCluster {
    pub fn new(cfg: KubeConfig) -> Result<Self> {
        let mut builder = Client::builder().timeout(cfg.request_timeout);
        if let Some(path) = &cfg.ca_cert_path {
            let pem = std::fs::read(path)?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::backend("parse cluster CA certificate", e))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| Error::backend("build kubernetes http client", e))?;
        Ok(Self { cfg, http })
    }

    fn jobs_url(&self) -> String {
        format!(
            "{}/apis/batch/v1/namespaces/{}/jobs",
            self.cfg.api_url, self.cfg.namespace
        )
    }

    fn services_url(&self) -> String {
        format!("{}/api/v1/namespaces/{}/services", self.cfg.api_url, self.cfg.namespace)
    }

    fn pods_url(&self) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.cfg.api_url, self.cfg.namespace)
    }

    /// Issue one call with retry on transient failures. Returns `None` on 404.
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        query: Option<&Labels>,
        body: Option<&serde_json::Value>,
    ) -> Result<Option<T>> {
        let operation = format!("{method} {url}");
        let operation = operation.as_str();
        let method = &method;
        self.cfg
            .retry
            .run(operation, || async move {
                let mut req = self.http.request(method.clone(), url);
                if let Some(token) = &self.cfg.token {
                    req = req.bearer_auth(token);
                }
                if let Some(selector) = query {
                    req = req.query(&[("labelSelector", selector_string(selector))]);
                }
                if let Some(body) = body {
                    req = req.json(body);
                }
                let resp = req
                    .send()
                    .await
                    .map_err(|e| Error::from_reqwest(operation, e))?;

                let status = resp.status();
                if status == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                if status.is_success() {
                    return resp
                        .json::<T>()
                        .await
                        .map(Some)
                        .map_err(|e| Error::from_reqwest(operation, e));
                }
                let text = resp.text().await.unwrap_or_default();
                Err(match status {
                    StatusCode::CONFLICT => Error::Conflict(format!("{operation}: {text}")),
                    s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                        Error::transient_message(operation, format!("{s}: {text}"))
                    }
                    s => Error::BackendMessage(format!("{operation} failed ({s}): {text}")),
                })
            })
            .await
    }

    async fn delete(&self, url: &str) -> Result<bool> {
        let body = foreground_delete_options();
        let res: Option<serde_json::Value> =
            self.call(Method::DELETE, url, None, Some(&body)).await?;
        Ok(res.is_some())
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    fn namespace(&self) -> &str {
        &self.cfg.namespace
    }

    #[tracing::instrument(level = "info", skip(self, request), fields(job = %request.name))]
    async fn create_job(&self, request: &JobRequest) -> Result<JobInfo> {
        let manifest = job_manifest(request);
        let job: Option<K8sJob> = self
            .call(Method::POST, &self.jobs_url(), None, Some(&manifest))
            .await?;
        job.map(JobInfo::from)
            .ok_or_else(|| Error::BackendMessage("job create returned 404".to_string()))
    }

    async fn get_job(&self, name: &str) -> Result<Option<JobInfo>> {
        let url = format!("{}/{name}", self.jobs_url());
        let job: Option<K8sJob> = self.call(Method::GET, &url, None, None).await?;
        Ok(job.map(JobInfo::from))
    }

    async fn list_jobs(&self, selector: &Labels) -> Result<Vec<JobInfo>> {
        let list: Option<ObjectList<K8sJob>> = self
            .call(Method::GET, &self.jobs_url(), Some(selector), None)
            .await?;
        Ok(list
            .map(|l| l.items.into_iter().map(JobInfo::from).collect())
            .unwrap_or_default())
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn delete_job(&self, name: &str) -> Result<bool> {
        self.delete(&format!("{}/{name}", self.jobs_url())).await
    }

    #[tracing::instrument(level = "info", skip(self, request), fields(service = %request.name))]
    async fn create_service(&self, request: &ServiceRequest) -> Result<ServiceInfo> {
        let manifest = service_manifest(request);
        let svc: Option<K8sService> = self
            .call(Method::POST, &self.services_url(), None, Some(&manifest))
            .await?;
        svc.map(ServiceInfo::from)
            .ok_or_else(|| Error::BackendMessage("service create returned 404".to_string()))
    }

    async fn get_service(&self, name: &str) -> Result<Option<ServiceInfo>> {
        let url = format!("{}/{name}", self.services_url());
        let svc: Option<K8sService> = self.call(Method::GET, &url, None, None).await?;
        Ok(svc.map(ServiceInfo::from))
    }

    async fn list_services(&self, selector: &Labels) -> Result<Vec<ServiceInfo>> {
        let list: Option<ObjectList<K8sService>> = self
            .call(Method::GET, &self.services_url(), Some(selector), None)
            .await?;
        Ok(list
            .map(|l| l.items.into_iter().map(ServiceInfo::from).collect())
            .unwrap_or_default())
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn delete_service(&self, name: &str) -> Result<bool> {
        self.delete(&format!("{}/{name}", self.services_url())).await
    }

    async fn list_pods(&self, selector: &Labels) -> Result<Vec<PodInfo>> {
        let list: Option<ObjectList<K8sPod>> = self
            .call(Method::GET, &self.pods_url(), Some(selector), None)
            .await?;
        Ok(list
            .map(|l| l.items.into_iter().map(PodInfo::from).collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Wire types (subset of the Kubernetes object schema)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct ObjectList<T> {
    #[serde(default)]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    name: String,
    #[serde(default)]
    labels: Labels,
    #[serde(default)]
    creation_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct K8sJob {
    metadata: ObjectMeta,
    #[serde(default)]
    status: Option<K8sJobStatus>,
}

#[derive(Debug, Default, Deserialize)]
struct K8sJobStatus {
    #[serde(default)]
    active: Option<u32>,
    #[serde(default)]
    failed: Option<u32>,
}

impl From<K8sJob> for JobInfo {
    fn from(job: K8sJob) -> Self {
        let status = job.status.unwrap_or_default();
        Self {
            name: job.metadata.name,
            labels: job.metadata.labels,
            created_at: job.metadata.creation_timestamp,
            active: status.active.unwrap_or(0),
            failed: status.failed.unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
struct K8sService {
    metadata: ObjectMeta,
    #[serde(default)]
    spec: Option<K8sServiceSpec>,
    #[serde(default)]
    status: Option<K8sServiceStatus>,
}

#[derive(Debug, Deserialize)]
struct K8sServiceSpec {
    #[serde(rename = "clusterIP", default)]
    cluster_ip: Option<String>,
    #[serde(default)]
    ports: Vec<K8sServicePort>,
}

#[derive(Debug, Deserialize)]
struct K8sServicePort {
    port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct K8sServiceStatus {
    #[serde(default)]
    load_balancer: Option<K8sLoadBalancer>,
}

#[derive(Debug, Deserialize)]
struct K8sLoadBalancer {
    #[serde(default)]
    ingress: Vec<K8sIngress>,
}

#[derive(Debug, Deserialize)]
struct K8sIngress {
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    hostname: Option<String>,
}

impl From<K8sService> for ServiceInfo {
    fn from(svc: K8sService) -> Self {
        let (cluster_ip, port) = match svc.spec {
            Some(spec) => (
                spec.cluster_ip.filter(|ip| ip != "None"),
                spec.ports.first().map(|p| p.port).unwrap_or(0),
            ),
            None => (None, 0),
        };
        let external_ip = svc
            .status
            .and_then(|s| s.load_balancer)
            .and_then(|lb| lb.ingress.into_iter().next())
            .and_then(|i| i.ip.or(i.hostname));
        Self {
            name: svc.metadata.name,
            labels: svc.metadata.labels,
            cluster_ip,
            external_ip,
            port,
        }
    }
}

#[derive(Debug, Deserialize)]
struct K8sPod {
    metadata: ObjectMeta,
    #[serde(default)]
    status: Option<K8sPodStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct K8sPodStatus {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    container_statuses: Vec<K8sContainerStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct K8sContainerStatus {
    name: String,
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    started: Option<bool>,
    #[serde(default)]
    restart_count: u32,
    #[serde(default)]
    state: Option<K8sContainerState>,
}

#[derive(Debug, Deserialize)]
struct K8sContainerState {
    #[serde(default)]
    running: Option<serde_json::Value>,
    #[serde(default)]
    waiting: Option<K8sStateDetail>,
    #[serde(default)]
    terminated: Option<K8sStateDetail>,
}

#[derive(Debug, Deserialize)]
struct K8sStateDetail {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl From<K8sContainerStatus> for ContainerInfo {
    fn from(c: K8sContainerStatus) -> Self {
        let (state, detail) = match c.state {
            Some(K8sContainerState { running: Some(_), .. }) => (ContainerState::Running, None),
            Some(K8sContainerState { waiting: Some(d), .. }) => (ContainerState::Waiting, Some(d)),
            Some(K8sContainerState { terminated: Some(d), .. }) => {
                (ContainerState::Terminated, Some(d))
            }
            _ => (ContainerState::Unknown, None),
        };
        let (reason, message) = detail.map(|d| (d.reason, d.message)).unwrap_or_default();
        Self {
            name: c.name,
            status: ContainerStatus {
                ready: c.ready,
                started: c.started.unwrap_or(false),
                restart_count: c.restart_count,
                state,
                reason,
                message,
            },
        }
    }
}

impl From<K8sPod> for PodInfo {
    fn from(pod: K8sPod) -> Self {
        let (phase, containers) = match pod.status {
            Some(s) => (
                s.phase.unwrap_or_else(|| "Unknown".to_string()),
                s.container_statuses.into_iter().map(ContainerInfo::from).collect(),
            ),
            None => ("Unknown".to_string(), Vec::new()),
        };
        Self {
            name: pod.metadata.name,
            labels: pod.metadata.labels,
            phase,
            containers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_pod_with_waiting_sidecar() {
        let raw = serde_json::json!({
            "metadata": {"name": "tb-abc-x1", "labels": {"job-name": "tb-abc"}},
            "status": {
                "phase": "Running",
                "containerStatuses": [
                    {"name": "testbed", "ready": true, "started": true, "restartCount": 0,
                     "state": {"running": {"startedAt": "2024-01-01T00:00:00Z"}}},
                    {"name": "sidecar", "ready": false, "restartCount": 2,
                     "state": {"waiting": {"reason": "CrashLoopBackOff", "message": "back-off"}}}
                ]
            }
        });
        let pod: PodInfo = serde_json::from_value::<K8sPod>(raw).expect("decode").into();
        assert_eq!(pod.phase, "Running");
        let testbed = pod.container("testbed").expect("testbed");
        assert!(testbed.ready);
        assert_eq!(testbed.state, ContainerState::Running);
        let sidecar = pod.container("sidecar").expect("sidecar");
        assert_eq!(sidecar.state, ContainerState::Waiting);
        assert_eq!(sidecar.reason.as_deref(), Some("CrashLoopBackOff"));
        assert_eq!(sidecar.restart_count, 2);
    }

    #[test]
    fn decodes_job_lists() {
        let raw = serde_json::json!({
            "kind": "JobList",
            "items": [
                {"metadata": {"name": "tb-a", "labels": {"app": "testbed"},
                              "creationTimestamp": "2024-01-01T00:00:00Z"},
                 "status": {"active": 1}},
                {"metadata": {"name": "tb-b"}}
            ]
        });
        let list: ObjectList<K8sJob> = serde_json::from_value(raw).expect("decode");
        let jobs: Vec<JobInfo> = list.items.into_iter().map(JobInfo::from).collect();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].name, "tb-a");
        assert!(jobs[0].created_at.is_some());
        assert!(jobs[1].created_at.is_none());

        let empty: ObjectList<K8sPod> =
            serde_json::from_value(serde_json::json!({"kind": "PodList"})).expect("decode");
        assert!(empty.items.is_empty());
    }

    #[test]
    fn decodes_load_balancer_ingress() {
        let raw = serde_json::json!({
            "metadata": {"name": "tb-abc", "creationTimestamp": "2024-05-01T10:00:00Z"},
            "spec": {"clusterIP": "10.0.0.12", "ports": [{"port": 8000}]},
            "status": {"loadBalancer": {"ingress": [{"ip": "20.1.2.3"}]}}
        });
        let svc: ServiceInfo = serde_json::from_value::<K8sService>(raw).expect("decode").into();
        assert_eq!(svc.cluster_ip.as_deref(), Some("10.0.0.12"));
        assert_eq!(svc.external_ip.as_deref(), Some("20.1.2.3"));
        assert_eq!(svc.port, 8000);
    }

    #[test]
    fn decodes_job_status_counts() {
        let raw = serde_json::json!({
            "metadata": {"name": "tb-abc", "labels": {"user-id": "u1"}},
            "status": {"failed": 1}
        });
        let job: JobInfo = serde_json::from_value::<K8sJob>(raw).expect("decode").into();
        assert_eq!(job.failed, 1);
        assert_eq!(job.active, 0);
        assert_eq!(job.labels.get("user-id").map(String::as_str), Some("u1"));
    }
}
