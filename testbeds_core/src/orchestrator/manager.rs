use super::{
    LABEL_INSTANCE_ID, LABEL_JOB_NAME, LABEL_USER_ID, OrchestratorConfig, TransportFactory,
    generate_testbed_id, owner_selector, pair_selector, testbed_labels,
};
use crate::cluster::manifests::{SIDECAR_CONTAINER, TESTBED_CONTAINER};
use crate::cluster::{
    ClusterApi, JobInfo, JobRequest, Labels, ResourceProfile, ServiceInfo, ServiceRequest,
};
use crate::models::{
    ContainerStatus, TestbedDetailed, TestbedState, TestbedStatusDetailed, TestbedStatusSummary,
    TestbedSummary,
};
use crate::protocol::client::TestbedClient;
use crate::readiness::{InfraSnapshot, ReadinessMonitor, ReadinessProbe, ReadinessReport};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::sync::Arc;
use tokio::time::Instant;

const POD_RUNNING: &str = "Running";
const POD_FAILED: &str = "Failed";
const POD_UNKNOWN: &str = "Unknown";

/// Combine pod phase, container readiness, endpoint presence and (optionally) an
/// application health probe into one ranked state.
pub fn derive_state(
    status: Option<&TestbedStatusDetailed>,
    endpoint_ready: bool,
    healthy: bool,
) -> TestbedState {
    let Some(status) = status else {
        return TestbedState::NotFound;
    };
    let infra_ready = status.pod_phase == POD_RUNNING
        && status.testbed.ready
        && status.sidecar.ready
        && endpoint_ready;
    match (infra_ready, healthy) {
        (true, true) => TestbedState::RunningHealthy,
        (true, false) => TestbedState::RunningUnverified,
        _ => TestbedState::Pending,
    }
}

fn unknown_status() -> TestbedStatusSummary {
    TestbedStatusSummary {
        pod_phase: POD_UNKNOWN.to_string(),
        testbed_ready: false,
        sidecar_ready: false,
    }
}

/// Oldest first; jobs without a creation timestamp sort last, name breaks ties.
fn age_key(job: &JobInfo) -> (bool, Option<DateTime<Utc>>, &str) {
    (job.created_at.is_none(), job.created_at, job.name.as_str())
}

fn is_owned_by(labels: &Labels, owner: &str) -> bool {
    labels.get(LABEL_USER_ID).map(String::as_str) == Some(owner)
}

fn instance_of(job: &JobInfo) -> String {
    job.labels
        .get(LABEL_INSTANCE_ID)
        .cloned()
        .unwrap_or_else(|| "unknown".to_string())
}

/// Creates, finds, reuses and deletes testbeds on behalf of owners.
///
/// Holds no locks over cluster resources: the cluster's conflict-on-create and
/// idempotent delete are the only serialization points.
pub struct TestbedManager {
    cluster: Arc<dyn ClusterApi>,
    transports: Arc<dyn TransportFactory>,
    config: OrchestratorConfig,
}

impl TestbedManager {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        transports: Arc<dyn TransportFactory>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            cluster,
            transports,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn namespace(&self) -> &str {
        self.cluster.namespace()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn list(&self, owner: &str) -> Result<Vec<TestbedSummary>> {
        let mut jobs = self.cluster.list_jobs(&owner_selector(owner)).await?;
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        let mut out = Vec::with_capacity(jobs.len());
        for job in jobs {
            let status = self
                .pod_status(&job.name)
                .await?
                .map(|s| s.summary())
                .unwrap_or_else(unknown_status);
            out.push(TestbedSummary {
                testbed_id: job.name.clone(),
                instance_id: instance_of(&job),
                status,
            });
        }
        Ok(out)
    }

    /// Reuse the owner's live testbed for the instance, or create one.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn find_or_create(&self, instance_id: &str, owner: &str) -> Result<TestbedSummary> {
        if let Some(existing) = self.find_reusable(instance_id, owner).await? {
            tracing::info!(testbed_id = %existing.testbed_id, "reusing existing testbed");
            return Ok(existing);
        }
        match self.create(instance_id, owner).await {
            Err(Error::Conflict(msg)) => {
                // A concurrent caller won the race; hand back its testbed.
                tracing::info!(reason = %msg, "lost creation race, looking up winner");
                self.find_reusable(instance_id, owner)
                    .await?
                    .ok_or(Error::Conflict(msg))
            }
            other => other,
        }
    }

    /// Oldest non-failed testbed for the pair. Failed ones are deleted on the way.
    async fn find_reusable(&self, instance_id: &str, owner: &str) -> Result<Option<TestbedSummary>> {
        let mut jobs = self
            .cluster
            .list_jobs(&pair_selector(instance_id, owner))
            .await?;
        jobs.sort_by(|a, b| age_key(a).cmp(&age_key(b)));
        for job in jobs {
            let status = self.pod_status(&job.name).await?;
            let failed =
                job.failed > 0 || status.as_ref().is_some_and(|s| s.pod_phase == POD_FAILED);
            if failed {
                tracing::warn!(testbed_id = %job.name, "testbed failed, deleting before reuse");
                if let Err(e) = self.delete_resources(&job.name).await {
                    tracing::error!(testbed_id = %job.name, error = %e, "failed to delete failed testbed");
                }
                continue;
            }
            return Ok(Some(TestbedSummary {
                testbed_id: job.name.clone(),
                instance_id: instance_of(&job),
                status: status.map(|s| s.summary()).unwrap_or_else(unknown_status),
            }));
        }
        Ok(None)
    }

    /// Create a job and its service. A service failure removes the job again, and
    /// a newer duplicate for the same pair removes itself and reports a conflict.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn create(&self, instance_id: &str, owner: &str) -> Result<TestbedSummary> {
        if instance_id.trim().is_empty() {
            return Err(Error::InvalidInput("instance_id is required".to_string()));
        }
        let testbed_id = generate_testbed_id(instance_id);
        let labels = testbed_labels(&testbed_id, instance_id, owner);

        let job = JobRequest {
            name: testbed_id.clone(),
            labels: labels.clone(),
            testbed_image: self.config.testbed_image(instance_id),
            sidecar_image: self.config.sidecar_image.clone(),
            resources: ResourceProfile::for_instance(instance_id),
            agent_port: self.config.agent_port,
        };
        self.cluster.create_job(&job).await?;

        if let Err(e) = self.create_service(&testbed_id, &labels).await {
            tracing::error!(testbed_id = %testbed_id, error = %e, "service creation failed, removing job");
            if let Err(cleanup) = self.cluster.delete_job(&testbed_id).await {
                tracing::error!(testbed_id = %testbed_id, error = %cleanup, "compensating job delete failed");
            }
            return Err(e);
        }

        let created = match self.wait_for_job(&testbed_id).await {
            Ok(job) => job,
            Err(e) => {
                self.delete_best_effort(&testbed_id).await;
                return Err(e);
            }
        };
        self.resolve_duplicates(&created, instance_id, owner).await?;

        let status = self
            .pod_status(&testbed_id)
            .await?
            .map(|s| s.summary())
            .unwrap_or_else(unknown_status);
        tracing::info!(testbed_id = %testbed_id, namespace = %self.namespace(), "testbed created");
        Ok(TestbedSummary {
            testbed_id,
            instance_id: instance_id.to_string(),
            status,
        })
    }

    async fn create_service(&self, testbed_id: &str, labels: &Labels) -> Result<ServiceInfo> {
        let mut selector = Labels::new();
        selector.insert(LABEL_JOB_NAME.to_string(), testbed_id.to_string());
        self.cluster
            .create_service(&ServiceRequest {
                name: testbed_id.to_string(),
                labels: labels.clone(),
                selector,
                port: self.config.agent_port,
                expose_externally: !self.config.in_cluster,
            })
            .await
    }

    async fn wait_for_job(&self, testbed_id: &str) -> Result<JobInfo> {
        let deadline = Instant::now() + self.config.create_timeout;
        loop {
            if let Some(job) = self.cluster.get_job(testbed_id).await? {
                return Ok(job);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "job {testbed_id} not visible after {}s",
                    self.config.create_timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.config.create_poll_interval).await;
        }
    }

    async fn resolve_duplicates(&self, created: &JobInfo, instance_id: &str, owner: &str) -> Result<()> {
        let jobs = self
            .cluster
            .list_jobs(&pair_selector(instance_id, owner))
            .await?;
        let winner = jobs
            .iter()
            .filter(|j| j.failed == 0)
            .min_by(|a, b| age_key(a).cmp(&age_key(b)));
        match winner {
            Some(w) if w.name != created.name => {
                tracing::warn!(
                    testbed_id = %created.name,
                    existing = %w.name,
                    "duplicate testbed for instance, removing the newer one"
                );
                self.delete_best_effort(&created.name).await;
                Err(Error::Conflict(format!(
                    "testbed for instance {instance_id} already exists: {}",
                    w.name
                )))
            }
            _ => Ok(()),
        }
    }

    /// Detailed status, or `None` when missing or owned by someone else.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get(&self, testbed_id: &str, owner: &str) -> Result<Option<TestbedDetailed>> {
        let Some(job) = self.owned_job(testbed_id, owner).await? else {
            return Ok(None);
        };
        let (mut detailed, endpoint) = self.describe(&job).await?;
        if detailed.state == TestbedState::RunningUnverified {
            if let Some(url) = endpoint.as_deref() {
                if self.probe_health(testbed_id, url).await {
                    detailed.state = TestbedState::RunningHealthy;
                }
            }
        }
        Ok(Some(detailed))
    }

    async fn owned_job(&self, testbed_id: &str, owner: &str) -> Result<Option<JobInfo>> {
        Ok(self
            .cluster
            .get_job(testbed_id)
            .await?
            .filter(|j| is_owned_by(&j.labels, owner)))
    }

    /// Infra-level view of a job and the agent address, if one is resolvable.
    async fn describe(&self, job: &JobInfo) -> Result<(TestbedDetailed, Option<String>)> {
        let pod = self.pod_status(&job.name).await?;
        let service = self.cluster.get_service(&job.name).await?;
        let endpoint = service.as_ref().and_then(|s| self.endpoint(&job.name, s));
        let state = derive_state(pod.as_ref(), endpoint.is_some(), false);
        let status = pod.unwrap_or_else(|| TestbedStatusDetailed {
            pod_phase: POD_UNKNOWN.to_string(),
            testbed: ContainerStatus::unknown(),
            sidecar: ContainerStatus::unknown(),
        });
        let detailed = TestbedDetailed {
            testbed_id: job.name.clone(),
            instance_id: instance_of(job),
            status,
            external_ip: service.and_then(|s| s.external_ip),
            state,
        };
        Ok((detailed, endpoint))
    }

    async fn pod_status(&self, testbed_id: &str) -> Result<Option<TestbedStatusDetailed>> {
        let mut selector = Labels::new();
        selector.insert(LABEL_JOB_NAME.to_string(), testbed_id.to_string());
        let pods = self.cluster.list_pods(&selector).await?;
        let Some(pod) = pods
            .iter()
            .find(|p| p.phase == POD_RUNNING)
            .or_else(|| pods.first())
        else {
            tracing::debug!(testbed_id, "no pod for testbed yet");
            return Ok(None);
        };
        Ok(Some(TestbedStatusDetailed {
            pod_phase: pod.phase.clone(),
            testbed: pod
                .container(TESTBED_CONTAINER)
                .cloned()
                .unwrap_or_else(ContainerStatus::unknown),
            sidecar: pod
                .container(SIDECAR_CONTAINER)
                .cloned()
                .unwrap_or_else(ContainerStatus::unknown),
        }))
    }

    /// Service DNS inside the cluster, LoadBalancer ingress outside it.
    fn endpoint(&self, testbed_id: &str, service: &ServiceInfo) -> Option<String> {
        if self.config.in_cluster {
            Some(format!(
                "http://{testbed_id}.{}.svc.cluster.local:{}",
                self.namespace(),
                service.port
            ))
        } else {
            service
                .external_ip
                .as_ref()
                .map(|ip| format!("http://{ip}:{}", service.port))
        }
    }

    async fn probe_health(&self, testbed_id: &str, base_url: &str) -> bool {
        let transport = match self.transports.connect(testbed_id, base_url) {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!(testbed_id, error = %e, "cannot open transport for health probe");
                return false;
            }
        };
        match tokio::time::timeout(self.config.health_timeout, transport.health()).await {
            Ok(Ok(healthy)) => healthy,
            Ok(Err(e)) => {
                tracing::debug!(testbed_id, error = %e, "health probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(testbed_id, "health probe timed out");
                false
            }
        }
    }

    /// Idempotent. Returns whether anything owned by `owner` was removed.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn delete(&self, testbed_id: &str, owner: &str) -> Result<bool> {
        if self.owned_job(testbed_id, owner).await?.is_some() {
            self.delete_resources(testbed_id).await?;
            tracing::info!(testbed_id, "deleted job and service");
            return Ok(true);
        }
        // A service can outlive its job after a partial delete.
        let orphan = self
            .cluster
            .get_service(testbed_id)
            .await?
            .is_some_and(|s| is_owned_by(&s.labels, owner));
        if orphan {
            self.cluster.delete_service(testbed_id).await?;
            tracing::info!(testbed_id, "deleted orphaned service");
            return Ok(true);
        }
        tracing::info!(testbed_id, "testbed already absent");
        Ok(false)
    }

    async fn delete_resources(&self, testbed_id: &str) -> Result<()> {
        self.cluster.delete_service(testbed_id).await?;
        self.cluster.delete_job(testbed_id).await?;
        Ok(())
    }

    async fn delete_best_effort(&self, testbed_id: &str) {
        if let Err(e) = self.delete_resources(testbed_id).await {
            tracing::error!(testbed_id, error = %e, "cleanup of testbed failed");
        }
    }

    /// Delete every testbed the owner has. Failures are logged and skipped.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn delete_all(&self, owner: &str) -> Result<usize> {
        let jobs = self.cluster.list_jobs(&owner_selector(owner)).await?;
        let results = join_all(jobs.iter().map(|j| self.delete_resources(&j.name))).await;
        let mut deleted = 0;
        for (job, res) in jobs.iter().zip(results) {
            match res {
                Ok(()) => deleted += 1,
                Err(e) => tracing::error!(testbed_id = %job.name, error = %e, "failed to delete testbed"),
            }
        }
        tracing::info!(deleted, "deleted testbeds");
        Ok(deleted)
    }

    /// Remove every labelled job and service of the owner, orphans included.
    /// Counts individual resources.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn cleanup(&self, owner: &str) -> Result<usize> {
        let selector = owner_selector(owner);
        let jobs = self.cluster.list_jobs(&selector).await?;
        let services = self.cluster.list_services(&selector).await?;

        let job_results = join_all(jobs.iter().map(|j| self.cluster.delete_job(&j.name))).await;
        let service_results =
            join_all(services.iter().map(|s| self.cluster.delete_service(&s.name))).await;

        let mut deleted = 0;
        let names = jobs
            .iter()
            .map(|j| ("job", &j.name))
            .chain(services.iter().map(|s| ("service", &s.name)));
        for ((kind, name), res) in names.zip(job_results.into_iter().chain(service_results)) {
            match res {
                Ok(_) => deleted += 1,
                Err(e) => tracing::error!(kind, name = %name, error = %e, "failed to delete resource"),
            }
        }
        tracing::info!(deleted, "cleaned up resources");
        Ok(deleted)
    }

    /// Bind a protocol client to the testbed. A testbed whose job or service has
    /// gone missing is recreated; the returned client then names the new id.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn create_client(
        &self,
        testbed_id: &str,
        owner: &str,
        instance_hint: Option<&str>,
    ) -> Result<TestbedClient> {
        let not_found = || Error::NotFound(format!("testbed {testbed_id}"));
        match self.cluster.get_job(testbed_id).await? {
            Some(job) if !is_owned_by(&job.labels, owner) => Err(not_found()),
            Some(job) => {
                if self.cluster.get_service(testbed_id).await?.is_some() {
                    return self.connect(testbed_id).await;
                }
                let instance_id = instance_hint
                    .map(str::to_string)
                    .unwrap_or_else(|| instance_of(&job));
                tracing::warn!(testbed_id, instance_id = %instance_id, "service missing, recreating testbed");
                self.delete_resources(testbed_id).await?;
                let created = self.find_or_create(&instance_id, owner).await?;
                self.connect(&created.testbed_id).await
            }
            None => {
                let instance_id = instance_hint.ok_or_else(not_found)?;
                tracing::warn!(testbed_id, instance_id, "testbed missing, recreating");
                let created = self.find_or_create(instance_id, owner).await?;
                self.connect(&created.testbed_id).await
            }
        }
    }

    async fn connect(&self, testbed_id: &str) -> Result<TestbedClient> {
        let service = self
            .cluster
            .get_service(testbed_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("service for testbed {testbed_id}")))?;
        let url = self.endpoint(testbed_id, &service).ok_or_else(|| {
            Error::Unreachable(format!("testbed {testbed_id} has no external address yet"))
        })?;
        let transport = self.transports.connect(testbed_id, &url)?;
        Ok(TestbedClient::new(testbed_id, transport))
    }

    /// Poll until the testbed is running and its agent answers the health probe.
    pub async fn wait_until_ready(
        &self,
        testbed_id: &str,
        owner: &str,
        monitor: &ReadinessMonitor,
    ) -> Result<ReadinessReport> {
        let probe = ManagedProbe {
            manager: self,
            testbed_id,
            owner,
        };
        monitor.wait(&probe, testbed_id).await
    }
}

struct ManagedProbe<'a> {
    manager: &'a TestbedManager,
    testbed_id: &'a str,
    owner: &'a str,
}

#[async_trait]
impl ReadinessProbe for ManagedProbe<'_> {
    async fn infra(&self) -> Result<Option<InfraSnapshot>> {
        let Some(job) = self.manager.owned_job(self.testbed_id, self.owner).await? else {
            return Ok(None);
        };
        let (detailed, endpoint) = self.manager.describe(&job).await?;
        Ok(Some(InfraSnapshot {
            pod_phase: detailed.status.pod_phase,
            testbed_ready: detailed.status.testbed.ready,
            sidecar_ready: detailed.status.sidecar.ready,
            endpoint_ready: endpoint.is_some(),
        }))
    }

    async fn app_healthy(&self) -> Result<bool> {
        let Some(service) = self.manager.cluster.get_service(self.testbed_id).await? else {
            return Ok(false);
        };
        let Some(url) = self.manager.endpoint(self.testbed_id, &service) else {
            return Ok(false);
        };
        Ok(self.manager.probe_health(self.testbed_id, &url).await)
    }
}
