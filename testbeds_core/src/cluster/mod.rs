//! Cluster API seam.
//!
//! The orchestrator talks to the cluster only through [`ClusterApi`]; it never holds
//! its own locks over cluster resources. Create is conditional (an existing name is a
//! `Conflict`) and delete is idempotent (an absent name reports `false`).

pub mod kube;
pub mod manifests;
pub mod memory;

use crate::models::ContainerStatus;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Labels = BTreeMap<String, String>;

/// Render labels as a Kubernetes equality selector (`k1=v1,k2=v2`).
pub fn selector_string(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn matches_selector(labels: &Labels, selector: &Labels) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// CPU and memory requests/limits in Kubernetes quantity syntax.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub name: String,
    pub labels: Labels,
    pub testbed_image: String,
    pub sidecar_image: String,
    pub resources: ResourceProfile,
    pub agent_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    pub name: String,
    pub labels: Labels,
    pub selector: Labels,
    pub port: u16,
    /// LoadBalancer when true, ClusterIP otherwise.
    pub expose_externally: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub name: String,
    pub labels: Labels,
    pub created_at: Option<DateTime<Utc>>,
    pub active: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub labels: Labels,
    pub cluster_ip: Option<String>,
    pub external_ip: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub name: String,
    pub status: ContainerStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub labels: Labels,
    pub phase: String,
    pub containers: Vec<ContainerInfo>,
}

impl PodInfo {
    pub fn container(&self, name: &str) -> Option<&ContainerStatus> {
        self.containers
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.status)
    }
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    fn namespace(&self) -> &str;

    /// Fails with `Error::Conflict` if a job with the same name exists.
    async fn create_job(&self, request: &JobRequest) -> Result<JobInfo>;
    async fn get_job(&self, name: &str) -> Result<Option<JobInfo>>;
    async fn list_jobs(&self, selector: &Labels) -> Result<Vec<JobInfo>>;
    /// Returns `false` when the job was already gone.
    async fn delete_job(&self, name: &str) -> Result<bool>;

    async fn create_service(&self, request: &ServiceRequest) -> Result<ServiceInfo>;
    async fn get_service(&self, name: &str) -> Result<Option<ServiceInfo>>;
    async fn list_services(&self, selector: &Labels) -> Result<Vec<ServiceInfo>>;
    async fn delete_service(&self, name: &str) -> Result<bool>;

    async fn list_pods(&self, selector: &Labels) -> Result<Vec<PodInfo>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_renders_sorted_pairs() {
        let mut labels = Labels::new();
        labels.insert("user-id".into(), "alice".into());
        labels.insert("instance-id".into(), "psf__requests-2317".into());
        assert_eq!(
            selector_string(&labels),
            "instance-id=psf__requests-2317,user-id=alice"
        );
    }

    #[test]
    fn selector_matching_requires_every_pair() {
        let mut labels = Labels::new();
        labels.insert("a".into(), "1".into());
        labels.insert("b".into(), "2".into());
        let mut sel = Labels::new();
        sel.insert("a".into(), "1".into());
        assert!(matches_selector(&labels, &sel));
        sel.insert("b".into(), "3".into());
        assert!(!matches_selector(&labels, &sel));
    }
}
