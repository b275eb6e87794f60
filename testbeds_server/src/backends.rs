//! Wires the control plane and the agent from configuration.

use crate::cli::{ChannelKind, ClusterMode};
use crate::server::AppState;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use testbeds_core::ClusterApi;
use testbeds_core::cluster::kube::{KubeCluster, KubeConfig};
use testbeds_core::cluster::memory::{InMemoryCluster, InMemoryOptions};
use testbeds_core::config::TestbedsConfig;
use testbeds_core::dataset::{IgnoredTests, InstanceStore};
use testbeds_core::exec::ExecutionChannel;
use testbeds_core::exec::service::ExecutionService;
use testbeds_core::exec::shared_volume::SharedVolumeChannel;
use testbeds_core::exec::shell::ShellChannel;
use testbeds_core::orchestrator::{
    HttpTransportFactory, LocalTransportFactory, TestbedManager, TransportFactory,
};

#[tracing::instrument(level = "info", skip(cfg), fields(namespace = %cfg.namespace))]
pub async fn build_manager(
    cfg: &TestbedsConfig,
    mode: ClusterMode,
    workdir: &Path,
) -> anyhow::Result<TestbedManager> {
    let (cluster, transports): (Arc<dyn ClusterApi>, Arc<dyn TransportFactory>) = match mode {
        ClusterMode::Kube => {
            let kube = KubeCluster::new(KubeConfig::from_env(&cfg.namespace)?)?;
            (Arc::new(kube), Arc::new(HttpTransportFactory::default()))
        }
        ClusterMode::Memory => {
            tokio::fs::create_dir_all(workdir).await?;
            tracing::warn!(workdir = %workdir.display(), "using in-memory cluster with a local shell agent");
            let cluster = InMemoryCluster::new(cfg.namespace.clone(), InMemoryOptions::default());
            let transports = LocalTransportFactory::new(
                Arc::new(ShellChannel::new(workdir)),
                cfg.pipeline.exec_timeout,
            );
            (Arc::new(cluster), Arc::new(transports))
        }
    };
    Ok(TestbedManager::new(cluster, transports, cfg.orchestrator.clone()))
}

#[tracing::instrument(level = "info", skip(cfg))]
pub async fn build_state(
    cfg: &TestbedsConfig,
    mode: ClusterMode,
    workdir: PathBuf,
) -> anyhow::Result<AppState> {
    let manager = build_manager(cfg, mode, &workdir).await?;

    let instances = match &cfg.instances_path {
        Some(path) => InstanceStore::load(path).await?,
        None => {
            tracing::warn!("INSTANCES_PATH not set; evaluation routes will report unknown instances");
            InstanceStore::default()
        }
    };
    let ignored = match &cfg.ignored_tests_path {
        Some(path) => IgnoredTests::load(path).await?,
        None => IgnoredTests::default(),
    };
    tracing::info!(instances = instances.len(), "task instances loaded");

    Ok(AppState::new(
        Arc::new(manager),
        Arc::new(instances),
        Arc::new(ignored),
        cfg.pipeline.clone(),
        cfg.readiness,
    ))
}

pub fn build_agent_service(
    channel: ChannelKind,
    workdir: PathBuf,
    shared_dir: PathBuf,
    default_timeout: Duration,
) -> ExecutionService {
    let channel: Arc<dyn ExecutionChannel> = match channel {
        ChannelKind::Shell => Arc::new(ShellChannel::new(workdir)),
        ChannelKind::SharedVolume => Arc::new(SharedVolumeChannel::new(shared_dir)),
    };
    tracing::info!(channel = channel.name(), "sandbox agent channel");
    ExecutionService::new(channel, default_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_state_starts_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = build_state(&TestbedsConfig::default(), ClusterMode::Memory, dir.path().join("wd"))
            .await
            .expect("state");
        assert!(state.instances.is_empty());
        assert!(state.manager.list("alice").await.expect("list").is_empty());
        assert!(dir.path().join("wd").is_dir());
    }

    #[tokio::test]
    async fn missing_instances_file_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = TestbedsConfig {
            instances_path: Some(dir.path().join("nope.json")),
            ..TestbedsConfig::default()
        };
        assert!(build_state(&cfg, ClusterMode::Memory, dir.path().to_path_buf())
            .await
            .is_err());
    }

    #[test]
    fn agent_channel_follows_kind() {
        let svc = build_agent_service(
            ChannelKind::SharedVolume,
            PathBuf::from("/testbed"),
            PathBuf::from("/shared"),
            Duration::from_secs(5),
        );
        assert_eq!(svc.channel().name(), "shared-volume");
    }
}
