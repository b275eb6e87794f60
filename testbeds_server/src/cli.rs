use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "testbeds", version, about = "SWE-bench testbeds on Kubernetes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Where testbeds live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClusterMode {
    /// Kubernetes API server, in-cluster or via `KUBE_API_URL`.
    Kube,
    /// Process-local cluster backed by a shell agent. For development.
    Memory,
}

/// How the sandbox agent reaches the testbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ChannelKind {
    /// Run commands directly in a local working directory.
    Shell,
    /// Hand scripts to the testbed container through trigger files on a shared volume.
    SharedVolume,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the control plane (default if no subcommand given).
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, env = "PORT", default_value = "8000")]
        port: u16,

        #[arg(long, value_enum, env = "TESTBEDS_CLUSTER", default_value = "kube")]
        cluster: ClusterMode,

        /// Working directory of the local agent in `memory` mode.
        #[arg(long, env = "TESTBEDS_WORKDIR", default_value = ".testbeds_dev")]
        workdir: PathBuf,
    },

    /// Run the sandbox agent inside a testbed pod.
    Agent {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, env = "AGENT_PORT", default_value = "8000")]
        port: u16,

        #[arg(long, value_enum, env = "AGENT_CHANNEL", default_value = "shared-volume")]
        channel: ChannelKind,

        /// Working directory for the `shell` channel.
        #[arg(long, env = "AGENT_WORKDIR", default_value = "/testbed")]
        workdir: PathBuf,

        /// Mount point of the volume shared with the testbed container.
        #[arg(long, env = "SHARED_DIR", default_value = "/shared")]
        shared_dir: PathBuf,

        /// Applied to executions submitted without a timeout.
        #[arg(long, env = "AGENT_DEFAULT_TIMEOUT_SECS", default_value = "1800")]
        default_timeout_secs: u64,
    },

    /// Delete every job and service owned by one owner.
    Cleanup {
        #[arg(long)]
        owner: String,

        #[arg(long, value_enum, env = "TESTBEDS_CLUSTER", default_value = "kube")]
        cluster: ClusterMode,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_defaults_to_shared_volume() {
        let cli = Cli::try_parse_from(["testbeds", "agent"]).expect("parse");
        match cli.command {
            Some(Commands::Agent {
                channel,
                shared_dir,
                default_timeout_secs,
                ..
            }) => {
                assert_eq!(channel, ChannelKind::SharedVolume);
                assert_eq!(shared_dir, PathBuf::from("/shared"));
                assert_eq!(default_timeout_secs, 1800);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn serve_accepts_memory_cluster() {
        let cli = Cli::try_parse_from(["testbeds", "serve", "--cluster", "memory", "--port", "9000"])
            .expect("parse");
        assert!(matches!(
            cli.command,
            Some(Commands::Serve {
                cluster: ClusterMode::Memory,
                port: 9000,
                ..
            })
        ));
    }

    #[test]
    fn cleanup_requires_owner() {
        assert!(Cli::try_parse_from(["testbeds", "cleanup"]).is_err());
    }
}
