use clap::Parser;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use testbeds_core::config::TestbedsConfig;
use testbeds_server::auth::ApiKeys;
use testbeds_server::cli::{Cli, ClusterMode, Commands};

#[tokio::main]
#[tracing::instrument(level = "info")]
async fn main() -> anyhow::Result<()> {
    testbeds_core::o11y::init_global_from_env()?;
    let cli = Cli::parse();

    let cmd = cli.command.unwrap_or(Commands::Serve {
        host: "0.0.0.0".to_string(),
        port: 8000,
        cluster: ClusterMode::Kube,
        workdir: ".testbeds_dev".into(),
    });

    match cmd {
        Commands::Serve {
            host,
            port,
            cluster,
            workdir,
        } => {
            let addr: SocketAddr = format!("{host}:{port}").parse()?;
            let cfg = TestbedsConfig::from_env()?;
            let api_keys = ApiKeys::load(&cfg.api_keys_path).await;
            let state = testbeds_server::backends::build_state(&cfg, cluster, workdir).await?;
            testbeds_server::server::serve(addr, state, api_keys).await?;
        }
        Commands::Agent {
            host,
            port,
            channel,
            workdir,
            shared_dir,
            default_timeout_secs,
        } => {
            let addr: SocketAddr = format!("{host}:{port}").parse()?;
            let service = testbeds_server::backends::build_agent_service(
                channel,
                workdir,
                shared_dir,
                Duration::from_secs(default_timeout_secs),
            );
            testbeds_server::agent::serve(addr, service).await?;
        }
        Commands::Cleanup { owner, cluster } => {
            let cfg = TestbedsConfig::from_env()?;
            let manager =
                testbeds_server::backends::build_manager(&cfg, cluster, Path::new(".testbeds_dev"))
                    .await?;
            let deleted = manager.cleanup(&owner).await?;
            println!("Cleaned up {deleted} resources");
        }
    }

    Ok(())
}
