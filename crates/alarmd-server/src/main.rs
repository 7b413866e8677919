use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use alarmd_server::config::ServerConfig;
use alarmd_server::daemon::Daemon;
use alarmd_server::seed;

const DEFAULT_CONFIG_PATH: &str = "config/alarmd.toml";

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  alarmd-server [config.toml]                                Start the engine loops");
    eprintln!("  alarmd-server init-strategies <config.toml> <seed.json>   Create/update strategies from seed file");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("alarmd=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("init-strategies") => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("init-strategies requires <config.toml> and <seed.json> arguments")
            })?;
            let seed_path = args.get(3).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("init-strategies requires <seed.json> argument")
            })?;
            run_init_strategies(config_path, seed_path).await
        }
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        _ => {
            let config_path = args
                .get(1)
                .map(|s| s.as_str())
                .unwrap_or(DEFAULT_CONFIG_PATH);
            run_server(config_path).await
        }
    }
}

fn load_config(path: &str) -> Result<ServerConfig> {
    let config = ServerConfig::load(path)?;
    alarmd_common::id::init(config.node.machine_id, config.node.node_id);
    Ok(config)
}

async fn run_init_strategies(config_path: &str, seed_path: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let seed_file = seed::load_seed_file(seed_path)?;
    let daemon = Daemon::connect(&config).await?;
    seed::init_strategies(daemon.store(), daemon.sessions(), seed_file).await?;
    Ok(())
}

async fn run_server(config_path: &str) -> Result<()> {
    let config = load_config(config_path)?;

    tracing::info!(
        db = %config.database.redacted_url(),
        webhooks = config.notification.webhooks.len(),
        max_concurrent_strategies = config.engine.max_concurrent_strategies,
        smart_scheduling = config.engine.smart_scheduling,
        "alarmd-server starting"
    );

    let daemon = Arc::new(Daemon::connect(&config).await?);
    daemon
        .run(async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await;

    tracing::info!("alarmd-server stopped");
    Ok(())
}
