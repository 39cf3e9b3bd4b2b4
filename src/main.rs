//! Rollout Agent - 集群滚动部署代理
//!
//! Usage:
//! - Normal mode: `rollout-agent`
//! - With custom port: `rollout-agent --port 19999`

use rollout_agent::RuntimeConfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// 解析命令行参数
fn parse_args() -> RuntimeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RuntimeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                config.port_override = args[i + 1].parse().ok();
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                i += 1;
            }
        }
    }

    config
}

fn print_help() {
    println!("Rollout Agent - 集群滚动部署代理");
    println!();
    println!("USAGE:");
    println!("    rollout-agent [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>    Override the listening port");
    println!("    -h, --help       Print help information");
    println!();
    println!("ENVIRONMENT:");
    println!("    ROLLOUT_AGENT_API_KEY     API key required by protected endpoints");
    println!("    CLUSTER_API_URL           Cluster management API base URL");
    println!("    SERVICE_MAPPING_FILE      Service whitelist (JSON)");
    println!("    RUST_LOG                  Log filter, e.g. rollout_agent=debug");
    println!();
    println!("EXAMPLES:");
    println!("    rollout-agent                 # Normal mode");
    println!("    rollout-agent --port 19999    # Custom port");
}

fn main() -> anyhow::Result<()> {
    let config = parse_args();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("rollout_agent=info".parse()?))
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let shutdown = CancellationToken::new();
        let cancel_on_signal = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, stopping agent");
            cancel_on_signal.cancel();
        });

        if let Err(e) = rollout_agent::init_and_run_agent_with_config(config, shutdown).await {
            error!(error = %e, "Agent error");
            return Err(e);
        }
        Ok(())
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
