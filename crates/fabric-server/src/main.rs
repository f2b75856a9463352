//! fabric-server: runs a gateway or a logic service of the IM fabric.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use fabric_core::error::FabricResult;
use fabric_core::wire::Protocol;
use fabric_server::app;
use fabric_server::config::{FabricConfig, Overrides};

/// fabric-server — IM gateway and logic services
#[derive(Parser, Debug)]
#[command(name = "fabric-server", version, about = "IM gateway and logic services")]
struct Cli {
    /// Config file path
    #[arg(long, global = true, default_value = "fabric.toml")]
    config: String,

    /// Listen address, overriding the config file
    #[arg(long, global = true)]
    listen: Option<String>,

    /// Service id, overriding the config file
    #[arg(long, global = true)]
    service_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept end-user connections and route their packets
    Gateway {
        /// ws or tcp
        #[arg(short, long, default_value = "ws")]
        protocol: Protocol,
    },
    /// Serve login or chat commands for gateways
    Logic {
        /// login or chat
        #[arg(short, long, default_value = "chat")]
        service: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting fabric-server");

    if let Err(e) = run(cli).await {
        error!(error = %e, "fabric-server failed");
        std::process::exit(1);
    }
    info!("fabric-server stopped");
}

async fn run(cli: Cli) -> FabricResult<()> {
    let mut overrides = Overrides {
        listen: cli.listen,
        service_id: cli.service_id,
        ..Default::default()
    };
    match &cli.command {
        Command::Gateway { protocol } => overrides.protocol = Some(*protocol),
        Command::Logic { service } => overrides.service_name = Some(service.clone()),
    }
    let config = FabricConfig::load(Some(&PathBuf::from(&cli.config)), &overrides)?;
    let naming = app::naming_from_config(&config)?;

    let container = match &cli.command {
        Command::Gateway { .. } => app::build_gateway(&config, naming, config.app_secret()?)?,
        Command::Logic { service } => {
            let storage = app::storage_from_config(&config).await?;
            app::build_logic(&config, service, naming, storage)?
        }
    };
    app::run(container, &config, shutdown_signal()).await
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
