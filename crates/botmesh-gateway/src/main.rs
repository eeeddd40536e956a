use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use botmesh_gateway::{Gateway, GatewayConfig};

#[derive(Parser, Debug)]
#[command(name = "botmesh-gateway", version, about = "Bot/worker WebSocket gateway")]
struct Cli {
    /// Config file (defaults to the platform config dir if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Debug logging, unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the gateway (default)
    Run,
    /// Validate the configuration and print it
    Check,
}

fn init_logging(verbose: bool, default_filter: &str) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) if verbose => EnvFilter::new("debug"),
        Err(_) => EnvFilter::new(default_filter),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match GatewayConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("botmesh-gateway: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(cli.verbose, &config.logging.filter);

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Check => check(&config),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Gateway failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), bind = %config.server.bind_addr, "Starting botmesh gateway");
    let gateway = Gateway::new(config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown requested");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
                // dropping the sender would read as a shutdown
                std::future::pending::<()>().await;
            }
        }
    });

    gateway.run(shutdown_rx).await
}

fn check(config: &GatewayConfig) -> anyhow::Result<()> {
    let rendered = toml::to_string_pretty(config)?;
    println!("{rendered}");
    println!("# configuration OK");
    Ok(())
}
