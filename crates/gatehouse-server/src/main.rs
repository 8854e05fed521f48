use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use gatehouse_db::DriverFactory;
use gatehouse_server::{AccountServer, AppConfig, logging, signals};

#[derive(Debug, Parser)]
#[command(name = "gatehouse", version, about = "Account and authentication server")]
struct Cli {
    /// INI configuration file.
    #[arg(long, default_value = "config/config.ini")]
    config: PathBuf,

    /// Log filter, e.g. `info` or `gatehouse_db=debug`. RUST_LOG wins.
    #[arg(long)]
    log_level: Option<String>,

    /// Listen port, overriding the configuration.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("gatehouse: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("gatehouse: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &AppConfig) -> anyhow::Result<()> {
    info!(config = ?config.server, "Starting {}", config.server.server_name);
    let server = AccountServer::start(config, Arc::new(DriverFactory))?;

    let waited = signals::wait_for_shutdown().await;
    info!("Shutting down");
    server.stop();
    waited?;
    Ok(())
}
