//! Main entry point for the satellite-data-downloader CLI

use clap::Parser;
use satellite_data_downloader::cli::{Cli, CliError, Commands};
use satellite_data_downloader::metrics;
use satellite_data_downloader::shutdown::{self, ShutdownCoordinator};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber with optional JSON formatting
fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("satellite_data_downloader=info"));

    // Logs go to stderr so stdout stays machine-readable
    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn run(cli: &Cli) -> Result<(), CliError> {
    let shutdown = ShutdownCoordinator::shared();
    shutdown::set_global_shutdown(shutdown.clone());
    shutdown::install_ctrl_c_handler(shutdown.clone());

    match &cli.command {
        Commands::Collections(cmd) => cmd.execute(cli),
        Commands::Query(args) => args.execute(cli, cli.adapter_context(shutdown)?).await,
        Commands::Download(args) => args.execute(cli, cli.adapter_context(shutdown)?).await,
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();

    if let Some(addr) = cli.metrics_addr {
        if let Err(e) = metrics::init_metrics(addr).await {
            warn!("Metrics exporter not started: {}", e);
        }
    }

    let result = run(&cli).await.map_err(anyhow::Error::from);
    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
