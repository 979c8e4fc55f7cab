//! CLI command implementations

pub mod collections;
pub mod download;
pub mod error;
pub mod query;

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::provider::{AdapterContext, NetrcCredentials};
use crate::registry::ReferenceSource;
use crate::shutdown::SharedShutdown;

pub use collections::CollectionsCommand;
pub use download::DownloadArgs;
pub use error::CliError;
pub use query::QueryArgs;

/// Maximum allowed concurrency to stay polite with provider endpoints
const MAX_CONCURRENCY: usize = 32;

/// Parse and validate concurrency value
fn parse_concurrency(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;

    if value == 0 {
        return Err("concurrency must be at least 1".to_string());
    }
    if value > MAX_CONCURRENCY {
        return Err(format!(
            "concurrency {value} exceeds maximum of {MAX_CONCURRENCY}"
        ));
    }
    Ok(value)
}

/// Satellite Data Downloader CLI
#[derive(Parser, Debug)]
#[command(name = "satellite-data-downloader")]
#[command(about = "Search and download Earth-observation products from multiple providers", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (json or human)
    #[arg(long, global = true, default_value = "human")]
    pub output_format: OutputFormat,

    /// Number of concurrent downloads (default: 4, max: 32)
    #[arg(long, global = true, default_value = "4", value_parser = parse_concurrency)]
    pub concurrency: usize,

    /// Maximum number of retries for failed requests (default: 5, range: 1-20)
    #[arg(long, global = true, default_value = "5", value_parser = clap::value_parser!(u32).range(1..=20))]
    pub max_retries: u32,

    /// Directory holding `sensors.csv` and `collections/<provider>.csv`
    /// instead of the embedded tables
    #[arg(long, global = true, env = "SDD_REFERENCE_DIR")]
    pub reference_dir: Option<PathBuf>,

    /// Serve Prometheus metrics on this address
    #[arg(long, global = true, env = "SDD_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

impl Cli {
    /// Reference tables selected by `--reference-dir`
    pub fn reference(&self) -> ReferenceSource {
        match &self.reference_dir {
            Some(dir) => ReferenceSource::Directory(dir.clone()),
            None => ReferenceSource::Embedded,
        }
    }

    /// Adapter context backed by the netrc credential store
    pub fn adapter_context(&self, shutdown: SharedShutdown) -> Result<AdapterContext, CliError> {
        let credentials = NetrcCredentials::from_env()?;
        Ok(AdapterContext::new(Arc::new(credentials))
            .with_reference(self.reference())
            .with_max_retries(self.max_retries)
            .with_shutdown(shutdown))
    }
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the collections a provider serves
    Collections(CollectionsCommand),

    /// Search a provider catalogue
    Query(QueryArgs),

    /// Search, then download the matching products
    Download(DownloadArgs),
}

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Human-readable output
    Human,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "human" => Ok(OutputFormat::Human),
            _ => Err(format!("Invalid output format: {s}")),
        }
    }
}

/// Print `value` as one JSON document on stdout
fn print_json<T: serde::Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
