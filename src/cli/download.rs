//! Download command implementation

use clap::Args;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info};

use super::{print_json, CliError, Cli, OutputFormat, QueryArgs};
use crate::provider::{AdapterContext, DownloadReport};
use crate::transfer::{ExistsPolicy, TransferObserver};

/// Download command arguments
#[derive(Debug, Args)]
pub struct DownloadArgs {
    /// Search constraints
    #[command(flatten)]
    pub query: QueryArgs,

    /// Destination directory
    #[arg(long, default_value = "data")]
    pub output: PathBuf,

    /// Only download the first N products of the result
    #[arg(long)]
    pub first: Option<usize>,

    /// What to do with products already on disk: skip, overwrite, backup or error
    #[arg(long, default_value = "skip")]
    pub if_exists: ExistsPolicy,
}

/// Mirrors transfer progress into one `indicatif` bar per target
pub struct ProgressObserver {
    multi: MultiProgress,
    bars: Mutex<HashMap<PathBuf, ProgressBar>>,
}

impl ProgressObserver {
    /// Observer drawing on stderr
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn style(total: Option<u64>) -> ProgressStyle {
        let template = match total {
            Some(_) => "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
            None => "{spinner:.green} [{elapsed_precise}] {bytes} ({bytes_per_sec}) {msg}",
        };
        ProgressStyle::default_bar()
            .template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-")
    }
}

impl Default for ProgressObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferObserver for ProgressObserver {
    fn on_start(&self, target: &Path, total: Option<u64>) {
        let bar = self.multi.add(ProgressBar::new(total.unwrap_or(0)));
        bar.set_style(Self::style(total));
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        bar.set_message(name);
        if let Ok(mut bars) = self.bars.lock() {
            if let Some(previous) = bars.insert(target.to_path_buf(), bar) {
                previous.finish_and_clear();
            }
        }
    }

    fn on_bytes(&self, target: &Path, bytes: u64) {
        if let Ok(bars) = self.bars.lock() {
            if let Some(bar) = bars.get(target) {
                bar.inc(bytes);
            }
        }
    }

    fn on_finish(&self, target: &Path, _success: bool) {
        if let Ok(mut bars) = self.bars.lock() {
            if let Some(bar) = bars.remove(target) {
                bar.finish_and_clear();
            }
        }
    }
}

impl DownloadArgs {
    /// Execute the download command
    pub async fn execute(&self, cli: &Cli, context: AdapterContext) -> Result<(), CliError> {
        let context = match cli.output_format {
            OutputFormat::Human => context.with_observer(Arc::new(ProgressObserver::new())),
            OutputFormat::Json => context,
        };
        let (adapter, _, result) = self.query.run(&context).await?;
        let selected = match self.first {
            Some(n) => result.slice(..n),
            None => result,
        };
        if selected.is_empty() {
            info!(provider = %self.query.provider, "Nothing to download");
        }

        tokio::fs::create_dir_all(&self.output).await?;
        info!(
            provider = %self.query.provider,
            count = selected.len(),
            output = %self.output.display(),
            policy = %self.if_exists,
            "Downloading products"
        );
        let products = selected.into_vec();
        let reports = adapter
            .download_all(&products, &self.output, self.if_exists, cli.concurrency)
            .await?;

        let failed = reports.iter().filter(|r| r.result.is_err()).count();
        match cli.output_format {
            OutputFormat::Json => output_json(&reports)?,
            OutputFormat::Human => output_human(&reports),
        }

        if failed > 0 {
            return Err(CliError::DownloadsFailed {
                failed,
                total: reports.len(),
            });
        }
        Ok(())
    }
}

/// Output reports as one JSON array
fn output_json(reports: &[DownloadReport]) -> Result<(), CliError> {
    let rows: Vec<_> = reports
        .iter()
        .map(|report| match &report.result {
            Ok(outcome) => json!({
                "product_id": report.product_id,
                "success": true,
                "status": outcome.status.as_str(),
                "path": outcome.path.display().to_string(),
                "bytes": outcome.bytes,
                "retries": outcome.retries,
                "redirects": outcome.redirects,
            }),
            Err(e) => json!({
                "product_id": report.product_id,
                "success": false,
                "error": e.to_string(),
                "kind": e.kind().as_str(),
            }),
        })
        .collect();
    print_json(&rows)
}

/// Output reports in human-readable format
fn output_human(reports: &[DownloadReport]) {
    for report in reports {
        match &report.result {
            Ok(outcome) => {
                println!(
                    "{:<10} {} -> {}",
                    outcome.status.as_str(),
                    report.product_id,
                    outcome.path.display()
                );
                if let Some(backup) = &outcome.backup {
                    println!("           previous file kept at {}", backup.display());
                }
            }
            Err(e) => {
                eprintln!("{:<10} {}: {e}", "failed", report.product_id);
                error!(product = %report.product_id, kind = %e.kind(), "Download failed: {}", e);
            }
        }
    }
}
