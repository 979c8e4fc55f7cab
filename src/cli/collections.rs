//! CLI command for listing the collections of a provider

use clap::Args;
use tracing::info;

use super::{print_json, CliError, Cli, OutputFormat};
use crate::provider::Provider;
use crate::registry::CollectionResolver;

/// Collections subcommand
#[derive(Debug, Args)]
pub struct CollectionsCommand {
    /// Provider (cdse, creodias, cnes, theia, nasa, usgs, eumdac, google)
    #[arg(long)]
    pub provider: Provider,
}

impl CollectionsCommand {
    /// Print every collection of the provider table with its sensor record
    pub fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let resolver = CollectionResolver::load(self.provider.table_name(), &cli.reference())?;
        let collections = resolver.available_collections()?;
        info!(provider = %self.provider, count = collections.len(), "Listed collections");

        match cli.output_format {
            OutputFormat::Json => print_json(&collections)?,
            OutputFormat::Human => {
                println!("{} collections served by {}:\n", collections.len(), self.provider);
                for c in &collections {
                    let levels: Vec<String> = c.levels.iter().map(u8::to_string).collect();
                    let end = c
                        .end_date
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "operating".to_string());
                    println!(
                        "{:<24} L{:<6} {} .. {:<10} {}",
                        c.sand_name,
                        levels.join(","),
                        c.launch_date,
                        end,
                        c.description
                    );
                }
            }
        }
        Ok(())
    }
}
