use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cmd;
mod output;

use cmd::{
  AssembleArgs, CatalogArgs, DiscoverArgs, MatrixArgs, PatchArgs, ScanArgs, cmd_assemble, cmd_catalog, cmd_discover,
  cmd_info, cmd_matrix, cmd_patch, cmd_scan,
};
use output::OutputFormat;

/// chartpatch - discover, patch and republish the container images of Helm charts
#[derive(Parser)]
#[command(name = "chartpatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Path to the config file (default: ./chartpatch.yaml, then the user config dir)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Output format for summaries
  #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
  format: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Discover chart and tracked images and update the inventory
  Discover(DiscoverArgs),

  /// Build the deduplicated patch work queue from a discovery manifest
  Matrix(MatrixArgs),

  /// Scan matrix images for vulnerabilities
  Scan(ScanArgs),

  /// Patch a single matrix image
  Patch(PatchArgs),

  /// Assemble wrapper charts for charts with newly patched images
  Assemble(AssembleArgs),

  /// Build the before/after vulnerability catalog
  Catalog(CatalogArgs),

  /// Show the resolved configuration
  Info,
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "info" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let config = cli.config.as_deref();
  match cli.command {
    Commands::Discover(args) => cmd_discover(config, &args, cli.format),
    Commands::Matrix(args) => cmd_matrix(&args),
    Commands::Scan(args) => cmd_scan(config, &args, cli.format),
    Commands::Patch(args) => cmd_patch(config, &args, cli.format),
    Commands::Assemble(args) => cmd_assemble(config, &args, cli.format),
    Commands::Catalog(args) => cmd_catalog(&args, cli.format),
    Commands::Info => cmd_info(config, cli.format),
  }
}
