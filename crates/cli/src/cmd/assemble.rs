use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Args;

use chartpatch_lib::assemble::{AssembleOptions, PUBLISHED_FILENAME, assemble};
use chartpatch_lib::discover::{DiscoveryManifest, HelmRenderer};
use chartpatch_lib::matrix::Matrix;
use chartpatch_lib::metadata::timestamp_now;
use chartpatch_lib::patch::PatchResults;

use super::{load_config, registry_client, runtime};
use crate::output::{
  OutputFormat, elapsed, print_error, print_info, print_json, print_mapping, print_stat, print_success, symbols,
};

#[derive(Debug, Args)]
pub struct AssembleArgs {
  /// Discovery manifest listing the charts
  #[arg(long, default_value = "discovery.json")]
  pub manifest: PathBuf,

  /// Matrix the results belong to
  #[arg(long, default_value = "matrix.json")]
  pub matrix: PathBuf,

  /// Result directory
  #[arg(long, default_value = "results")]
  pub results: PathBuf,

  /// Report directory
  #[arg(long, default_value = "reports")]
  pub reports: PathBuf,

  /// Output directory for wrapper charts and published.json
  #[arg(long, default_value = "dist")]
  pub out: PathBuf,
}

/// Assemble wrapper charts for every chart with a newly patched image.
pub fn cmd_assemble(config: Option<&Path>, args: &AssembleArgs, format: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let config = load_config(config)?;
  let target_registry = config.target.require_registry()?;
  let registry = registry_client(&config)?;
  let renderer = HelmRenderer::new(config.tools.helm.clone());

  let manifest = DiscoveryManifest::load(&args.manifest)
    .with_context(|| format!("Failed to read discovery manifest {}", args.manifest.display()))?;
  let matrix =
    Matrix::load(&args.matrix).with_context(|| format!("Failed to read matrix {}", args.matrix.display()))?;
  let results = PatchResults::load(&matrix, &args.results);

  let options = AssembleOptions {
    out_dir: &args.out,
    reports_dir: &args.reports,
    target_registry,
    chart_repository: &config.target.chart_repository,
    timestamp: timestamp_now(),
  };

  let rt = runtime()?;
  let summary = rt
    .block_on(assemble(&manifest.charts, &matrix, &results, &renderer, &registry, &options))
    .context("Assembly failed")?;

  if format.is_json() {
    print_json(&summary.published)?;
  } else {
    for chart in &summary.published {
      print_success(&format!("{} {}", chart.name, chart.version));
      print_stat("Reference", &chart.oci_ref);
      for image in &chart.images {
        print_mapping(symbols::ADD, &image.original, &image.patched);
      }
    }
    for name in &summary.unchanged {
      print_info(&format!("{} unchanged", name));
    }
    for (name, error) in &summary.failures {
      print_error(&format!("{}: {}", name, error));
    }
    print_stat("Published", &args.out.join(PUBLISHED_FILENAME).display().to_string());
    print_stat("Duration", &elapsed(start));
  }

  if !summary.is_success() {
    bail!("{} charts failed to assemble", summary.failures.len());
  }
  Ok(())
}
