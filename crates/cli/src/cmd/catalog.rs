use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use chartpatch_lib::catalog::build_catalog;
use chartpatch_lib::matrix::Matrix;
use chartpatch_lib::patch::PatchResults;

use crate::output::{OutputFormat, print_json, print_stat, print_success};

#[derive(Debug, Args)]
pub struct CatalogArgs {
  /// Matrix to catalog
  #[arg(long, default_value = "matrix.json")]
  pub matrix: PathBuf,

  /// Result directory
  #[arg(long, default_value = "results")]
  pub results: PathBuf,

  /// Report directory
  #[arg(long, default_value = "reports")]
  pub reports: PathBuf,

  /// Where to write the catalog
  #[arg(long, default_value = "catalog.json")]
  pub output: PathBuf,
}

pub fn cmd_catalog(args: &CatalogArgs, format: OutputFormat) -> Result<()> {
  let matrix =
    Matrix::load(&args.matrix).with_context(|| format!("Failed to read matrix {}", args.matrix.display()))?;
  let results = PatchResults::load(&matrix, &args.results);

  let catalog = build_catalog(&matrix, &results, &args.reports);
  catalog
    .save(&args.output)
    .with_context(|| format!("Failed to write catalog {}", args.output.display()))?;

  if format.is_json() {
    return print_json(&catalog.summary);
  }

  let summary = &catalog.summary;
  print_success(&format!("Wrote {}", args.output.display()));
  print_stat("Images", &summary.total_images.to_string());
  print_stat("Vulnerabilities before", &summary.total_vulns_before.to_string());
  print_stat("Vulnerabilities after", &summary.total_vulns_after.to_string());
  print_stat("Fixed", &summary.fixed_vulns.to_string());
  Ok(())
}
