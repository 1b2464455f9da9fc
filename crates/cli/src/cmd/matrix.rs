use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use chartpatch_lib::discover::DiscoveryManifest;
use chartpatch_lib::matrix::Matrix;

use crate::output::print_success;

#[derive(Debug, Args)]
pub struct MatrixArgs {
  /// Discovery manifest to read
  #[arg(long, default_value = "discovery.json")]
  pub manifest: PathBuf,

  /// Where to write the matrix
  #[arg(long, default_value = "matrix.json")]
  pub output: PathBuf,
}

/// Build the work queue and print it as compact JSON on stdout.
pub fn cmd_matrix(args: &MatrixArgs) -> Result<()> {
  let manifest = DiscoveryManifest::load(&args.manifest)
    .with_context(|| format!("Failed to read discovery manifest {}", args.manifest.display()))?;

  let matrix = Matrix::build(&manifest.images);
  matrix
    .save(&args.output)
    .with_context(|| format!("Failed to write matrix {}", args.output.display()))?;

  println!("{}", matrix.to_compact_json().context("Failed to serialize matrix")?);
  print_success(&format!("{} images queued in {}", matrix.len(), args.output.display()));
  Ok(())
}
