use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use chartpatch_lib::matrix::Matrix;
use chartpatch_lib::patch::{PatchOutcome, PatchRequest, patch_image};

use super::{load_config, registry_client, runtime};
use crate::output::{OutputFormat, print_info, print_json, print_mapping, print_success, symbols};

#[derive(Debug, Args)]
pub struct PatchArgs {
  /// Matrix reference of the image to patch
  #[arg(long)]
  pub image_ref: String,

  /// Matrix the image belongs to
  #[arg(long, default_value = "matrix.json")]
  pub matrix: PathBuf,

  /// Report directory
  #[arg(long, default_value = "reports")]
  pub reports: PathBuf,

  /// Result directory
  #[arg(long, default_value = "results")]
  pub results: PathBuf,

  /// Patch even if the target tag already exists
  #[arg(long)]
  pub force: bool,
}

/// Patch one queue item and record its result.
pub fn cmd_patch(config: Option<&Path>, args: &PatchArgs, format: OutputFormat) -> Result<()> {
  let config = load_config(config)?;
  let target_registry = config.target.require_registry()?;
  let registry = registry_client(&config)?;

  let matrix =
    Matrix::load(&args.matrix).with_context(|| format!("Failed to read matrix {}", args.matrix.display()))?;
  let entry = matrix
    .find(&args.image_ref)
    .with_context(|| format!("{} is not in {}", args.image_ref, args.matrix.display()))?;

  let request = PatchRequest {
    image_ref: &entry.image_ref,
    image_name: &entry.image_name,
    reports_dir: &args.reports,
    results_dir: &args.results,
    target_registry,
    image_prefix: config.target.image_prefix.as_deref(),
    tools: &config.tools,
    force: args.force,
  };

  let rt = runtime()?;
  let result = rt
    .block_on(patch_image(&request, &registry))
    .with_context(|| format!("Failed to patch {}", args.image_ref))?;

  if format.is_json() {
    return print_json(&chartpatch_lib::patch::PatchResultRecord::from(&result));
  }

  match &result.outcome {
    PatchOutcome::Patched(target) => {
      print_success(&format!("Patched {} ({} vulnerabilities)", result.image_ref, result.vuln_count));
      print_mapping(symbols::ADD, &result.image_ref, &target.reference());
    }
    PatchOutcome::Skipped { reason, target } => {
      print_info(&format!("Skipped {}: {}", result.image_ref, reason.as_str()));
      if let Some(target) = target {
        print_mapping(symbols::SKIP, &result.image_ref, &target.reference());
      }
    }
    PatchOutcome::Failed(message) => {
      anyhow::bail!("Failed to patch {}: {}", result.image_ref, message);
    }
  }
  Ok(())
}
