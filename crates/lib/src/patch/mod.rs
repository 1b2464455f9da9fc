//! Patching one image.
//!
//! For a matrix entry the patch stage decides between three paths:
//!
//! 1. The patched tag already exists in the target registry: skip as
//!    `up_to_date`, unless forced.
//! 2. The scan found nothing fixable: skip as `no_fixable_vulnerabilities`,
//!    mirroring the image to its target when a mirror command is configured.
//! 3. Otherwise run the patcher.
//!
//! The result is always written before returning, so a failed patch leaves a
//! result file that assembly can read.

pub mod result;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::config::ToolsConfig;
use crate::consts::PATCHED_TAG_SUFFIX;
use crate::image::{Image, ImageError, split_registry};
use crate::process;
use crate::registry::Registry;
use crate::scan::report::{self, ReportError, VulnReport};

pub use result::{
  PatchOutcome, PatchResultRecord, PatchResults, PatchTarget, ResultError, SinglePatchResult, SkipReason, load_result,
  result_path, save_result,
};

#[derive(Debug, Error)]
pub enum PatchError {
  #[error(transparent)]
  Image(#[from] ImageError),

  #[error(transparent)]
  Report(#[from] ReportError),

  #[error(transparent)]
  Result(#[from] ResultError),

  #[error("no vulnerability report for {image_ref} at {path} (run `scan` first)")]
  MissingReport { image_ref: String, path: PathBuf },

  #[error("patching {image_ref} failed: {message}")]
  Failed { image_ref: String, message: String },
}

/// Compute where the patched form of `source` is published.
///
/// `<target_registry>/<image_prefix?>/<repository>:<tag>-patched`, where
/// the repository drops any registry host of the source. An untagged source
/// is treated as `latest`.
pub fn patched_target(source: &Image, target_registry: &str, image_prefix: Option<&str>) -> PatchTarget {
  let (_, repository) = split_registry(&source.repository);
  let repository = match image_prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
    Some(prefix) => format!("{}/{}", prefix, repository),
    None => repository.to_string(),
  };
  let tag = format!("{}-{}", source.tag.as_deref().unwrap_or("latest"), PATCHED_TAG_SUFFIX);

  PatchTarget {
    registry: target_registry.trim_end_matches('/').to_string(),
    repository,
    tag,
  }
}

/// Everything needed to patch one matrix entry.
#[derive(Debug, Clone)]
pub struct PatchRequest<'a> {
  pub image_ref: &'a str,
  pub image_name: &'a str,
  pub reports_dir: &'a Path,
  pub results_dir: &'a Path,
  pub target_registry: &'a str,
  pub image_prefix: Option<&'a str>,
  pub tools: &'a ToolsConfig,
  /// Patch even if the patched tag already exists.
  pub force: bool,
}

/// Patch one image and record its result.
///
/// A patcher or mirror failure is written as a failed result and then
/// returned as [`PatchError::Failed`].
pub async fn patch_image<R: Registry>(request: &PatchRequest<'_>, registry: &R) -> Result<SinglePatchResult, PatchError> {
  let source = Image::parse(request.image_ref)?;
  let report_path = report::report_path(request.reports_dir, request.image_name);
  let report = VulnReport::load(&report_path)?.ok_or_else(|| PatchError::MissingReport {
    image_ref: request.image_ref.to_string(),
    path: report_path.clone(),
  })?;

  let target = patched_target(&source, request.target_registry, request.image_prefix);
  let outcome = decide(request, registry, &report, target).await;

  let result = SinglePatchResult {
    image_ref: request.image_ref.to_string(),
    vuln_count: report.total(),
    outcome,
  };
  let path = save_result(request.results_dir, request.image_name, &result)?;

  if let PatchOutcome::Failed(message) = &result.outcome {
    return Err(PatchError::Failed {
      image_ref: request.image_ref.to_string(),
      message: message.clone(),
    });
  }
  info!(image = %request.image_ref, outcome = ?result.outcome, result = %path.display(), "recorded patch result");
  Ok(result)
}

async fn decide<R: Registry>(
  request: &PatchRequest<'_>,
  registry: &R,
  report: &VulnReport,
  target: PatchTarget,
) -> PatchOutcome {
  if !request.force && target_exists(registry, &target).await {
    return PatchOutcome::Skipped {
      reason: SkipReason::UpToDate,
      target: Some(target),
    };
  }

  let target_ref = target.reference();
  let vars = [
    ("image", request.image_ref),
    ("target", target_ref.as_str()),
    ("tag", target.tag.as_str()),
  ];

  if report.fixable_count() == 0 {
    let Some(mirror) = &request.tools.mirror else {
      return PatchOutcome::Skipped {
        reason: SkipReason::NoFixableVulnerabilities,
        target: None,
      };
    };
    return match process::run(&process::expand(mirror, &vars)).await {
      Ok(_) => {
        info!(image = %request.image_ref, target = %target_ref, "mirrored image without fixable vulnerabilities");
        PatchOutcome::Skipped {
          reason: SkipReason::NoFixableVulnerabilities,
          target: Some(target),
        }
      }
      Err(e) => PatchOutcome::Failed(format!("mirror failed: {}", e)),
    };
  }

  let raw_report = report::raw_report_path(request.reports_dir, request.image_name)
    .display()
    .to_string();
  let vars = [
    ("image", request.image_ref),
    ("target", target_ref.as_str()),
    ("tag", target.tag.as_str()),
    ("report", raw_report.as_str()),
  ];
  match process::run(&process::expand(&request.tools.patcher, &vars)).await {
    Ok(_) => {
      info!(image = %request.image_ref, target = %target_ref, fixable = report.fixable_count(), "patched image");
      PatchOutcome::Patched(target)
    }
    Err(e) => PatchOutcome::Failed(e.to_string()),
  }
}

async fn target_exists<R: Registry>(registry: &R, target: &PatchTarget) -> bool {
  match registry.tag_exists(&target.image(), &target.tag).await {
    Ok(exists) => exists,
    Err(e) => {
      warn!(target = %target.reference(), error = %e, "could not check for an existing patched image");
      false
    }
  }
}
