//! Per-image patch results.
//!
//! A result is produced once per matrix entry and read back by assembly and
//! the catalog. In memory it is a [`SinglePatchResult`] whose outcome makes
//! the "patched xor skipped xor failed" rule unrepresentable to break. On
//! disk it is a flat JSON record:
//!
//! ```json
//! {
//!   "image_ref": "nginx:1.25",
//!   "patched_registry": "ghcr.io/acme",
//!   "patched_repository": "nginx",
//!   "patched_tag": "1.25-patched",
//!   "vuln_count": 12,
//!   "skipped": false,
//!   "changed": true
//! }
//! ```

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::image::Image;
use crate::matrix::Matrix;
use crate::util::fs::write_atomic;

#[derive(Debug, Error)]
pub enum ResultError {
  #[error("failed to read patch result {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write patch result {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("invalid patch result {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("inconsistent patch result for {image_ref}: {message}")]
  Inconsistent { image_ref: String, message: String },
}

/// Why an image was not patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
  /// The patched tag already exists in the target registry.
  UpToDate,
  /// The scan found nothing with a known fix.
  NoFixableVulnerabilities,
  /// No result was produced for the image.
  NoResult,
}

impl SkipReason {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::UpToDate => "up_to_date",
      Self::NoFixableVulnerabilities => "no_fixable_vulnerabilities",
      Self::NoResult => "no_result",
    }
  }
}

/// Where a patched (or mirrored) image lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchTarget {
  pub registry: String,
  pub repository: String,
  pub tag: String,
}

impl PatchTarget {
  /// The target as an image, for registry queries.
  pub fn image(&self) -> Image {
    Image {
      registry: Some(self.registry.clone()),
      repository: self.repository.clone(),
      tag: Some(self.tag.clone()),
      path: String::new(),
    }
  }

  pub fn reference(&self) -> String {
    format!("{}/{}:{}", self.registry, self.repository, self.tag)
  }
}

/// What happened to one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
  Patched(PatchTarget),
  /// Not patched. A target is present when the image is nevertheless
  /// available there (already published, or mirrored).
  Skipped {
    reason: SkipReason,
    target: Option<PatchTarget>,
  },
  Failed(String),
}

/// The patch result for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinglePatchResult {
  pub image_ref: String,
  /// Vulnerabilities found before patching.
  pub vuln_count: usize,
  pub outcome: PatchOutcome,
}

impl SinglePatchResult {
  /// The result assumed for an image whose result file is missing.
  pub fn no_result(image_ref: impl Into<String>) -> Self {
    Self {
      image_ref: image_ref.into(),
      vuln_count: 0,
      outcome: PatchOutcome::Skipped {
        reason: SkipReason::NoResult,
        target: None,
      },
    }
  }

  /// Whether this run produced a new patched image.
  pub fn changed(&self) -> bool {
    matches!(self.outcome, PatchOutcome::Patched(_))
  }

  /// Where the image can be pulled from after this run, if anywhere.
  pub fn target(&self) -> Option<&PatchTarget> {
    match &self.outcome {
      PatchOutcome::Patched(target) => Some(target),
      PatchOutcome::Skipped { target, .. } => target.as_ref(),
      PatchOutcome::Failed(_) => None,
    }
  }

  pub fn skip_reason(&self) -> Option<SkipReason> {
    match self.outcome {
      PatchOutcome::Skipped { reason, .. } => Some(reason),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match &self.outcome {
      PatchOutcome::Failed(message) => Some(message),
      _ => None,
    }
  }
}

/// The flat on-disk record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchResultRecord {
  pub image_ref: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub patched_registry: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub patched_repository: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub patched_tag: Option<String>,
  #[serde(default)]
  pub vuln_count: usize,
  #[serde(default)]
  pub skipped: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub skip_reason: Option<SkipReason>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(default)]
  pub changed: bool,
}

impl From<&SinglePatchResult> for PatchResultRecord {
  fn from(result: &SinglePatchResult) -> Self {
    let target = result.target();
    Self {
      image_ref: result.image_ref.clone(),
      patched_registry: target.map(|t| t.registry.clone()),
      patched_repository: target.map(|t| t.repository.clone()),
      patched_tag: target.map(|t| t.tag.clone()),
      vuln_count: result.vuln_count,
      skipped: result.skip_reason().is_some(),
      skip_reason: result.skip_reason(),
      error: result.error().map(str::to_string),
      changed: result.changed(),
    }
  }
}

impl TryFrom<PatchResultRecord> for SinglePatchResult {
  type Error = ResultError;

  fn try_from(record: PatchResultRecord) -> Result<Self, Self::Error> {
    let inconsistent = |message: &str| ResultError::Inconsistent {
      image_ref: record.image_ref.clone(),
      message: message.to_string(),
    };

    let target = match (&record.patched_registry, &record.patched_repository, &record.patched_tag) {
      (Some(registry), Some(repository), Some(tag)) => Some(PatchTarget {
        registry: registry.clone(),
        repository: repository.clone(),
        tag: tag.clone(),
      }),
      (None, None, None) => None,
      _ => return Err(inconsistent("partial patched image")),
    };

    let outcome = match (record.error.clone(), record.skipped, target) {
      (Some(_), true, _) => return Err(inconsistent("both skipped and failed")),
      (Some(message), false, _) => PatchOutcome::Failed(message),
      (None, true, target) => PatchOutcome::Skipped {
        reason: record.skip_reason.unwrap_or(SkipReason::NoResult),
        target,
      },
      (None, false, Some(target)) => PatchOutcome::Patched(target),
      (None, false, None) => return Err(inconsistent("neither patched, skipped nor failed")),
    };

    Ok(Self {
      image_ref: record.image_ref,
      vuln_count: record.vuln_count,
      outcome,
    })
  }
}

/// Result file for a matrix entry.
pub fn result_path(dir: &Path, image_name: &str) -> PathBuf {
  dir.join(format!("{}.json", image_name))
}

/// Write a result atomically.
pub fn save_result(dir: &Path, image_name: &str, result: &SinglePatchResult) -> Result<PathBuf, ResultError> {
  let path = result_path(dir, image_name);
  let content =
    serde_json::to_string_pretty(&PatchResultRecord::from(result)).map_err(|source| ResultError::Parse {
      path: path.clone(),
      source,
    })?;
  write_atomic(&path, content.as_bytes()).map_err(|source| ResultError::Write {
    path: path.clone(),
    source,
  })?;
  Ok(path)
}

/// Read a result. A missing file is `None`.
pub fn load_result(dir: &Path, image_name: &str) -> Result<Option<SinglePatchResult>, ResultError> {
  let path = result_path(dir, image_name);
  let content = match fs::read_to_string(&path) {
    Ok(content) => content,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
    Err(source) => return Err(ResultError::Read { path, source }),
  };
  let record: PatchResultRecord =
    serde_json::from_str(&content).map_err(|source| ResultError::Parse { path, source })?;
  SinglePatchResult::try_from(record).map(Some)
}

/// Patch results for a whole matrix, keyed by image reference.
#[derive(Debug, Clone, Default)]
pub struct PatchResults {
  by_ref: HashMap<String, SinglePatchResult>,
}

impl PatchResults {
  /// Read the result of every matrix entry from `dir`.
  ///
  /// Missing or unreadable files become `no_result`, so a partially failed
  /// CI run still assembles.
  pub fn load(matrix: &Matrix, dir: &Path) -> Self {
    let mut by_ref = HashMap::new();
    for entry in &matrix.include {
      let result = match load_result(dir, &entry.image_name) {
        Ok(Some(result)) => result,
        Ok(None) => {
          debug!(image = %entry.image_ref, "no patch result");
          SinglePatchResult::no_result(&entry.image_ref)
        }
        Err(e) => {
          warn!(image = %entry.image_ref, error = %e, "ignoring unreadable patch result");
          SinglePatchResult::no_result(&entry.image_ref)
        }
      };
      by_ref.insert(entry.image_ref.clone(), result);
    }
    Self { by_ref }
  }

  pub fn insert(&mut self, result: SinglePatchResult) {
    self.by_ref.insert(result.image_ref.clone(), result);
  }

  /// The result for `image_ref`, or `no_result` if none is known.
  pub fn get(&self, image_ref: &str) -> SinglePatchResult {
    self
      .by_ref
      .get(image_ref)
      .cloned()
      .unwrap_or_else(|| SinglePatchResult::no_result(image_ref))
  }

  pub fn len(&self) -> usize {
    self.by_ref.len()
  }

  pub fn is_empty(&self) -> bool {
    self.by_ref.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn target() -> PatchTarget {
    PatchTarget {
      registry: "ghcr.io/acme".to_string(),
      repository: "nginx".to_string(),
      tag: "1.25-patched".to_string(),
    }
  }

  fn result(outcome: PatchOutcome) -> SinglePatchResult {
    SinglePatchResult {
      image_ref: "nginx:1.25".to_string(),
      vuln_count: 4,
      outcome,
    }
  }

  mod record {
    use super::*;

    #[test]
    fn patched_is_changed_and_not_skipped() {
      let record = PatchResultRecord::from(&result(PatchOutcome::Patched(target())));
      assert!(record.changed);
      assert!(!record.skipped);
      assert_eq!(record.patched_tag.as_deref(), Some("1.25-patched"));
      assert_eq!(record.error, None);
    }

    #[test]
    fn skip_reasons_use_snake_case() {
      let record = PatchResultRecord::from(&result(PatchOutcome::Skipped {
        reason: SkipReason::NoFixableVulnerabilities,
        target: None,
      }));
      let json = serde_json::to_value(&record).unwrap();
      assert_eq!(json["skip_reason"], "no_fixable_vulnerabilities");
      assert_eq!(json["skipped"], true);
      assert_eq!(json["changed"], false);
      assert!(json.get("patched_registry").is_none());
    }

    #[test]
    fn failed_carries_error() {
      let record = PatchResultRecord::from(&result(PatchOutcome::Failed("copa exited 1".into())));
      assert!(!record.changed);
      assert!(!record.skipped);
      assert_eq!(record.error.as_deref(), Some("copa exited 1"));
    }

    #[test]
    fn rejects_inconsistent_records() {
      let record: PatchResultRecord = serde_json::from_str(r#"{"image_ref": "x:1", "patched_tag": "1-patched"}"#).unwrap();
      assert!(matches!(
        SinglePatchResult::try_from(record),
        Err(ResultError::Inconsistent { .. })
      ));

      let record: PatchResultRecord = serde_json::from_str(r#"{"image_ref": "x:1"}"#).unwrap();
      assert!(SinglePatchResult::try_from(record).is_err());
    }

    #[test]
    fn skipped_without_reason_defaults_to_no_result() {
      let record: PatchResultRecord = serde_json::from_str(r#"{"image_ref": "x:1", "skipped": true}"#).unwrap();
      let parsed = SinglePatchResult::try_from(record).unwrap();
      assert_eq!(parsed.skip_reason(), Some(SkipReason::NoResult));
    }
  }

  mod files {
    use super::*;

    #[test]
    fn save_then_load() {
      let dir = TempDir::new().unwrap();
      let original = result(PatchOutcome::Skipped {
        reason: SkipReason::UpToDate,
        target: Some(target()),
      });
      let path = save_result(dir.path(), "nginx_1.25", &original).unwrap();
      assert_eq!(path, dir.path().join("nginx_1.25.json"));
      assert_eq!(load_result(dir.path(), "nginx_1.25").unwrap(), Some(original));
    }

    #[test]
    fn missing_file_is_none() {
      let dir = TempDir::new().unwrap();
      assert_eq!(load_result(dir.path(), "absent").unwrap(), None);
    }

    #[test]
    fn results_default_to_no_result() {
      let dir = TempDir::new().unwrap();
      let images = vec![Image::parse("nginx:1.25").unwrap(), Image::parse("busybox:1.36").unwrap()];
      let matrix = Matrix::build(&images);
      save_result(
        dir.path(),
        &matrix.include[0].image_name,
        &result(PatchOutcome::Patched(target())),
      )
      .unwrap();
      std::fs::write(dir.path().join(format!("{}.json", matrix.include[1].image_name)), "{").unwrap();

      let results = PatchResults::load(&matrix, dir.path());
      assert!(results.get("nginx:1.25").changed());
      assert_eq!(results.get("busybox:1.36").skip_reason(), Some(SkipReason::NoResult));
      assert_eq!(results.get("unknown:1").skip_reason(), Some(SkipReason::NoResult));
    }
  }

  #[test]
  fn no_result_has_no_target() {
    let result = SinglePatchResult::no_result("x:1");
    assert!(!result.changed());
    assert!(result.target().is_none());
    assert_eq!(result.skip_reason(), Some(SkipReason::NoResult));
  }

  #[test]
  fn target_reference() {
    assert_eq!(target().reference(), "ghcr.io/acme/nginx:1.25-patched");
  }
}
