//! Before/after vulnerability catalog.
//!
//! The catalog joins every matrix entry with its pre-patch report, its
//! post-patch report (if the patched image was scanned) and its patch
//! result. It is the input of the static catalog site.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::matrix::Matrix;
use crate::metadata::{self, MetadataError};
use crate::patch::PatchResults;
use crate::scan::report::{patched_report_path, report_path};
use crate::scan::{VulnReport, Vulnerability};

#[derive(Debug, Error)]
pub enum CatalogError {
  #[error(transparent)]
  Write(#[from] MetadataError),
}

/// Vulnerability totals of one report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VulnSummary {
  pub total: usize,
  pub severity_counts: BTreeMap<String, usize>,
}

impl From<&VulnReport> for VulnSummary {
  fn from(report: &VulnReport) -> Self {
    Self {
      total: report.total(),
      severity_counts: report.severity_counts(),
    }
  }
}

/// One image in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogImage {
  /// Matrix entry name.
  pub id: String,
  pub original_ref: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub patched_ref: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub os: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub skip_reason: Option<String>,
  pub before_vulns: VulnSummary,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub after_vulns: Option<VulnSummary>,
  /// Post-patch findings, or pre-patch findings if no post-patch scan exists.
  pub vulnerabilities: Vec<Vulnerability>,
}

impl CatalogImage {
  /// Findings remaining after patching. Without a post-patch scan, nothing
  /// is assumed fixed.
  pub fn remaining(&self) -> usize {
    self.after_vulns.as_ref().map_or(self.before_vulns.total, |a| a.total)
  }

  /// Findings fixed by patching. Negative if patching introduced findings.
  pub fn fixed(&self) -> i64 {
    self.before_vulns.total as i64 - self.remaining() as i64
  }
}

/// Catalog-wide totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSummary {
  pub total_images: usize,
  pub total_vulns_before: usize,
  pub total_vulns_after: usize,
  pub fixed_vulns: i64,
}

/// The catalog document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
  pub images: Vec<CatalogImage>,
  pub summary: CatalogSummary,
}

impl Catalog {
  pub fn save(&self, path: &Path) -> Result<(), CatalogError> {
    Ok(metadata::write_json(path, self)?)
  }
}

/// Build one catalog entry from its reports.
pub fn catalog_entry(
  id: &str,
  original_ref: &str,
  patched_ref: Option<String>,
  before: &VulnReport,
  after: Option<&VulnReport>,
) -> CatalogImage {
  CatalogImage {
    id: id.to_string(),
    original_ref: original_ref.to_string(),
    patched_ref,
    os: before.os.clone(),
    skip_reason: None,
    before_vulns: VulnSummary::from(before),
    after_vulns: after.map(VulnSummary::from),
    vulnerabilities: after.unwrap_or(before).vulnerabilities.clone(),
  }
}

pub fn summarize(images: &[CatalogImage]) -> CatalogSummary {
  CatalogSummary {
    total_images: images.len(),
    total_vulns_before: images.iter().map(|i| i.before_vulns.total).sum(),
    total_vulns_after: images.iter().map(CatalogImage::remaining).sum(),
    fixed_vulns: images.iter().map(CatalogImage::fixed).sum(),
  }
}

/// Build the catalog for every scanned matrix entry.
///
/// Entries without a pre-patch report were never scanned and are left out.
/// An unreadable report is logged and treated as absent.
pub fn build_catalog(matrix: &Matrix, results: &PatchResults, reports_dir: &Path) -> Catalog {
  let mut images = Vec::new();

  for entry in &matrix.include {
    let Some(before) = load_report(&report_path(reports_dir, &entry.image_name)) else {
      warn!(image = %entry.image_ref, "no vulnerability report, leaving image out of the catalog");
      continue;
    };
    let after = load_report(&patched_report_path(reports_dir, &entry.image_name));
    let result = results.get(&entry.image_ref);

    let mut image = catalog_entry(
      &entry.image_name,
      &entry.image_ref,
      result.target().map(|t| t.reference()),
      &before,
      after.as_ref(),
    );
    image.skip_reason = result.skip_reason().map(|r| r.as_str().to_string());
    debug!(image = %entry.image_ref, before = image.before_vulns.total, after = image.remaining(), "cataloged image");
    images.push(image);
  }

  let summary = summarize(&images);
  Catalog { images, summary }
}

fn load_report(path: &Path) -> Option<VulnReport> {
  VulnReport::load(path).unwrap_or_else(|e| {
    warn!(path = %path.display(), error = %e, "ignoring unreadable report");
    None
  })
}
