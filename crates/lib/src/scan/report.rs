//! Normalized vulnerability reports.
//!
//! Scanner output is normalized into a [`VulnReport`] before anything else
//! reads it, so patching, metadata and the catalog never depend on a specific
//! scanner's JSON layout. Trivy's JSON format is the one understood today.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::PATCHED_REPORT_SUFFIX;
use crate::util::fs::write_atomic;

#[derive(Debug, Error)]
pub enum ReportError {
  #[error("failed to read report {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write report {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("invalid report {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
}

/// A single finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vulnerability {
  pub id: String,
  pub package: String,
  pub installed_version: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub fixed_version: Option<String>,
  /// Upper-case severity (`CRITICAL`, `HIGH`, ..., `UNKNOWN`).
  pub severity: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
}

impl Vulnerability {
  /// Whether a fixed version is known.
  pub fn is_fixable(&self) -> bool {
    self.fixed_version.as_deref().is_some_and(|v| !v.trim().is_empty())
  }
}

/// A normalized scan of one image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VulnReport {
  pub image_ref: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub os: Option<String>,
  #[serde(default)]
  pub vulnerabilities: Vec<Vulnerability>,
}

impl VulnReport {
  /// Normalize Trivy JSON output.
  ///
  /// Findings repeated across targets are kept once.
  pub fn from_trivy(image_ref: &str, json: &str) -> Result<Self, serde_json::Error> {
    let raw: TrivyReport = serde_json::from_str(json)?;

    let os = raw.metadata.and_then(|m| m.os).map(|os| match os.name {
      Some(name) if !name.is_empty() => format!("{} {}", os.family, name),
      _ => os.family,
    });

    let mut seen = HashSet::new();
    let vulnerabilities = raw
      .results
      .unwrap_or_default()
      .into_iter()
      .flat_map(|r| r.vulnerabilities.unwrap_or_default())
      .filter(|v| seen.insert((v.id.clone(), v.package.clone(), v.installed_version.clone())))
      .map(|v| Vulnerability {
        severity: normalize_severity(&v.severity),
        id: v.id,
        package: v.package,
        installed_version: v.installed_version,
        fixed_version: v.fixed_version.filter(|f| !f.trim().is_empty()),
        title: v.title,
      })
      .collect();

    Ok(Self {
      image_ref: image_ref.to_string(),
      os,
      vulnerabilities,
    })
  }

  pub fn total(&self) -> usize {
    self.vulnerabilities.len()
  }

  pub fn fixable_count(&self) -> usize {
    self.vulnerabilities.iter().filter(|v| v.is_fixable()).count()
  }

  /// Findings per severity, in a stable order.
  pub fn severity_counts(&self) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for v in &self.vulnerabilities {
      *counts.entry(v.severity.clone()).or_insert(0) += 1;
    }
    counts
  }

  /// Load a normalized report. A missing file is `None`.
  pub fn load(path: &Path) -> Result<Option<Self>, ReportError> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(source) => {
        return Err(ReportError::Read {
          path: path.to_path_buf(),
          source,
        });
      }
    };
    serde_json::from_str(&content).map(Some).map_err(|source| ReportError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  pub fn save(&self, path: &Path) -> Result<(), ReportError> {
    let content = serde_json::to_string_pretty(self).map_err(|source| ReportError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    write_atomic(path, content.as_bytes()).map_err(|source| ReportError::Write {
      path: path.to_path_buf(),
      source,
    })
  }
}

fn normalize_severity(severity: &str) -> String {
  let severity = severity.trim().to_ascii_uppercase();
  if severity.is_empty() { "UNKNOWN".to_string() } else { severity }
}

/// Normalized pre-patch report for a matrix entry.
pub fn report_path(dir: &Path, image_name: &str) -> PathBuf {
  dir.join(format!("{}.json", image_name))
}

/// Raw scanner output for a matrix entry, handed to the patcher.
pub fn raw_report_path(dir: &Path, image_name: &str) -> PathBuf {
  dir.join(format!("{}.raw.json", image_name))
}

/// Normalized post-patch report for a matrix entry.
pub fn patched_report_path(dir: &Path, image_name: &str) -> PathBuf {
  dir.join(format!("{}{}", image_name, PATCHED_REPORT_SUFFIX))
}

pub fn patched_raw_report_path(dir: &Path, image_name: &str) -> PathBuf {
  dir.join(format!("{}.patched.raw.json", image_name))
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyReport {
  #[serde(default)]
  metadata: Option<TrivyMetadata>,
  #[serde(default)]
  results: Option<Vec<TrivyResult>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyMetadata {
  #[serde(default, rename = "OS")]
  os: Option<TrivyOs>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyOs {
  family: String,
  #[serde(default)]
  name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyResult {
  #[serde(default)]
  vulnerabilities: Option<Vec<TrivyVulnerability>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyVulnerability {
  #[serde(rename = "VulnerabilityID")]
  id: String,
  #[serde(rename = "PkgName")]
  package: String,
  #[serde(default)]
  installed_version: String,
  #[serde(default)]
  fixed_version: Option<String>,
  #[serde(default)]
  severity: String,
  #[serde(default)]
  title: Option<String>,
}

#[cfg(test)]
pub(crate) mod fixtures {
  /// A Trivy report with three findings, two of them fixable.
  pub const TRIVY_JSON: &str = r#"{
    "SchemaVersion": 2,
    "ArtifactName": "nginx:1.25",
    "Metadata": { "OS": { "Family": "debian", "Name": "12.5" } },
    "Results": [
      {
        "Target": "nginx:1.25 (debian 12.5)",
        "Vulnerabilities": [
          { "VulnerabilityID": "CVE-2024-0001", "PkgName": "openssl", "InstalledVersion": "3.0.11", "FixedVersion": "3.0.13", "Severity": "HIGH", "Title": "openssl issue" },
          { "VulnerabilityID": "CVE-2024-0002", "PkgName": "zlib", "InstalledVersion": "1.2.13", "FixedVersion": "", "Severity": "low" },
          { "VulnerabilityID": "CVE-2024-0003", "PkgName": "curl", "InstalledVersion": "7.88", "FixedVersion": "7.88.1-10", "Severity": "CRITICAL" }
        ]
      },
      {
        "Target": "usr/local/bin/app",
        "Vulnerabilities": [
          { "VulnerabilityID": "CVE-2024-0001", "PkgName": "openssl", "InstalledVersion": "3.0.11", "FixedVersion": "3.0.13", "Severity": "HIGH" }
        ]
      },
      { "Target": "empty" }
    ]
  }"#;
}

#[cfg(test)]
mod tests {
  use super::fixtures::TRIVY_JSON;
  use super::*;

  #[test]
  fn normalizes_trivy_output() {
    let report = VulnReport::from_trivy("nginx:1.25", TRIVY_JSON).unwrap();
    assert_eq!(report.image_ref, "nginx:1.25");
    assert_eq!(report.os.as_deref(), Some("debian 12.5"));
    assert_eq!(report.total(), 3);
    assert_eq!(report.fixable_count(), 2);
    assert_eq!(report.vulnerabilities[1].severity, "LOW");
    assert_eq!(report.vulnerabilities[1].fixed_version, None);
  }

  #[test]
  fn severity_counts_are_grouped() {
    let report = VulnReport::from_trivy("nginx:1.25", TRIVY_JSON).unwrap();
    let counts = report.severity_counts();
    assert_eq!(counts.get("HIGH"), Some(&1));
    assert_eq!(counts.get("CRITICAL"), Some(&1));
    assert_eq!(counts.get("LOW"), Some(&1));
  }

  #[test]
  fn clean_image_has_no_findings() {
    let report = VulnReport::from_trivy("distroless", r#"{"SchemaVersion": 2}"#).unwrap();
    assert_eq!(report.total(), 0);
    assert_eq!(report.os, None);
  }

  #[test]
  fn malformed_output_is_an_error() {
    assert!(VulnReport::from_trivy("x", "not json").is_err());
  }

  #[test]
  fn load_missing_is_none() {
    let dir = tempfile::TempDir::new().unwrap();
    assert!(VulnReport::load(&dir.path().join("absent.json")).unwrap().is_none());
  }

  #[test]
  fn report_paths() {
    let dir = Path::new("/reports");
    assert_eq!(report_path(dir, "nginx_1.25"), Path::new("/reports/nginx_1.25.json"));
    assert_eq!(raw_report_path(dir, "nginx_1.25"), Path::new("/reports/nginx_1.25.raw.json"));
    assert_eq!(patched_report_path(dir, "nginx_1.25"), Path::new("/reports/nginx_1.25.patched.json"));
  }
}
