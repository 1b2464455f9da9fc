//! Vulnerability scanning.
//!
//! Each matrix entry is scanned by the external scanner. The scanner writes
//! its raw JSON next to the normalized report:
//!
//! ```text
//! reports/
//! ├── nginx_1.25.raw.json           # scanner output, handed to the patcher
//! ├── nginx_1.25.json               # normalized pre-patch report
//! ├── nginx_1.25.patched.raw.json
//! └── nginx_1.25.patched.json       # normalized post-patch report
//! ```
//!
//! Scans run concurrently up to a configured limit. A failed scan is
//! reported without cancelling the others.

pub mod report;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::matrix::MatrixEntry;
use crate::process::{self, ProcessError};

pub use report::{ReportError, VulnReport, Vulnerability};

#[derive(Debug, Error)]
pub enum ScanError {
  #[error(transparent)]
  Process(#[from] ProcessError),

  #[error(transparent)]
  Report(#[from] ReportError),

  #[error("scanner output for {image} is not valid JSON: {source}")]
  Output {
    image: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("scan worker failed: {0}")]
  Worker(String),
}

/// Which image of a matrix entry is scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStage {
  /// The upstream image.
  Original,
  /// The published patched image.
  Patched,
}

/// One scan to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanJob {
  /// Reference handed to the scanner.
  pub image_ref: String,
  /// Matrix entry name keying the report files.
  pub image_name: String,
  pub stage: ScanStage,
}

impl ScanJob {
  pub fn original(entry: &MatrixEntry) -> Self {
    Self {
      image_ref: entry.image_ref.clone(),
      image_name: entry.image_name.clone(),
      stage: ScanStage::Original,
    }
  }

  /// Scan `target` and file the report under the entry's name.
  pub fn patched(entry: &MatrixEntry, target: impl Into<String>) -> Self {
    Self {
      image_ref: target.into(),
      image_name: entry.image_name.clone(),
      stage: ScanStage::Patched,
    }
  }

  fn raw_path(&self, dir: &Path) -> PathBuf {
    match self.stage {
      ScanStage::Original => report::raw_report_path(dir, &self.image_name),
      ScanStage::Patched => report::patched_raw_report_path(dir, &self.image_name),
    }
  }

  fn report_path(&self, dir: &Path) -> PathBuf {
    match self.stage {
      ScanStage::Original => report::report_path(dir, &self.image_name),
      ScanStage::Patched => report::patched_report_path(dir, &self.image_name),
    }
  }
}

/// Runs the scanner command template against images.
///
/// The template may use `{image}` and `{output}`.
#[derive(Debug, Clone)]
pub struct Scanner {
  command: Vec<String>,
  reports_dir: PathBuf,
}

impl Scanner {
  pub fn new(command: Vec<String>, reports_dir: impl Into<PathBuf>) -> Self {
    Self {
      command,
      reports_dir: reports_dir.into(),
    }
  }

  pub fn reports_dir(&self) -> &Path {
    &self.reports_dir
  }

  /// Scan one image and write its normalized report. Returns the report path.
  pub async fn scan(&self, job: &ScanJob) -> Result<PathBuf, ScanError> {
    let raw_path = job.raw_path(&self.reports_dir);
    if let Some(parent) = raw_path.parent() {
      tokio::fs::create_dir_all(parent)
        .await
        .map_err(|source| ReportError::Write {
          path: parent.to_path_buf(),
          source,
        })?;
    }

    let raw_display = raw_path.display().to_string();
    let argv = process::expand(&self.command, &[("image", job.image_ref.as_str()), ("output", raw_display.as_str())]);
    debug!(image = %job.image_ref, command = ?argv, "running scanner");
    process::run(&argv).await?;

    let raw = tokio::fs::read_to_string(&raw_path)
      .await
      .map_err(|source| ReportError::Read {
        path: raw_path.clone(),
        source,
      })?;
    let normalized = VulnReport::from_trivy(&job.image_ref, &raw).map_err(|source| ScanError::Output {
      image: job.image_ref.clone(),
      source,
    })?;

    let report_path = job.report_path(&self.reports_dir);
    normalized.save(&report_path)?;
    info!(
      image = %job.image_ref,
      vulnerabilities = normalized.total(),
      fixable = normalized.fixable_count(),
      "scanned image"
    );
    Ok(report_path)
  }
}

/// Outcome of a batch of scans.
#[derive(Debug, Default)]
pub struct ScanSummary {
  /// `(image_ref, report path)` for every successful scan.
  pub reports: Vec<(String, PathBuf)>,
  /// `(image_ref, error)` for every failed scan.
  pub failures: Vec<(String, ScanError)>,
}

impl ScanSummary {
  pub fn is_success(&self) -> bool {
    self.failures.is_empty()
  }
}

/// Scan every job with at most `concurrency` scans in flight.
pub async fn scan_all(scanner: Arc<Scanner>, jobs: Vec<ScanJob>, concurrency: usize) -> ScanSummary {
  let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
  let mut join_set = JoinSet::new();

  for job in jobs {
    let scanner = Arc::clone(&scanner);
    let semaphore = Arc::clone(&semaphore);
    join_set.spawn(async move {
      let result = match semaphore.acquire_owned().await {
        Ok(_permit) => scanner.scan(&job).await,
        Err(e) => Err(ScanError::Worker(e.to_string())),
      };
      (job.image_ref, result)
    });
  }

  let mut summary = ScanSummary::default();
  while let Some(joined) = join_set.join_next().await {
    match joined {
      Ok((image_ref, Ok(path))) => summary.reports.push((image_ref, path)),
      Ok((image_ref, Err(e))) => {
        error!(image = %image_ref, error = %e, "scan failed");
        summary.failures.push((image_ref, e));
      }
      Err(e) => {
        error!(error = %e, "scan task panicked");
        summary.failures.push((String::new(), ScanError::Worker(e.to_string())));
      }
    }
  }

  summary.reports.sort_by(|a, b| a.0.cmp(&b.0));
  summary
}
