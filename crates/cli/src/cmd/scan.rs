use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Args;
use serde::Serialize;

use chartpatch_lib::matrix::Matrix;
use chartpatch_lib::patch::PatchResults;
use chartpatch_lib::scan::{ScanJob, Scanner, scan_all};

use super::{load_config, runtime};
use crate::output::{OutputFormat, elapsed, print_error, print_json, print_stat, print_success};

#[derive(Debug, Args)]
pub struct ScanArgs {
  /// Matrix to scan
  #[arg(long, default_value = "matrix.json")]
  pub matrix: PathBuf,

  /// Report directory
  #[arg(long, default_value = "reports")]
  pub reports: PathBuf,

  /// Scan the patched targets recorded in the result files instead
  #[arg(long)]
  pub patched: bool,

  /// Result directory used with --patched
  #[arg(long, default_value = "results")]
  pub results: PathBuf,

  /// Maximum concurrent scans (overrides the config)
  #[arg(long)]
  pub concurrency: Option<usize>,
}

#[derive(Serialize)]
struct ScanReport<'a> {
  scanned: Vec<&'a str>,
  failed: Vec<FailedScan<'a>>,
}

#[derive(Serialize)]
struct FailedScan<'a> {
  image: &'a str,
  error: String,
}

pub fn cmd_scan(config: Option<&Path>, args: &ScanArgs, format: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let config = load_config(config)?;
  let matrix =
    Matrix::load(&args.matrix).with_context(|| format!("Failed to read matrix {}", args.matrix.display()))?;

  let jobs: Vec<ScanJob> = if args.patched {
    let results = PatchResults::load(&matrix, &args.results);
    matrix
      .include
      .iter()
      .filter_map(|entry| {
        let result = results.get(&entry.image_ref);
        if !result.changed() {
          return None;
        }
        result.target().map(|t| ScanJob::patched(entry, t.reference()))
      })
      .collect()
  } else {
    matrix.include.iter().map(ScanJob::original).collect()
  };

  let concurrency = args.concurrency.filter(|n| *n > 0).unwrap_or_else(|| config.scan.concurrency());
  let scanner = Arc::new(Scanner::new(config.tools.scanner.clone(), &args.reports));

  let rt = runtime()?;
  let summary = rt.block_on(scan_all(scanner, jobs, concurrency));

  if format.is_json() {
    print_json(&ScanReport {
      scanned: summary.reports.iter().map(|(image, _)| image.as_str()).collect(),
      failed: summary
        .failures
        .iter()
        .map(|(image, e)| FailedScan {
          image,
          error: e.to_string(),
        })
        .collect(),
    })?;
  } else {
    for (image, error) in &summary.failures {
      print_error(&format!("{}: {}", image, error));
    }
    print_success(&format!("Scanned {} images", summary.reports.len()));
    print_stat("Reports", &args.reports.display().to_string());
    print_stat("Duration", &elapsed(start));
  }

  if !summary.is_success() {
    bail!("{} of {} scans failed", summary.failures.len(), summary.failures.len() + summary.reports.len());
  }
  Ok(())
}
