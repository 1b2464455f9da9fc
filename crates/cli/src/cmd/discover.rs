use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use chartpatch_lib::discover::{self, DiscoveryManifest, HelmRenderer};

use super::{load_config, registry_client, runtime};
use crate::output::{OutputFormat, elapsed, print_info, print_json, print_stat, print_success, print_warning, symbols};

#[derive(Debug, Args)]
pub struct DiscoverArgs {
  /// Where to write the discovery manifest
  #[arg(long, default_value = "discovery.json")]
  pub manifest: PathBuf,
}

#[derive(Serialize)]
struct DiscoverReport<'a> {
  manifest: &'a Path,
  charts: usize,
  images: usize,
  appended: Vec<&'a str>,
  skipped: Vec<&'a str>,
}

/// Discover chart and tracked images, merge new ones into the inventory and
/// write the discovery manifest.
pub fn cmd_discover(config: Option<&Path>, args: &DiscoverArgs, format: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let config = load_config(config)?;
  let registry = registry_client(&config)?;
  let renderer = HelmRenderer::new(config.tools.helm.clone());

  let rt = runtime()?;
  let outcome = rt
    .block_on(discover::discover(&config, &registry, &renderer))
    .context("Discovery failed")?;

  outcome
    .manifest
    .save(&args.manifest)
    .with_context(|| format!("Failed to write discovery manifest {}", args.manifest.display()))?;

  if format.is_json() {
    return print_json(&DiscoverReport {
      manifest: &args.manifest,
      charts: outcome.manifest.charts.len(),
      images: outcome.manifest.images.len(),
      appended: outcome.appended.iter().map(|e| e.key.as_str()).collect(),
      skipped: outcome.skipped.iter().map(|s| s.name.as_str()).collect(),
    });
  }

  for entry in &outcome.appended {
    print_info(&format!("{} {} {}", symbols::ADD, entry.key, entry.image.reference()));
  }
  for skipped in &outcome.skipped {
    print_warning(&format!("Skipped chart {}: {}", skipped.name, skipped.error));
  }

  print_success(&format!("Wrote {}", args.manifest.display()));
  print_manifest_stats(&outcome.manifest, outcome.appended.len());
  print_stat("Duration", &elapsed(start));
  Ok(())
}

fn print_manifest_stats(manifest: &DiscoveryManifest, appended: usize) {
  print_stat("Charts", &manifest.charts.len().to_string());
  print_stat("Images", &manifest.images.len().to_string());
  print_stat("New inventory entries", &appended.to_string());
}
