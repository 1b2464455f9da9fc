use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use chartpatch_lib::config::{Config, find_config_path};

use crate::output::{OutputFormat, format_duration, print_json, print_stat};

#[derive(Serialize)]
struct InfoReport<'a> {
  version: &'static str,
  config: String,
  #[serde(flatten)]
  settings: &'a Config,
}

/// Print the resolved configuration.
pub fn cmd_info(config: Option<&Path>, format: OutputFormat) -> Result<()> {
  let path = find_config_path(config).context("Failed to find config file")?;
  let config = Config::load(&path).with_context(|| format!("Failed to load config {}", path.display()))?;

  if format.is_json() {
    return print_json(&InfoReport {
      version: env!("CARGO_PKG_VERSION"),
      config: path.display().to_string(),
      settings: &config,
    });
  }

  println!("chartpatch {}", env!("CARGO_PKG_VERSION"));
  println!();
  println!("Config: {}", path.display());
  print_stat("Inventory", &config.inventory_path().display().to_string());
  print_stat("Charts", &config.charts.len().to_string());
  for chart in &config.charts {
    println!("    {} {} ({})", chart.name, chart.version, chart.repository);
  }
  print_stat("Tracked images", &config.images.len().to_string());
  for image in &config.images {
    println!("    {} [{}]", image.display_name(), image.strategy);
  }
  print_stat("Target registry", config.target.registry.as_deref().unwrap_or("(not set)"));
  print_stat("Chart repository", &config.target.chart_repository);
  print_stat("Scan concurrency", &config.scan.concurrency().to_string());
  print_stat("Registry timeout", &format_duration(config.registry.timeout()));
  print_stat("Helm", &config.tools.helm);
  print_stat("Scanner", &config.tools.scanner.join(" "));
  print_stat("Patcher", &config.tools.patcher.join(" "));
  Ok(())
}
