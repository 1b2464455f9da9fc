mod assemble;
mod catalog;
mod discover;
mod info;
mod matrix;
mod patch;
mod scan;

use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use chartpatch_lib::config::{Config, find_config_path};
use chartpatch_lib::registry::HttpRegistry;

pub use assemble::{AssembleArgs, cmd_assemble};
pub use catalog::{CatalogArgs, cmd_catalog};
pub use discover::{DiscoverArgs, cmd_discover};
pub use info::cmd_info;
pub use matrix::{MatrixArgs, cmd_matrix};
pub use patch::{PatchArgs, cmd_patch};
pub use scan::{ScanArgs, cmd_scan};

/// Resolve and load the config file.
fn load_config(explicit: Option<&Path>) -> Result<Config> {
  let path = find_config_path(explicit).context("Failed to find config file")?;
  debug!(path = %path.display(), "loading config");
  Config::load(&path).with_context(|| format!("Failed to load config {}", path.display()))
}

fn registry_client(config: &Config) -> Result<HttpRegistry> {
  HttpRegistry::new(config.registry.timeout(), config.registry.plain_http.clone()).context("Failed to create registry client")
}

fn runtime() -> Result<tokio::runtime::Runtime> {
  tokio::runtime::Runtime::new().context("Failed to create async runtime")
}
