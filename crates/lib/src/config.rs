//! Configuration file loading.
//!
//! The configuration (`chartpatch.yaml`) names the charts to discover, the
//! externally tracked images and their tag strategies, where patched
//! artifacts are published, and how the external tools are invoked.
//!
//! # Format
//!
//! ```yaml
//! inventory: images.yaml
//! charts:
//!   - name: vector
//!     repository: https://helm.vector.dev
//!     version: 0.40.0
//! images:
//!   - repository: prometheus/prometheus
//!     registry: quay.io
//!     strategy: pattern
//!     pattern: '^v\d+\.\d+\.\d+$'
//!     maxTags: 2
//! target:
//!   registry: ghcr.io/acme
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{
  CONFIG_FILENAME, DEFAULT_CHART_REPOSITORY, DEFAULT_REGISTRY_TIMEOUT_SECS, INVENTORY_FILENAME,
};
use crate::platform::paths::config_dir;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
  /// No config file could be found.
  #[error("config file not found: {path}")]
  NotFound { path: String },

  /// Failed to read the config file.
  #[error("failed to read config file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  /// Failed to parse the config YAML.
  #[error("failed to parse config file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },

  /// A command needs a publish target but none is configured.
  #[error("no target registry configured (set `target.registry`)")]
  MissingTarget,
}

/// A chart whose images should be discovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSource {
  /// Chart name.
  pub name: String,
  /// Chart repository URL (`https://...`) or OCI base (`oci://...`).
  pub repository: String,
  /// Pinned chart version.
  pub version: String,
  /// Overrides the chart's declared `appVersion` for tag resolution.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub app_version: Option<String>,
}

/// An image tracked outside of any chart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedImage {
  /// Display name; defaults to the repository.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub registry: Option<String>,
  pub repository: String,
  /// Tag strategy: `list`, `pattern` or `latest`.
  pub strategy: String,
  /// Tags for the `list` strategy.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub tags: Vec<String>,
  /// Regular expression for the `pattern` strategy.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pattern: Option<String>,
  /// Tags never selected by `pattern` or `latest`.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub exclude: Vec<String>,
  /// Keep at most this many of the newest matches. 0 or unset is unlimited.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_tags: Option<usize>,
}

impl TrackedImage {
  pub fn display_name(&self) -> &str {
    self.name.as_deref().unwrap_or(&self.repository)
  }
}

/// Where patched images and wrapper charts are published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
  /// Target registry, optionally with a namespace (e.g. `ghcr.io/acme`).
  #[serde(default)]
  pub registry: Option<String>,
  /// Repository below the target registry holding wrapper charts.
  #[serde(default = "default_chart_repository")]
  pub chart_repository: String,
  /// Optional path prefix for patched image repositories.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub image_prefix: Option<String>,
}

impl Default for TargetConfig {
  fn default() -> Self {
    Self {
      registry: None,
      chart_repository: default_chart_repository(),
      image_prefix: None,
    }
  }
}

impl TargetConfig {
  /// The target registry, or an error if none is configured.
  pub fn require_registry(&self) -> Result<&str, ConfigError> {
    self
      .registry
      .as_deref()
      .filter(|r| !r.trim().is_empty())
      .ok_or(ConfigError::MissingTarget)
  }
}

/// Registry client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
  /// Per-request timeout in seconds.
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  /// Hosts contacted over plain HTTP.
  #[serde(default)]
  pub plain_http: Vec<String>,
}

impl Default for RegistryConfig {
  fn default() -> Self {
    Self {
      timeout_secs: default_timeout_secs(),
      plain_http: Vec::new(),
    }
  }
}

impl RegistryConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs.max(1))
  }
}

/// Argument templates for the external collaborators.
///
/// Templates may reference `{image}`, `{output}`, `{report}`, `{target}` and `{tag}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsConfig {
  /// Chart renderer binary.
  #[serde(default = "default_helm")]
  pub helm: String,
  /// Vulnerability scanner command.
  #[serde(default = "default_scanner")]
  pub scanner: Vec<String>,
  /// Image patcher command.
  #[serde(default = "default_patcher")]
  pub patcher: Vec<String>,
  /// Optional command copying an unpatched image to its target.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub mirror: Option<Vec<String>>,
}

impl Default for ToolsConfig {
  fn default() -> Self {
    Self {
      helm: default_helm(),
      scanner: default_scanner(),
      patcher: default_patcher(),
      mirror: None,
    }
  }
}

/// Scanning stage settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
  /// Maximum concurrent scans. Defaults to the available parallelism.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub concurrency: Option<usize>,
}

impl ScanConfig {
  pub fn concurrency(&self) -> usize {
    self
      .concurrency
      .filter(|n| *n > 0)
      .unwrap_or_else(|| std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4))
  }
}

/// The complete configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
  /// Inventory file, relative to the config file's directory.
  #[serde(default = "default_inventory")]
  pub inventory: PathBuf,
  #[serde(default)]
  pub charts: Vec<ChartSource>,
  #[serde(default)]
  pub images: Vec<TrackedImage>,
  #[serde(default)]
  pub target: TargetConfig,
  #[serde(default)]
  pub registry: RegistryConfig,
  #[serde(default)]
  pub tools: ToolsConfig,
  #[serde(default)]
  pub scan: ScanConfig,
  /// Directory relative paths are resolved against.
  #[serde(skip)]
  pub base_dir: PathBuf,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      inventory: default_inventory(),
      charts: Vec::new(),
      images: Vec::new(),
      target: TargetConfig::default(),
      registry: RegistryConfig::default(),
      tools: ToolsConfig::default(),
      scan: ScanConfig::default(),
      base_dir: PathBuf::from("."),
    }
  }
}

impl Config {
  /// Parse configuration from YAML text.
  pub fn from_yaml(content: &str, base_dir: &Path) -> Result<Self, serde_yaml::Error> {
    let mut config: Config = serde_yaml::from_str(content)?;
    config.base_dir = base_dir.to_path_buf();
    Ok(config)
  }

  /// Load configuration from a file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let base_dir = path.parent().unwrap_or(Path::new("."));
    Self::from_yaml(&content, base_dir).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Resolve a path from the config against the config directory.
  pub fn resolve(&self, path: &Path) -> PathBuf {
    if path.is_absolute() {
      path.to_path_buf()
    } else {
      self.base_dir.join(path)
    }
  }

  /// Absolute location of the inventory file.
  pub fn inventory_path(&self) -> PathBuf {
    self.resolve(&self.inventory)
  }
}

/// Find the config file path, with fallback resolution.
///
/// Priority order:
/// 1. Explicit path if provided and exists
/// 2. `./chartpatch.yaml` in current directory
/// 3. `~/.config/chartpatch/chartpatch.yaml` (user config dir)
///
/// # Errors
///
/// Returns `ConfigError::NotFound` if no config file can be found.
pub fn find_config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
  if let Some(path) = explicit {
    if path.exists() {
      return Ok(path.to_path_buf());
    }
    return Err(ConfigError::NotFound {
      path: path.display().to_string(),
    });
  }

  let cwd_config = PathBuf::from(".").join(CONFIG_FILENAME);
  if cwd_config.exists() {
    return Ok(cwd_config);
  }

  let user_config = config_dir().join(CONFIG_FILENAME);
  if user_config.exists() {
    return Ok(user_config);
  }

  Err(ConfigError::NotFound {
    path: format!(
      "{} (tried ./{} and {})",
      CONFIG_FILENAME,
      CONFIG_FILENAME,
      user_config.display()
    ),
  })
}

fn default_inventory() -> PathBuf {
  PathBuf::from(INVENTORY_FILENAME)
}

fn default_chart_repository() -> String {
  DEFAULT_CHART_REPOSITORY.to_string()
}

fn default_timeout_secs() -> u64 {
  DEFAULT_REGISTRY_TIMEOUT_SECS
}

fn default_helm() -> String {
  "helm".to_string()
}

fn default_scanner() -> Vec<String> {
  ["trivy", "image", "--quiet", "--format", "json", "--output", "{output}", "{image}"]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_patcher() -> Vec<String> {
  ["copa", "patch", "--image", "{image}", "--report", "{report}", "--tag", "{tag}"]
    .into_iter()
    .map(String::from)
    .collect()
}
