//! Chart rendering capability.
//!
//! Charts are opaque to the engine: their metadata, default values and
//! rendered manifests come from an external renderer. [`HelmRenderer`] drives
//! the `helm` CLI; tests use an in-memory fake.

use std::future::Future;

use serde_yaml::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::ChartSource;
use crate::process::{self, ProcessError};

use super::walker::scalar_string;

/// Errors that can occur when rendering a chart.
#[derive(Debug, Error)]
pub enum RenderError {
  #[error(transparent)]
  Process(#[from] ProcessError),

  #[error("failed to parse output for chart {chart}: {source}")]
  Parse {
    chart: String,
    #[source]
    source: serde_yaml::Error,
  },
}

/// The subset of `Chart.yaml` the pipeline uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartMetadata {
  pub name: String,
  pub version: String,
  pub app_version: Option<String>,
}

impl ChartMetadata {
  /// Parse `Chart.yaml` text. Numeric versions are accepted as strings.
  pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
    let doc: Value = serde_yaml::from_str(text)?;
    let field = |key: &str| doc.get(key).and_then(scalar_string);
    Ok(Self {
      name: field("name").unwrap_or_default(),
      version: field("version").unwrap_or_default(),
      app_version: field("appVersion"),
    })
  }
}

/// Read-only access to a chart's metadata, values and rendered manifests.
pub trait ChartRenderer {
  fn chart_metadata(&self, chart: &ChartSource) -> impl Future<Output = Result<ChartMetadata, RenderError>> + Send;

  /// The chart's default values. An empty document is an empty mapping.
  fn values(&self, chart: &ChartSource) -> impl Future<Output = Result<Value, RenderError>> + Send;

  /// Render the chart's manifests with default values.
  fn render(&self, chart: &ChartSource) -> impl Future<Output = Result<String, RenderError>> + Send;
}

/// Renderer backed by the `helm` binary.
#[derive(Debug, Clone)]
pub struct HelmRenderer {
  helm: String,
}

impl HelmRenderer {
  pub fn new(helm: impl Into<String>) -> Self {
    Self { helm: helm.into() }
  }

  /// Chart location arguments: `oci://` repositories are addressed directly,
  /// everything else through `--repo`.
  fn chart_args(&self, chart: &ChartSource) -> Vec<String> {
    let location = if chart.repository.starts_with("oci://") {
      vec![format!("{}/{}", chart.repository.trim_end_matches('/'), chart.name)]
    } else {
      vec![chart.name.clone(), "--repo".to_string(), chart.repository.clone()]
    };
    location
      .into_iter()
      .chain(["--version".to_string(), chart.version.clone()])
      .collect()
  }

  async fn helm(&self, chart: &ChartSource, args: &[&str]) -> Result<String, RenderError> {
    let argv: Vec<String> = std::iter::once(self.helm.clone())
      .chain(args.iter().map(|a| a.to_string()))
      .chain(self.chart_args(chart))
      .collect();
    debug!(chart = %chart.name, command = ?argv, "running helm");
    Ok(process::run(&argv).await?)
  }
}

impl ChartRenderer for HelmRenderer {
  async fn chart_metadata(&self, chart: &ChartSource) -> Result<ChartMetadata, RenderError> {
    let text = self.helm(chart, &["show", "chart"]).await?;
    ChartMetadata::from_yaml(&text).map_err(|source| RenderError::Parse {
      chart: chart.name.clone(),
      source,
    })
  }

  async fn values(&self, chart: &ChartSource) -> Result<Value, RenderError> {
    let text = self.helm(chart, &["show", "values"]).await?;
    let values: Value = serde_yaml::from_str(&text).map_err(|source| RenderError::Parse {
      chart: chart.name.clone(),
      source,
    })?;
    Ok(match values {
      Value::Null => Value::Mapping(Default::default()),
      other => other,
    })
  }

  async fn render(&self, chart: &ChartSource) -> Result<String, RenderError> {
    self.helm(chart, &["template", chart.name.as_str()]).await
  }
}
