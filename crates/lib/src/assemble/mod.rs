//! Wrapper chart assembly.
//!
//! For every discovered chart with at least one newly patched image,
//! assembly writes a wrapper chart that depends on the upstream chart and
//! overrides its image values:
//!
//! ```text
//! dist/
//! ├── published.json
//! └── vector/
//!     ├── Chart.yaml        # apiVersion v2, depends on the upstream chart
//!     ├── values.yaml       # rewritten upstream values, nested under the dependency
//!     ├── sbom.cdx.json
//!     └── vulns.json
//! ```
//!
//! Charts whose images are all unchanged are not republished. A chart that
//! fails to assemble is reported and the others continue.

pub mod overlay;
pub mod version;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::discover::{ChartDiscovery, ChartRenderer, RenderError};
use crate::image::Image;
use crate::matrix::Matrix;
use crate::metadata::{self, ChartIdentity, ImageReport, MetadataError, PublishedImage};
use crate::patch::{PatchResults, PatchTarget, SinglePatchResult};
use crate::registry::{Registry, RegistryError};
use crate::scan::VulnReport;
use crate::scan::report::{patched_report_path, report_path};
use crate::util::fs::write_atomic;

pub use version::{next_patch_level, next_version, patch_level, tag_spelling};

/// Name of the publication record in the output directory.
pub const PUBLISHED_FILENAME: &str = "published.json";

#[derive(Debug, Error)]
pub enum AssembleError {
  #[error(transparent)]
  Render(#[from] RenderError),

  #[error("failed to determine the next chart version: {0}")]
  Registry(#[from] RegistryError),

  #[error(transparent)]
  Metadata(#[from] MetadataError),

  #[error("failed to render {path}: {source}")]
  Yaml {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },

  #[error("failed to write {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// A chart image joined with its patch result.
#[derive(Debug, Clone)]
pub struct PatchResult {
  pub image: Image,
  pub result: SinglePatchResult,
}

/// Join a chart's images with the patch results.
pub fn join_results(chart: &ChartDiscovery, results: &PatchResults) -> Vec<PatchResult> {
  chart
    .images
    .iter()
    .map(|image| PatchResult {
      image: image.clone(),
      result: results.get(&image.reference()),
    })
    .collect()
}

/// Where wrapper charts are published.
pub fn chart_image(target_registry: &str, chart_repository: &str, name: &str) -> Image {
  Image {
    registry: Some(target_registry.trim_end_matches('/').to_string()),
    repository: format!("{}/{}", chart_repository.trim_matches('/'), name),
    tag: None,
    path: String::new(),
  }
}

/// An image mapping in the publication record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMapping {
  pub original: String,
  pub patched: String,
}

/// One published wrapper chart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedChart {
  pub name: String,
  pub version: String,
  pub registry: String,
  pub oci_ref: String,
  pub sbom_path: String,
  pub vuln_predicate_path: String,
  pub images: Vec<ImageMapping>,
}

/// Output locations and publish target.
#[derive(Debug, Clone)]
pub struct AssembleOptions<'a> {
  pub out_dir: &'a Path,
  pub reports_dir: &'a Path,
  pub target_registry: &'a str,
  pub chart_repository: &'a str,
  /// Timestamp recorded in generated metadata.
  pub timestamp: String,
}

/// Outcome of an assembly run.
#[derive(Debug, Default)]
pub struct AssembleSummary {
  pub published: Vec<PublishedChart>,
  /// Charts with no newly patched image.
  pub unchanged: Vec<String>,
  pub failures: Vec<(String, AssembleError)>,
}

impl AssembleSummary {
  pub fn is_success(&self) -> bool {
    self.failures.is_empty()
  }
}

/// Assemble every chart that needs republishing and write `published.json`.
pub async fn assemble<R: Registry, C: ChartRenderer>(
  charts: &[ChartDiscovery],
  matrix: &Matrix,
  results: &PatchResults,
  renderer: &C,
  registry: &R,
  options: &AssembleOptions<'_>,
) -> Result<AssembleSummary, AssembleError> {
  let mut summary = AssembleSummary::default();

  for chart in charts {
    let joined = join_results(chart, results);
    if !joined.iter().any(|j| j.result.changed()) {
      info!(chart = %chart.name, "no newly patched images, skipping");
      summary.unchanged.push(chart.name.clone());
      continue;
    }

    match assemble_chart(chart, &joined, matrix, renderer, registry, options).await {
      Ok(published) => {
        info!(chart = %published.name, version = %published.version, images = published.images.len(), "assembled wrapper chart");
        summary.published.push(published);
      }
      Err(e) => {
        error!(chart = %chart.name, error = %e, "failed to assemble chart");
        summary.failures.push((chart.name.clone(), e));
      }
    }
  }

  let record_path = options.out_dir.join(PUBLISHED_FILENAME);
  metadata::write_json(&record_path, &summary.published)?;
  Ok(summary)
}

/// Assemble one wrapper chart.
pub async fn assemble_chart<R: Registry, C: ChartRenderer>(
  chart: &ChartDiscovery,
  joined: &[PatchResult],
  matrix: &Matrix,
  renderer: &C,
  registry: &R,
  options: &AssembleOptions<'_>,
) -> Result<PublishedChart, AssembleError> {
  let chart_ref = chart_image(options.target_registry, options.chart_repository, &chart.name);
  let version = next_version(registry, &chart_ref, &chart.version).await?;

  let values = renderer.values(&chart.source()).await?;
  let available: Vec<(&Image, &PatchTarget)> = joined
    .iter()
    .filter_map(|j| j.result.target().map(|t| (&j.image, t)))
    .collect();
  let (rewritten, unrelocated) = overlay::rewrite_values(&values, &available);
  for image in unrelocated {
    warn!(chart = %chart.name, image = %image, "patched image is not referenced by a values path, the upstream chart keeps using it");
  }

  let dir = options.out_dir.join(&chart.name);
  write_yaml(&dir.join("Chart.yaml"), &WrapperChart::new(chart, &version))?;
  let mut nested = Mapping::new();
  nested.insert(Value::String(chart.name.clone()), rewritten);
  write_yaml(&dir.join("values.yaml"), &Value::Mapping(nested))?;

  let publish_repository = format!(
    "{}/{}",
    options.target_registry.trim_end_matches('/'),
    options.chart_repository.trim_matches('/')
  );
  let identity = ChartIdentity {
    name: &chart.name,
    version: &version,
    upstream_version: &chart.version,
    upstream_repository: &chart.repository,
    publish_repository: &publish_repository,
  };

  let sources: Vec<String> = available.iter().map(|(image, _)| image.reference()).collect();
  let mut published_images = Vec::with_capacity(available.len());
  for ((_, target), source) in available.iter().zip(&sources) {
    let digest = match registry.manifest_digest(&target.image(), &target.tag).await {
      Ok(digest) => digest,
      Err(e) => {
        warn!(image = %target.reference(), error = %e, "could not read manifest digest");
        None
      }
    };
    published_images.push(PublishedImage {
      source,
      target,
      digest,
    });
  }

  let sbom_path = dir.join("sbom.cdx.json");
  metadata::write_json(&sbom_path, &metadata::build_sbom(&identity, &published_images, &options.timestamp))?;

  let loaded: Vec<(Option<VulnReport>, Option<VulnReport>)> = sources
    .iter()
    .map(|source| load_reports(matrix, options.reports_dir, source))
    .collect();
  let reports: Vec<ImageReport<'_>> = published_images
    .iter()
    .cloned()
    .zip(&loaded)
    .map(|(image, (before, after))| ImageReport {
      image,
      before: before.as_ref(),
      after: after.as_ref(),
    })
    .collect();
  let vulns_path = dir.join("vulns.json");
  metadata::write_json(&vulns_path, &metadata::build_vuln_predicate(&identity, &reports, &options.timestamp))?;

  Ok(PublishedChart {
    name: chart.name.clone(),
    version: version.clone(),
    registry: options.target_registry.to_string(),
    oci_ref: format!("oci://{}/{}:{}", publish_repository, chart.name, tag_spelling(&version)),
    sbom_path: sbom_path.display().to_string(),
    vuln_predicate_path: vulns_path.display().to_string(),
    images: published_images
      .iter()
      .map(|p| ImageMapping {
        original: p.source.to_string(),
        patched: p.target.reference(),
      })
      .collect(),
  })
}

/// Pre- and post-patch reports for an image, if they can be read.
fn load_reports(matrix: &Matrix, reports_dir: &Path, image_ref: &str) -> (Option<VulnReport>, Option<VulnReport>) {
  let Some(entry) = matrix.find(image_ref) else {
    return (None, None);
  };
  let load = |path: PathBuf| match VulnReport::load(&path) {
    Ok(report) => report,
    Err(e) => {
      warn!(path = %path.display(), error = %e, "ignoring unreadable report");
      None
    }
  };
  (
    load(report_path(reports_dir, &entry.image_name)),
    load(patched_report_path(reports_dir, &entry.image_name)),
  )
}

/// `Chart.yaml` of a wrapper chart.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WrapperChart<'a> {
  api_version: &'static str,
  name: &'a str,
  version: &'a str,
  description: String,
  dependencies: Vec<ChartDependency<'a>>,
}

#[derive(Debug, Serialize)]
struct ChartDependency<'a> {
  name: &'a str,
  version: &'a str,
  repository: &'a str,
}

impl<'a> WrapperChart<'a> {
  fn new(chart: &'a ChartDiscovery, version: &'a str) -> Self {
    Self {
      api_version: "v2",
      name: &chart.name,
      version,
      description: format!("{} {} with patched container images", chart.name, chart.version),
      dependencies: vec![ChartDependency {
        name: &chart.name,
        version: &chart.version,
        repository: &chart.repository,
      }],
    }
  }
}

fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<(), AssembleError> {
  let content = serde_yaml::to_string(value).map_err(|source| AssembleError::Yaml {
    path: path.to_path_buf(),
    source,
  })?;
  write_atomic(path, content.as_bytes()).map_err(|source| AssembleError::Write {
    path: path.to_path_buf(),
    source,
  })
}
