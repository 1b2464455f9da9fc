//! Image discovery.
//!
//! Discovery turns a set of charts and tracked images into a
//! [`DiscoveryManifest`]: the images each chart references, and the flat list
//! of every image the rest of the pipeline should consider.
//!
//! # Per-chart flow
//!
//! ```text
//! values ──walk──► images ──resolve tags──► apply overrides ──┐
//!                                                             ├──► chart images
//! rendered manifests ──extract──► template-only images ───────┘
//! ```
//!
//! A chart that fails to render is logged and skipped; discovery of the
//! remaining charts continues. An invalid tag strategy fails the whole run
//! before any chart is processed.

pub mod render;
pub mod resolver;
pub mod strategy;
pub mod template;
pub mod walker;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ChartSource, Config, TrackedImage};
use crate::image::{Image, OverrideTable};
use crate::inventory::{Inventory, InventoryEntry, InventoryError};
use crate::registry::{Registry, RepositoryLocation};
use crate::util::fs::write_atomic;

pub use render::{ChartMetadata, ChartRenderer, HelmRenderer, RenderError};
pub use resolver::TagResolver;
pub use strategy::{StrategyError, TagStrategy};

/// Errors that abort a discovery run.
#[derive(Debug, Error)]
pub enum DiscoverError {
  #[error(transparent)]
  Strategy(#[from] StrategyError),

  #[error(transparent)]
  Inventory(#[from] InventoryError),

  #[error("failed to read discovery manifest {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to write discovery manifest {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid discovery manifest {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
}

/// The images discovered for one chart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartDiscovery {
  pub name: String,
  pub version: String,
  pub repository: String,
  pub images: Vec<Image>,
}

impl ChartDiscovery {
  /// The chart source this discovery came from.
  pub fn source(&self) -> ChartSource {
    ChartSource {
      name: self.name.clone(),
      repository: self.repository.clone(),
      version: self.version.clone(),
      app_version: None,
    }
  }
}

/// Output of discovery.
///
/// `images` holds the inventory entries in file order followed by the
/// expansion of every tracked image. Every chart image also appears in
/// `images`, because chart images are merged into the inventory first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryManifest {
  pub charts: Vec<ChartDiscovery>,
  pub images: Vec<Image>,
}

impl DiscoveryManifest {
  pub fn load(path: &Path) -> Result<Self, DiscoverError> {
    let content = fs::read_to_string(path).map_err(|source| DiscoverError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    serde_json::from_str(&content).map_err(|source| DiscoverError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  pub fn save(&self, path: &Path) -> Result<(), DiscoverError> {
    let content = serde_json::to_string_pretty(self).map_err(|source| DiscoverError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    write_atomic(path, content.as_bytes()).map_err(|source| DiscoverError::Write {
      path: path.to_path_buf(),
      source,
    })
  }
}

/// A chart that could not be discovered.
#[derive(Debug)]
pub struct SkippedChart {
  pub name: String,
  pub error: RenderError,
}

/// Everything a discovery run produced.
#[derive(Debug)]
pub struct DiscoveryOutcome {
  pub manifest: DiscoveryManifest,
  /// Inventory entries added by this run.
  pub appended: Vec<InventoryEntry>,
  pub skipped: Vec<SkippedChart>,
}

/// Run discovery for every configured chart and tracked image, merging new
/// chart images into the inventory.
///
/// The inventory file is only rewritten when new entries were appended.
pub async fn discover<R: Registry, C: ChartRenderer>(
  config: &Config,
  registry: &R,
  renderer: &C,
) -> Result<DiscoveryOutcome, DiscoverError> {
  let strategies = config
    .images
    .iter()
    .map(TagStrategy::from_tracked)
    .collect::<Result<Vec<_>, _>>()?;

  let inventory_path = config.inventory_path();
  let mut inventory = Inventory::load(&inventory_path)?;
  let overrides = inventory.overrides().clone();
  debug!(path = %inventory_path.display(), entries = inventory.len(), overrides = overrides.len(), "loaded inventory");

  let mut resolver = TagResolver::new(registry);
  let mut charts = Vec::new();
  let mut skipped = Vec::new();
  for chart in &config.charts {
    match discover_chart(chart, renderer, &mut resolver, &overrides).await {
      Ok(discovery) => {
        info!(chart = %chart.name, version = %chart.version, images = discovery.images.len(), "discovered chart");
        charts.push(discovery);
      }
      Err(error) => {
        warn!(chart = %chart.name, error = %error, "skipping chart");
        skipped.push(SkippedChart {
          name: chart.name.clone(),
          error,
        });
      }
    }
  }

  let appended = inventory.merge(charts.iter().flat_map(|c| c.images.iter()))?;
  if inventory.save()? {
    info!(path = %inventory_path.display(), added = appended.len(), "updated inventory");
  }

  let mut images: Vec<Image> = inventory.images().iter().map(|i| overrides.apply(i)).collect();
  images.extend(expand_tracked(&config.images, &strategies, registry, &overrides).await);

  Ok(DiscoveryOutcome {
    manifest: DiscoveryManifest { charts, images },
    appended,
    skipped,
  })
}

/// Discover the images of a single chart.
pub async fn discover_chart<R: Registry, C: ChartRenderer>(
  chart: &ChartSource,
  renderer: &C,
  resolver: &mut TagResolver<'_, R>,
  overrides: &OverrideTable,
) -> Result<ChartDiscovery, RenderError> {
  let metadata = renderer.chart_metadata(chart).await?;
  let app_version = chart.app_version.clone().or(metadata.app_version);
  let values = renderer.values(chart).await?;
  let rendered = renderer.render(chart).await?;

  let mut images = Vec::new();
  let mut seen_refs = HashSet::new();
  let mut seen_names = HashSet::new();

  for image in walker::walk(&values) {
    let resolved = resolver.resolve_image(image, app_version.as_deref()).await;
    let image = overrides.apply(&resolved);
    seen_names.insert(RepositoryLocation::of(&image));
    if seen_refs.insert(image.reference()) {
      images.push(image);
    }
  }

  // Images the values walk already covered are skipped by repository, since
  // rendered tags may be spelled differently from the resolved ones.
  for image in template::extract_images(&rendered) {
    if seen_names.contains(&RepositoryLocation::of(&image)) {
      continue;
    }
    let resolved = resolver.resolve_image(image, app_version.as_deref()).await;
    let image = overrides.apply(&resolved);
    if seen_refs.insert(image.reference()) {
      debug!(chart = %chart.name, image = %image, "template-only image");
      images.push(image);
    }
  }

  Ok(ChartDiscovery {
    name: chart.name.clone(),
    version: chart.version.clone(),
    repository: chart.repository.clone(),
    images,
  })
}

/// Expand tracked images into concrete tagged images.
///
/// An image whose tags cannot be listed is logged and contributes nothing.
pub async fn expand_tracked<R: Registry>(
  tracked: &[TrackedImage],
  strategies: &[TagStrategy],
  registry: &R,
  overrides: &OverrideTable,
) -> Vec<Image> {
  let mut images = Vec::new();
  for (entry, strategy) in tracked.iter().zip(strategies) {
    let base = match Image::new(entry.registry.clone(), entry.repository.as_str(), None) {
      Ok(base) => base,
      Err(e) => {
        warn!(image = %entry.display_name(), error = %e, "skipping tracked image");
        continue;
      }
    };

    match strategy.tags_for(&base, registry).await {
      Ok(tags) => {
        debug!(image = %entry.display_name(), tags = ?tags, "selected tags");
        images.extend(tags.into_iter().map(|tag| overrides.apply(&base.with_tag(tag))));
      }
      Err(e) => warn!(image = %entry.display_name(), error = %e, "failed to list tags"),
    }
  }
  images
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::image::Override;
  use crate::util::testutil::{FakeChart, FakeRegistry, FakeRenderer, chart_source};
  use tempfile::TempDir;

  const VECTOR_VALUES: &str = r#"
image:
  repository: timberio/vector
  tag: ""
sidecar:
  image: busybox:1.36
"#;

  const VECTOR_RENDERED: &str = r#"
spec:
  template:
    spec:
      containers:
        - image: timberio/vector:0.46.1-distroless-libc
        - image: busybox:1.36
        - image: quay.io/org/exporter:2.0
"#;

  fn vector_chart() -> FakeChart {
    FakeChart {
      app_version: Some("0.46.1-distroless-libc".to_string()),
      values: VECTOR_VALUES.to_string(),
      rendered: Some(VECTOR_RENDERED.to_string()),
    }
  }

  fn config_in(dir: &TempDir, yaml: &str) -> Config {
    Config::from_yaml(yaml, dir.path()).unwrap()
  }

  mod chart {
    use super::*;

    #[tokio::test]
    async fn resolves_overrides_and_template_images() {
      let registry = FakeRegistry::new();
      let renderer = FakeRenderer::new().with_chart("vector", vector_chart());
      let mut resolver = TagResolver::new(&registry);
      let overrides = OverrideTable::new(vec![Override::new("timberio/vector", "distroless-libc", "debian")]);

      let discovery = discover_chart(&chart_source("vector", "0.40.0"), &renderer, &mut resolver, &overrides)
        .await
        .unwrap();

      let found: Vec<(String, String)> = discovery
        .images
        .iter()
        .map(|i| (i.path.clone(), i.reference()))
        .collect();
      assert_eq!(
        found,
        vec![
          ("image".to_string(), "timberio/vector:0.46.1-debian".to_string()),
          ("sidecar.image".to_string(), "busybox:1.36".to_string()),
          (String::new(), "quay.io/org/exporter:2.0".to_string()),
        ]
      );
    }

    #[tokio::test]
    async fn pinned_app_version_overrides_chart() {
      let registry = FakeRegistry::new().with_tags("timberio/vector", &["v9.9.9"]);
      let renderer = FakeRenderer::new().with_chart("vector", vector_chart());
      let mut resolver = TagResolver::new(&registry);
      let mut source = chart_source("vector", "0.40.0");
      source.app_version = Some("9.9.9".to_string());

      let discovery = discover_chart(&source, &renderer, &mut resolver, &OverrideTable::default())
        .await
        .unwrap();
      assert_eq!(discovery.images[0].reference(), "timberio/vector:v9.9.9");
    }

    #[tokio::test]
    async fn render_failure_is_an_error() {
      let registry = FakeRegistry::new();
      let mut broken = vector_chart();
      broken.rendered = None;
      let renderer = FakeRenderer::new().with_chart("vector", broken);
      let mut resolver = TagResolver::new(&registry);

      let result = discover_chart(&chart_source("vector", "0.40.0"), &renderer, &mut resolver, &OverrideTable::default()).await;
      assert!(result.is_err());
    }
  }

  mod run {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn merges_inventory_and_skips_failed_charts() {
      let dir = TempDir::new().unwrap();
      std::fs::write(
        dir.path().join("images.yaml"),
        "overrides:\n  timberio/vector:\n    from: distroless-libc\n    to: debian\n",
      )
      .unwrap();
      let config = config_in(
        &dir,
        r#"
charts:
  - name: vector
    repository: https://helm.vector.dev
    version: 0.40.0
  - name: broken
    repository: https://example.com
    version: 1.0.0
images:
  - repository: library/postgres
    strategy: list
    tags: ["16.2"]
"#,
      );
      let registry = FakeRegistry::new();
      let renderer = FakeRenderer::new().with_chart("vector", vector_chart());

      let outcome = discover(&config, &registry, &renderer).await.unwrap();

      assert_eq!(outcome.skipped.len(), 1);
      assert_eq!(outcome.skipped[0].name, "broken");
      assert_eq!(outcome.manifest.charts.len(), 1);
      assert_eq!(outcome.appended.len(), 3);

      let refs: Vec<String> = outcome.manifest.images.iter().map(Image::reference).collect();
      assert_eq!(
        refs,
        vec![
          "timberio/vector:0.46.1-debian",
          "busybox:1.36",
          "quay.io/org/exporter:2.0",
          "library/postgres:16.2",
        ]
      );

      for chart_image in &outcome.manifest.charts[0].images {
        assert!(refs.contains(&chart_image.reference()));
      }
    }

    #[tokio::test]
    async fn second_run_leaves_inventory_untouched() {
      let dir = TempDir::new().unwrap();
      let config = config_in(
        &dir,
        "charts:\n  - name: vector\n    repository: https://helm.vector.dev\n    version: 0.40.0\n",
      );
      let registry = FakeRegistry::new();
      let renderer = FakeRenderer::new().with_chart("vector", vector_chart());

      discover(&config, &registry, &renderer).await.unwrap();
      let first = std::fs::read_to_string(config.inventory_path()).unwrap();

      let outcome = discover(&config, &registry, &renderer).await.unwrap();
      let second = std::fs::read_to_string(config.inventory_path()).unwrap();

      assert!(outcome.appended.is_empty());
      assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unknown_strategy_fails_the_run() {
      let dir = TempDir::new().unwrap();
      let config = config_in(&dir, "images:\n  - repository: org/app\n    strategy: newest\n");
      let registry = FakeRegistry::new();
      let renderer = FakeRenderer::new();

      let err = discover(&config, &registry, &renderer).await.unwrap_err();
      assert!(matches!(err, DiscoverError::Strategy(StrategyError::Unknown { .. })));
      assert!(!config.inventory_path().exists());
    }

    #[tokio::test]
    #[traced_test]
    async fn tracked_listing_failure_is_not_fatal() {
      let dir = TempDir::new().unwrap();
      let config = config_in(
        &dir,
        "images:\n  - repository: org/down\n    strategy: latest\n  - repository: org/up\n    strategy: latest\n",
      );
      let registry = FakeRegistry::new().failing("org/down").with_tags("org/up", &["1.0.0", "1.1.0"]);
      let renderer = FakeRenderer::new();

      let outcome = discover(&config, &registry, &renderer).await.unwrap();
      let refs: Vec<String> = outcome.manifest.images.iter().map(Image::reference).collect();
      assert_eq!(refs, vec!["org/up:1.1.0"]);
      assert!(logs_contain("failed to list tags"));
    }
  }

  #[test]
  fn manifest_roundtrips_through_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("discovery.json");
    let manifest = DiscoveryManifest {
      charts: vec![ChartDiscovery {
        name: "vector".to_string(),
        version: "0.40.0".to_string(),
        repository: "https://helm.vector.dev".to_string(),
        images: vec![Image::parse("timberio/vector:0.46.1-debian").unwrap().at("image")],
      }],
      images: vec![Image::parse("busybox:1.36").unwrap()],
    };
    manifest.save(&path).unwrap();
    assert_eq!(DiscoveryManifest::load(&path).unwrap(), manifest);
  }
}
