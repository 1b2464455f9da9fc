//! Test doubles for chartpatch-lib.
//!
//! [`FakeRegistry`] and [`FakeRenderer`] stand in for the network and for
//! `helm`, so discovery and assembly can be exercised deterministically.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_yaml::Value;

use crate::config::ChartSource;
use crate::discover::render::{ChartMetadata, ChartRenderer, RenderError};
use crate::image::Image;
use crate::process::ProcessError;
use crate::registry::{Registry, RegistryError};
use crate::util::hash::hash_bytes;

/// In-memory registry keyed by image name (`registry/repository`).
#[derive(Debug, Default)]
pub struct FakeRegistry {
  tags: Mutex<HashMap<String, Vec<String>>>,
  failing: HashSet<String>,
  probes: AtomicUsize,
}

impl FakeRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Seed a repository with tags.
  pub fn with_tags(self, name: &str, tags: &[&str]) -> Self {
    self.publish_all(name, tags);
    self
  }

  /// Make every operation on `name` fail with HTTP 500.
  pub fn failing(mut self, name: &str) -> Self {
    self.failing.insert(name.to_string());
    self
  }

  pub fn publish(&self, name: &str, tag: &str) {
    self.publish_all(name, &[tag]);
  }

  fn publish_all(&self, name: &str, tags: &[&str]) {
    let mut map = self.tags.lock().unwrap();
    let entry = map.entry(name.to_string()).or_default();
    entry.extend(tags.iter().map(|t| t.to_string()));
  }

  /// Number of `tag_exists` calls served.
  pub fn probe_count(&self) -> usize {
    self.probes.load(Ordering::SeqCst)
  }

  fn check(&self, image: &Image) -> Result<(), RegistryError> {
    if self.failing.contains(&image.name()) {
      return Err(RegistryError::Status {
        url: image.name(),
        status: 500,
      });
    }
    Ok(())
  }

  fn tags_of(&self, image: &Image) -> Vec<String> {
    self.tags.lock().unwrap().get(&image.name()).cloned().unwrap_or_default()
  }
}

impl Registry for FakeRegistry {
  async fn list_tags(&self, image: &Image) -> Result<Vec<String>, RegistryError> {
    self.check(image)?;
    Ok(self.tags_of(image))
  }

  async fn tag_exists(&self, image: &Image, tag: &str) -> Result<bool, RegistryError> {
    self.probes.fetch_add(1, Ordering::SeqCst);
    self.check(image)?;
    Ok(self.tags_of(image).iter().any(|t| t == tag))
  }

  async fn manifest_digest(&self, image: &Image, tag: &str) -> Result<Option<String>, RegistryError> {
    self.check(image)?;
    let exists = self.tags_of(image).iter().any(|t| t == tag);
    Ok(exists.then(|| format!("sha256:{}", hash_bytes(format!("{}:{}", image.name(), tag).as_bytes()))))
  }
}

/// A chart the fake renderer knows about.
#[derive(Debug, Clone, Default)]
pub struct FakeChart {
  pub app_version: Option<String>,
  pub values: String,
  pub rendered: Option<String>,
}

/// Renderer serving canned chart metadata, values and manifests by chart name.
///
/// A chart without `rendered` text fails to render.
#[derive(Debug, Default)]
pub struct FakeRenderer {
  charts: HashMap<String, FakeChart>,
}

impl FakeRenderer {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_chart(mut self, name: &str, chart: FakeChart) -> Self {
    self.charts.insert(name.to_string(), chart);
    self
  }

  fn chart(&self, source: &ChartSource) -> Result<&FakeChart, RenderError> {
    self.charts.get(&source.name).ok_or_else(|| {
      RenderError::Process(ProcessError::Failed {
        program: "helm".to_string(),
        code: Some(1),
        stderr: format!("chart {} not found", source.name),
      })
    })
  }
}

impl ChartRenderer for FakeRenderer {
  async fn chart_metadata(&self, source: &ChartSource) -> Result<ChartMetadata, RenderError> {
    let chart = self.chart(source)?;
    Ok(ChartMetadata {
      name: source.name.clone(),
      version: source.version.clone(),
      app_version: chart.app_version.clone(),
    })
  }

  async fn values(&self, source: &ChartSource) -> Result<Value, RenderError> {
    let chart = self.chart(source)?;
    serde_yaml::from_str(&chart.values).map_err(|e| RenderError::Parse {
      chart: source.name.clone(),
      source: e,
    })
  }

  async fn render(&self, source: &ChartSource) -> Result<String, RenderError> {
    let chart = self.chart(source)?;
    chart.rendered.clone().ok_or_else(|| {
      RenderError::Process(ProcessError::Failed {
        program: "helm".to_string(),
        code: Some(1),
        stderr: "template rendering failed".to_string(),
      })
    })
  }
}

/// Shorthand for a chart source in tests.
pub fn chart_source(name: &str, version: &str) -> ChartSource {
  ChartSource {
    name: name.to_string(),
    repository: format!("https://charts.example.com/{}", name),
    version: version.to_string(),
    app_version: None,
  }
}
