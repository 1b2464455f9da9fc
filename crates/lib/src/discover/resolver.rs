//! Tag disambiguation.
//!
//! Charts often leave an image tag empty and let the template fall back to
//! the chart's `appVersion`. Upstreams disagree on whether their tags carry a
//! `v` prefix, so the registry is asked which spelling exists.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::image::Image;
use crate::registry::Registry;

/// Resolves `appVersion` into an existing tag, memoizing registry probes.
///
/// Probes are keyed by image name and candidate tag, so each pair reaches the
/// registry at most once per resolver.
pub struct TagResolver<'r, R: Registry> {
  registry: &'r R,
  probes: HashMap<(String, String), bool>,
}

impl<'r, R: Registry> TagResolver<'r, R> {
  pub fn new(registry: &'r R) -> Self {
    Self {
      registry,
      probes: HashMap::new(),
    }
  }

  /// Resolve `app_version` into the tag to use for `image`.
  ///
  /// - A version already starting with `v` is used verbatim.
  /// - Otherwise the version is probed as-is, then with a `v` prefix.
  /// - If neither exists (or the registry is unreachable) the version is
  ///   used as-is.
  pub async fn resolve(&mut self, image: &Image, app_version: &str) -> String {
    let version = app_version.trim();
    if version.starts_with('v') {
      return version.to_string();
    }

    if self.probe(image, version).await {
      return version.to_string();
    }

    let prefixed = format!("v{}", version);
    if self.probe(image, &prefixed).await {
      debug!(image = %image.name(), tag = %prefixed, "resolved v-prefixed tag");
      return prefixed;
    }

    debug!(image = %image.name(), tag = %version, "no matching tag found, using appVersion as-is");
    version.to_string()
  }

  /// Fill in a missing tag from `app_version`. Tagged images pass through.
  pub async fn resolve_image(&mut self, image: Image, app_version: Option<&str>) -> Image {
    if image.tag.is_some() {
      return image;
    }
    match app_version.map(str::trim).filter(|v| !v.is_empty()) {
      Some(version) => {
        let tag = self.resolve(&image, version).await;
        image.with_tag(tag)
      }
      None => image,
    }
  }

  async fn probe(&mut self, image: &Image, tag: &str) -> bool {
    let key = (image.name(), tag.to_string());
    if let Some(&exists) = self.probes.get(&key) {
      return exists;
    }

    let exists = match self.registry.tag_exists(image, tag).await {
      Ok(exists) => exists,
      Err(e) => {
        warn!(image = %image.name(), tag = %tag, error = %e, "tag probe failed");
        false
      }
    };
    self.probes.insert(key, exists);
    exists
  }
}
