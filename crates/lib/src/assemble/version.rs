//! Wrapper chart versioning.
//!
//! A wrapper chart is versioned `<upstream>-<N>`. `N` starts at 0 and is one
//! more than the highest level already published, so every publication of
//! the same upstream version gets a strictly greater version.

use tracing::debug;

use crate::image::Image;
use crate::registry::{Registry, RegistryError};

/// Spelling of a chart version as an OCI tag. Tags cannot hold `+`, so
/// `helm push` stores build metadata with `_` instead.
pub fn tag_spelling(version: &str) -> String {
  version.replace('+', "_")
}

/// Parse the patch level of `tag` if it is `<upstream>-<N>`, with `upstream`
/// in either its chart or its tag spelling.
pub fn patch_level(tag: &str, upstream: &str) -> Option<u64> {
  let rest = match tag.strip_prefix(upstream) {
    Some(rest) => rest,
    None => tag.strip_prefix(tag_spelling(upstream).as_str())?,
  };
  let level = rest.strip_prefix('-')?;
  if level.is_empty() || !level.bytes().all(|b| b.is_ascii_digit()) {
    return None;
  }
  level.parse().ok()
}

/// The next patch level given the published tags.
pub fn next_patch_level<'a>(tags: impl IntoIterator<Item = &'a str>, upstream: &str) -> u64 {
  tags
    .into_iter()
    .filter_map(|tag| patch_level(tag, upstream))
    .max()
    .map_or(0, |level| level + 1)
}

/// Compute the next wrapper version of `chart` for `upstream`.
///
/// A listing failure is returned rather than guessed around, so a version is
/// never reused. A repository that does not exist yet has no tags.
pub async fn next_version<R: Registry>(registry: &R, chart: &Image, upstream: &str) -> Result<String, RegistryError> {
  let tags = registry.list_tags(chart).await?;
  let level = next_patch_level(tags.iter().map(String::as_str), upstream);
  debug!(chart = %chart.name(), upstream = %upstream, published = tags.len(), level, "computed patch level");
  Ok(format!("{}-{}", upstream, level))
}
