//! Tag strategies for externally tracked images.
//!
//! | Strategy  | Selection                                                      |
//! |-----------|----------------------------------------------------------------|
//! | `list`    | The configured tags, verbatim. No registry access.             |
//! | `pattern` | Tags matching a regex, minus exclusions, semver-sorted, newest N |
//! | `latest`  | The single highest semantic version, minus exclusions          |
//!
//! Tags that do not parse as semantic versions (after stripping a leading
//! `v`) are discarded by `pattern` and `latest`.

use regex::Regex;
use semver::Version;
use thiserror::Error;

use crate::config::TrackedImage;
use crate::image::Image;
use crate::registry::{Registry, RegistryError};

/// Errors that can occur when building a tag strategy.
#[derive(Debug, Error)]
pub enum StrategyError {
  #[error("image {image}: unknown tag strategy '{name}' (expected list, pattern or latest)")]
  Unknown { image: String, name: String },

  #[error("image {image}: the pattern strategy requires a `pattern`")]
  MissingPattern { image: String },

  #[error("image {image}: invalid pattern: {source}")]
  InvalidPattern {
    image: String,
    #[source]
    source: regex::Error,
  },
}

/// How tags are chosen for a tracked image.
#[derive(Debug, Clone)]
pub enum TagStrategy {
  List(Vec<String>),
  Pattern {
    pattern: Regex,
    exclude: Vec<String>,
    /// 0 keeps every match.
    max_tags: usize,
  },
  Latest {
    exclude: Vec<String>,
  },
}

impl TagStrategy {
  /// Build the strategy declared by a tracked image.
  pub fn from_tracked(tracked: &TrackedImage) -> Result<Self, StrategyError> {
    let image = tracked.display_name().to_string();
    match tracked.strategy.trim() {
      "list" => Ok(Self::List(tracked.tags.clone())),
      "pattern" => {
        let pattern = tracked
          .pattern
          .as_deref()
          .ok_or_else(|| StrategyError::MissingPattern { image: image.clone() })?;
        let pattern = Regex::new(pattern).map_err(|source| StrategyError::InvalidPattern { image, source })?;
        Ok(Self::Pattern {
          pattern,
          exclude: tracked.exclude.clone(),
          max_tags: tracked.max_tags.unwrap_or(0),
        })
      }
      "latest" => Ok(Self::Latest {
        exclude: tracked.exclude.clone(),
      }),
      other => Err(StrategyError::Unknown {
        image,
        name: other.to_string(),
      }),
    }
  }

  /// Whether the strategy needs the repository's tag list.
  pub fn needs_listing(&self) -> bool {
    !matches!(self, Self::List(_))
  }

  /// Select tags from the available ones.
  pub fn select(&self, available: &[String]) -> Vec<String> {
    match self {
      Self::List(tags) => tags.clone(),
      Self::Pattern {
        pattern,
        exclude,
        max_tags,
      } => {
        let candidates = available.iter().filter(|t| pattern.is_match(t));
        let sorted = semver_sorted(candidates, exclude);
        let skip = if *max_tags > 0 {
          sorted.len().saturating_sub(*max_tags)
        } else {
          0
        };
        sorted.into_iter().skip(skip).collect()
      }
      Self::Latest { exclude } => semver_sorted(available.iter(), exclude).pop().into_iter().collect(),
    }
  }

  /// Resolve the strategy against a registry.
  pub async fn tags_for<R: Registry>(&self, image: &Image, registry: &R) -> Result<Vec<String>, RegistryError> {
    if !self.needs_listing() {
      return Ok(self.select(&[]));
    }
    let available = registry.list_tags(image).await?;
    Ok(self.select(&available))
  }
}

/// Parse a tag as a semantic version, ignoring a leading `v`.
pub fn parse_version(tag: &str) -> Option<Version> {
  Version::parse(tag.strip_prefix('v').unwrap_or(tag)).ok()
}

/// Drop excluded and non-semver tags, then sort ascending by version.
fn semver_sorted<'a>(tags: impl Iterator<Item = &'a String>, exclude: &[String]) -> Vec<String> {
  let mut versioned: Vec<(Version, &String)> = tags
    .filter(|t| !exclude.contains(t))
    .filter_map(|t| parse_version(t).map(|v| (v, t)))
    .collect();
  versioned.sort_by(|(a, at), (b, bt)| a.cmp(b).then_with(|| at.cmp(bt)));
  versioned.into_iter().map(|(_, t)| t.clone()).collect()
}
