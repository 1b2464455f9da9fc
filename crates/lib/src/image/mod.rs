//! Container image values.
//!
//! An [`Image`] is the atomic unit of discovery: the registry, repository and
//! tag of a container image, plus the dotted path at which it was found in its
//! source document. The path is empty for externally tracked images.
//!
//! # Reference Format
//!
//! ```text
//! registry/repository:tag
//! ```
//!
//! Absent parts are omitted, so `nginx`, `bitnami/nginx:1.25` and
//! `ghcr.io/org/app:v1.2.3` are all valid references. References are the
//! canonical form used for deduplication.

pub mod overrides;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::fs::safe_file_stem;

pub use overrides::{Override, OverrideTable};

/// Errors that can occur when building an image value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
  /// The repository is empty.
  #[error("image repository is empty")]
  EmptyRepository,

  /// The repository is a URL, not an image name.
  #[error("image repository looks like a URL: {0}")]
  Url(String),

  /// The reference is pinned by digest and cannot be patched by tag.
  #[error("image '{0}' is pinned by digest")]
  DigestPinned(String),

  /// The text is not shaped like an image reference.
  #[error("'{0}' is not an image reference")]
  Invalid(String),
}

/// A container image found in a source document or tracked externally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Image {
  /// Registry host (e.g. `ghcr.io`), if declared separately.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub registry: Option<String>,

  /// Repository path. Never empty and never a URL.
  pub repository: String,

  /// Image tag, if known.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tag: Option<String>,

  /// Dotted location of the image in its source document.
  #[serde(default)]
  pub path: String,
}

impl Image {
  /// Create an image value, validating the repository.
  ///
  /// Empty registry and tag strings are normalized to `None`.
  pub fn new(registry: Option<String>, repository: impl Into<String>, tag: Option<String>) -> Result<Self, ImageError> {
    let repository: String = repository.into();
    let repository = repository.trim().to_string();
    if repository.is_empty() {
      return Err(ImageError::EmptyRepository);
    }
    if is_url(&repository) {
      return Err(ImageError::Url(repository));
    }

    Ok(Self {
      registry: non_empty(registry),
      repository,
      tag: non_empty(tag),
      path: String::new(),
    })
  }

  /// Parse a `[registry/]repository[:tag]` string.
  ///
  /// The tag is split on the last colon that is not part of a registry port,
  /// and a leading path segment that looks like a host becomes the registry.
  pub fn parse(reference: &str) -> Result<Self, ImageError> {
    let reference = reference.trim();
    if reference.is_empty() || is_url(reference) || reference.chars().any(char::is_whitespace) {
      return Err(ImageError::Invalid(reference.to_string()));
    }
    if reference.contains('@') {
      return Err(ImageError::DigestPinned(reference.to_string()));
    }

    let (name, tag) = split_tag(reference);
    let (registry, repository) = split_registry(name);
    Self::new(registry.map(str::to_string), repository, tag.map(str::to_string))
  }

  /// Set the source document path.
  pub fn at(mut self, path: impl Into<String>) -> Self {
    self.path = path.into();
    self
  }

  /// Return a copy of this image with a different tag, keeping its path.
  pub fn with_tag(&self, tag: impl Into<String>) -> Self {
    Self {
      tag: non_empty(Some(tag.into())),
      ..self.clone()
    }
  }

  /// The image name without its tag: `registry/repository`.
  pub fn name(&self) -> String {
    match &self.registry {
      Some(registry) => format!("{}/{}", registry, self.repository),
      None => self.repository.clone(),
    }
  }

  /// The canonical reference: `registry/repository:tag`, omitting absent parts.
  pub fn reference(&self) -> String {
    match &self.tag {
      Some(tag) => format!("{}:{}", self.name(), tag),
      None => self.name(),
    }
  }

  /// The registry host, either declared or embedded in the repository.
  pub fn registry_host(&self) -> Option<&str> {
    if let Some(registry) = &self.registry {
      return Some(registry.split('/').next().unwrap_or(registry));
    }
    split_registry(&self.repository).0
  }

  /// A filesystem- and CI-safe encoding of the reference.
  pub fn sanitized_name(&self) -> String {
    safe_file_stem(&self.reference())
  }
}

impl fmt::Display for Image {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.reference())
  }
}

/// Heuristic filter for values that could name a container image.
///
/// Accepts non-empty text that is not a boolean literal, not an HTTP(S) URL
/// and contains no whitespace.
pub fn looks_like_image(value: &str) -> bool {
  if value.is_empty() || value.chars().any(char::is_whitespace) {
    return false;
  }
  if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("false") {
    return false;
  }
  !is_url(value)
}

/// Whether a free-standing string is shaped like `repo[:tag]`.
///
/// Requires a slash so that plain words (`IfNotPresent`, `nginx`) in
/// arbitrary string fields are not mistaken for images.
pub fn is_image_string(value: &str) -> bool {
  looks_like_image(value) && value.contains('/')
}

/// Whether text is an HTTP(S) URL.
pub fn is_url(value: &str) -> bool {
  let lower = value.trim_start().to_ascii_lowercase();
  lower.starts_with("http://") || lower.starts_with("https://")
}

/// Split `name[:tag]` on the last colon after the last slash.
pub fn split_tag(reference: &str) -> (&str, Option<&str>) {
  let last_segment = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
  match reference[last_segment..].rfind(':') {
    Some(i) => {
      let colon = last_segment + i;
      let tag = &reference[colon + 1..];
      (&reference[..colon], if tag.is_empty() { None } else { Some(tag) })
    }
    None => (reference, None),
  }
}

/// Split a leading registry host off a repository path.
///
/// A first segment counts as a host when it contains a dot or a port, or is
/// `localhost`.
pub fn split_registry(name: &str) -> (Option<&str>, &str) {
  match name.split_once('/') {
    Some((first, rest)) if is_host_like(first) && !rest.is_empty() => (Some(first), rest),
    _ => (None, name),
  }
}

fn is_host_like(segment: &str) -> bool {
  segment.contains('.') || segment.contains(':') || segment == "localhost"
}

fn non_empty(value: Option<String>) -> Option<String> {
  value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
