//! Registry capability.
//!
//! The engine never mutates a registry. It only needs three read operations:
//! list the tags of a repository, check whether a tag exists, and read a
//! manifest digest. [`Registry`] captures exactly that, so discovery and
//! assembly can be driven by [`HttpRegistry`] in production and by
//! deterministic fakes in tests.

mod http;

use std::future::Future;

use thiserror::Error;

use crate::image::Image;

pub use http::HttpRegistry;

/// Docker Hub's canonical name and its API host.
const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_API: &str = "registry-1.docker.io";

/// Errors returned by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
  /// Failed to build the HTTP client.
  #[error("failed to build HTTP client: {0}")]
  Client(#[source] reqwest::Error),

  /// The request could not be sent or timed out.
  #[error("request to {url} failed: {source}")]
  Request {
    url: String,
    #[source]
    source: reqwest::Error,
  },

  /// The registry answered with an unexpected status.
  #[error("registry returned HTTP {status} for {url}")]
  Status { url: String, status: u16 },

  /// Token negotiation failed.
  #[error("authentication with {host} failed: {message}")]
  Auth { host: String, message: String },

  /// The response body was not what the distribution API promises.
  #[error("invalid response from {url}: {message}")]
  InvalidResponse { url: String, message: String },
}

/// Read-only registry operations used for disambiguation and versioning.
pub trait Registry {
  /// List every tag of the image's repository.
  ///
  /// A repository that does not exist has no tags.
  fn list_tags(&self, image: &Image) -> impl Future<Output = Result<Vec<String>, RegistryError>> + Send;

  /// Check whether `tag` exists for the image's repository.
  fn tag_exists(&self, image: &Image, tag: &str) -> impl Future<Output = Result<bool, RegistryError>> + Send;

  /// Read the manifest digest of `image:tag`, if the tag exists.
  fn manifest_digest(
    &self,
    image: &Image,
    tag: &str,
  ) -> impl Future<Output = Result<Option<String>, RegistryError>> + Send;
}

/// Where an image's repository lives from the distribution API's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryLocation {
  /// Host (with optional port) serving the `/v2/` API.
  pub host: String,
  /// Repository path below the host.
  pub repository: String,
}

impl RepositoryLocation {
  /// Locate an image's repository.
  ///
  /// Handles registries declared with a namespace (`ghcr.io/acme`), hosts
  /// embedded in the repository, and Docker Hub's implicit `library/`
  /// namespace.
  pub fn of(image: &Image) -> Self {
    let (host, repository) = match &image.registry {
      Some(registry) => match registry.split_once('/') {
        Some((host, namespace)) => (
          host.to_string(),
          format!("{}/{}", namespace.trim_matches('/'), image.repository),
        ),
        None => (registry.clone(), image.repository.clone()),
      },
      None => match crate::image::split_registry(&image.repository) {
        (Some(host), rest) => (host.to_string(), rest.to_string()),
        (None, rest) => (DOCKER_HUB.to_string(), rest.to_string()),
      },
    };

    if host == DOCKER_HUB || host == "index.docker.io" || host == DOCKER_HUB_API {
      let repository = if repository.contains('/') {
        repository
      } else {
        format!("library/{}", repository)
      };
      return Self {
        host: DOCKER_HUB_API.to_string(),
        repository,
      };
    }

    Self { host, repository }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn docker_hub_official_image() {
    let image = Image::parse("nginx:1.25").unwrap();
    let loc = RepositoryLocation::of(&image);
    assert_eq!(loc.host, "registry-1.docker.io");
    assert_eq!(loc.repository, "library/nginx");
  }

  #[test]
  fn docker_hub_namespaced_image() {
    let image = Image::new(Some("docker.io".into()), "timberio/vector", None).unwrap();
    let loc = RepositoryLocation::of(&image);
    assert_eq!(loc.host, "registry-1.docker.io");
    assert_eq!(loc.repository, "timberio/vector");
  }

  #[test]
  fn host_embedded_in_repository() {
    let image = Image::new(None, "quay.io/prometheus/prometheus", None).unwrap();
    let loc = RepositoryLocation::of(&image);
    assert_eq!(loc.host, "quay.io");
    assert_eq!(loc.repository, "prometheus/prometheus");
  }

  #[test]
  fn registry_with_namespace() {
    let image = Image::new(Some("ghcr.io/acme".into()), "timberio/vector", None).unwrap();
    let loc = RepositoryLocation::of(&image);
    assert_eq!(loc.host, "ghcr.io");
    assert_eq!(loc.repository, "acme/timberio/vector");
  }
}
