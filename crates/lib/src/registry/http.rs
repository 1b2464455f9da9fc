//! OCI distribution API client.
//!
//! Speaks just enough of the distribution protocol for the [`Registry`]
//! capability: tag listing with `Link` pagination, `HEAD` manifest probes and
//! anonymous bearer-token negotiation from `WWW-Authenticate` challenges.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::header::{ACCEPT, LINK, WWW_AUTHENTICATE};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::{Registry, RegistryError, RepositoryLocation};
use crate::image::Image;
use crate::util::hash::hash_bytes;

const MANIFEST_ACCEPT: &str = concat!(
  "application/vnd.oci.image.index.v1+json,",
  "application/vnd.oci.image.manifest.v1+json,",
  "application/vnd.docker.distribution.manifest.list.v2+json,",
  "application/vnd.docker.distribution.manifest.v2+json"
);

const DIGEST_HEADER: &str = "docker-content-digest";

/// Upper bound on followed `Link` pages for a single listing.
const MAX_TAG_PAGES: usize = 50;

#[derive(Debug, Deserialize)]
struct TagList {
  #[serde(default)]
  tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
  token: Option<String>,
  access_token: Option<String>,
}

/// Registry client over HTTPS (or plain HTTP for configured hosts).
#[derive(Debug)]
pub struct HttpRegistry {
  client: reqwest::Client,
  plain_http: Vec<String>,
  tokens: Mutex<HashMap<RepositoryLocation, String>>,
}

impl HttpRegistry {
  /// Create a client with the given request timeout.
  ///
  /// Hosts listed in `plain_http` are contacted over `http://`.
  pub fn new(timeout: Duration, plain_http: Vec<String>) -> Result<Self, RegistryError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("chartpatch/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(RegistryError::Client)?;

    Ok(Self {
      client,
      plain_http,
      tokens: Mutex::new(HashMap::new()),
    })
  }

  fn base_url(&self, host: &str) -> String {
    let scheme = if self.plain_http.iter().any(|h| h == host) {
      "http"
    } else {
      "https"
    };
    format!("{}://{}", scheme, host)
  }

  fn cached_token(&self, loc: &RepositoryLocation) -> Option<String> {
    self.tokens.lock().ok().and_then(|tokens| tokens.get(loc).cloned())
  }

  fn store_token(&self, loc: &RepositoryLocation, token: String) {
    if let Ok(mut tokens) = self.tokens.lock() {
      tokens.insert(loc.clone(), token);
    }
  }

  async fn request(&self, method: Method, url: &str, token: Option<&str>) -> Result<Response, RegistryError> {
    let mut builder = self.client.request(method, url).header(ACCEPT, MANIFEST_ACCEPT);
    if let Some(token) = token {
      builder = builder.bearer_auth(token);
    }
    builder.send().await.map_err(|source| RegistryError::Request {
      url: url.to_string(),
      source,
    })
  }

  /// Send a request, negotiating a bearer token on a `401` challenge.
  async fn send(&self, loc: &RepositoryLocation, method: Method, url: &str) -> Result<Response, RegistryError> {
    let cached = self.cached_token(loc);
    let response = self.request(method.clone(), url, cached.as_deref()).await?;
    if response.status() != StatusCode::UNAUTHORIZED {
      return Ok(response);
    }

    let challenge = response
      .headers()
      .get(WWW_AUTHENTICATE)
      .and_then(|v| v.to_str().ok())
      .map(str::to_string);
    let Some(challenge) = challenge else {
      return Ok(response);
    };

    let token = self.fetch_token(loc, &challenge).await?;
    self.store_token(loc, token.clone());
    self.request(method, url, Some(&token)).await
  }

  async fn fetch_token(&self, loc: &RepositoryLocation, challenge: &str) -> Result<String, RegistryError> {
    let auth_err = |message: String| RegistryError::Auth {
      host: loc.host.clone(),
      message,
    };

    let (realm, service) =
      parse_www_authenticate(challenge).ok_or_else(|| auth_err(format!("unsupported challenge: {}", challenge)))?;

    let mut query = vec![("scope", format!("repository:{}:pull", loc.repository))];
    if let Some(service) = service {
      query.push(("service", service));
    }

    debug!(realm = %realm, repository = %loc.repository, "requesting anonymous registry token");

    let response = self
      .client
      .get(&realm)
      .query(&query)
      .send()
      .await
      .map_err(|e| auth_err(e.to_string()))?;
    if !response.status().is_success() {
      return Err(auth_err(format!("token endpoint returned HTTP {}", response.status())));
    }

    let body: TokenResponse = response.json().await.map_err(|e| auth_err(e.to_string()))?;
    body
      .token
      .or(body.access_token)
      .ok_or_else(|| auth_err("token response has no token".to_string()))
  }

  async fn head_manifest(&self, image: &Image, tag: &str) -> Result<Option<Response>, RegistryError> {
    let loc = RepositoryLocation::of(image);
    let url = format!("{}/v2/{}/manifests/{}", self.base_url(&loc.host), loc.repository, tag);
    let response = self.send(&loc, Method::HEAD, &url).await?;

    match response.status() {
      StatusCode::NOT_FOUND => Ok(None),
      status if status.is_success() => Ok(Some(response)),
      status => Err(RegistryError::Status {
        url,
        status: status.as_u16(),
      }),
    }
  }
}

impl Registry for HttpRegistry {
  async fn list_tags(&self, image: &Image) -> Result<Vec<String>, RegistryError> {
    let loc = RepositoryLocation::of(image);
    let base = self.base_url(&loc.host);
    let mut url = format!("{}/v2/{}/tags/list?n=1000", base, loc.repository);
    let mut tags = Vec::new();

    for _ in 0..MAX_TAG_PAGES {
      let response = self.send(&loc, Method::GET, &url).await?;
      match response.status() {
        StatusCode::NOT_FOUND => {
          debug!(repository = %loc.repository, "repository not found, no tags");
          return Ok(tags);
        }
        status if !status.is_success() => {
          return Err(RegistryError::Status {
            url,
            status: status.as_u16(),
          });
        }
        _ => {}
      }

      let next = response
        .headers()
        .get(LINK)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_next_link);

      let page: TagList = response.json().await.map_err(|e| RegistryError::InvalidResponse {
        url: url.clone(),
        message: e.to_string(),
      })?;
      tags.extend(page.tags.unwrap_or_default());

      match next {
        Some(next) if next.starts_with('/') => url = format!("{}{}", base, next),
        Some(next) => url = next,
        None => return Ok(tags),
      }
    }

    debug!(repository = %loc.repository, pages = MAX_TAG_PAGES, "tag listing truncated");
    Ok(tags)
  }

  async fn tag_exists(&self, image: &Image, tag: &str) -> Result<bool, RegistryError> {
    Ok(self.head_manifest(image, tag).await?.is_some())
  }

  async fn manifest_digest(&self, image: &Image, tag: &str) -> Result<Option<String>, RegistryError> {
    let Some(response) = self.head_manifest(image, tag).await? else {
      return Ok(None);
    };

    if let Some(digest) = response.headers().get(DIGEST_HEADER).and_then(|v| v.to_str().ok()) {
      return Ok(Some(digest.to_string()));
    }

    // Some registries omit the digest header on HEAD; hash the manifest body instead.
    let loc = RepositoryLocation::of(image);
    let url = format!("{}/v2/{}/manifests/{}", self.base_url(&loc.host), loc.repository, tag);
    let response = self.send(&loc, Method::GET, &url).await?;
    if !response.status().is_success() {
      return Err(RegistryError::Status {
        url,
        status: response.status().as_u16(),
      });
    }
    let body = response.bytes().await.map_err(|source| RegistryError::Request {
      url: url.clone(),
      source,
    })?;
    Ok(Some(format!("sha256:{}", hash_bytes(&body))))
  }
}

/// Parse a `WWW-Authenticate: Bearer realm="...",service="..."` challenge.
///
/// Returns `(realm, service)`.
fn parse_www_authenticate(header: &str) -> Option<(String, Option<String>)> {
  let rest = header.trim().strip_prefix("Bearer ")?;

  let mut realm = None;
  let mut service = None;
  let mut remaining = rest;

  while !remaining.is_empty() {
    remaining = remaining.trim_start_matches([' ', ',']);
    if remaining.is_empty() {
      break;
    }

    let eq = remaining.find('=')?;
    let key = remaining[..eq].trim();
    remaining = &remaining[eq + 1..];

    let value = if let Some(quoted) = remaining.strip_prefix('"') {
      let close = quoted.find('"')?;
      let value = &quoted[..close];
      remaining = &quoted[close + 1..];
      value
    } else {
      let end = remaining.find(',').unwrap_or(remaining.len());
      let value = &remaining[..end];
      remaining = &remaining[end..];
      value
    };

    match key {
      "realm" => realm = Some(value.to_string()),
      "service" => service = Some(value.to_string()),
      _ => {}
    }
  }

  realm.map(|realm| (realm, service))
}

/// Extract the `rel="next"` target from a `Link` header.
fn parse_next_link(header: &str) -> Option<String> {
  header.split(',').find_map(|part| {
    let (target, params) = part.split_once(';')?;
    if !params.contains("rel=\"next\"") && !params.contains("rel=next") {
      return None;
    }
    let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
    Some(target.to_string())
  })
}
