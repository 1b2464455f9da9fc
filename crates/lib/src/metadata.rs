//! Supply-chain metadata for wrapper charts.
//!
//! Each published wrapper chart carries:
//! - `sbom.cdx.json`: a CycloneDX 1.5 document listing the chart and every
//!   patched or mirrored image it references, as package URLs.
//! - `vulns.json`: the remaining findings per image, taken from the
//!   post-patch scan when one exists.
//!
//! Both are plain serde structures, so they are deterministic for a given
//! input and timestamp.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::consts::APP_NAME;
use crate::patch::PatchTarget;
use crate::scan::{VulnReport, Vulnerability};
use crate::util::fs::write_atomic;
use crate::util::hash::stable_urn;

#[derive(Debug, Error)]
pub enum MetadataError {
  #[error("failed to serialize {path}: {source}")]
  Serialize {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to write {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// The wrapper chart being described.
#[derive(Debug, Clone)]
pub struct ChartIdentity<'a> {
  pub name: &'a str,
  pub version: &'a str,
  pub upstream_version: &'a str,
  pub upstream_repository: &'a str,
  /// Registry and repository the chart is pushed to, e.g. `ghcr.io/acme/charts`.
  pub publish_repository: &'a str,
}

/// A published image referenced by the chart.
#[derive(Debug, Clone)]
pub struct PublishedImage<'a> {
  /// Upstream reference the image was derived from.
  pub source: &'a str,
  pub target: &'a PatchTarget,
  /// Manifest digest, if the registry reported one.
  pub digest: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bom {
  pub bom_format: &'static str,
  pub spec_version: &'static str,
  pub serial_number: String,
  pub version: u32,
  pub metadata: BomMetadata,
  pub components: Vec<BomComponent>,
  pub dependencies: Vec<BomDependency>,
}

#[derive(Debug, Serialize)]
pub struct BomMetadata {
  pub timestamp: String,
  pub tools: BomTools,
  pub component: BomComponent,
}

#[derive(Debug, Serialize)]
pub struct BomTools {
  pub components: Vec<BomComponent>,
}

#[derive(Debug, Serialize)]
pub struct BomComponent {
  #[serde(rename = "type")]
  pub kind: &'static str,
  #[serde(rename = "bom-ref", skip_serializing_if = "Option::is_none")]
  pub bom_ref: Option<String>,
  pub name: String,
  pub version: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub purl: Option<String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub hashes: Vec<BomHash>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub properties: Vec<BomProperty>,
}

#[derive(Debug, Serialize)]
pub struct BomHash {
  pub alg: &'static str,
  pub content: String,
}

#[derive(Debug, Serialize)]
pub struct BomProperty {
  pub name: String,
  pub value: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BomDependency {
  #[serde(rename = "ref")]
  pub reference: String,
  pub depends_on: Vec<String>,
}

/// Package URL of a published image.
///
/// `pkg:oci/<name>@<digest>?repository_url=<registry/repository>&tag=<tag>`,
/// without the version when the digest is unknown.
pub fn image_purl(target: &PatchTarget, digest: Option<&str>) -> String {
  let name = target
    .repository
    .rsplit('/')
    .next()
    .unwrap_or(&target.repository)
    .to_ascii_lowercase();
  let version = digest.map(|d| format!("@{}", d.replace(':', "%3A"))).unwrap_or_default();
  format!(
    "pkg:oci/{}{}?repository_url={}/{}&tag={}",
    name, version, target.registry, target.repository, target.tag
  )
}

/// Package URL of the wrapper chart.
pub fn chart_purl(chart: &ChartIdentity<'_>) -> String {
  format!(
    "pkg:helm/{}@{}?repository_url=oci://{}",
    chart.name, chart.version, chart.publish_repository
  )
}

/// Package URL of the upstream chart a wrapper depends on.
pub fn upstream_chart_purl(chart: &ChartIdentity<'_>) -> String {
  format!(
    "pkg:helm/{}@{}?repository_url={}",
    chart.name, chart.upstream_version, chart.upstream_repository
  )
}

/// Build the CycloneDX document for a wrapper chart.
///
/// Components are the published images followed by the upstream chart. The
/// wrapper depends on all of them.
pub fn build_sbom(chart: &ChartIdentity<'_>, images: &[PublishedImage<'_>], timestamp: &str) -> Bom {
  let chart_ref = chart_purl(chart);

  let mut components: Vec<BomComponent> = images
    .iter()
    .map(|image| {
      let purl = image_purl(image.target, image.digest.as_deref());
      let hashes = image
        .digest
        .as_deref()
        .and_then(|d| d.strip_prefix("sha256:"))
        .map(|hex| {
          vec![BomHash {
            alg: "SHA-256",
            content: hex.to_string(),
          }]
        })
        .unwrap_or_default();
      BomComponent {
        kind: "container",
        bom_ref: Some(purl.clone()),
        name: format!("{}/{}", image.target.registry, image.target.repository),
        version: image.target.tag.clone(),
        purl: Some(purl),
        hashes,
        properties: vec![BomProperty {
          name: format!("{}:source", APP_NAME),
          value: image.source.to_string(),
        }],
      }
    })
    .collect();

  let upstream_ref = upstream_chart_purl(chart);
  components.push(BomComponent {
    kind: "application",
    bom_ref: Some(upstream_ref.clone()),
    name: chart.name.to_string(),
    version: chart.upstream_version.to_string(),
    purl: Some(upstream_ref),
    hashes: Vec::new(),
    properties: Vec::new(),
  });

  let dependencies = vec![BomDependency {
    reference: chart_ref.clone(),
    depends_on: components.iter().filter_map(|c| c.bom_ref.clone()).collect(),
  }];

  Bom {
    bom_format: "CycloneDX",
    spec_version: "1.5",
    serial_number: stable_urn(&format!("{}@{}", chart.name, chart.version)),
    version: 1,
    metadata: BomMetadata {
      timestamp: timestamp.to_string(),
      tools: BomTools {
        components: vec![BomComponent {
          kind: "application",
          bom_ref: None,
          name: APP_NAME.to_string(),
          version: env!("CARGO_PKG_VERSION").to_string(),
          purl: None,
          hashes: Vec::new(),
          properties: Vec::new(),
        }],
      },
      component: BomComponent {
        kind: "application",
        bom_ref: Some(chart_ref.clone()),
        name: chart.name.to_string(),
        version: chart.version.to_string(),
        purl: Some(chart_ref),
        hashes: Vec::new(),
        properties: vec![
          BomProperty {
            name: format!("{}:upstream-version", APP_NAME),
            value: chart.upstream_version.to_string(),
          },
          BomProperty {
            name: format!("{}:upstream-repository", APP_NAME),
            value: chart.upstream_repository.to_string(),
          },
        ],
      },
    },
    components,
    dependencies,
  }
}

/// Remaining findings for a wrapper chart.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VulnPredicate {
  pub chart: String,
  pub version: String,
  pub generated_at: String,
  pub images: Vec<ImageVulns>,
  pub total: usize,
  pub severity_counts: BTreeMap<String, usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageVulns {
  pub image: String,
  pub source: String,
  /// Whether findings come from a scan of the published image.
  pub post_patch: bool,
  pub vulnerabilities: Vec<Vulnerability>,
}

/// The report behind an image's findings: post-patch if present.
pub struct ImageReport<'a> {
  pub image: PublishedImage<'a>,
  pub before: Option<&'a VulnReport>,
  pub after: Option<&'a VulnReport>,
}

/// Aggregate per-image findings into the chart's vulnerability predicate.
pub fn build_vuln_predicate(chart: &ChartIdentity<'_>, reports: &[ImageReport<'_>], timestamp: &str) -> VulnPredicate {
  let mut severity_counts = BTreeMap::new();
  let mut total = 0;

  let images = reports
    .iter()
    .map(|r| {
      let (report, post_patch) = match (r.after, r.before) {
        (Some(after), _) => (Some(after), true),
        (None, before) => (before, false),
      };
      let vulnerabilities = report.map(|rep| rep.vulnerabilities.clone()).unwrap_or_default();
      for v in &vulnerabilities {
        *severity_counts.entry(v.severity.clone()).or_insert(0) += 1;
      }
      total += vulnerabilities.len();
      ImageVulns {
        image: r.image.target.reference(),
        source: r.image.source.to_string(),
        post_patch,
        vulnerabilities,
      }
    })
    .collect();

  VulnPredicate {
    chart: chart.name.to_string(),
    version: chart.version.to_string(),
    generated_at: timestamp.to_string(),
    images,
    total,
    severity_counts,
  }
}

/// Current UTC time in RFC 3339 form, as used in generated documents.
pub fn timestamp_now() -> String {
  chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), MetadataError> {
  let content = serde_json::to_string_pretty(value).map_err(|source| MetadataError::Serialize {
    path: path.to_path_buf(),
    source,
  })?;
  write_atomic(path, content.as_bytes()).map_err(|source| MetadataError::Write {
    path: path.to_path_buf(),
    source,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn target() -> PatchTarget {
    PatchTarget {
      registry: "ghcr.io/acme".to_string(),
      repository: "timberio/vector".to_string(),
      tag: "0.46.1-debian-patched".to_string(),
    }
  }

  fn chart() -> ChartIdentity<'static> {
    ChartIdentity {
      name: "vector",
      version: "0.40.0-1",
      upstream_version: "0.40.0",
      upstream_repository: "https://helm.vector.dev",
      publish_repository: "ghcr.io/acme/charts",
    }
  }

  fn report(image_ref: &str, severities: &[&str]) -> VulnReport {
    VulnReport {
      image_ref: image_ref.to_string(),
      os: None,
      vulnerabilities: severities
        .iter()
        .enumerate()
        .map(|(i, s)| Vulnerability {
          id: format!("CVE-2024-{:04}", i),
          package: "pkg".to_string(),
          installed_version: "1".to_string(),
          fixed_version: None,
          severity: s.to_string(),
          title: None,
        })
        .collect(),
    }
  }

  #[test]
  fn purls() {
    let t = target();
    assert_eq!(
      image_purl(&t, Some("sha256:abc")),
      "pkg:oci/vector@sha256%3Aabc?repository_url=ghcr.io/acme/timberio/vector&tag=0.46.1-debian-patched"
    );
    assert_eq!(
      image_purl(&t, None),
      "pkg:oci/vector?repository_url=ghcr.io/acme/timberio/vector&tag=0.46.1-debian-patched"
    );
    assert_eq!(
      chart_purl(&chart()),
      "pkg:helm/vector@0.40.0-1?repository_url=oci://ghcr.io/acme/charts"
    );
  }

  #[test]
  fn sbom_lists_images_and_dependencies() {
    let t = target();
    let images = [PublishedImage {
      source: "timberio/vector:0.46.1-debian",
      target: &t,
      digest: Some("sha256:abc".to_string()),
    }];
    let bom = build_sbom(&chart(), &images, "2026-01-01T00:00:00Z");
    let json = serde_json::to_value(&bom).unwrap();

    assert_eq!(json["bomFormat"], "CycloneDX");
    assert_eq!(json["specVersion"], "1.5");
    assert_eq!(json["components"][0]["type"], "container");
    assert_eq!(json["components"][0]["hashes"][0]["content"], "abc");
    assert_eq!(json["components"][0]["properties"][0]["value"], "timberio/vector:0.46.1-debian");
    assert_eq!(json["dependencies"][0]["dependsOn"][0], json["components"][0]["bom-ref"]);
    assert_eq!(json["metadata"]["component"]["name"], "vector");

    let upstream = &json["components"][1];
    assert_eq!(upstream["version"], "0.40.0");
    assert_eq!(upstream["purl"], "pkg:helm/vector@0.40.0?repository_url=https://helm.vector.dev");
    assert_eq!(json["dependencies"][0]["dependsOn"][1], upstream["bom-ref"]);
  }

  #[test]
  fn timestamp_is_utc() {
    assert!(timestamp_now().ends_with('Z'));
  }

  #[test]
  fn sbom_serial_number_is_stable() {
    let a = build_sbom(&chart(), &[], "2026-01-01T00:00:00Z");
    let b = build_sbom(&chart(), &[], "2026-02-01T00:00:00Z");
    assert_eq!(a.serial_number, b.serial_number);
    assert!(a.serial_number.starts_with("urn:uuid:"));
  }

  #[test]
  fn predicate_prefers_post_patch_findings() {
    let t = target();
    let before = report("timberio/vector:0.46.1-debian", &["HIGH", "HIGH", "LOW"]);
    let after = report("ghcr.io/acme/timberio/vector:0.46.1-debian-patched", &["LOW"]);
    let only_before = report("busybox:1.36", &["CRITICAL"]);

    let reports = [
      ImageReport {
        image: PublishedImage {
          source: "timberio/vector:0.46.1-debian",
          target: &t,
          digest: None,
        },
        before: Some(&before),
        after: Some(&after),
      },
      ImageReport {
        image: PublishedImage {
          source: "busybox:1.36",
          target: &t,
          digest: None,
        },
        before: Some(&only_before),
        after: None,
      },
    ];
    let predicate = build_vuln_predicate(&chart(), &reports, "2026-01-01T00:00:00Z");

    assert_eq!(predicate.total, 2);
    assert!(predicate.images[0].post_patch);
    assert!(!predicate.images[1].post_patch);
    assert_eq!(predicate.severity_counts.get("LOW"), Some(&1));
    assert_eq!(predicate.severity_counts.get("CRITICAL"), Some(&1));
  }
}
