//! The image inventory file.
//!
//! The inventory is a human-edited YAML mapping: one entry per image, plus a
//! reserved `overrides` key holding tag substitutions.
//!
//! ```yaml
//! # Pinned manually.
//! postgres:
//!   image:
//!     repository: library/postgres
//!     tag: "16.2"
//!
//! overrides:
//!   timberio/vector:
//!     from: distroless-libc
//!     to: debian
//! ```
//!
//! Discovery only ever appends to this file. New entries are rendered and
//! added to the end of the existing text, so comments, ordering and manual
//! edits survive, and a run that finds nothing new leaves the file
//! byte-for-byte unchanged.

mod key;

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::consts::OVERRIDES_KEY;
use crate::discover::walker::scalar_string;
use crate::image::{Image, Override, OverrideTable};
use crate::util::fs::write_atomic;

pub use key::derive_key;

/// Errors that can occur when reading or writing the inventory.
#[derive(Debug, Error)]
pub enum InventoryError {
  #[error("failed to read inventory {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse inventory {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },

  #[error("inventory {path} must be a mapping at the top level")]
  NotAMapping { path: PathBuf },

  #[error("invalid override for '{key}': {message}")]
  InvalidOverride { key: String, message: String },

  #[error("failed to render inventory entries: {0}")]
  Render(#[source] serde_yaml::Error),

  #[error("failed to write inventory {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// One image entry of the inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEntry {
  pub key: String,
  pub image: Image,
}

/// An inventory file loaded for merging.
#[derive(Debug)]
pub struct Inventory {
  path: PathBuf,
  content: String,
  keys: HashSet<String>,
  entries: Vec<InventoryEntry>,
  overrides: OverrideTable,
  dirty: bool,
  // No top-level keys, so any non-comment text is a null or `{}` document.
  blank: bool,
}

impl Inventory {
  /// Load an inventory. A missing file is an empty inventory.
  pub fn load(path: &Path) -> Result<Self, InventoryError> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        debug!(path = %path.display(), "inventory not found, starting empty");
        String::new()
      }
      Err(source) => {
        return Err(InventoryError::Read {
          path: path.to_path_buf(),
          source,
        });
      }
    };
    Self::parse(path, content)
  }

  /// Parse inventory text that will be saved to `path`.
  pub fn parse(path: &Path, content: String) -> Result<Self, InventoryError> {
    let document: Value = serde_yaml::from_str(&content).map_err(|source| InventoryError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    let mapping = match document {
      Value::Null => Mapping::new(),
      Value::Mapping(mapping) => mapping,
      _ => return Err(InventoryError::NotAMapping { path: path.to_path_buf() }),
    };

    let blank = mapping.is_empty();
    let mut keys = HashSet::new();
    let mut entries = Vec::new();
    let mut overrides = OverrideTable::default();

    for (key, value) in &mapping {
      let Some(key) = scalar_string(key) else {
        continue;
      };
      keys.insert(key.clone());

      if key == OVERRIDES_KEY {
        overrides = parse_overrides(value)?;
        continue;
      }

      match parse_entry(value) {
        Some(image) => entries.push(InventoryEntry { key, image }),
        None => warn!(key = %key, "inventory entry has no usable image, ignoring"),
      }
    }

    Ok(Self {
      path: path.to_path_buf(),
      content,
      keys,
      entries,
      overrides,
      dirty: false,
      blank,
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// The current file text, including appended entries.
  pub fn content(&self) -> &str {
    &self.content
  }

  pub fn entries(&self) -> &[InventoryEntry] {
    &self.entries
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn overrides(&self) -> &OverrideTable {
    &self.overrides
  }

  /// Entry images in file order.
  pub fn images(&self) -> Vec<Image> {
    self.entries.iter().map(|e| e.image.clone()).collect()
  }

  /// Whether an image with exactly this reference is already inventoried.
  pub fn contains(&self, image: &Image) -> bool {
    let reference = image.reference();
    self.entries.iter().any(|e| e.image.reference() == reference)
  }

  /// Append every image whose reference is not yet inventoried.
  ///
  /// Returns the appended entries. Existing entries are never modified, and
  /// repeated references within `images` are added once.
  pub fn merge<'a>(&mut self, images: impl IntoIterator<Item = &'a Image>) -> Result<Vec<InventoryEntry>, InventoryError> {
    let mut known: HashSet<String> = self.entries.iter().map(|e| e.image.reference()).collect();
    let mut appended = Vec::new();

    for image in images {
      if !known.insert(image.reference()) {
        continue;
      }
      let key = derive_key(image, &self.keys);
      self.keys.insert(key.clone());

      let mut stored = image.clone();
      stored.path.clear();
      debug!(key = %key, image = %stored, "appending inventory entry");
      appended.push(InventoryEntry { key, image: stored });
    }

    if appended.is_empty() {
      return Ok(appended);
    }

    self.append_text(&appended)?;
    self.entries.extend(appended.iter().cloned());
    self.dirty = true;
    Ok(appended)
  }

  /// Write the file if entries were appended. Returns whether it was written.
  pub fn save(&mut self) -> Result<bool, InventoryError> {
    if !self.dirty {
      return Ok(false);
    }
    write_atomic(&self.path, self.content.as_bytes()).map_err(|source| InventoryError::Write {
      path: self.path.clone(),
      source,
    })?;
    self.dirty = false;
    Ok(true)
  }

  fn append_text(&mut self, appended: &[InventoryEntry]) -> Result<(), InventoryError> {
    let mut block = Mapping::new();
    for entry in appended {
      let record = serde_yaml::to_value(EntryRecord::from(&entry.image)).map_err(InventoryError::Render)?;
      block.insert(Value::String(entry.key.clone()), record);
    }
    let rendered = serde_yaml::to_string(&Value::Mapping(block)).map_err(InventoryError::Render)?;

    if self.blank {
      self.content = comment_lines(&self.content);
      self.blank = false;
    }
    if !self.content.is_empty() && !self.content.ends_with('\n') {
      self.content.push('\n');
    }
    self.content.push_str(&rendered);
    Ok(())
  }
}

/// Keep only the comment and blank lines of `content`.
fn comment_lines(content: &str) -> String {
  content
    .lines()
    .filter(|line| {
      let line = line.trim();
      line.is_empty() || line.starts_with('#')
    })
    .fold(String::new(), |mut kept, line| {
      kept.push_str(line);
      kept.push('\n');
      kept
    })
}

/// On-disk shape of an entry.
#[derive(Serialize)]
struct EntryRecord<'a> {
  image: ImageRecord<'a>,
}

#[derive(Serialize)]
struct ImageRecord<'a> {
  #[serde(skip_serializing_if = "Option::is_none")]
  registry: Option<&'a str>,
  repository: &'a str,
  #[serde(skip_serializing_if = "Option::is_none")]
  tag: Option<&'a str>,
}

impl<'a> From<&'a Image> for EntryRecord<'a> {
  fn from(image: &'a Image) -> Self {
    Self {
      image: ImageRecord {
        registry: image.registry.as_deref(),
        repository: &image.repository,
        tag: image.tag.as_deref(),
      },
    }
  }
}

/// Read an entry's image: `{image: {registry?, repository, tag?}}` or
/// `{image: "repo:tag"}`.
fn parse_entry(value: &Value) -> Option<Image> {
  match value.get("image")? {
    Value::String(reference) => Image::parse(reference).ok(),
    image @ Value::Mapping(_) => {
      let repository = image.get("repository").and_then(scalar_string)?;
      let registry = image.get("registry").and_then(scalar_string);
      let tag = image.get("tag").and_then(scalar_string);
      Image::new(registry, repository, tag).ok()
    }
    _ => None,
  }
}

fn parse_overrides(value: &Value) -> Result<OverrideTable, InventoryError> {
  let rules = match value {
    Value::Null => return Ok(OverrideTable::default()),
    Value::Mapping(rules) => rules,
    _ => {
      return Err(InventoryError::InvalidOverride {
        key: OVERRIDES_KEY.to_string(),
        message: "expected a mapping".to_string(),
      });
    }
  };

  let mut parsed = Vec::with_capacity(rules.len());
  for (key, rule) in rules {
    let key = scalar_string(key).unwrap_or_default();
    let field = |name: &str| {
      rule
        .get(name)
        .and_then(scalar_string)
        .ok_or_else(|| InventoryError::InvalidOverride {
          key: key.clone(),
          message: format!("missing `{}`", name),
        })
    };
    let from = field("from")?;
    let to = field("to")?;
    parsed.push(Override::new(key.clone(), from, to));
  }
  Ok(OverrideTable::new(parsed))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  const EXISTING: &str = r#"# Images patched for the platform team.
postgres:
  image:
    repository: library/postgres
    tag: "16.2"   # keep in sync with the operator

nginx:
  image: nginx:1.25

overrides:
  timberio/vector:
    from: distroless-libc
    to: debian
"#;

  fn inventory(content: &str) -> Inventory {
    Inventory::parse(Path::new("images.yaml"), content.to_string()).unwrap()
  }

  fn image(reference: &str) -> Image {
    Image::parse(reference).unwrap()
  }

  mod loading {
    use super::*;

    #[test]
    fn reads_entries_and_overrides() {
      let inv = inventory(EXISTING);
      let refs: Vec<String> = inv.images().iter().map(Image::reference).collect();
      assert_eq!(refs, vec!["library/postgres:16.2", "nginx:1.25"]);
      assert_eq!(inv.overrides().len(), 1);
      assert_eq!(inv.overrides().rules()[0].to_suffix, "debian");
    }

    #[test]
    fn missing_file_is_empty() {
      let dir = TempDir::new().unwrap();
      let inv = Inventory::load(&dir.path().join("images.yaml")).unwrap();
      assert!(inv.is_empty());
      assert!(inv.overrides().is_empty());
    }

    #[test]
    fn rejects_non_mapping_documents() {
      let err = Inventory::parse(Path::new("x.yaml"), "- a\n- b\n".to_string()).unwrap_err();
      assert!(matches!(err, InventoryError::NotAMapping { .. }));
    }

    #[test]
    fn rejects_incomplete_overrides() {
      let err = Inventory::parse(Path::new("x.yaml"), "overrides:\n  org/app:\n    from: a\n".to_string()).unwrap_err();
      assert!(matches!(err, InventoryError::InvalidOverride { ref key, .. } if key == "org/app"));
    }
  }

  mod merging {
    use super::*;

    #[test]
    fn appends_after_existing_text() {
      let mut inv = inventory(EXISTING);
      let redis = image("bitnami/redis:7.2").at("master.image");
      let appended = inv.merge([&image("nginx:1.25"), &redis]).unwrap();

      assert_eq!(appended.len(), 1);
      assert_eq!(appended[0].key, "bitnami-redis");
      assert_eq!(appended[0].image.path, "");
      assert!(inv.content().starts_with(EXISTING));
      assert!(inv.content().ends_with("bitnami-redis:\n  image:\n    repository: bitnami/redis\n    tag: '7.2'\n"));

      let reparsed = inventory(inv.content());
      assert_eq!(reparsed.len(), 3);
      assert!(reparsed.contains(&redis));
    }

    #[test]
    fn empty_flow_mapping_is_replaced() {
      let mut inv = inventory("# Managed by discovery\n{}\n");
      let app = image("org/app:1.0");
      inv.merge([&app]).unwrap();

      assert!(inv.content().starts_with("# Managed by discovery\n"));
      assert!(!inv.content().contains("{}"));
      let reparsed = inventory(inv.content());
      assert_eq!(reparsed.len(), 1);
      assert!(reparsed.contains(&app));

      let mut again = inventory(inv.content());
      again.merge([&image("org/other:2.0")]).unwrap();
      assert!(again.content().starts_with(inv.content()));
      assert_eq!(inventory(again.content()).len(), 2);
    }

    #[test]
    fn merge_is_idempotent() {
      let mut inv = inventory(EXISTING);
      let candidates = [image("bitnami/redis:7.2"), image("quay.io/org/exporter:2.0")];
      inv.merge(candidates.iter()).unwrap();
      let once = inv.content().to_string();

      let mut again = inventory(&once);
      assert!(again.merge(candidates.iter()).unwrap().is_empty());
      assert_eq!(again.content(), once);
      assert!(!again.save().unwrap());
    }

    #[test]
    fn repeated_references_are_added_once() {
      let mut inv = inventory("");
      let a = image("org/app:1").at("a.image");
      let b = image("org/app:1").at("b.image");
      assert_eq!(inv.merge([&a, &b]).unwrap().len(), 1);
    }

    #[test]
    fn key_collisions_get_registry_then_number() {
      let mut inv = inventory(EXISTING);
      let appended = inv
        .merge([&image("nginx:1.26"), &image("docker.io/nginx:1.27"), &image("docker.io/nginx:1.28")])
        .unwrap();
      let keys: Vec<&str> = appended.iter().map(|e| e.key.as_str()).collect();
      assert_eq!(keys, vec!["nginx-2", "nginx-docker-io", "nginx-docker-io-2"]);
    }

    #[test]
    fn overrides_key_is_never_reused() {
      let mut inv = inventory(EXISTING);
      let appended = inv.merge([&image("org/overrides:1")]).unwrap();
      assert_eq!(appended[0].key, "org-overrides");

      let mut bare = inventory("overrides: {}\n");
      let appended = bare.merge([&image("overrides:1")]).unwrap();
      assert_eq!(appended[0].key, "overrides-2");
    }
  }

  mod saving {
    use super::*;

    #[test]
    fn writes_only_when_dirty() {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("images.yaml");
      fs::write(&path, EXISTING).unwrap();

      let mut inv = Inventory::load(&path).unwrap();
      assert!(!inv.save().unwrap());

      inv.merge([&image("org/app:1.0")]).unwrap();
      assert!(inv.save().unwrap());
      let written = fs::read_to_string(&path).unwrap();
      assert!(written.starts_with(EXISTING));
      assert!(written.contains("org-app:"));
    }

    #[test]
    fn creates_missing_file() {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("nested").join("images.yaml");
      let mut inv = Inventory::load(&path).unwrap();
      inv.merge([&image("org/app:1.0")]).unwrap();
      assert!(inv.save().unwrap());
      assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "org-app:\n  image:\n    repository: org/app\n    tag: '1.0'\n"
      );
    }
  }
}
