//! The patch work queue.
//!
//! Every distinct image reference becomes one matrix entry, consumed by CI as
//! a job matrix. The entry's `image_name` is a filesystem- and CI-safe name
//! that also keys the image's reports and patch result file.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::image::Image;
use crate::util::fs::write_atomic;

#[derive(Debug, Error)]
pub enum MatrixError {
  #[error("failed to read matrix {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to write matrix {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid matrix {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
}

/// One unit of patch work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixEntry {
  pub image_ref: String,
  pub image_name: String,
}

/// The deduplicated work queue: `{"include": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Matrix {
  pub include: Vec<MatrixEntry>,
}

impl Matrix {
  /// Build the matrix from images, keeping the first occurrence of each
  /// reference. Colliding sanitized names get a numeric suffix.
  pub fn build<'a>(images: impl IntoIterator<Item = &'a Image>) -> Self {
    let mut seen_refs = HashSet::new();
    let mut names = HashSet::new();
    let mut include = Vec::new();

    for image in images {
      let image_ref = image.reference();
      if !seen_refs.insert(image_ref.clone()) {
        continue;
      }

      let base = image.sanitized_name();
      let mut image_name = base.clone();
      let mut n = 2;
      while !names.insert(image_name.clone()) {
        image_name = format!("{}-{}", base, n);
        n += 1;
      }

      include.push(MatrixEntry { image_ref, image_name });
    }

    Self { include }
  }

  pub fn len(&self) -> usize {
    self.include.len()
  }

  pub fn is_empty(&self) -> bool {
    self.include.is_empty()
  }

  pub fn find(&self, image_ref: &str) -> Option<&MatrixEntry> {
    self.include.iter().find(|e| e.image_ref == image_ref)
  }

  /// Compact single-line JSON, suitable as a CI output variable.
  pub fn to_compact_json(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string(self)
  }

  pub fn load(path: &Path) -> Result<Self, MatrixError> {
    let content = fs::read_to_string(path).map_err(|source| MatrixError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    serde_json::from_str(&content).map_err(|source| MatrixError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  pub fn save(&self, path: &Path) -> Result<(), MatrixError> {
    let content = self.to_compact_json().map_err(|source| MatrixError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    write_atomic(path, content.as_bytes()).map_err(|source| MatrixError::Write {
      path: path.to_path_buf(),
      source,
    })
  }
}
