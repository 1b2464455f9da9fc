//! Filesystem helpers.

use std::fs;
use std::io;
use std::path::Path;

use crate::util::hash::hash_bytes;

/// Write `content` to `path` atomically.
///
/// The content is written to a sibling temp file which is then renamed over
/// the destination, so readers never observe a partially written file.
/// Parent directories are created as needed.
pub fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
  if let Some(parent) = path.parent() {
    if !parent.as_os_str().is_empty() {
      fs::create_dir_all(parent)?;
    }
  }

  let file_name = path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_else(|| "out".to_string());
  let temp_path = path.with_file_name(format!(".{}.tmp", file_name));

  fs::write(&temp_path, content)?;
  fs::rename(&temp_path, path)
}

/// Convert arbitrary text (typically an image reference) to a safe file stem.
///
/// Keeps alphanumerics, dash, underscore and dot; everything else becomes `_`.
/// Falls back to a hash of the input if nothing usable remains.
pub fn safe_file_stem(text: &str) -> String {
  let sanitized: String = text
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
        c
      } else {
        '_'
      }
    })
    .collect();

  let trimmed = sanitized.trim_matches('.');
  if !trimmed.is_empty() && trimmed.chars().any(|c| c.is_ascii_alphanumeric()) {
    return sanitized;
  }

  format!("image_{}", &hash_bytes(text.as_bytes())[..16])
}
