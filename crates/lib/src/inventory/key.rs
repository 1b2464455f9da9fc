//! Inventory key derivation.

use std::collections::HashSet;

use crate::image::{Image, split_registry};

/// Derive a fresh inventory key for `image`.
///
/// The key is the repository path with `/` replaced by `-`. On collision the
/// sanitized registry host is appended, then a numeric suffix starting at 2.
pub fn derive_key(image: &Image, taken: &HashSet<String>) -> String {
  let (_, path) = split_registry(&image.repository);
  let base = sanitize(&path.replace('/', "-"));
  if !taken.contains(&base) {
    return base;
  }

  let stem = match image.registry_host() {
    Some(host) => {
      let qualified = format!("{}-{}", base, sanitize(host));
      if !taken.contains(&qualified) {
        return qualified;
      }
      qualified
    }
    None => base,
  };

  let mut n = 2;
  loop {
    let candidate = format!("{}-{}", stem, n);
    if !taken.contains(&candidate) {
      return candidate;
    }
    n += 1;
  }
}

fn sanitize(text: &str) -> String {
  text
    .chars()
    .map(|c| if c == '.' || c == ':' { '-' } else { c })
    .collect()
}
