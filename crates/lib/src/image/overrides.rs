//! Declarative tag-variant substitution.
//!
//! Some upstream image variants cannot be patched (e.g. distroless images
//! have no package manager). An override swaps such a variant for a patchable
//! sibling: `timberio/vector:0.46.1-distroless-libc` with
//! `{from: distroless-libc, to: debian}` becomes `timberio/vector:0.46.1-debian`.

use tracing::debug;

use super::Image;

/// A single substitution rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Override {
  /// Substring the image reference must contain.
  pub match_key: String,
  /// Tag variant to replace (without the leading dash).
  pub from_suffix: String,
  /// Replacement tag variant.
  pub to_suffix: String,
}

impl Override {
  pub fn new(match_key: impl Into<String>, from_suffix: impl Into<String>, to_suffix: impl Into<String>) -> Self {
    Self {
      match_key: match_key.into(),
      from_suffix: from_suffix.into(),
      to_suffix: to_suffix.into(),
    }
  }

  /// Whether this rule fires for `image`.
  ///
  /// Fires only when the tag ends with `-<from>` and the reference contains
  /// the match key.
  pub fn matches(&self, image: &Image) -> bool {
    if self.from_suffix.is_empty() || self.match_key.is_empty() {
      return false;
    }
    let Some(tag) = image.tag.as_deref() else {
      return false;
    };
    tag.ends_with(&format!("-{}", self.from_suffix)) && image.reference().contains(&self.match_key)
  }

  /// Apply the substitution, returning the rewritten image if the rule fired.
  pub fn apply(&self, image: &Image) -> Option<Image> {
    if !self.matches(image) {
      return None;
    }
    let tag = image.tag.as_deref()?;
    let base = &tag[..tag.len() - self.from_suffix.len()];
    Some(image.with_tag(format!("{}{}", base, self.to_suffix)))
  }
}

/// An ordered set of override rules. The first matching rule wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideTable {
  rules: Vec<Override>,
}

impl OverrideTable {
  pub fn new(rules: Vec<Override>) -> Self {
    Self { rules }
  }

  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }

  pub fn len(&self) -> usize {
    self.rules.len()
  }

  pub fn rules(&self) -> &[Override] {
    &self.rules
  }

  /// Apply the first matching rule, or return the image unchanged.
  pub fn apply(&self, image: &Image) -> Image {
    for rule in &self.rules {
      if let Some(rewritten) = rule.apply(image) {
        debug!(from = %image, to = %rewritten, "applied tag override");
        return rewritten;
      }
    }
    image.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn vector_override() -> Override {
    Override::new("timberio/vector", "distroless-libc", "debian")
  }

  #[test]
  fn swaps_variant_suffix() {
    let image = Image::parse("timberio/vector:0.46.1-distroless-libc").unwrap().at("image");
    let rewritten = vector_override().apply(&image).unwrap();
    assert_eq!(rewritten.reference(), "timberio/vector:0.46.1-debian");
    assert_eq!(rewritten.path, "image");
  }

  #[test]
  fn unrelated_images_untouched() {
    let table = OverrideTable::new(vec![vector_override()]);

    let other_repo = Image::parse("grafana/agent:0.40.0-distroless-libc").unwrap();
    assert_eq!(table.apply(&other_repo), other_repo);

    let other_tag = Image::parse("timberio/vector:0.46.1-alpine").unwrap();
    assert_eq!(table.apply(&other_tag), other_tag);
  }

  #[test]
  fn requires_dash_before_suffix() {
    let image = Image::parse("timberio/vector:distroless-libc").unwrap();
    assert!(!vector_override().matches(&image));
  }

  #[test]
  fn untagged_image_never_matches() {
    let image = Image::parse("timberio/vector").unwrap();
    assert!(!vector_override().matches(&image));
  }

  #[test]
  fn first_matching_rule_wins() {
    let table = OverrideTable::new(vec![
      Override::new("vector", "distroless-libc", "debian"),
      Override::new("vector", "distroless-libc", "alpine"),
    ]);
    let image = Image::parse("timberio/vector:0.46.1-distroless-libc").unwrap();
    assert_eq!(table.apply(&image).tag.as_deref(), Some("0.46.1-debian"));
  }
}
