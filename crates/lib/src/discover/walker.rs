//! Values-tree walker.
//!
//! Chart values documents have no fixed schema, so images are located with
//! two structural rules applied at every mapping, in order:
//!
//! 1. A mapping with a `repository` field that [looks like an image] and
//!    either sits under a key literally named `image`, or also carries a
//!    `tag`/`digest` field. Such a mapping is a leaf: nothing inside it is
//!    searched further.
//! 2. A mapping with a string `image` field shaped like `repo[:tag]`.
//!
//! Every match records its dotted path (`controller.sidecars[0].image`) so
//! the patched value can later be written back to the same place.
//!
//! [looks like an image]: crate::image::looks_like_image

use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::image::{Image, ImageError, is_image_string, looks_like_image};

/// Walk a values document and return every detected image, in document order.
///
/// Each mapping and sequence is visited exactly once.
pub fn walk(document: &Value) -> Vec<Image> {
  let mut found = Vec::new();
  visit(document, None, "", &mut found);
  found
}

fn visit(node: &Value, parent_key: Option<&str>, path: &str, found: &mut Vec<Image>) {
  match node {
    Value::Mapping(map) => {
      if let Some(detected) = match_repository_map(map, parent_key) {
        match detected {
          Ok(image) => found.push(image.at(path)),
          Err(e) => debug!(path = %path, error = %e, "ignoring image mapping"),
        }
        return;
      }

      if let Some(detected) = match_image_field(map) {
        let image_path = join_key(path, "image");
        match detected {
          Ok(image) => found.push(image.at(image_path)),
          Err(e) => debug!(path = %image_path, error = %e, "ignoring image string"),
        }
      }

      for (key, value) in map {
        let Some(key) = key_string(key) else {
          continue;
        };
        visit(value, Some(&key), &join_key(path, &key), found);
      }
    }
    Value::Sequence(items) => {
      for (index, item) in items.iter().enumerate() {
        visit(item, None, &format!("{}[{}]", path, index), found);
      }
    }
    Value::Tagged(tagged) => visit(&tagged.value, parent_key, path, found),
    _ => {}
  }
}

/// Rule 1: `{registry?, repository, tag?|digest?}`.
fn match_repository_map(map: &Mapping, parent_key: Option<&str>) -> Option<Result<Image, ImageError>> {
  let repository = map.get("repository").and_then(Value::as_str)?.trim();
  if !looks_like_image(repository) {
    return None;
  }

  let has_version_field = map.contains_key("tag") || map.contains_key("digest");
  if parent_key != Some("image") && !has_version_field {
    return None;
  }

  let tag = map.get("tag").and_then(scalar_string);
  let digest = map.get("digest").and_then(scalar_string);
  if tag.is_none() {
    if let Some(digest) = digest {
      return Some(Err(ImageError::DigestPinned(format!("{}@{}", repository, digest))));
    }
  }

  let registry = map.get("registry").and_then(scalar_string);
  Some(Image::new(registry, repository, tag))
}

/// Rule 2: `{image: "repo[:tag]"}`.
fn match_image_field(map: &Mapping) -> Option<Result<Image, ImageError>> {
  let value = map.get("image").and_then(Value::as_str)?.trim();
  if !is_image_string(value) {
    return None;
  }
  Some(Image::parse(value))
}

/// Render a scalar (string, number) as text. Empty strings count as absent.
pub(crate) fn scalar_string(value: &Value) -> Option<String> {
  let text = match value {
    Value::String(s) => s.trim().to_string(),
    Value::Number(n) => n.to_string(),
    _ => return None,
  };
  if text.is_empty() { None } else { Some(text) }
}

fn key_string(key: &Value) -> Option<String> {
  match key {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    Value::Bool(b) => Some(b.to_string()),
    _ => None,
  }
}

fn join_key(path: &str, key: &str) -> String {
  if key.is_empty() || key.contains(['.', '[', ']', '"', '\\']) {
    let escaped = key.replace('\\', "\\\\").replace('"', "\\\"");
    return format!("{}[\"{}\"]", path, escaped);
  }
  if path.is_empty() {
    key.to_string()
  } else {
    format!("{}.{}", path, key)
  }
}

/// One step of a dotted document path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  Key(String),
  Index(usize),
}

/// Parse a dotted path such as `a.b[0].c` into segments.
///
/// Keys that would be ambiguous in dotted form are written quoted in
/// brackets, `metadata["app.kubernetes.io/name"]`, with `\` escaping `"` and
/// `\` inside the quotes. Returns `None` if the path is malformed.
pub fn parse_path(path: &str) -> Option<Vec<Segment>> {
  let mut segments = Vec::new();
  let mut name = String::new();
  let mut chars = path.chars().peekable();

  while let Some(c) = chars.next() {
    match c {
      '.' => flush_name(&mut name, &mut segments),
      '[' => {
        flush_name(&mut name, &mut segments);
        if chars.next_if_eq(&'"').is_some() {
          let mut key = String::new();
          loop {
            match chars.next()? {
              '"' => break,
              '\\' => key.push(chars.next()?),
              other => key.push(other),
            }
          }
          chars.next_if_eq(&']')?;
          segments.push(Segment::Key(key));
        } else {
          let mut digits = String::new();
          loop {
            match chars.next()? {
              ']' => break,
              other => digits.push(other),
            }
          }
          segments.push(Segment::Index(digits.parse().ok()?));
        }
      }
      other => name.push(other),
    }
  }
  flush_name(&mut name, &mut segments);

  Some(segments)
}

fn flush_name(name: &mut String, segments: &mut Vec<Segment>) {
  if !name.is_empty() {
    segments.push(Segment::Key(std::mem::take(name)));
  }
}

/// Look up the node at `path`.
pub fn get_path<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
  parse_path(path)?
    .iter()
    .try_fold(document, |node, segment| match (node, segment) {
      (Value::Mapping(map), Segment::Key(key)) => map.get(key.as_str()),
      (Value::Sequence(items), Segment::Index(i)) => items.get(*i),
      _ => None,
    })
}

/// Look up the node at `path` for modification.
pub fn get_path_mut<'a>(document: &'a mut Value, path: &str) -> Option<&'a mut Value> {
  let segments = parse_path(path)?;
  let mut node = document;
  for segment in &segments {
    node = match (node, segment) {
      (Value::Mapping(map), Segment::Key(key)) => map.get_mut(key.as_str())?,
      (Value::Sequence(items), Segment::Index(i)) => items.get_mut(*i)?,
      _ => return None,
    };
  }
  Some(node)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn yaml(text: &str) -> Value {
    serde_yaml::from_str(text).unwrap()
  }

  fn refs(images: &[Image]) -> Vec<(String, String)> {
    images.iter().map(|i| (i.path.clone(), i.reference())).collect()
  }

  mod rules {
    use super::*;

    #[test]
    fn repository_under_image_key() {
      let doc = yaml(
        r#"
image:
  repository: timberio/vector
  pullPolicy: IfNotPresent
"#,
      );
      assert_eq!(refs(&walk(&doc)), vec![("image".into(), "timberio/vector".into())]);
    }

    #[test]
    fn repository_with_tag_anywhere() {
      let doc = yaml(
        r#"
controller:
  sidecar:
    registry: quay.io
    repository: kiwigrid/k8s-sidecar
    tag: 1.27.4
"#,
      );
      assert_eq!(
        refs(&walk(&doc)),
        vec![("controller.sidecar".into(), "quay.io/kiwigrid/k8s-sidecar:1.27.4".into())]
      );
    }

    #[test]
    fn repository_without_tag_or_image_parent_is_ignored() {
      let doc = yaml(
        r#"
git:
  repository: org/config-repo
"#,
      );
      assert!(walk(&doc).is_empty());
    }

    #[test]
    fn numeric_tag_is_stringified() {
      let doc = yaml(
        r#"
image:
  repository: library/redis
  tag: 7
"#,
      );
      assert_eq!(walk(&doc)[0].tag.as_deref(), Some("7"));
    }

    #[test]
    fn image_string_field() {
      let doc = yaml(
        r#"
extraContainers:
  - name: proxy
    image: envoyproxy/envoy:v1.30.1
  - name: local
    image: busybox
"#,
      );
      assert_eq!(
        refs(&walk(&doc)),
        vec![("extraContainers[0].image".into(), "envoyproxy/envoy:v1.30.1".into())]
      );
    }

    #[test]
    fn registry_port_is_kept_in_image_string() {
      let doc = yaml("job:\n  image: registry.local:5000/tools/kubectl\n");
      let images = walk(&doc);
      assert_eq!(images[0].registry.as_deref(), Some("registry.local:5000"));
      assert_eq!(images[0].tag, None);
    }

    #[test]
    fn rejects_non_image_values() {
      let doc = yaml(
        r#"
a:
  image:
    repository: "true"
b:
  image:
    repository: https://charts.example.com/repo
c:
  repository: "has space"
  tag: "1"
d:
  image: https://example.com/a/b
"#,
      );
      assert!(walk(&doc).is_empty());
    }

    #[test]
    fn digest_only_mapping_is_a_skipped_leaf() {
      let doc = yaml(
        r#"
image:
  repository: org/app
  digest: sha256:abc
  nested:
    image: org/other:1.0
"#,
      );
      assert!(walk(&doc).is_empty());
    }
  }

  mod traversal {
    use super::*;

    #[test]
    fn matched_mapping_is_a_leaf() {
      let doc = yaml(
        r#"
image:
  repository: org/app
  tag: "1.0"
  extra:
    repository: org/hidden
    tag: "2.0"
"#,
      );
      assert_eq!(refs(&walk(&doc)), vec![("image".into(), "org/app:1.0".into())]);
    }

    #[test]
    fn image_field_does_not_stop_recursion() {
      let doc = yaml(
        r#"
worker:
  image: org/worker:1.0
  init:
    image:
      repository: org/init
"#,
      );
      assert_eq!(
        refs(&walk(&doc)),
        vec![
          ("worker.image".into(), "org/worker:1.0".into()),
          ("worker.init.image".into(), "org/init".into()),
        ]
      );
    }

    #[test]
    fn document_order_is_preserved() {
      let doc = yaml(
        r#"
b:
  image: { repository: org/b }
a:
  image: { repository: org/a }
"#,
      );
      let found: Vec<_> = walk(&doc).into_iter().map(|i| i.repository).collect();
      assert_eq!(found, vec!["org/b", "org/a"]);
    }

    #[test]
    fn empty_and_scalar_documents() {
      assert!(walk(&Value::Null).is_empty());
      assert!(walk(&yaml("just a string")).is_empty());
    }
  }

  mod paths {
    use super::*;

    #[test]
    fn parse_mixed_segments() {
      assert_eq!(
        parse_path("a.b[0][2].c").unwrap(),
        vec![
          Segment::Key("a".into()),
          Segment::Key("b".into()),
          Segment::Index(0),
          Segment::Index(2),
          Segment::Key("c".into()),
        ]
      );
      assert_eq!(parse_path("").unwrap(), vec![]);
      assert!(parse_path("a[x]").is_none());
    }

    #[test]
    fn get_and_set_by_path() {
      let mut doc = yaml(
        r#"
sidecars:
  - name: a
    image: org/a:1
"#,
      );
      assert_eq!(
        get_path(&doc, "sidecars[0].image").and_then(Value::as_str),
        Some("org/a:1")
      );

      *get_path_mut(&mut doc, "sidecars[0].image").unwrap() = Value::String("org/a:2".into());
      assert_eq!(
        get_path(&doc, "sidecars[0].image").and_then(Value::as_str),
        Some("org/a:2")
      );
      assert!(get_path(&doc, "sidecars[3].image").is_none());
    }

    #[test]
    fn dotted_keys_are_quoted() {
      let doc = yaml(
        r#"
labels:
  app.kubernetes.io:
    image:
      repository: org/real
  app:
    kubernetes:
      io:
        image:
          repository: org/decoy
"#,
      );
      let found = walk(&doc);
      assert_eq!(found[0].path, r#"labels["app.kubernetes.io"].image"#);

      let node = get_path(&doc, &found[0].path).unwrap();
      assert_eq!(node.get("repository").and_then(Value::as_str), Some("org/real"));
      assert_eq!(
        get_path(&doc, &found[1].path).unwrap().get("repository").and_then(Value::as_str),
        Some("org/decoy")
      );
    }

    #[test]
    fn quoted_keys_unescape() {
      assert_eq!(join_key("", "a[0]"), r#"["a[0]"]"#);
      assert_eq!(join_key("x", r#"say "hi"\"#), r#"x["say \"hi\"\\"]"#);
      assert_eq!(
        parse_path(r#"x["say \"hi\"\\"].y"#).unwrap(),
        vec![
          Segment::Key("x".into()),
          Segment::Key(r#"say "hi"\"#.into()),
          Segment::Key("y".into()),
        ]
      );
      assert!(parse_path(r#"x["open"#).is_none());
    }

    #[test]
    fn walker_paths_resolve() {
      let doc = yaml(
        r#"
server:
  containers:
    - image:
        repository: org/app
        tag: "1"
"#,
      );
      let image = &walk(&doc)[0];
      assert_eq!(image.path, "server.containers[0].image");
      assert!(get_path(&doc, &image.path).unwrap().is_mapping());
    }
  }
}
