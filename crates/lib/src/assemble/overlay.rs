//! Values overlay.
//!
//! The wrapper chart's values are the upstream values with each patched
//! image rewritten in place, at the path discovery recorded for it.

use serde_yaml::{Mapping, Value};
use tracing::{debug, warn};

use crate::discover::walker::get_path_mut;
use crate::image::Image;
use crate::patch::PatchTarget;

/// Rewrite `values` so each image points at its target.
///
/// Returns the rewritten document and the images that could not be
/// relocated (no path, or the path no longer resolves to an image).
pub fn rewrite_values<'a>(values: &Value, replacements: &[(&'a Image, &PatchTarget)]) -> (Value, Vec<&'a Image>) {
  let mut document = values.clone();
  let mut unrelocated = Vec::new();

  for (image, target) in replacements {
    if image.path.is_empty() {
      debug!(image = %image, "image has no values path, leaving it to the upstream chart");
      unrelocated.push(*image);
      continue;
    }

    let relocated = match get_path_mut(&mut document, &image.path) {
      Some(Value::Mapping(map)) => {
        rewrite_mapping(map, target);
        true
      }
      Some(node @ Value::String(_)) => {
        *node = Value::String(target.reference());
        true
      }
      _ => false,
    };

    if relocated {
      debug!(path = %image.path, from = %image, to = %target.reference(), "relocated image");
    } else {
      warn!(path = %image.path, image = %image, "values path does not hold an image");
      unrelocated.push(*image);
    }
  }

  (document, unrelocated)
}

/// Point a `{registry?, repository, tag}` mapping at `target`.
///
/// Charts without a `registry` field get the registry folded into
/// `repository`. A `digest` would take precedence over the tag, so it is
/// cleared.
fn rewrite_mapping(map: &mut Mapping, target: &PatchTarget) {
  if map.contains_key("registry") {
    map.insert("registry".into(), Value::String(target.registry.clone()));
    map.insert("repository".into(), Value::String(target.repository.clone()));
  } else {
    map.insert(
      "repository".into(),
      Value::String(format!("{}/{}", target.registry, target.repository)),
    );
  }
  map.insert("tag".into(), Value::String(target.tag.clone()));
  if map.contains_key("digest") {
    map.insert("digest".into(), Value::String(String::new()));
  }
}
