//! Container images from rendered manifests.
//!
//! Some images only appear once a chart is rendered (hard-coded in a
//! template, or assembled from several values). These are found by reading
//! the `image` field of every container in the rendered workloads.

use std::collections::HashSet;

use serde::Deserialize;
use serde_yaml::Value;
use tracing::debug;

use crate::image::Image;

/// Pod spec fields holding container lists.
const CONTAINER_FIELDS: &[&str] = &["containers", "initContainers", "ephemeralContainers"];

/// Extract every container image from a multi-document manifest stream,
/// deduplicated by reference in first-seen order.
///
/// Documents that fail to parse are skipped.
pub fn extract_images(rendered: &str) -> Vec<Image> {
  let mut seen = HashSet::new();
  let mut images = Vec::new();

  for document in serde_yaml::Deserializer::from_str(rendered) {
    let value = match Value::deserialize(document) {
      Ok(value) => value,
      Err(e) => {
        debug!(error = %e, "skipping unparseable rendered document");
        continue;
      }
    };

    let mut found = Vec::new();
    collect_container_images(&value, &mut found);
    for reference in found {
      match Image::parse(&reference) {
        Ok(image) => {
          if seen.insert(image.reference()) {
            images.push(image);
          }
        }
        Err(e) => debug!(image = %reference, error = %e, "ignoring rendered container image"),
      }
    }
  }

  images
}

fn collect_container_images(node: &Value, found: &mut Vec<String>) {
  match node {
    Value::Mapping(map) => {
      for (key, value) in map {
        let is_container_list = key.as_str().is_some_and(|k| CONTAINER_FIELDS.contains(&k));
        if let (true, Value::Sequence(containers)) = (is_container_list, value) {
          for container in containers {
            if let Some(image) = container.get("image").and_then(Value::as_str) {
              found.push(image.trim().to_string());
            }
          }
        }
        collect_container_images(value, found);
      }
    }
    Value::Sequence(items) => items.iter().for_each(|item| collect_container_images(item, found)),
    _ => {}
  }
}
