//! chartpatch-lib: discovery, tag resolution and reassembly for patched chart images
//!
//! This crate provides the pipeline behind `chartpatch`:
//! - `image`: image values, reference parsing and tag overrides
//! - `registry`: the registry capability and its OCI distribution client
//! - `discover`: values-tree walking, tag resolution, template extraction and tag strategies
//! - `inventory`: the human-edited inventory file and its append-only merge
//! - `matrix`: the deduplicated patch work queue
//! - `scan` / `patch`: per-image vulnerability reports and patch results
//! - `assemble`: wrapper charts and versioning
//! - `metadata`: CycloneDX SBOM and vulnerability predicate documents
//! - `catalog`: before/after vulnerability summary for the catalog renderer

pub mod assemble;
pub mod catalog;
pub mod config;
pub mod consts;
pub mod discover;
pub mod image;
pub mod inventory;
pub mod matrix;
pub mod metadata;
pub mod patch;
pub mod platform;
pub mod process;
pub mod registry;
pub mod scan;
pub mod util;
