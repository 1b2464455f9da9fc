//! Shared utilities.
//!
//! Common utilities used across the crate: hashing, file naming and atomic writes.

pub mod fs;
pub mod hash;

#[cfg(test)]
pub mod testutil;
