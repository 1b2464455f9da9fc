//! Hashing helpers.

use sha2::{Digest, Sha256};

/// Hash arbitrary bytes.
///
/// Returns the full 64-character lowercase SHA256 hex digest.
pub fn hash_bytes(data: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(data);
  hex::encode(hasher.finalize())
}

/// Derive a stable `urn:uuid:` identifier from arbitrary seed text.
///
/// The same seed always yields the same URN, which keeps regenerated
/// metadata documents byte-stable across runs.
pub fn stable_urn(seed: &str) -> String {
  let h = hash_bytes(seed.as_bytes());
  format!(
    "urn:uuid:{}-{}-{}-{}-{}",
    &h[0..8],
    &h[8..12],
    &h[12..16],
    &h[16..20],
    &h[20..32]
  )
}
