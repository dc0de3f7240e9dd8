// ABOUTME: Stable dependency fingerprinting for sandbox pool lookup
// ABOUTME: Hashes the sorted (package, version-range) pairs a tool declares

use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Compute the stable digest identifying a tool's dependency set.
///
/// Pairs are hashed in package-name order, so identical maps produce the
/// identical fingerprint regardless of declaration order. The empty map has
/// its own well-defined fingerprint shared by all dependency-free tools.
pub fn dependency_fingerprint(dependencies: &HashMap<String, String>) -> String {
    let mut pairs: Vec<_> = dependencies.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    for (name, range) in pairs {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(range.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
