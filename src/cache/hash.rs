//! Input fingerprints for cache instance ids.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Fingerprint of a set of raw user inputs.
///
/// Hashes `name:value,` for every input in name order and keeps every
/// second hex digit, giving a 32-character id. Equal input sets always
/// produce the same id regardless of insertion order.
pub fn input_fingerprint(inputs: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (name, value) in inputs {
        hasher.update(format!("{name}:{value},").as_bytes());
    }
    format!("{:x}", hasher.finalize())
        .chars()
        .step_by(2)
        .collect()
}
