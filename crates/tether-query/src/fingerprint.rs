//! Cache key derivation.
//!
//! Keys are namespaced by backend and by materializer shape, so two
//! materializers that read the same statement into different types never
//! share an entry. The scope names the database the statement runs against;
//! data sources sharing one cache only share entries when their scopes match.

use sha2::{Digest, Sha256};

/// Build a deterministic cache key: `{backend}:{shape}:{sha256 of scope, operation and parameters}`
pub fn fingerprint(
    backend: &str,
    scope: &str,
    shape: &str,
    operation: &str,
    parameters: &[serde_json::Value],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    hasher.update([0u8]);
    hasher.update(operation.as_bytes());
    for parameter in parameters {
        // Separator keeps ("ab", []) apart from ("a", ["b"])
        hasher.update([0u8]);
        hasher.update(parameter.to_string().as_bytes());
    }
    format!("{}:{}:{}", backend, shape, hex::encode(hasher.finalize()))
}
