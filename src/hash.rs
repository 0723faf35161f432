//! Stable 64-bit identity hashes for config nodes.
//!
//! Matchers, predicates and metrics are identified across restarts and
//! config updates by a hash of their serialized form. The hash must be
//! stable across processes, so it is derived from an md5 digest of the
//! node's canonical JSON serialization rather than from `std::hash`.

use serde::Serialize;
use tracing::warn;

/// Stable 64-bit hash of a serializable config node.
///
/// Returns 0 when the node fails to serialize, which only happens for
/// malformed hand-built values; two such nodes then compare equal, which is
/// the conservative outcome for state preservation.
pub fn stable_hash<T: Serialize>(node: &T) -> u64 {
    let bytes = match serde_json::to_vec(node) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Failed to serialize config node for hashing");
            return 0;
        }
    };
    let digest = md5::compute(&bytes);
    u64::from_le_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

/// Combined hash of a metric and its optional activation, the unit of
/// cross-restart identity for producer state.
pub fn metric_hash<M: Serialize, A: Serialize>(metric: &M, activation: Option<&A>) -> u64 {
    let base = stable_hash(metric);
    match activation {
        Some(activation) => base ^ stable_hash(activation).rotate_left(1),
        None => base,
    }
}
