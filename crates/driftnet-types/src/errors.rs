//! Error kinds shared across the control plane.

use thiserror::Error;

/// State-machine violations surfaced by the status algebra and the store.
#[derive(Error, Debug)]
pub enum StateError {
    /// A compare-and-set was attempted against a status the transition table
    /// does not allow. Callers log and skip the write.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// A compare-and-set matched zero documents: another writer won the race.
    /// The winning writer is authoritative; callers drop the operation.
    #[error("concurrent update lost on {entity} {id}")]
    ConcurrentUpdate { entity: &'static str, id: String },

    /// Unknown enum tag in a payload or a stored row. Rejected at decode.
    #[error("unknown status tag: {0}")]
    InvalidStatus(String),
}

/// Error-message substrings that mark a remote failure as permanent.
///
/// A permanent failure (DNS resolution, NXDOMAIN) freezes the site
/// immediately instead of burning through the retry budget.
pub const PERMANENT_FAILURE_MARKERS: &[&str] = &[
    "domain not resolvable",
    "no such host",
    "server misbehaving",
];

/// Classify a remote error message as permanent (freeze now) or transient
/// (count against the failure budget).
pub fn is_permanent_remote_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    PERMANENT_FAILURE_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_classification() {
        assert!(is_permanent_remote_error("domain not resolvable"));
        assert!(is_permanent_remote_error(
            "lookup x.example: no such host"
        ));
        assert!(is_permanent_remote_error(
            "dial tcp: lookup x.example on 8.8.8.8:53: server misbehaving"
        ));
        assert!(is_permanent_remote_error("Domain NOT Resolvable"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(!is_permanent_remote_error("connection refused"));
        assert!(!is_permanent_remote_error("i/o timeout"));
        assert!(!is_permanent_remote_error("HTTP 502 bad gateway"));
        assert!(!is_permanent_remote_error(""));
    }
}
