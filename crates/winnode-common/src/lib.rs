//! Common types for winnode: errors, bounded polling, telemetry and the
//! metadata keys written onto managed Node objects.

#![deny(missing_docs)]

pub mod error;
pub mod events;
pub mod metrics;
pub mod poll;
pub mod retry;
pub mod telemetry;

pub use error::Error;
pub use poll::{poll_bounded, PollConfig, PollError};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Annotation recording the controller version that last fully configured a node
pub const VERSION_ANNOTATION: &str = "winnode.dev/version";

/// Annotation recording the fingerprint of the trust bundle last verified on a node
pub const TRUST_BUNDLE_HASH_ANNOTATION: &str = "winnode.dev/trust-bundle-hash";

/// Label marking a node whose storage driver migration already completed
pub const STORAGE_MIGRATED_LABEL: &str = "winnode.dev/storage-driver-migrated";

/// Label an administrator sets to let an upgrade proceed regardless of volumes
pub const ALLOW_UPGRADE_LABEL: &str = "winnode.dev/allow-upgrade";

/// Label selecting Windows nodes
pub const WINDOWS_OS_LABEL_SELECTOR: &str = "kubernetes.io/os=windows";

/// Default namespace for the operator and its own objects
pub const DEFAULT_OPERATOR_NAMESPACE: &str = "winnode-system";

/// Version of the running controller, compared against [`VERSION_ANNOTATION`]
pub fn version() -> &'static str {
    option_env!("WINNODE_BUILD_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"))
}

/// Compact SHA-256 fingerprint (first 8 bytes as 16 hex chars)
///
/// Stable across processes, suitable for annotation values.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_hash_is_stable_and_compact() {
        let a = deterministic_hash("bundle");
        assert_eq!(a, deterministic_hash("bundle"));
        assert_ne!(a, deterministic_hash("bundle2"));
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
