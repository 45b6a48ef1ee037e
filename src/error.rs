//! Error types for resource creation and lifetime management.
//!
//! Only allocation-class failures are recoverable and surfaced as
//! [`ResourceError`]. Ownership-corruption, double-release and residency
//! pairing violations are programmer errors: by the time they are observed
//! the lifetime invariants have already been broken and continuing risks a
//! device-level use-after-free, so those paths panic instead.

use thiserror::Error;

/// Recoverable errors from the resource factory and native backend.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// The native creation call failed.
    #[error("allocation failed for '{name}' ({size} bytes): {reason}")]
    AllocationFailed {
        /// Debug name of the requested resource.
        name: String,
        /// Requested size in bytes.
        size: u64,
        /// Backend-specific failure description.
        reason: String,
    },
    /// An invalid parameter was provided to a creation call.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// The backend does not support the requested operation.
    #[error("backend '{backend}' does not support {operation}")]
    Unsupported {
        /// Backend name.
        backend: &'static str,
        /// The unsupported operation.
        operation: String,
    },
}

/// Convenience result alias used throughout the crate.
pub type ResourceResult<T> = Result<T, ResourceError>;
