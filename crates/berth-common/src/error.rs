//! Unified error types for the berth workspace.
//!
//! Manifest and policy errors are caller-correctable and surfaced verbatim.
//! `Internal` is reserved for operator misconfiguration of the host, and
//! must never be used for a problem with the caller's request.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum BerthError {
    /// The caller-supplied manifest cannot be used as given.
    #[error("invalid manifest: {message}")]
    InvalidManifest {
        /// Description of the structural problem.
        message: String,
    },

    /// The manifest is well formed but forbidden by host policy.
    #[error("policy violation: {message}")]
    PolicyViolation {
        /// Description of the violated policy.
        message: String,
    },

    /// A volume source resolves outside of its sandbox root.
    #[error("the provided source path is escaping the base volume path: {source_path}")]
    PathEscape {
        /// Source path as declared in the manifest.
        source_path: String,
    },

    /// A container or volume name does not match the identifier grammar.
    #[error("invalid characters present in name: {name:?}")]
    InvalidName {
        /// Offending name.
        name: String,
    },

    /// A host resource (cgroup, volume directory) could not be acquired.
    #[error("{resource} unavailable: {source}")]
    ResourceUnavailable {
        /// Human-readable description of the resource.
        resource: String,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// One of the ordered bootstrap steps failed.
    #[error("bootstrap step {step} failed: {message}")]
    BootstrapStepFailed {
        /// Name of the step that failed.
        step: String,
        /// The step's own error message.
        message: String,
    },

    /// The host configuration is inconsistent.
    #[error("internal error: {message}")]
    Internal {
        /// Description for the operator.
        message: String,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// An image reference uses a scheme no puller handles.
    #[error("{scheme:?} scheme not supported")]
    UnsupportedScheme {
        /// Scheme portion of the reference.
        scheme: String,
    },

    /// An enter session could not be established.
    #[error("enter handshake failed: {message}")]
    Handshake {
        /// Reason the handshake failed.
        message: String,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl BerthError {
    /// Builds an [`BerthError::Io`] for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns whether the caller can correct this error by changing the request.
    #[must_use]
    pub const fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidManifest { .. }
                | Self::PolicyViolation { .. }
                | Self::PathEscape { .. }
                | Self::InvalidName { .. }
                | Self::UnsupportedScheme { .. }
        )
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, BerthError>;
