//! Error types for the emulab-cluster crate.

use std::io;
use thiserror::Error;

/// Main error type for cluster deployment operations
#[derive(Error, Debug)]
pub enum ClusterError {
    /// The caller asked for something contradictory (e.g. both role filters)
    #[error("Usage error: {0}")]
    UsageError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// A local or remote command exited with a non-zero status
    #[error("Command `{command}` failed with exit status {status}")]
    CommandFailed {
        /// Rendered command line
        command: String,
        /// Exit status, -1 when terminated by a signal
        status: i32,
    },

    /// A local program could not be started at all
    #[error("Failed to spawn `{program}`: {source}")]
    SpawnError {
        /// Program that failed to start
        program: String,
        /// Underlying error from the OS
        #[source]
        source: io::Error,
    },

    /// The topology manifest was well-formed XML but missing required data
    #[error("Manifest error: {0}")]
    ManifestError(String),

    /// The topology manifest could not be parsed as XML
    #[error("Manifest is not valid XML: {0}")]
    XmlError(#[from] roxmltree::Error),

    /// Host not found in the manifest
    #[error("Attempted host {0} not found in localconfig")]
    HostNotFound(String),

    /// A host does not satisfy a precondition for the selected mode
    #[error("Precondition failed on {host}: {reason}")]
    PreconditionFailed {
        /// Offending host
        host: String,
        /// What was missing
        reason: String,
    },

    /// Lifecycle operation called in the wrong state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// IO error occurred
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl ClusterError {
    /// Whether this error came from the transport layer (ssh, rsync, pdsh)
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, ClusterError::CommandFailed { .. } | ClusterError::SpawnError { .. })
    }
}

/// Type alias for Result with ClusterError
pub type ClusterResult<T> = Result<T, ClusterError>;
