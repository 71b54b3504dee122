//! Error types for image verification

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for discovery, build and verification
#[derive(Error, Debug)]
pub enum Error {
    /// The working directory could not be listed
    #[error("failed to list image directories in {path}: {source}")]
    Discovery {
        /// Directory being listed
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Configuration is unusable
    #[error("invalid configuration: {reason}")]
    Config {
        /// What is wrong with the configuration
        reason: String,
    },

    /// A Docker API call failed
    #[error("docker operation '{operation}' failed: {source}")]
    Docker {
        /// The operation being performed
        operation: &'static str,
        /// Underlying Docker API error
        #[source]
        source: bollard::errors::Error,
    },

    /// The container has no host binding for an exposed port
    #[error("container {container_id} has no host binding for port {port}")]
    PortNotMapped {
        /// Container whose port was queried
        container_id: String,
        /// Container-side port
        port: u16,
    },

    /// A started container never began answering HTTP requests
    #[error("{image} did not answer on {url} within {timeout:?}")]
    NotReady {
        /// Image reference of the container
        image: String,
        /// URL that was polled
        url: String,
        /// Startup timeout that elapsed
        timeout: Duration,
    },

    /// The build container exited with a non-zero code
    #[error("build container exited with code {exit_code}")]
    BuildFailed {
        /// Exit code reported by the runtime
        exit_code: i64,
    },

    /// The build container did not exit in time
    #[error("build container did not exit within {timeout:?}")]
    BuildTimeout {
        /// Configured build timeout
        timeout: Duration,
    },

    /// The shared HTTP client could not be created
    #[error("failed to start HTTP client: {0}")]
    ClientStartup(#[source] reqwest::Error),

    /// An HTTP request failed before a response arrived
    #[error("request to {url} failed: {source}")]
    Request {
        /// Requested URL
        url: String,
        /// Underlying client error
        #[source]
        source: reqwest::Error,
    },

    /// The response did not meet expectations
    #[error(transparent)]
    Assertion(#[from] AssertionFailure),

    /// Verification work panicked; the payload message is kept
    #[error("verification panicked: {0}")]
    Panicked(String),

    /// Stopping or removing a container failed
    #[error("failed to clean up container {container_id}: {reason}")]
    Cleanup {
        /// Container that leaked
        container_id: String,
        /// Why cleanup failed
        reason: String,
    },

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a docker error for the named operation
    pub fn docker(operation: &'static str, source: bollard::errors::Error) -> Self {
        Self::Docker { operation, source }
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Whether this error aborts the whole run when raised during setup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Discovery { .. }
                | Error::Config { .. }
                | Error::BuildFailed { .. }
                | Error::BuildTimeout { .. }
                | Error::ClientStartup(_)
        )
    }
}

/// A response that did not match the expected status or content
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", describe(self))]
pub struct AssertionFailure {
    /// Expected HTTP status
    pub expected_status: u16,
    /// Actual HTTP status
    pub actual_status: u16,
    /// Markers that were required but absent from the body
    pub missing_markers: Vec<String>,
    /// Leading part of the response body, for diagnostics
    pub body_excerpt: String,
}

fn describe(failure: &AssertionFailure) -> String {
    let mut parts = Vec::new();
    if failure.expected_status != failure.actual_status {
        parts.push(format!(
            "expected status {} but was {}",
            failure.expected_status, failure.actual_status
        ));
    }
    if !failure.missing_markers.is_empty() {
        parts.push(format!(
            "expected body to contain {:?}; body was {:?}",
            failure.missing_markers, failure.body_excerpt
        ));
    }
    parts.join("; ")
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
