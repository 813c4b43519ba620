//! Error taxonomy for the harness.
//!
//! Assertion predicates use `anyhow` so arbitrary context can be attached;
//! everything the harness itself produces is one of these variants.

use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The caller provided an invalid configuration. Always synchronous,
    /// never retried.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// A referenced resource is absent. Negative assertions map this to
    /// success.
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// The manifest CLI rejected an apply. The stderr is preserved verbatim
    /// so tests can assert on admission webhook rejection text.
    #[error("apply failed (exit code {code}): {stderr}")]
    Apply { code: i32, stderr: String },

    #[error("delete failed (exit code {code}): {stderr}")]
    Delete { code: i32, stderr: String },

    /// An in-cluster exec invocation failed.
    #[error("exec failed (exit code {code}): {stderr}")]
    Exec {
        code: i32,
        stdout: String,
        stderr: String,
    },

    /// An eventually/consistently predicate did not converge.
    #[error("timed out after {elapsed:?}: {last}")]
    Timeout { elapsed: Duration, last: String },

    /// An admin API response could not be parsed. The raw payload is kept
    /// for diagnostics.
    #[error("failed to decode response: {message}")]
    Decode { message: String, raw: Vec<u8> },

    /// One or more undo operations failed while unwinding. The root cause
    /// remains the first forward failure.
    #[error("operation {root} failed; {} undo error(s) during unwind", unwind.len())]
    Unwind {
        root: Box<Error>,
        unwind: Vec<Error>,
    },

    #[error("operation {operation} failed: {source}")]
    Operation {
        operation: String,
        #[source]
        source: Box<Error>,
    },

    #[error("assertion failed: {0}")]
    Assertion(#[source] anyhow::Error),

    #[error("gateway installation failed: {0}")]
    InstallFailed(String),

    #[error("gateway uninstallation failed: {0}")]
    UninstallFailed(String),

    /// The installation never reached a consistent state within the
    /// sampling window.
    #[error("installation did not reach a consistent state: {0}")]
    NotConsistent(String),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// The first forward failure, unwrapping unwind/operation wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Unwind { root, .. } => root.root_cause(),
            Error::Operation { source, .. } => source.root_cause(),
            _ => self,
        }
    }
}
