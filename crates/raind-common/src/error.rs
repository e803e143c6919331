//! Common error types for the raind platform.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`RaindError`].
pub type RaindResult<T> = Result<T, RaindError>;

/// Coarse classification of an error, used by callers that need to branch
/// (HTTP status mapping, name-or-id fallback, retry decisions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input. Never retried.
    Validation,
    /// Name already in use, dependency cycle, illegal state transition.
    Conflict,
    /// Unknown id or name.
    NotFound,
    /// No free resource (address, name) left.
    Exhausted,
    /// A host command or file operation failed.
    HostMutation,
    /// An operation exceeded its deadline.
    Timeout,
    /// Anything else.
    Internal,
}

/// Common errors across the raind crates.
#[derive(Error, Diagnostic, Debug)]
pub enum RaindError {
    /// An entity was not found.
    #[error("{kind}: {id} not found")]
    #[diagnostic(code(raind::not_found))]
    NotFound {
        /// Entity kind (`container`, `pod`, `bottle`, ...).
        kind: &'static str,
        /// The identifier or name that was looked up.
        id: String,
    },

    /// A unique name is already taken.
    #[error("{kind} name {name} is already used")]
    #[diagnostic(code(raind::already_used), help("Pick another name or delete the existing entry"))]
    AlreadyUsed {
        /// Entity kind.
        kind: &'static str,
        /// The conflicting name.
        name: String,
    },

    /// Malformed input.
    #[error("invalid {what}: {message}")]
    #[diagnostic(code(raind::validation))]
    Validation {
        /// What was being validated (`image reference`, `spiffe id`, ...).
        what: &'static str,
        /// Detail.
        message: String,
    },

    /// An operation is not permitted in the current state.
    #[error("{kind} {id} cannot {operation} in state {state}")]
    #[diagnostic(code(raind::invalid_state))]
    InvalidState {
        /// Entity kind.
        kind: &'static str,
        /// Entity id.
        id: String,
        /// Current state.
        state: String,
        /// Rejected operation.
        operation: &'static str,
    },

    /// A structural conflict (dependency cycle and the like).
    #[error("conflict: {message}")]
    #[diagnostic(code(raind::conflict))]
    Conflict {
        /// Detail.
        message: String,
    },

    /// A pool or namespace of names ran out.
    #[error("resource exhausted: {message}")]
    #[diagnostic(code(raind::exhausted))]
    Exhausted {
        /// Detail.
        message: String,
    },

    /// An external command exited unsuccessfully.
    #[error("{program} {args} failed: {output}")]
    #[diagnostic(code(raind::command))]
    Command {
        /// Program name.
        program: String,
        /// Space-joined arguments.
        args: String,
        /// Combined stdout and stderr.
        output: String,
    },

    /// An operation exceeded its deadline.
    #[error("timed out: {operation}")]
    #[diagnostic(code(raind::timeout))]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// A downloaded blob did not hash to its advertised digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    #[diagnostic(code(raind::image::digest_mismatch))]
    DigestMismatch {
        /// Advertised digest.
        expected: String,
        /// Computed digest.
        actual: String,
    },

    /// Registry protocol error.
    #[error("registry error: {message}")]
    #[diagnostic(code(raind::image::registry))]
    Registry {
        /// Detail.
        message: String,
    },

    /// Certificate issuance error.
    #[error("pki error: {message}")]
    #[diagnostic(code(raind::pki))]
    Pki {
        /// Detail.
        message: String,
    },

    /// A rollback step failed after an earlier failure.
    #[error("rollback failed: {message} (original error: {original})")]
    #[diagnostic(
        code(raind::rollback),
        help("Host state may be partially applied; inspect the container directory and packet filter")
    )]
    RollbackFailed {
        /// Rollback failure detail.
        message: String,
        /// Display text of the error that triggered the rollback.
        original: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(raind::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    #[diagnostic(code(raind::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("configuration error: {message}")]
    #[diagnostic(code(raind::config))]
    Config {
        /// Detail.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("internal error: {message}")]
    #[diagnostic(code(raind::internal))]
    Internal {
        /// Detail.
        message: String,
    },
}

impl RaindError {
    /// Shorthand for [`RaindError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Shorthand for [`RaindError::Validation`].
    pub fn validation(what: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            what,
            message: message.into(),
        }
    }

    /// Shorthand for [`RaindError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Validation { .. } | Self::Serialization(_) => ErrorKind::Validation,
            Self::AlreadyUsed { .. } | Self::InvalidState { .. } | Self::Conflict { .. } => {
                ErrorKind::Conflict
            }
            Self::Exhausted { .. } => ErrorKind::Exhausted,
            Self::Command { .. } | Self::Io(_) | Self::RollbackFailed { .. } => {
                ErrorKind::HostMutation
            }
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::DigestMismatch { .. }
            | Self::Registry { .. }
            | Self::Pki { .. }
            | Self::Config { .. }
            | Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns true for [`ErrorKind::NotFound`].
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound)
    }
}

impl From<serde_json::Error> for RaindError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = RaindError::not_found("container", "ghost-a");
        assert_eq!(err.to_string(), "container: ghost-a not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn already_used_display() {
        let err = RaindError::AlreadyUsed {
            kind: "container",
            name: "web".to_string(),
        };
        assert!(err.to_string().contains("already used"));
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RaindError = io_err.into();
        assert!(matches!(err, RaindError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::HostMutation);
    }

    #[test]
    fn rollback_keeps_original_text() {
        let err = RaindError::RollbackFailed {
            message: "remove cgroup".to_string(),
            original: "droplet create failed".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("remove cgroup"));
        assert!(text.contains("droplet create failed"));
    }
}
