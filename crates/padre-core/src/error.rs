//! Core error types for the radiopadre launcher

use padre_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::{Operation, SessionState, TransportKind};

/// Top-level error type
#[derive(Error, Debug)]
pub enum PadreError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PadreError {
    /// Suggested fix to print before exiting, if there is one
    pub fn remediation(&self) -> Option<String> {
        match self {
            PadreError::Transport(e) => e.remediation(),
            _ => None,
        }
    }
}

/// Errors reaching or driving a transport backend
#[derive(Error, Debug)]
pub enum TransportError {
    /// A required executable is not installed
    #[error("{binary} binary not found")]
    BinaryNotFound { binary: String },

    /// SSH (or cluster) authentication failed
    #[error("cannot connect to {host}: {detail}")]
    AuthenticationFailed { host: String, detail: String },

    /// The session process could not be started
    #[error("launch failed: {0}")]
    LaunchFailed(String),

    /// The API explicitly refused the request
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Connectivity dropped; the operation can be retried
    #[error("transient failure: {0}")]
    Transient(String),

    /// The backend does not implement this operation
    #[error("{operation} is not supported by the {transport} backend")]
    Unsupported {
        transport: TransportKind,
        operation: Operation,
    },

    /// I/O error talking to a helper process
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether retrying may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }

    /// Suggested fix for fatal errors
    pub fn remediation(&self) -> Option<String> {
        match self {
            TransportError::BinaryNotFound { binary } => Some(format!(
                "check that `{}` is installed and on your PATH, or pick another backend with --backend",
                binary
            )),
            TransportError::AuthenticationFailed { host, .. } => Some(format!(
                "check that `ssh {}` works without a password prompt (ssh-agent or key-based login)",
                host
            )),
            TransportError::LaunchFailed(_) => {
                Some("try re-running with --auto-init to reinstall the session environment".into())
            }
            TransportError::Rejected(_) => {
                Some("check your cluster credentials and namespace permissions".into())
            }
            TransportError::Unsupported { operation, .. } => Some(format!(
                "use a backend that supports {} (see --backend)",
                operation
            )),
            TransportError::Transient(_) | TransportError::Io(_) => None,
        }
    }
}

/// Session-related errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Port lists do not have N entries each
    #[error("expected {expected} port pairs, got {internal} internal and {external} external")]
    PortCountMismatch {
        expected: usize,
        internal: usize,
        external: usize,
    },

    /// State machine violation
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    /// Session not found
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Malformed on-disk session record
    #[error("invalid session record {path:?}: {reason}")]
    InvalidRecord { path: PathBuf, reason: String },
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_recoverable() {
        assert!(TransportError::Transient("timeout".into()).is_recoverable());
        assert!(!TransportError::Rejected("Forbidden".into()).is_recoverable());
        assert!(!TransportError::BinaryNotFound { binary: "kubectl".into() }.is_recoverable());
    }

    #[test]
    fn test_fatal_errors_have_remediation() {
        let err = PadreError::from(TransportError::BinaryNotFound {
            binary: "docker".into(),
        });
        assert!(err.remediation().unwrap().contains("`docker`"));
        assert!(TransportError::Transient("x".into()).remediation().is_none());
    }

    #[test]
    fn test_unsupported_message() {
        let err = TransportError::Unsupported {
            transport: TransportKind::Singularity,
            operation: Operation::KillSessions,
        };
        assert_eq!(
            err.to_string(),
            "kill sessions is not supported by the singularity backend"
        );
    }
}
