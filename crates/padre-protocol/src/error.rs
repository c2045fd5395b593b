//! Protocol error types

use thiserror::Error;

/// Errors that can occur while reading the control channel
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error on the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
