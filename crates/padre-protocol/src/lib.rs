//! padre-protocol: bootstrap protocol for radiopadre sessions
//!
//! A launched session announces its token, ports, URLs and readiness as
//! plain text lines on its stdout/stderr. This crate reassembles those
//! lines from raw byte chunks and classifies each one into a typed
//! [`BootstrapEvent`].

pub mod codec;
pub mod error;
pub mod event;
pub mod parser;

pub use codec::{LineCodec, MAX_LINE_LENGTH};
pub use error::ProtocolError;
pub use event::{BootstrapEvent, Severity};
pub use parser::{BootstrapParser, READY_MARKER};
