//! padre-core: core abstractions and configuration for the radiopadre launcher
//!
//! This crate provides the session model, the error taxonomy, client
//! configuration and the on-disk session records shared by the
//! orchestrator and the CLI.

pub mod config;
pub mod error;
pub mod process;
pub mod recent;
pub mod record;
pub mod session;
pub mod types;

pub use error::{PadreError, SessionError, TransportError};
pub use session::Session;
pub use types::{Capabilities, Operation, PortMap, PortSlot, SessionId, SessionState, TransportKind};
