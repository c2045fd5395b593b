//! Typed events produced from bootstrap lines

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a remote log line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    /// Lines with no severity marker
    #[default]
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(s)
    }
}

/// One classified line of the bootstrap protocol
///
/// Events are produced per line and consumed by the session supervisor in
/// stream order. They are never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapEvent {
    /// `Session ID/notebook token is '<hex>'`
    SessionIdAnnounced(String),

    /// `Selected ports: p1:..:pN:q1:..:qN`
    PortsAnnounced {
        /// Ports as seen by the session itself
        internal: Vec<u16>,
        /// Ports the user connects to
        external: Vec<u16>,
    },

    /// `Browse to URL: <url>`
    LaunchUrlAnnounced(String),

    /// `Container name: <name>`
    ContainerNameAnnounced(String),

    /// `... radiopadre is running on host <hostname>`
    RemoteHostnameAnnounced(String),

    /// The notebook server reported that it is up
    ReadySignal,

    /// Anything else
    PlainLogLine { text: String, severity: Severity },
}

impl BootstrapEvent {
    /// Short name of the event kind, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            BootstrapEvent::SessionIdAnnounced(_) => "session-id",
            BootstrapEvent::PortsAnnounced { .. } => "ports",
            BootstrapEvent::LaunchUrlAnnounced(_) => "launch-url",
            BootstrapEvent::ContainerNameAnnounced(_) => "container-name",
            BootstrapEvent::RemoteHostnameAnnounced(_) => "remote-host",
            BootstrapEvent::ReadySignal => "ready",
            BootstrapEvent::PlainLogLine { .. } => "log",
        }
    }
}
