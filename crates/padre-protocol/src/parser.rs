//! Line classifier for the bootstrap protocol
//!
//! Each line is matched against an ordered table of rules; the first rule
//! that produces an event wins. Lines that match nothing (including lines
//! whose payload is malformed, such as a port list of the wrong length)
//! become [`BootstrapEvent::PlainLogLine`] with a severity taken from the
//! usual logging markers.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::event::{BootstrapEvent, Severity};

/// Substring the notebook server prints once it accepts connections.
///
/// Matched case-sensitively as a raw substring to stay compatible with the
/// remote-side emitter.
pub const READY_MARKER: &str = "jupyter notebook server is running";

/// Prefix OpenSSH prints on stderr when a multiplexed channel closes
const SSH_MUX_NOISE: &str = "Shared connection to";

static SESSION_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Session ID/notebook token is '([0-9a-f]+)'").unwrap());

static PORTS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Selected ports: (\d+(?::\d+)*)\s*$").unwrap());

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Browse to URL: ([^\s\x1b]+)").unwrap());

static CONTAINER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Container name: ([^\s\x1b]+)").unwrap());

static HOSTNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"radiopadre is running on host ([^\s\x1b]+)").unwrap());

type Matcher = fn(&BootstrapParser, &str) -> Option<BootstrapEvent>;

/// Rules in priority order
const RULES: &[(&str, Matcher)] = &[
    ("session-id", BootstrapParser::match_session_id),
    ("ports", BootstrapParser::match_ports),
    ("launch-url", BootstrapParser::match_url),
    ("container-name", BootstrapParser::match_container),
    ("remote-host", BootstrapParser::match_hostname),
    ("ready", BootstrapParser::match_ready),
];

/// Stateless per-line classifier
///
/// The only configuration is the number of port slots N, which is fixed for
/// the lifetime of a session.
#[derive(Debug, Clone, Copy)]
pub struct BootstrapParser {
    num_ports: usize,
}

impl BootstrapParser {
    /// Create a parser expecting `num_ports` internal/external port pairs
    pub fn new(num_ports: usize) -> Self {
        Self { num_ports }
    }

    /// Number of port pairs a `Selected ports` line must carry
    pub fn num_ports(&self) -> usize {
        self.num_ports
    }

    /// Classify a single line (without its terminator)
    pub fn classify(&self, line: &str) -> BootstrapEvent {
        for (name, rule) in RULES {
            if let Some(event) = rule(self, line) {
                tracing::trace!(rule = *name, "bootstrap line matched");
                return event;
            }
        }
        BootstrapEvent::PlainLogLine {
            text: line.to_string(),
            severity: severity_of(line),
        }
    }

    fn match_session_id(&self, line: &str) -> Option<BootstrapEvent> {
        let caps = SESSION_ID_RE.captures(line)?;
        Some(BootstrapEvent::SessionIdAnnounced(caps[1].to_string()))
    }

    fn match_ports(&self, line: &str) -> Option<BootstrapEvent> {
        let caps = PORTS_RE.captures(line)?;
        let ports: Vec<u16> = caps[1]
            .split(':')
            .map(|p| p.parse::<u16>())
            .collect::<Result<_, _>>()
            .ok()?;

        if self.num_ports == 0 || ports.len() != 2 * self.num_ports {
            tracing::debug!(
                expected = 2 * self.num_ports,
                got = ports.len(),
                "port announcement with wrong count"
            );
            return None;
        }

        let (internal, external) = ports.split_at(self.num_ports);
        Some(BootstrapEvent::PortsAnnounced {
            internal: internal.to_vec(),
            external: external.to_vec(),
        })
    }

    fn match_url(&self, line: &str) -> Option<BootstrapEvent> {
        let caps = URL_RE.captures(line)?;
        Some(BootstrapEvent::LaunchUrlAnnounced(caps[1].to_string()))
    }

    fn match_container(&self, line: &str) -> Option<BootstrapEvent> {
        let caps = CONTAINER_RE.captures(line)?;
        Some(BootstrapEvent::ContainerNameAnnounced(caps[1].to_string()))
    }

    fn match_hostname(&self, line: &str) -> Option<BootstrapEvent> {
        let caps = HOSTNAME_RE.captures(line)?;
        Some(BootstrapEvent::RemoteHostnameAnnounced(caps[1].to_string()))
    }

    fn match_ready(&self, line: &str) -> Option<BootstrapEvent> {
        line.contains(READY_MARKER).then_some(BootstrapEvent::ReadySignal)
    }
}

/// Severity of an otherwise unmatched line
pub fn severity_of(line: &str) -> Severity {
    if line.contains(": ERROR: ") {
        Severity::Error
    } else if line.contains(": WARNING: ") {
        Severity::Warning
    } else if line.contains(": DEBUG:") || line.starts_with(SSH_MUX_NOISE) {
        Severity::Debug
    } else {
        Severity::Info
    }
}
