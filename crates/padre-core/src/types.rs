//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{SessionError, TransportError};

/// Session identifier, doubling as the notebook token
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a session ID from an announced token
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random token (32 lowercase hex digits)
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Get the raw token
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Mechanism used to launch and reach a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Local virtualenv subprocess
    Venv,
    Docker,
    Singularity,
    /// Pod on a Kubernetes cluster
    #[serde(rename = "k8s", alias = "kubernetes")]
    Kubernetes,
    /// Remote host reached over SSH
    Ssh,
}

impl TransportKind {
    /// All transport kinds in default preference order
    pub const ALL: [TransportKind; 5] = [
        TransportKind::Docker,
        TransportKind::Singularity,
        TransportKind::Venv,
        TransportKind::Kubernetes,
        TransportKind::Ssh,
    ];

    /// Short name used on the command line and in config files
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Venv => "venv",
            TransportKind::Docker => "docker",
            TransportKind::Singularity => "singularity",
            TransportKind::Kubernetes => "k8s",
            TransportKind::Ssh => "ssh",
        }
    }

    /// Whether sessions of this kind run in a container or pod
    pub fn is_containerized(&self) -> bool {
        matches!(
            self,
            TransportKind::Docker | TransportKind::Singularity | TransportKind::Kubernetes
        )
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "venv" => Ok(TransportKind::Venv),
            "docker" => Ok(TransportKind::Docker),
            "singularity" => Ok(TransportKind::Singularity),
            "k8s" | "kubernetes" => Ok(TransportKind::Kubernetes),
            "ssh" => Ok(TransportKind::Ssh),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// Optional backend operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// Leave the session running and return
    Detach,
    ListSessions,
    IdentifySession,
    KillSessions,
    /// Reattach to a running session
    Resume,
    /// Kill stale sessions for the current directory
    GrimReaper,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Detach => "detach",
            Operation::ListSessions => "list sessions",
            Operation::IdentifySession => "identify session",
            Operation::KillSessions => "kill sessions",
            Operation::Resume => "resume",
            Operation::GrimReaper => "grim reaper",
        };
        f.write_str(s)
    }
}

/// Capability set of a transport kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub kind: TransportKind,
    pub detach: bool,
    pub list_sessions: bool,
    pub identify_session: bool,
    pub kill_sessions: bool,
    pub resume: bool,
    pub grim_reaper: bool,
}

impl Capabilities {
    /// Capabilities of a transport kind
    pub fn for_kind(kind: TransportKind) -> Self {
        let none = Self {
            kind,
            detach: false,
            list_sessions: false,
            identify_session: false,
            kill_sessions: false,
            resume: false,
            grim_reaper: false,
        };
        match kind {
            TransportKind::Docker => Self {
                detach: true,
                list_sessions: true,
                identify_session: true,
                kill_sessions: true,
                resume: true,
                grim_reaper: true,
                ..none
            },
            // Singularity instances are not labelled, so listing is always empty
            TransportKind::Singularity => Self {
                list_sessions: true,
                ..none
            },
            TransportKind::Ssh => Self {
                detach: true,
                ..none
            },
            TransportKind::Venv | TransportKind::Kubernetes => none,
        }
    }

    /// Whether an operation is supported
    pub fn supports(&self, op: Operation) -> bool {
        match op {
            Operation::Detach => self.detach,
            Operation::ListSessions => self.list_sessions,
            Operation::IdentifySession => self.identify_session,
            Operation::KillSessions => self.kill_sessions,
            Operation::Resume => self.resume,
            Operation::GrimReaper => self.grim_reaper,
        }
    }

    /// Return a typed `Unsupported` error for operations this transport lacks
    pub fn require(&self, op: Operation) -> Result<(), TransportError> {
        if self.supports(op) {
            Ok(())
        } else {
            Err(TransportError::Unsupported {
                transport: self.kind,
                operation: op,
            })
        }
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Provisioning,
    Ready,
    Interactive,
    Terminating,
    Terminated,
}

impl SessionState {
    /// Whether moving to `next` is allowed
    ///
    /// The machine is monotonic except that `Connecting` and `Provisioning`
    /// may alternate on transient reconnects. Every live state may move to
    /// `Terminating`.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Connecting, Provisioning) | (Provisioning, Connecting) => true,
            (Provisioning, Ready) | (Ready, Interactive) => true,
            (Terminating, Terminated) => true,
            (Terminating, Terminating) | (Terminated, _) => false,
            (_, Terminating) => true,
            _ => false,
        }
    }

    /// Whether the session has finished
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Terminated)
    }

    /// Whether the notebook server has come up
    pub fn is_up(&self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Interactive)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Provisioning => "provisioning",
            SessionState::Ready => "ready",
            SessionState::Interactive => "interactive",
            SessionState::Terminating => "terminating",
            SessionState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Named port slots, in announcement order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSlot {
    Notebook = 0,
    /// JS9 helper
    Helper = 1,
    Http = 2,
    Carta = 3,
    CartaWs = 4,
}

/// Default number of port slots
pub const DEFAULT_NUM_PORTS: usize = 5;

/// Internal/external port lists of equal, fixed length
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMap {
    internal: Vec<u16>,
    external: Vec<u16>,
}

impl PortMap {
    /// Build a port map, checking that both halves have `num_ports` entries
    pub fn new(internal: Vec<u16>, external: Vec<u16>, num_ports: usize) -> Result<Self, SessionError> {
        if internal.len() != num_ports || external.len() != num_ports {
            return Err(SessionError::PortCountMismatch {
                expected: num_ports,
                internal: internal.len(),
                external: external.len(),
            });
        }
        Ok(Self { internal, external })
    }

    /// Port map where both sides use the same ports
    pub fn identity(ports: Vec<u16>) -> Self {
        Self {
            internal: ports.clone(),
            external: ports,
        }
    }

    pub fn internal(&self) -> &[u16] {
        &self.internal
    }

    pub fn external(&self) -> &[u16] {
        &self.external
    }

    pub fn len(&self) -> usize {
        self.internal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.internal.is_empty()
    }

    /// `(internal, external)` pairs
    pub fn pairs(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.internal.iter().copied().zip(self.external.iter().copied())
    }

    /// External port of a named slot
    pub fn external_port(&self, slot: PortSlot) -> Option<u16> {
        self.external.get(slot as usize).copied()
    }

    /// Whether every pair maps a port onto itself
    pub fn is_identity(&self) -> bool {
        self.internal == self.external
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_generate() {
        let id = SessionId::generate();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, SessionId::generate());
    }

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("k8s".parse::<TransportKind>().unwrap(), TransportKind::Kubernetes);
        assert_eq!("Kubernetes".parse::<TransportKind>().unwrap(), TransportKind::Kubernetes);
        assert_eq!("docker".parse::<TransportKind>().unwrap(), TransportKind::Docker);
        assert!("podman".parse::<TransportKind>().is_err());
        assert_eq!(TransportKind::Kubernetes.to_string(), "k8s");
    }

    #[test]
    fn test_capabilities_require() {
        let caps = Capabilities::for_kind(TransportKind::Singularity);
        assert!(caps.supports(Operation::ListSessions));
        let err = caps.require(Operation::KillSessions).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Unsupported {
                transport: TransportKind::Singularity,
                operation: Operation::KillSessions
            }
        ));
        assert!(Capabilities::for_kind(TransportKind::Docker)
            .require(Operation::Resume)
            .is_ok());
    }

    #[test]
    fn test_state_transitions() {
        use SessionState::*;
        assert!(Connecting.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(Connecting));
        assert!(Provisioning.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Interactive));
        assert!(Interactive.can_transition_to(Terminating));
        assert!(Connecting.can_transition_to(Terminating));
        assert!(Terminating.can_transition_to(Terminated));

        assert!(!Connecting.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Provisioning));
        assert!(!Interactive.can_transition_to(Ready));
        assert!(!Terminated.can_transition_to(Terminating));
        assert!(!Terminating.can_transition_to(Interactive));
    }

    #[test]
    fn test_port_map_validation() {
        assert!(PortMap::new(vec![1, 2], vec![3, 4], 2).is_ok());
        let err = PortMap::new(vec![1, 2], vec![3], 2).unwrap_err();
        assert!(matches!(err, SessionError::PortCountMismatch { expected: 2, .. }));
    }

    #[test]
    fn test_port_map_slots() {
        let map = PortMap::new(vec![1, 2, 3, 4, 5], vec![11, 12, 13, 14, 15], 5).unwrap();
        assert_eq!(map.external_port(PortSlot::Helper), Some(12));
        assert_eq!(map.pairs().collect::<Vec<_>>()[0], (1, 11));
        assert!(!map.is_identity());
        assert!(PortMap::identity(vec![9000, 9001]).is_identity());
    }
}
