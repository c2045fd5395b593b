//! The session value owned by the supervisor

use crate::error::SessionError;
use crate::types::{PortMap, SessionId, SessionState, TransportKind};

/// One interactive radiopadre run
///
/// Created when a launch is requested and mutated only by the supervisor as
/// bootstrap events arrive. Port lists, once known, always hold exactly
/// `num_ports` entries on each side.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: Option<SessionId>,
    pub transport: TransportKind,
    /// Container or pod name, once announced
    pub container_name: Option<String>,
    /// Host the notebook is running on, if announced
    pub remote_host: Option<String>,
    num_ports: usize,
    ports: Option<PortMap>,
    state: SessionState,
    launch_urls: Vec<String>,
}

impl Session {
    pub fn new(transport: TransportKind, num_ports: usize) -> Self {
        Self {
            session_id: None,
            transport,
            container_name: None,
            remote_host: None,
            num_ports,
            ports: None,
            state: SessionState::Connecting,
            launch_urls: Vec::new(),
        }
    }

    /// Attach a known session id
    pub fn with_session_id(mut self, id: SessionId) -> Self {
        self.session_id = Some(id);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn num_ports(&self) -> usize {
        self.num_ports
    }

    pub fn ports(&self) -> Option<&PortMap> {
        self.ports.as_ref()
    }

    /// Move to a new state, rejecting transitions the lifecycle forbids
    pub fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(from = %self.state, to = %next, "session state change");
        self.state = next;
        Ok(())
    }

    /// Record announced ports; returns whether they differ from the current set
    pub fn apply_ports(&mut self, internal: Vec<u16>, external: Vec<u16>) -> Result<bool, SessionError> {
        let map = PortMap::new(internal, external, self.num_ports)?;
        if self.ports.as_ref() == Some(&map) {
            return Ok(false);
        }
        self.ports = Some(map);
        Ok(true)
    }

    /// Record a known port map (e.g. from a session record)
    pub fn set_ports(&mut self, map: PortMap) -> Result<bool, SessionError> {
        self.apply_ports(map.internal().to_vec(), map.external().to_vec())
    }

    /// Accumulate a launch URL, repeats included
    pub fn add_launch_url(&mut self, url: impl Into<String>) {
        self.launch_urls.push(url.into());
    }

    /// URLs in discovery order
    pub fn launch_urls(&self) -> &[String] {
        &self.launch_urls
    }

    /// URLs most-recent first, the order they are shown to the user
    pub fn urls_for_display(&self) -> Vec<String> {
        self.launch_urls.iter().rev().cloned().collect()
    }
}
