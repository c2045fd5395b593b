//! Port forwarding
//!
//! Once a session announces its ports, the [`PortForwardManager`] makes
//! each external port reachable locally. How depends on the transport: the
//! SSH master connection forwards all pairs in one control request,
//! Kubernetes needs one `kubectl port-forward` process per port, and local
//! or published container ports need nothing at all.

use std::sync::Arc;

use async_trait::async_trait;
use padre_core::{PortMap, TransportError};

use crate::backend::{PodApi, SshTransport};
use crate::registry::{ChildId, ChildRegistry, ChildRole, ChildStatus, KILL_WAIT};

/// What keeps a forwarded port open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelHandle {
    /// Port is reachable as is
    Direct,
    /// Forward held by the SSH master connection
    SshMux,
    /// A dedicated forwarding process
    Process(ChildId),
}

/// One forwarded port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedPort {
    pub local_port: u16,
    pub remote_port: u16,
    pub handle: TunnelHandle,
}

/// Mechanism that opens and closes tunnels
#[async_trait]
pub trait Forwarder: Send {
    fn name(&self) -> &'static str;

    /// Open one tunnel per `(internal, external)` pair
    async fn open(
        &mut self,
        ports: &PortMap,
        target_host: &str,
        registry: &mut ChildRegistry,
    ) -> Result<Vec<ForwardedPort>, TransportError>;

    /// Close tunnels previously returned by `open`
    async fn close(
        &mut self,
        tunnels: Vec<ForwardedPort>,
        target_host: &str,
        registry: &mut ChildRegistry,
    ) -> Result<(), TransportError>;
}

/// Local and published ports need no tunnel
#[derive(Debug, Default)]
pub struct DirectForwarder;

#[async_trait]
impl Forwarder for DirectForwarder {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn open(
        &mut self,
        ports: &PortMap,
        _target_host: &str,
        _registry: &mut ChildRegistry,
    ) -> Result<Vec<ForwardedPort>, TransportError> {
        Ok(ports
            .pairs()
            .map(|(internal, external)| ForwardedPort {
                local_port: external,
                remote_port: internal,
                handle: TunnelHandle::Direct,
            })
            .collect())
    }

    async fn close(
        &mut self,
        _tunnels: Vec<ForwardedPort>,
        _target_host: &str,
        _registry: &mut ChildRegistry,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Forwards through the already open SSH master with `-O forward`
pub struct SshMuxForwarder {
    transport: SshTransport,
}

impl SshMuxForwarder {
    pub fn new(transport: SshTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Forwarder for SshMuxForwarder {
    fn name(&self) -> &'static str {
        "ssh mux"
    }

    async fn open(
        &mut self,
        ports: &PortMap,
        target_host: &str,
        _registry: &mut ChildRegistry,
    ) -> Result<Vec<ForwardedPort>, TransportError> {
        let pairs: Vec<(u16, u16)> = ports.pairs().collect();
        tracing::debug!("sending forward request to ssh mux process");
        self.transport.control("forward", &pairs, target_host).await?;
        Ok(pairs
            .into_iter()
            .map(|(internal, external)| ForwardedPort {
                local_port: external,
                remote_port: internal,
                handle: TunnelHandle::SshMux,
            })
            .collect())
    }

    async fn close(
        &mut self,
        tunnels: Vec<ForwardedPort>,
        target_host: &str,
        _registry: &mut ChildRegistry,
    ) -> Result<(), TransportError> {
        let pairs: Vec<(u16, u16)> = tunnels
            .iter()
            .map(|t| (t.remote_port, t.local_port))
            .collect();
        if pairs.is_empty() {
            return Ok(());
        }
        self.transport.control("cancel", &pairs, target_host).await
    }
}

/// One `kubectl port-forward` process per port
pub struct KubectlForwarder {
    api: Arc<dyn PodApi>,
    pod: String,
}

impl KubectlForwarder {
    pub fn new(api: Arc<dyn PodApi>, pod: impl Into<String>) -> Self {
        Self {
            api,
            pod: pod.into(),
        }
    }
}

#[async_trait]
impl Forwarder for KubectlForwarder {
    fn name(&self) -> &'static str {
        "kubectl port-forward"
    }

    async fn open(
        &mut self,
        ports: &PortMap,
        _target_host: &str,
        registry: &mut ChildRegistry,
    ) -> Result<Vec<ForwardedPort>, TransportError> {
        let mut tunnels = Vec::new();
        for (internal, external) in ports.pairs() {
            let mut cmd = self.api.port_forward_command(&self.pod, external, internal);
            let label = format!("kubectl port-forward {}", external);
            match registry.spawn_quiet(label, ChildRole::Forwarder, &mut cmd) {
                Ok(id) => tunnels.push(ForwardedPort {
                    local_port: external,
                    remote_port: internal,
                    handle: TunnelHandle::Process(id),
                }),
                Err(e) => {
                    // don't leave half a set behind
                    for t in tunnels {
                        if let TunnelHandle::Process(id) = t.handle {
                            registry.terminate(id, KILL_WAIT).await;
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(tunnels)
    }

    async fn close(
        &mut self,
        tunnels: Vec<ForwardedPort>,
        _target_host: &str,
        registry: &mut ChildRegistry,
    ) -> Result<(), TransportError> {
        for t in tunnels {
            if let TunnelHandle::Process(id) = t.handle {
                registry.terminate(id, KILL_WAIT).await;
            }
        }
        Ok(())
    }
}

/// Keeps the set of forwarded ports in line with the latest announcement
pub struct PortForwardManager {
    forwarder: Box<dyn Forwarder>,
    active: Option<(PortMap, String)>,
    tunnels: Vec<ForwardedPort>,
}

impl PortForwardManager {
    pub fn new(forwarder: Box<dyn Forwarder>) -> Self {
        Self {
            forwarder,
            active: None,
            tunnels: Vec::new(),
        }
    }

    /// Forward every pair of `ports` to `target_host`
    ///
    /// Calling this again with the same arguments opens nothing new unless a
    /// forwarding process has died; with different arguments the previous set
    /// is torn down first. Returns the number of tunnels opened.
    pub async fn establish(
        &mut self,
        ports: &PortMap,
        target_host: &str,
        registry: &mut ChildRegistry,
    ) -> Result<usize, TransportError> {
        if let Some((active_ports, active_host)) = &self.active {
            if active_ports == ports && active_host == target_host {
                let dead = self.dead_tunnels(registry);
                if dead == 0 {
                    tracing::debug!("port forwarding already in place");
                    return Ok(0);
                }
                tracing::warn!("{} port forward(s) have died, re-establishing", dead);
            } else {
                tracing::info!("port assignment changed, replacing forwards");
            }
            self.teardown_all(registry).await;
        }

        let tunnels = self.forwarder.open(ports, target_host, registry).await?;
        tracing::info!(
            "forwarding {} port(s) via {}: {}",
            tunnels.len(),
            self.forwarder.name(),
            tunnels
                .iter()
                .map(|t| format!("{}->{}", t.local_port, t.remote_port))
                .collect::<Vec<_>>()
                .join(" ")
        );
        let opened = tunnels.len();
        self.tunnels = tunnels;
        self.active = Some((ports.clone(), target_host.to_string()));
        Ok(opened)
    }

    /// Close every tunnel; failures are logged, not returned
    pub async fn teardown_all(&mut self, registry: &mut ChildRegistry) {
        let tunnels = std::mem::take(&mut self.tunnels);
        let Some((_, host)) = self.active.take() else {
            return;
        };
        if tunnels.is_empty() {
            return;
        }
        if let Err(e) = self.forwarder.close(tunnels, &host, registry).await {
            tracing::warn!("failed to remove port forwards: {}", e);
        }
    }

    /// Tunnels whose forwarding process has exited or been reaped
    pub fn dead_tunnels(&self, registry: &mut ChildRegistry) -> usize {
        self.tunnels
            .iter()
            .filter(|t| match t.handle {
                TunnelHandle::Process(id) => !matches!(registry.status(id), Ok(ChildStatus::Running)),
                TunnelHandle::Direct | TunnelHandle::SshMux => false,
            })
            .count()
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    pub fn tunnels(&self) -> &[ForwardedPort] {
        &self.tunnels
    }
}
