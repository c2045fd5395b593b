//! Transport backends
//!
//! A backend knows how to start the session program for one transport,
//! expose its output as a [`ControlChannel`], report whether it is still
//! alive, and tear it down. Operations a transport lacks return
//! [`TransportError::Unsupported`] rather than panicking.

mod container;
mod docker;
mod kube;
mod local;
mod singularity;
mod ssh;

pub use container::{ContainerLayout, Mount, CONTAINER_PORT_BASE};
pub use docker::DockerBackend;
pub use kube::{Kubectl, KubernetesBackend, LogDeduper, PodApi, PodPhase, PodStatus, PodWatcher};
pub use local::LocalBackend;
pub use singularity::SingularityBackend;
pub use ssh::{SshBackend, SshTransport};

use std::path::PathBuf;
use std::pin::Pin;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use padre_core::config::ClientConfig;
use padre_core::process::SignalKind;
use padre_core::{
    Capabilities, Operation, PadreError, PortMap, PortSlot, Session, SessionError, SessionId,
    TransportError, TransportKind,
};
use padre_protocol::BootstrapEvent;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::forward::Forwarder;
use crate::registry::{self, ChildId, ChildRegistry, ChildRole, ChildStatus};

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Streams connecting the orchestrator to a launched session
pub struct ControlChannel {
    pub stdout: Option<BoxedReader>,
    pub stderr: Option<BoxedReader>,
    pub stdin: Option<BoxedWriter>,
    /// Process behind the streams, if there is one
    pub child: Option<ChildId>,
    /// Events the backend already knows, applied before any output is read
    pub announced: Vec<BootstrapEvent>,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .field("stdin", &self.stdin.is_some())
            .field("child", &self.child)
            .field("announced", &self.announced)
            .finish()
    }
}

impl ControlChannel {
    /// Take the pipes of a spawned child and register it as the control channel
    pub fn from_child(registry: &mut ChildRegistry, label: impl Into<String>, mut child: Child) -> Self {
        let stdout = child.stdout.take().map(|s| Box::pin(s) as BoxedReader);
        let stderr = child.stderr.take().map(|s| Box::pin(s) as BoxedReader);
        let stdin = child.stdin.take().map(|s| Box::pin(s) as BoxedWriter);
        let id = registry.register(label, ChildRole::ControlChannel, child);
        Self {
            stdout,
            stderr,
            stdin,
            child: Some(id),
            announced: Vec::new(),
        }
    }

    /// Channel built from arbitrary streams (used by tests and log streams)
    pub fn from_streams(stdout: Option<BoxedReader>, stderr: Option<BoxedReader>, stdin: Option<BoxedWriter>) -> Self {
        Self {
            stdout,
            stderr,
            stdin,
            child: None,
            announced: Vec::new(),
        }
    }

    /// Queue an event the backend already knows
    pub fn announce(mut self, event: BootstrapEvent) -> Self {
        self.announced.push(event);
        self
    }
}

/// What the caller wants launched
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub session_id: SessionId,
    pub num_ports: usize,
    /// Absolute directory the session serves
    pub workdir: PathBuf,
    /// Notebook or subdirectory to open
    pub notebook: Option<String>,
    /// Mount the work directory read-only
    pub read_only_workdir: bool,
    /// External ports to use; suggested when absent
    pub userside_ports: Option<Vec<u16>>,
    /// Extra arguments for the runscript
    pub extra_args: Vec<String>,
    /// Reattach to an existing session instead of starting one
    pub resume: Option<SessionInfo>,
}

impl LaunchSpec {
    pub fn new(session_id: SessionId, num_ports: usize, workdir: impl Into<PathBuf>) -> Self {
        Self {
            session_id,
            num_ports,
            workdir: workdir.into(),
            notebook: None,
            read_only_workdir: false,
            userside_ports: None,
            extra_args: Vec::new(),
            resume: None,
        }
    }

    /// Arguments passed to the runscript after the backend-specific ones
    pub fn trailing_args(&self) -> Vec<String> {
        let mut args = self.extra_args.clone();
        if let Some(nb) = &self.notebook {
            args.push(nb.clone());
        }
        args
    }
}

/// Answer to "is the session still there?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// Could not be determined right now (e.g. the API is unreachable)
    Unknown,
    /// Finished, with an exit code when one is known
    Exited(Option<i32>),
}

/// How the session ends from the backend's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupMode {
    /// Remove the remote session and everything it left behind
    Teardown,
    /// Leave the remote session running
    Detach,
}

/// A running container session found by `list_sessions`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub container_id: String,
    pub name: String,
    /// Directory the session was started in
    pub workdir: String,
    /// Creation time as reported by the runtime
    pub created: String,
    pub session_id: SessionId,
    pub ports: PortMap,
}

impl SessionInfo {
    /// URL to reopen the running notebook
    pub fn resume_url(&self) -> Option<String> {
        let port = self.ports.external_port(PortSlot::Notebook)?;
        Some(format!(
            "http://localhost:{}/tree#running?token={}",
            port, self.session_id
        ))
    }
}

/// A transport that can launch and tear down sessions
#[async_trait]
pub trait Backend: Send {
    fn kind(&self) -> TransportKind;

    fn capabilities(&self) -> Capabilities {
        Capabilities::for_kind(self.kind())
    }

    /// Start the session and return its control channel
    ///
    /// Failure to reach the transport at all is fatal.
    async fn launch(
        &mut self,
        spec: &LaunchSpec,
        registry: &mut ChildRegistry,
    ) -> Result<ControlChannel, TransportError>;

    /// Reopen output after end-of-stream; `None` means the session is over
    async fn reopen(&mut self, _registry: &mut ChildRegistry) -> Result<Option<ControlChannel>, TransportError> {
        Ok(None)
    }

    /// Rewrite a raw output line before it is classified; `None` drops it
    fn preprocess_line(&mut self, line: String) -> Option<String> {
        Some(line)
    }

    /// Whether the session is still alive
    async fn poll_status(&mut self, registry: &mut ChildRegistry) -> Result<Liveness, TransportError>;

    /// Signal the session process
    async fn send_signal(&mut self, kind: SignalKind, registry: &mut ChildRegistry) -> Result<(), TransportError>;

    /// Ask the session to stop (the `exit` line has already been written)
    async fn request_stop(&mut self, _session: &Session, registry: &mut ChildRegistry) -> Result<(), TransportError> {
        self.send_signal(SignalKind::Terminate, registry).await
    }

    /// Stop the session by force after the grace period
    async fn force_stop(&mut self, _session: &Session, registry: &mut ChildRegistry) -> Result<(), TransportError> {
        self.send_signal(SignalKind::Kill, registry).await
    }

    /// Release transport-side resources once the session is over
    async fn cleanup(
        &mut self,
        _session: &Session,
        _mode: CleanupMode,
        _registry: &mut ChildRegistry,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    /// Forwarder reaching this transport's ports
    fn forwarder(&self) -> Box<dyn Forwarder>;

    /// Running sessions of this user, newest first
    async fn list_sessions(&mut self) -> Result<Vec<SessionInfo>, TransportError> {
        Err(TransportError::Unsupported {
            transport: self.kind(),
            operation: Operation::ListSessions,
        })
    }

    /// Kill the given sessions (by container id)
    async fn kill_sessions(&mut self, _sessions: &[SessionInfo], _ids: &[String]) -> Result<(), TransportError> {
        Err(TransportError::Unsupported {
            transport: self.kind(),
            operation: Operation::KillSessions,
        })
    }
}

/// Resolve a session argument: an ordinal of up to 4 digits, or a container id
pub fn identify_session<'a>(
    caps: &Capabilities,
    sessions: &'a [SessionInfo],
    arg: &str,
) -> Result<&'a SessionInfo, PadreError> {
    caps.require(Operation::IdentifySession)?;
    if arg.len() <= 4 && !arg.is_empty() && arg.bytes().all(|b| b.is_ascii_digit()) {
        let index: usize = arg
            .parse()
            .map_err(|_| SessionError::NotFound(arg.to_string()))?;
        return sessions.get(index).ok_or_else(|| {
            SessionError::NotFound(format!(
                "invalid session #{}, we only have {} running",
                index,
                sessions.len()
            ))
            .into()
        });
    }
    sessions
        .iter()
        .find(|s| s.container_id == arg)
        .ok_or_else(|| SessionError::NotFound(format!("invalid container ID {}", arg)).into())
}

/// Locate a transport binary on PATH
pub fn find_binary(name: &str) -> Result<PathBuf, TransportError> {
    which::which(name).map_err(|_| TransportError::BinaryNotFound {
        binary: name.to_string(),
    })
}

/// Binary a transport needs, if any
pub fn required_binary(kind: TransportKind, config: &ClientConfig) -> Option<String> {
    match kind {
        TransportKind::Venv => None,
        TransportKind::Docker => Some("docker".into()),
        TransportKind::Singularity => Some("singularity".into()),
        TransportKind::Kubernetes => Some(config.kubernetes.kubectl.clone()),
        TransportKind::Ssh => Some("ssh".into()),
    }
}

/// Create the backend for a transport kind
pub fn create_backend(kind: TransportKind, config: &ClientConfig) -> Result<Box<dyn Backend>, TransportError> {
    let binary = match required_binary(kind, config) {
        Some(name) => Some(find_binary(&name)?),
        None => None,
    };
    let backend: Box<dyn Backend> = match (kind, binary) {
        (TransportKind::Venv, _) => Box::new(LocalBackend::new(config.runscript.clone(), Vec::new())),
        (TransportKind::Docker, Some(bin)) => Box::new(DockerBackend::new(bin, config)),
        (TransportKind::Singularity, Some(bin)) => Box::new(SingularityBackend::new(bin, config)),
        (TransportKind::Kubernetes, Some(bin)) => {
            Box::new(KubernetesBackend::new(Kubectl::new(bin, &config.kubernetes), config)?)
        }
        (TransportKind::Ssh, Some(bin)) => {
            let host = config.ssh.host.clone().ok_or_else(|| {
                TransportError::LaunchFailed("no remote host configured for the ssh backend".into())
            })?;
            Box::new(SshBackend::new(SshTransport::new(bin, host, &config.ssh), config))
        }
        (kind, None) => {
            return Err(TransportError::BinaryNotFound {
                binary: kind.to_string(),
            })
        }
    };
    Ok(backend)
}

/// Pick the first backend from the preference list whose binary is available
pub fn select_backend(
    preferred: Option<TransportKind>,
    config: &ClientConfig,
) -> Result<Box<dyn Backend>, TransportError> {
    if let Some(kind) = preferred {
        return create_backend(kind, config);
    }
    let mut last_err = None;
    for kind in &config.backends {
        match create_backend(*kind, config) {
            Ok(backend) => {
                tracing::info!("using the {} backend", kind);
                return Ok(backend);
            }
            Err(e) => {
                tracing::debug!("{} backend unavailable: {}", kind, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        TransportError::LaunchFailed("no backends configured".into())
    }))
}

/// Liveness of the control channel process
pub fn child_liveness(registry: &mut ChildRegistry, child: Option<ChildId>) -> Result<Liveness, TransportError> {
    let Some(id) = child else {
        return Ok(Liveness::Exited(None));
    };
    match registry.status(id)? {
        ChildStatus::Running => Ok(Liveness::Alive),
        ChildStatus::Exited(code) => Ok(Liveness::Exited(code)),
    }
}

/// Signal the control channel process, if it is still tracked
pub fn signal_child(registry: &mut ChildRegistry, child: Option<ChildId>, kind: SignalKind) -> Result<(), TransportError> {
    if let Some(id) = child {
        registry.signal(id, kind)?;
    }
    Ok(())
}

/// Run a command to completion, capturing its output
pub async fn run_captured(cmd: &mut Command) -> Result<Output, TransportError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let label = registry::program_name(cmd);
    let child = registry::spawn_command(cmd, &label)?;
    Ok(child.wait_with_output().await?)
}

/// Run a command and return its stdout, failing with its stderr
pub async fn check_output(cmd: &mut Command, what: &str) -> Result<String, TransportError> {
    let output = run_captured(cmd).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(TransportError::LaunchFailed(format!(
            "{} failed ({}): {}",
            what, output.status, stderr
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Quote a word for a POSIX shell
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./:=@%+,".contains(&b));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
