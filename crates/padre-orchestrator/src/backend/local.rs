//! Local subprocess backend (virtualenv installs)

use std::process::Stdio;

use async_trait::async_trait;
use padre_core::process::SignalKind;
use padre_core::{TransportError, TransportKind};
use tokio::process::Command;

use super::{child_liveness, signal_child, Backend, ControlChannel, LaunchSpec, Liveness};
use crate::forward::{DirectForwarder, Forwarder};
use crate::registry::{self, ChildId, ChildRegistry};

/// Runs the session program directly on this machine
///
/// Ports are used as announced, so no forwarding is needed.
pub struct LocalBackend {
    program: String,
    args: Vec<String>,
    child: Option<ChildId>,
}

impl LocalBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            child: None,
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::Venv
    }

    async fn launch(
        &mut self,
        spec: &LaunchSpec,
        registry: &mut ChildRegistry,
    ) -> Result<ControlChannel, TransportError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .args(spec.trailing_args())
            .current_dir(&spec.workdir)
            .env("RADIOPADRE_SESSION_ID", spec.session_id.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!("starting local session: {} {}", self.program, self.args.join(" "));
        let child = registry::spawn_command(&mut cmd, &self.program)?;
        let channel = ControlChannel::from_child(registry, format!("local {}", self.program), child);
        self.child = channel.child;
        Ok(channel)
    }

    async fn poll_status(&mut self, registry: &mut ChildRegistry) -> Result<Liveness, TransportError> {
        child_liveness(registry, self.child)
    }

    async fn send_signal(&mut self, kind: SignalKind, registry: &mut ChildRegistry) -> Result<(), TransportError> {
        signal_child(registry, self.child, kind)
    }

    fn forwarder(&self) -> Box<dyn Forwarder> {
        Box::new(DirectForwarder)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use padre_core::SessionId;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_launch_passes_session_id_and_workdir() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut backend = LocalBackend::new(
            "sh",
            vec!["-c".into(), "echo $RADIOPADRE_SESSION_ID; pwd".into()],
        );
        let spec = LaunchSpec::new(SessionId::new("feed"), 5, dir.path());
        let mut reg = ChildRegistry::new();
        let mut channel = backend.launch(&spec, &mut reg).await.unwrap();

        let mut out = String::new();
        channel.stdout.take().unwrap().read_to_string(&mut out).await.unwrap();
        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("feed"));
        let cwd = std::fs::canonicalize(lines.next().unwrap()).unwrap();
        assert_eq!(cwd, std::fs::canonicalize(dir.path()).unwrap());

        reg.terminate_all(std::time::Duration::from_secs(1)).await;
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn test_missing_program_is_fatal() {
        let mut backend = LocalBackend::new("no-such-runscript-padre", Vec::new());
        let spec = LaunchSpec::new(SessionId::generate(), 5, ".");
        let err = backend.launch(&spec, &mut ChildRegistry::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::BinaryNotFound { .. }));
    }
}
