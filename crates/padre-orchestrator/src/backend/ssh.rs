//! SSH backend
//!
//! One multiplexed master connection is opened up front, so that an
//! authentication problem fails the launch immediately. The session
//! command and every later control request (`-O forward`, `-O cancel`,
//! `-O exit`, remote kills) go through that master socket.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use padre_core::config::{ClientConfig, SshConfig};
use padre_core::process::SignalKind;
use padre_core::{Session, TransportError, TransportKind};
use tokio::process::Command;

use super::{
    check_output, child_liveness, shell_quote, signal_child, Backend, CleanupMode, ControlChannel,
    LaunchSpec, Liveness,
};
use crate::forward::{Forwarder, SshMuxForwarder};
use crate::ports::{default_port_base, suggest_ports};
use crate::registry::{self, ChildId, ChildRegistry};

/// Exit status ssh uses for connection and authentication failures
const SSH_CONNECT_FAILURE: i32 = 255;

/// Command builder around one ControlMaster socket
#[derive(Debug, Clone)]
pub struct SshTransport {
    ssh: PathBuf,
    host: String,
    control_path: String,
    control_persist: String,
}

impl SshTransport {
    pub fn new(ssh: impl Into<PathBuf>, host: impl Into<String>, config: &SshConfig) -> Self {
        Self {
            ssh: ssh.into(),
            host: host.into(),
            control_path: config.control_path.clone(),
            control_persist: config.control_persist.clone(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// `-o` options selecting the shared master connection
    pub fn mux_options(&self) -> Vec<String> {
        vec![
            "-o".into(),
            format!("ControlPath={}", self.control_path),
            "-o".into(),
            "ControlMaster=auto".into(),
            "-o".into(),
            format!("ControlPersist={}", self.control_persist),
        ]
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.ssh);
        cmd.args(self.mux_options());
        cmd
    }

    /// Open (or reuse) the master connection
    ///
    /// stdin and stderr stay attached to the terminal so a passphrase can be
    /// typed; the persisting master keeps its pipes, so none are captured.
    pub async fn open_master(&self) -> Result<(), TransportError> {
        tracing::info!("opening ssh connection to {}", self.host);
        let mut cmd = self.command();
        cmd.arg(&self.host).arg("exit").stdout(Stdio::null());
        let label = registry::program_name(&cmd);
        let status = registry::spawn_command(&mut cmd, &label)?.wait().await?;
        match status.code() {
            Some(0) => Ok(()),
            Some(SSH_CONNECT_FAILURE) => Err(TransportError::AuthenticationFailed {
                host: self.host.clone(),
                detail: "ssh could not connect or authenticate".into(),
            }),
            _ => Err(TransportError::LaunchFailed(format!(
                "ssh to {} exited with {}",
                self.host, status
            ))),
        }
    }

    /// Command running `remote` on the host through the master, with a tty
    pub fn session_command(&self, remote: &str) -> Command {
        let mut cmd = Command::new(&self.ssh);
        cmd.arg("-tt")
            .args(self.mux_options())
            .arg(&self.host)
            .arg(format!("shopt -s huponexit && {}", remote));
        cmd
    }

    /// Arguments of a `-O forward`/`-O cancel` request
    pub fn control_args(&self, op: &str, pairs: &[(u16, u16)], target_host: &str) -> Vec<String> {
        let mut args = self.mux_options();
        args.extend(["-O".to_string(), op.to_string(), self.host.clone()]);
        for (internal, external) in pairs {
            args.push("-L".into());
            args.push(format!("localhost:{}:{}:{}", external, target_host, internal));
        }
        args
    }

    /// Send a forwarding control request to the master
    pub async fn control(&self, op: &str, pairs: &[(u16, u16)], target_host: &str) -> Result<(), TransportError> {
        let mut cmd = Command::new(&self.ssh);
        cmd.args(self.control_args(op, pairs, target_host));
        check_output(&mut cmd, &format!("ssh -O {}", op)).await?;
        Ok(())
    }

    /// Run a shell command on the host and return its stdout
    pub async fn run_remote(&self, remote: &str) -> Result<String, TransportError> {
        let mut cmd = self.command();
        cmd.arg(&self.host).arg(remote);
        check_output(&mut cmd, remote).await
    }

    /// Ask the master connection to exit
    pub async fn close_master(&self) -> Result<(), TransportError> {
        let mut cmd = self.command();
        cmd.args(["-O", "exit"]).arg(&self.host);
        check_output(&mut cmd, "ssh -O exit").await?;
        Ok(())
    }
}

/// Runs the launcher on a remote host
pub struct SshBackend {
    transport: SshTransport,
    remote_command: String,
    docker_image: String,
    child: Option<ChildId>,
}

impl SshBackend {
    pub fn new(transport: SshTransport, config: &ClientConfig) -> Self {
        Self {
            transport,
            remote_command: config.ssh.remote_command.clone(),
            docker_image: config.docker_image.clone(),
            child: None,
        }
    }

    /// Remote launcher invocation
    pub fn remote_invocation(&self, userside_ports: &[u16], spec: &LaunchSpec) -> String {
        let ports = userside_ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(":");
        let mut words = vec![self.remote_command.clone(), "--remote".into(), ports];
        words.extend(spec.trailing_args().iter().map(|a| shell_quote(a)));
        words.join(" ")
    }

    /// Shell snippet stopping a container on whichever runtime the host has
    fn kill_container_script(&self, name: &str) -> String {
        let image = format!(
            "~/.radiopadre/{}.singularity.img",
            self.docker_image.replace('/', "_")
        );
        format!(
            "if command -v docker >/dev/null; then docker kill {name}; \
             elif command -v singularity >/dev/null; then singularity instance.stop {image} {name}; fi",
            name = shell_quote(name),
            image = image
        )
    }
}

#[async_trait]
impl Backend for SshBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::Ssh
    }

    async fn launch(
        &mut self,
        spec: &LaunchSpec,
        registry: &mut ChildRegistry,
    ) -> Result<ControlChannel, TransportError> {
        self.transport.open_master().await?;

        let userside = match &spec.userside_ports {
            Some(ports) => ports.clone(),
            None => suggest_ports(spec.num_ports, default_port_base())?,
        };
        let remote = self.remote_invocation(&userside, spec);
        tracing::info!("running client on {}", self.transport.host());
        tracing::debug!("remote command: {}", remote);

        let mut cmd = self.transport.session_command(&remote);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = registry::spawn_command(&mut cmd, "ssh")?;
        let channel = ControlChannel::from_child(registry, format!("ssh {}", self.transport.host()), child);
        self.child = channel.child;
        Ok(channel)
    }

    async fn poll_status(&mut self, registry: &mut ChildRegistry) -> Result<Liveness, TransportError> {
        child_liveness(registry, self.child)
    }

    async fn send_signal(&mut self, kind: SignalKind, registry: &mut ChildRegistry) -> Result<(), TransportError> {
        signal_child(registry, self.child, kind)
    }

    async fn request_stop(&mut self, session: &Session, _registry: &mut ChildRegistry) -> Result<(), TransportError> {
        // `exit` has gone down the tty; a container needs an explicit kill
        if let Some(name) = &session.container_name {
            tracing::info!("killing remote container {}", name);
            self.transport.run_remote(&self.kill_container_script(name)).await?;
        }
        Ok(())
    }

    async fn cleanup(
        &mut self,
        _session: &Session,
        _mode: CleanupMode,
        _registry: &mut ChildRegistry,
    ) -> Result<(), TransportError> {
        // The master is ours in either mode; a detached container keeps running without it.
        self.transport.close_master().await
    }

    fn forwarder(&self) -> Box<dyn Forwarder> {
        Box::new(SshMuxForwarder::new(self.transport.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use padre_core::SessionId;

    fn transport() -> SshTransport {
        SshTransport::new("ssh", "joe@cluster", &SshConfig::default())
    }

    #[test]
    fn test_mux_options() {
        assert_eq!(
            transport().mux_options(),
            vec![
                "-o",
                "ControlPath=/tmp/ssh_mux_radiopadre_%C",
                "-o",
                "ControlMaster=auto",
                "-o",
                "ControlPersist=1h"
            ]
        );
    }

    #[test]
    fn test_forward_request_is_single_invocation() {
        let args = transport().control_args("forward", &[(1001, 2001), (1002, 2002)], "localhost");
        let tail: Vec<&str> = args[6..].iter().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec![
                "-O",
                "forward",
                "joe@cluster",
                "-L",
                "localhost:2001:localhost:1001",
                "-L",
                "localhost:2002:localhost:1002"
            ]
        );
    }

    #[test]
    fn test_session_command() {
        let cmd = transport().session_command("run-radiopadre x");
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "-tt");
        assert_eq!(args.last().unwrap(), "shopt -s huponexit && run-radiopadre x");
    }

    #[test]
    fn test_remote_invocation_quotes_arguments() {
        let backend = SshBackend::new(transport(), &ClientConfig::default());
        let mut spec = LaunchSpec::new(SessionId::new("ab"), 2, "/data");
        spec.notebook = Some("my notebook.ipynb".into());
        assert_eq!(
            backend.remote_invocation(&[10001, 10002], &spec),
            "run-radiopadre --remote 10001:10002 'my notebook.ipynb'"
        );
    }

    #[test]
    fn test_kill_script_covers_both_runtimes() {
        let backend = SshBackend::new(transport(), &ClientConfig::default());
        let script = backend.kill_container_script("radiopadre-joe-1");
        assert!(script.contains("docker kill radiopadre-joe-1"));
        assert!(script.contains("instance.stop ~/.radiopadre/osmirnov_radiopadre:latest.singularity.img"));
    }
}
