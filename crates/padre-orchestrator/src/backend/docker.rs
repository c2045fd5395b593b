//! Docker backend
//!
//! Sessions run detached in containers named `radiopadre-<user>-<id>`,
//! labelled with the owner and the directory they serve. Published ports
//! make forwarding unnecessary. Each container has a record directory
//! under `~/.radiopadre/.sessions` holding its session id and ports, which
//! is what `ps`, `resume` and `kill` work from.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use padre_core::config::{self, ClientConfig};
use padre_core::process::{current_uid_gid, SignalKind};
use padre_core::record::{self, SessionRecord};
use padre_core::{PortMap, Session, SessionId, TransportError, TransportKind};
use padre_protocol::BootstrapEvent;
use tokio::process::Command;

use super::container::{container_ports, discard_record, runscript_args, ContainerLayout};
use super::{
    check_output, child_liveness, run_captured, signal_child, Backend, CleanupMode, ControlChannel,
    LaunchSpec, Liveness, SessionInfo,
};
use crate::forward::{DirectForwarder, Forwarder};
use crate::ports::{default_port_base, suggest_ports};
use crate::registry::{self, ChildId, ChildRegistry};

const LABEL_USER: &str = "radiopadre.user";
const LABEL_DIR: &str = "radiopadre.dir";
const PS_FORMAT: &str = r#"{{.CreatedAt}}:::{{.ID}}:::{{.Names}}:::{{.Label "radiopadre.dir"}}"#;

/// One line of `docker ps` output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEntry {
    pub created: String,
    pub id: String,
    pub name: String,
    pub workdir: String,
}

/// Parse `docker ps` output in [`PS_FORMAT`], newest first
pub fn parse_ps_output(output: &str) -> Vec<ContainerEntry> {
    let mut entries: Vec<ContainerEntry> = output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.trim().split(":::").collect();
            match fields.as_slice() {
                [created, id, name, workdir] => Some(ContainerEntry {
                    created: created.to_string(),
                    id: id.to_string(),
                    name: name.to_string(),
                    workdir: workdir.to_string(),
                }),
                _ => None,
            }
        })
        .collect();
    entries.sort_by(|a, b| b.created.cmp(&a.created));
    entries
}

/// Container name for a session
pub fn container_name(user: &str, session_id: &SessionId) -> String {
    format!("{}{}-{}", record::SESSION_DIR_PREFIX, user, session_id)
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

pub struct DockerBackend {
    docker: PathBuf,
    image: String,
    runscript: String,
    user: String,
    sessions_dir: PathBuf,
    num_ports: usize,
    debug: bool,
    grim_reaper: bool,
    name: Option<String>,
    child: Option<ChildId>,
}

impl DockerBackend {
    pub fn new(docker: impl Into<PathBuf>, config: &ClientConfig) -> Self {
        Self {
            docker: docker.into(),
            image: config.docker_image.clone(),
            runscript: config.runscript.clone(),
            user: config::user_name(),
            sessions_dir: config::sessions_dir(),
            num_ports: config.num_ports,
            debug: config.container_debug,
            grim_reaper: config.grim_reaper,
            name: None,
            child: None,
        }
    }

    /// Keep session records somewhere else
    pub fn with_sessions_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sessions_dir = dir.into();
        self
    }

    fn command(&self) -> Command {
        Command::new(&self.docker)
    }

    /// Full `docker run` argument list
    pub fn run_args(
        &self,
        name: &str,
        spec: &LaunchSpec,
        layout: &ContainerLayout,
        selected: &[u16],
        userside: &[u16],
    ) -> Vec<String> {
        let (uid, gid) = current_uid_gid();
        let workdir = spec.workdir.display().to_string();
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            name.into(),
            "-w".into(),
            workdir.clone(),
            "--user".into(),
            format!("{}:{}", uid, gid),
            "-e".into(),
            format!("USER={}", self.user),
            "-e".into(),
            format!("HOME={}", layout.home.display()),
            "-e".into(),
            format!("RADIOPADRE_CONTAINER_NAME={}", name),
            "-e".into(),
            format!("RADIOPADRE_SESSION_ID={}", spec.session_id),
        ];
        if !self.debug {
            args.push("-d".into());
        }
        let inside = container_ports(selected.len());
        for (host, port) in selected.iter().zip(&inside) {
            args.push("-p".into());
            args.push(format!("{}:{}/tcp", host, port));
        }
        for mount in layout.mounts(true) {
            args.push("-v".into());
            args.push(mount.to_arg());
        }
        args.extend([
            "--label".into(),
            format!("{}={}", LABEL_USER, self.user),
            "--label".into(),
            format!("{}={}", LABEL_DIR, workdir),
            self.image.clone(),
        ]);
        args.extend(runscript_args(
            &self.runscript,
            &inside,
            userside,
            &spec.workdir,
            &spec.trailing_args(),
        ));
        args
    }

    /// Kill earlier sessions serving the same directory
    async fn reap_older_sessions(&mut self, spec: &LaunchSpec) {
        let sessions = match self.list_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::warn!("could not list running sessions: {}", e);
                return;
            }
        };
        let stale: Vec<String> = sessions
            .iter()
            .filter(|s| s.session_id != spec.session_id && same_dir(Path::new(&s.workdir), &spec.workdir))
            .map(|s| {
                tracing::info!("reaping older session {}", s.session_id);
                s.container_id.clone()
            })
            .collect();
        if !stale.is_empty() {
            if let Err(e) = self.kill_sessions(&sessions, &stale).await {
                tracing::warn!("failed to reap older sessions: {}", e);
            }
        }
    }

    fn logs_command(&self, name: &str, tail_only: bool) -> Command {
        let mut cmd = self.command();
        cmd.args(["logs", "-f"]);
        if tail_only {
            cmd.args(["--tail", "0"]);
        }
        cmd.arg(name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn follow_logs(
        &mut self,
        name: &str,
        tail_only: bool,
        registry: &mut ChildRegistry,
    ) -> Result<ControlChannel, TransportError> {
        let mut cmd = self.logs_command(name, tail_only);
        let child = registry::spawn_command(&mut cmd, "docker logs")?;
        let channel = ControlChannel::from_child(registry, format!("docker logs {}", name), child);
        self.child = channel.child;
        Ok(channel)
    }

    async fn container_running(&self, name: &str) -> Result<bool, TransportError> {
        let mut cmd = self.command();
        cmd.args(["ps", "-q", "--filter"]).arg(format!("name=^/?{}$", name));
        Ok(!check_output(&mut cmd, "docker ps").await?.trim().is_empty())
    }

    async fn kill_container(&self, name: &str) -> Result<(), TransportError> {
        let mut cmd = self.command();
        cmd.arg("kill").arg(name);
        check_output(&mut cmd, "docker kill").await?;
        Ok(())
    }

    async fn resume(
        &mut self,
        info: &SessionInfo,
        registry: &mut ChildRegistry,
    ) -> Result<ControlChannel, TransportError> {
        tracing::info!(
            "attaching to existing session {} running in {}",
            info.session_id,
            info.workdir
        );
        self.name = Some(info.name.clone());
        let channel = self.follow_logs(&info.name, true, registry)?;
        let mut channel = channel
            .announce(BootstrapEvent::ContainerNameAnnounced(info.name.clone()))
            .announce(BootstrapEvent::SessionIdAnnounced(info.session_id.to_string()))
            .announce(BootstrapEvent::PortsAnnounced {
                internal: info.ports.internal().to_vec(),
                external: info.ports.external().to_vec(),
            });
        if let Some(url) = info.resume_url() {
            channel = channel.announce(BootstrapEvent::LaunchUrlAnnounced(url));
        }
        Ok(channel.announce(BootstrapEvent::ReadySignal))
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::Docker
    }

    async fn launch(
        &mut self,
        spec: &LaunchSpec,
        registry: &mut ChildRegistry,
    ) -> Result<ControlChannel, TransportError> {
        if let Some(info) = &spec.resume {
            return self.resume(info, registry).await;
        }
        if self.grim_reaper {
            self.reap_older_sessions(spec).await;
        }

        let name = container_name(&self.user, &spec.session_id);
        tracing::info!("starting new session in container {}", name);
        self.name = Some(name.clone());

        let selected = suggest_ports(spec.num_ports, default_port_base())?;
        let userside = spec.userside_ports.clone().unwrap_or_else(|| selected.clone());
        let ports = PortMap::new(selected.clone(), userside.clone(), spec.num_ports)
            .map_err(|e| TransportError::LaunchFailed(e.to_string()))?;
        SessionRecord::new(spec.session_id.clone(), ports)
            .save(&self.sessions_dir, &name)?;

        let mut layout = ContainerLayout::new(&spec.workdir, record::record_dir(&self.sessions_dir, &name));
        layout.read_only_workdir = spec.read_only_workdir;
        layout.prepare()?;

        let args = self.run_args(&name, spec, &layout, &selected, &userside);
        tracing::debug!("running docker {}", args.join(" "));
        let mut cmd = self.command();
        cmd.args(&args);

        let channel = if self.debug {
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            let child = registry::spawn_command(&mut cmd, "docker run")?;
            let channel = ControlChannel::from_child(registry, format!("docker run {}", name), child);
            self.child = channel.child;
            channel
        } else {
            let output = run_captured(&mut cmd).await?;
            if !output.status.success() {
                discard_record(&self.sessions_dir, &name);
                return Err(TransportError::LaunchFailed(format!(
                    "docker run failed ({}): {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            self.follow_logs(&name, false, registry)?
        };

        Ok(channel
            .announce(BootstrapEvent::ContainerNameAnnounced(name))
            .announce(BootstrapEvent::SessionIdAnnounced(spec.session_id.to_string()))
            .announce(BootstrapEvent::PortsAnnounced {
                internal: selected,
                external: userside,
            }))
    }

    async fn reopen(&mut self, registry: &mut ChildRegistry) -> Result<Option<ControlChannel>, TransportError> {
        let Some(name) = self.name.clone() else {
            return Ok(None);
        };
        if self.debug || !self.container_running(&name).await? {
            return Ok(None);
        }
        tracing::debug!("log stream of {} ended, reattaching", name);
        self.follow_logs(&name, true, registry).map(Some)
    }

    async fn poll_status(&mut self, registry: &mut ChildRegistry) -> Result<Liveness, TransportError> {
        child_liveness(registry, self.child)
    }

    async fn send_signal(&mut self, kind: SignalKind, registry: &mut ChildRegistry) -> Result<(), TransportError> {
        signal_child(registry, self.child, kind)
    }

    async fn request_stop(&mut self, _session: &Session, _registry: &mut ChildRegistry) -> Result<(), TransportError> {
        match self.name.clone() {
            Some(name) => {
                tracing::info!("killing the container");
                self.kill_container(&name).await
            }
            None => Ok(()),
        }
    }

    async fn force_stop(&mut self, session: &Session, registry: &mut ChildRegistry) -> Result<(), TransportError> {
        self.send_signal(SignalKind::Kill, registry).await?;
        self.request_stop(session, registry).await
    }

    async fn cleanup(
        &mut self,
        _session: &Session,
        mode: CleanupMode,
        _registry: &mut ChildRegistry,
    ) -> Result<(), TransportError> {
        let Some(name) = self.name.clone() else {
            return Ok(());
        };
        match mode {
            CleanupMode::Detach => {
                tracing::info!("container session {} will remain running", name);
                Ok(())
            }
            CleanupMode::Teardown => {
                if let Err(e) = self.kill_container(&name).await {
                    tracing::debug!("container {} already gone: {}", name, e);
                }
                record::remove_record(&self.sessions_dir, &name)?;
                Ok(())
            }
        }
    }

    fn forwarder(&self) -> Box<dyn Forwarder> {
        Box::new(DirectForwarder)
    }

    async fn list_sessions(&mut self) -> Result<Vec<SessionInfo>, TransportError> {
        let mut cmd = self.command();
        cmd.args(["ps", "--filter"])
            .arg(format!("label={}={}", LABEL_USER, self.user))
            .args(["--format", PS_FORMAT]);
        let containers = parse_ps_output(&check_output(&mut cmd, "docker ps").await?);

        for name in record::list_record_names(&self.sessions_dir)? {
            if !containers.iter().any(|c| c.name == name) {
                tracing::info!("container {} is no longer running, clearing up session dir", name);
                record::remove_record(&self.sessions_dir, &name)?;
            }
        }

        let mut sessions = Vec::new();
        for entry in containers {
            match SessionRecord::read(&self.sessions_dir, &entry.name, self.num_ports) {
                Ok(rec) => sessions.push(SessionInfo {
                    container_id: entry.id,
                    name: entry.name,
                    workdir: entry.workdir,
                    created: entry.created,
                    session_id: rec.session_id,
                    ports: rec.ports,
                }),
                Err(e) => {
                    tracing::debug!("{}", e);
                    tracing::warn!("container {} has no session dir -- killing it", entry.name);
                    if let Err(e) = self.kill_container(&entry.id).await {
                        tracing::warn!("{}", e);
                    }
                }
            }
        }
        Ok(sessions)
    }

    async fn kill_sessions(&mut self, sessions: &[SessionInfo], ids: &[String]) -> Result<(), TransportError> {
        tracing::info!("killing containers: {}", ids.join(" "));
        for id in ids {
            let session = sessions
                .iter()
                .find(|s| &s.container_id == id)
                .ok_or_else(|| TransportError::Rejected(format!("no such radiopadre container: {}", id)))?;
            record::remove_record(&self.sessions_dir, &session.name)?;
        }
        if ids.is_empty() {
            return Ok(());
        }
        let mut cmd = self.command();
        cmd.arg("kill").args(ids);
        check_output(&mut cmd, "docker kill").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ps_output_newest_first() {
        let out = "\
2024-01-01 10:00:00 +0000 UTC:::aaa:::radiopadre-joe-1:::/data/a
garbage line
2024-03-01 10:00:00 +0000 UTC:::bbb:::radiopadre-joe-2:::/data/b
";
        let entries = parse_ps_output(out);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "bbb");
        assert_eq!(entries[1].workdir, "/data/a");
    }

    #[test]
    fn test_container_name() {
        assert_eq!(
            container_name("joe", &SessionId::new("abc123")),
            "radiopadre-joe-abc123"
        );
    }

    #[test]
    fn test_run_args() {
        let backend = DockerBackend::new("docker", &ClientConfig::default());
        let spec = LaunchSpec::new(SessionId::new("abc"), 2, "/data");
        let layout = ContainerLayout {
            workdir: "/data".into(),
            home: "/home/joe".into(),
            radiopadre_dir: "/home/joe/.radiopadre".into(),
            session_dir: "/home/joe/.radiopadre/.sessions/radiopadre-joe-abc".into(),
            read_only_workdir: false,
        };
        let args = backend.run_args("radiopadre-joe-abc", &spec, &layout, &[20001, 20002], &[20001, 20002]);

        assert_eq!(&args[..4], &["run", "--rm", "--name", "radiopadre-joe-abc"]);
        assert!(args.contains(&"-d".to_string()));
        assert!(args.contains(&"20001:11001/tcp".to_string()));
        assert!(args.contains(&"20002:11002/tcp".to_string()));
        assert!(args.contains(&"radiopadre.dir=/data".to_string()));
        assert!(args.contains(&"RADIOPADRE_SESSION_ID=abc".to_string()));

        let image = args.iter().position(|a| a == "osmirnov/radiopadre:latest").unwrap();
        assert_eq!(args[image + 1], "run-radiopadre");
        assert_eq!(args[image + 3], "11001:11002:20001:20002");
    }

    #[test]
    fn test_debug_mode_runs_attached() {
        let config = ClientConfig {
            container_debug: true,
            ..ClientConfig::default()
        };
        let backend = DockerBackend::new("docker", &config);
        let spec = LaunchSpec::new(SessionId::new("abc"), 1, "/data");
        let layout = ContainerLayout::new("/data", "/tmp/x");
        let args = backend.run_args("n", &spec, &layout, &[1], &[1]);
        assert!(!args.contains(&"-d".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_run_removes_record() {
        let tmp = tempfile::tempdir().unwrap();
        let sessions = tmp.path().join("sessions");
        let config = ClientConfig {
            grim_reaper: false,
            ..ClientConfig::default()
        };
        let mut backend = DockerBackend::new("false", &config).with_sessions_dir(&sessions);
        let spec = LaunchSpec::new(SessionId::new("abc"), 5, tmp.path());
        let err = backend.launch(&spec, &mut ChildRegistry::new()).await.unwrap_err();

        assert!(matches!(err, TransportError::LaunchFailed(_)));
        assert!(record::list_record_names(&sessions).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_kill_unknown_container_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut backend = DockerBackend::new("docker", &ClientConfig::default()).with_sessions_dir(tmp.path());
        let err = backend.kill_sessions(&[], &["nope".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
