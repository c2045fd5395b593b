//! Singularity backend
//!
//! Runs the image as a named instance. Singularity shares the host network,
//! so the ports the launcher picks are the ports we use, and there is no
//! label support for `ps`-style listing.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use padre_core::config::{self, ClientConfig};
use padre_core::process::SignalKind;
use padre_core::record::{self, SessionRecord};
use padre_core::{PortMap, Session, TransportError, TransportKind};
use padre_protocol::BootstrapEvent;
use tokio::process::Command;

use super::container::{discard_record, runscript_args, ContainerLayout};
use super::docker::container_name;
use super::{
    check_output, child_liveness, signal_child, Backend, CleanupMode, ControlChannel, LaunchSpec,
    Liveness, SessionInfo,
};
use crate::forward::{DirectForwarder, Forwarder};
use crate::ports::{default_port_base, suggest_ports};
use crate::registry::{self, ChildId, ChildRegistry};

/// Local image built from the Docker image
pub fn image_path(radiopadre_dir: &Path, docker_image: &str) -> PathBuf {
    radiopadre_dir.join(format!("{}.singularity.img", docker_image.replace('/', "_")))
}

pub struct SingularityBackend {
    singularity: PathBuf,
    image: PathBuf,
    runscript: String,
    user: String,
    sessions_dir: PathBuf,
    instance: Option<String>,
    child: Option<ChildId>,
}

impl SingularityBackend {
    pub fn new(singularity: impl Into<PathBuf>, config: &ClientConfig) -> Self {
        Self {
            singularity: singularity.into(),
            image: image_path(&config::radiopadre_dir(), &config.docker_image),
            runscript: config.runscript.clone(),
            user: config::user_name(),
            sessions_dir: config::sessions_dir(),
            instance: None,
            child: None,
        }
    }

    /// `instance.start` argument list
    pub fn start_args(&self, name: &str, layout: &ContainerLayout) -> Vec<String> {
        let mut args = vec![
            "instance.start".to_string(),
            "--workdir".to_string(),
            layout.workdir.display().to_string(),
        ];
        for mount in layout.mounts(false) {
            args.push("-B".into());
            args.push(mount.to_arg());
        }
        args.push(self.image.display().to_string());
        args.push(name.to_string());
        args
    }

    async fn start_instance(&self, name: &str, layout: &ContainerLayout) -> Result<(), TransportError> {
        layout.prepare()?;
        tracing::info!("starting singularity instance {}", name);
        tracing::info!("(if the image is not yet cached locally, this can take a few minutes the first time)");
        let mut start = Command::new(&self.singularity);
        start.args(self.start_args(name, layout));
        check_output(&mut start, "singularity instance.start").await?;
        Ok(())
    }

    async fn stop_instance(&self, name: &str) -> Result<(), TransportError> {
        let mut cmd = Command::new(&self.singularity);
        cmd.arg("instance.stop").arg(&self.image).arg(name);
        check_output(&mut cmd, "singularity instance.stop").await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for SingularityBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::Singularity
    }

    async fn launch(
        &mut self,
        spec: &LaunchSpec,
        registry: &mut ChildRegistry,
    ) -> Result<ControlChannel, TransportError> {
        if !self.image.exists() {
            return Err(TransportError::LaunchFailed(format!(
                "singularity image {} not found",
                self.image.display()
            )));
        }

        let name = container_name(&self.user, &spec.session_id);
        let selected = suggest_ports(spec.num_ports, default_port_base())?;
        let userside = spec.userside_ports.clone().unwrap_or_else(|| selected.clone());
        let ports = PortMap::new(selected.clone(), userside.clone(), spec.num_ports)
            .map_err(|e| TransportError::LaunchFailed(e.to_string()))?;
        SessionRecord::new(spec.session_id.clone(), ports).save(&self.sessions_dir, &name)?;

        let mut layout = ContainerLayout::new(&spec.workdir, record::record_dir(&self.sessions_dir, &name));
        layout.read_only_workdir = spec.read_only_workdir;
        if let Err(e) = self.start_instance(&name, &layout).await {
            discard_record(&self.sessions_dir, &name);
            return Err(e);
        }
        self.instance = Some(name.clone());

        let mut cmd = Command::new(&self.singularity);
        cmd.arg("exec")
            .arg(format!("instance://{}", name))
            .args(runscript_args(
                &self.runscript,
                &selected,
                &userside,
                &spec.workdir,
                &spec.trailing_args(),
            ))
            .env("RADIOPADRE_CONTAINER_NAME", &name)
            .env("RADIOPADRE_SESSION_ID", spec.session_id.as_str())
            .env("XDG_RUNTIME_DIR", "")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = registry::spawn_command(&mut cmd, "singularity exec")?;
        let channel = ControlChannel::from_child(registry, format!("singularity {}", name), child);
        self.child = channel.child;

        Ok(channel
            .announce(BootstrapEvent::ContainerNameAnnounced(name))
            .announce(BootstrapEvent::SessionIdAnnounced(spec.session_id.to_string()))
            .announce(BootstrapEvent::PortsAnnounced {
                internal: selected,
                external: userside,
            }))
    }

    async fn poll_status(&mut self, registry: &mut ChildRegistry) -> Result<Liveness, TransportError> {
        child_liveness(registry, self.child)
    }

    async fn send_signal(&mut self, kind: SignalKind, registry: &mut ChildRegistry) -> Result<(), TransportError> {
        signal_child(registry, self.child, kind)
    }

    async fn cleanup(
        &mut self,
        _session: &Session,
        _mode: CleanupMode,
        _registry: &mut ChildRegistry,
    ) -> Result<(), TransportError> {
        // instances do not outlive the client
        let Some(name) = self.instance.take() else {
            return Ok(());
        };
        tracing::info!("stopping singularity instance {}", name);
        let stopped = self.stop_instance(&name).await;
        record::remove_record(&self.sessions_dir, &name)?;
        stopped
    }

    fn forwarder(&self) -> Box<dyn Forwarder> {
        Box::new(DirectForwarder)
    }

    async fn list_sessions(&mut self) -> Result<Vec<SessionInfo>, TransportError> {
        Ok(Vec::new())
    }
}
