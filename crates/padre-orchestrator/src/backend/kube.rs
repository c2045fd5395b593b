//! Kubernetes backend
//!
//! The session runs in a pod built from a declarative manifest. There is no
//! process handle to hold on to: liveness comes from polling the pod phase,
//! output from `kubectl logs -f`, and stopping means deleting the pod.
//! Connectivity problems with the API are recoverable and only reported,
//! an explicit rejection (forbidden, unauthorized, invalid) is fatal.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use padre_core::config::{self, ClientConfig, HomeVolume, KubernetesConfig};
use padre_core::process::{current_uid_gid, group_name, SignalKind};
use padre_core::{Session, SessionId, TransportError, TransportKind};
use padre_protocol::BootstrapEvent;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{Backend, CleanupMode, ControlChannel, LaunchSpec, Liveness};
use crate::forward::{Forwarder, KubectlForwarder};
use crate::ports::{default_port_base, suggest_ports};
use crate::registry::{self, ChildRegistry};
use crate::retry::{LinkMonitor, RetryPolicy, Watchdog};

/// Name of the session container inside the pod
const CONTAINER: &str = "padre";

/// Where the data volume is mounted in the pod
const DATA_MOUNT: &str = "/mnt";

/// Phase of a pod as reported by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
    /// The pod no longer exists
    Gone,
}

impl PodPhase {
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    /// Pending or running
    pub fn is_active(&self) -> bool {
        matches!(self, PodPhase::Pending | PodPhase::Running)
    }
}

/// What we need to know about one pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodStatus {
    pub name: String,
    pub phase: PodPhase,
    /// A deletion timestamp is set
    pub deleting: bool,
    /// Exit code of the session container once it has terminated
    pub exit_code: Option<i32>,
}

impl PodStatus {
    /// Status of a pod the API no longer knows about
    pub fn gone(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: PodPhase::Gone,
            deleting: false,
            exit_code: None,
        }
    }

    pub fn liveness(&self) -> Liveness {
        match self.phase {
            PodPhase::Pending | PodPhase::Running => Liveness::Alive,
            PodPhase::Succeeded => Liveness::Exited(self.exit_code.or(Some(0))),
            PodPhase::Failed => Liveness::Exited(self.exit_code.or(Some(1))),
            PodPhase::Unknown => Liveness::Unknown,
            PodPhase::Gone => Liveness::Exited(self.exit_code),
        }
    }
}

/// A pod event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodEvent {
    pub uid: String,
    pub reason: String,
    pub message: String,
}

/// The few pod operations the backend needs
#[async_trait]
pub trait PodApi: Send + Sync {
    async fn create_pod(&self, manifest: &Value) -> Result<(), TransportError>;

    /// Status of one pod; a pod that does not exist reports [`PodPhase::Gone`]
    async fn pod_status(&self, name: &str) -> Result<PodStatus, TransportError>;

    async fn pod_events(&self, name: &str) -> Result<Vec<PodEvent>, TransportError>;

    /// Pods labelled as belonging to `user`
    async fn list_user_pods(&self, user: &str) -> Result<Vec<PodStatus>, TransportError>;

    /// Delete a pod; a pod that is already gone is not an error
    async fn delete_pod(&self, name: &str, force: bool) -> Result<(), TransportError>;

    /// Command following the session container's log, with timestamps
    fn log_command(&self, pod: &str) -> Command;

    /// Command forwarding local port `local` to `remote` in the pod
    fn port_forward_command(&self, pod: &str, local: u16, remote: u16) -> Command;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    uid: String,
    deletion_timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct List<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodJson {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    status: PodStatusJson,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatusJson {
    phase: Option<String>,
    #[serde(default)]
    container_statuses: Vec<ContainerStatusJson>,
}

#[derive(Debug, Deserialize)]
struct ContainerStatusJson {
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: ContainerStateJson,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerStateJson {
    terminated: Option<TerminatedJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminatedJson {
    exit_code: i32,
}

#[derive(Debug, Deserialize)]
struct EventJson {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

impl From<PodJson> for PodStatus {
    fn from(pod: PodJson) -> Self {
        let exit_code = pod
            .status
            .container_statuses
            .iter()
            .find(|c| c.name == CONTAINER)
            .or_else(|| pod.status.container_statuses.first())
            .and_then(|c| c.state.terminated.as_ref())
            .map(|t| t.exit_code);
        PodStatus {
            name: pod.metadata.name,
            phase: pod
                .status
                .phase
                .as_deref()
                .map(PodPhase::parse)
                .unwrap_or(PodPhase::Unknown),
            deleting: pod.metadata.deletion_timestamp.is_some(),
            exit_code,
        }
    }
}

/// Sort kubectl's complaint into the error taxonomy
pub fn classify_kubectl_error(what: &str, stderr: &str) -> TransportError {
    const TRANSIENT: &[&str] = &[
        "Unable to connect to the server",
        "connection refused",
        "i/o timeout",
        "TLS handshake timeout",
        "context deadline exceeded",
        "connection reset",
        "EOF",
    ];
    let detail = format!("{}: {}", what, stderr.trim());
    if TRANSIENT.iter().any(|marker| stderr.contains(marker)) {
        TransportError::Transient(detail)
    } else {
        TransportError::Rejected(detail)
    }
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("(NotFound)") || stderr.contains("not found")
}

/// [`PodApi`] on top of the `kubectl` CLI
#[derive(Debug, Clone)]
pub struct Kubectl {
    bin: PathBuf,
    context: Option<String>,
    namespace: Option<String>,
}

impl Kubectl {
    pub fn new(bin: impl Into<PathBuf>, config: &KubernetesConfig) -> Self {
        Self {
            bin: bin.into(),
            context: config.context.clone(),
            namespace: config.namespace.clone(),
        }
    }

    /// kubectl with the configured context and namespace
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin);
        if let Some(ctx) = &self.context {
            cmd.arg("--context").arg(ctx);
        }
        if let Some(ns) = &self.namespace {
            cmd.arg("--namespace").arg(ns);
        }
        cmd
    }

    /// Run kubectl to completion; returns stdout or the classified failure
    async fn run(&self, what: &str, args: &[&str], input: Option<Vec<u8>>) -> Result<String, TransportError> {
        let mut cmd = self.command();
        cmd.args(args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = registry::spawn_command(&mut cmd, "kubectl")?;
        if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(&data).await?;
        }
        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify_kubectl_error(what, &String::from_utf8_lossy(&output.stderr)))
        }
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(what: &str, text: &str) -> Result<T, TransportError> {
    serde_json::from_str(text)
        .map_err(|e| TransportError::Rejected(format!("unexpected {} output: {}", what, e)))
}

#[async_trait]
impl PodApi for Kubectl {
    async fn create_pod(&self, manifest: &Value) -> Result<(), TransportError> {
        let body = serde_json::to_vec(manifest)
            .map_err(|e| TransportError::LaunchFailed(format!("invalid pod manifest: {}", e)))?;
        self.run("creating pod", &["create", "-f", "-"], Some(body)).await?;
        Ok(())
    }

    async fn pod_status(&self, name: &str) -> Result<PodStatus, TransportError> {
        match self
            .run("reading pod status", &["get", "pod", name, "-o", "json", "--request-timeout=5s"], None)
            .await
        {
            Ok(out) => Ok(parse_json::<PodJson>("pod status", &out)?.into()),
            Err(TransportError::Rejected(detail)) if is_not_found(&detail) => Ok(PodStatus::gone(name)),
            Err(e) => Err(e),
        }
    }

    async fn pod_events(&self, name: &str) -> Result<Vec<PodEvent>, TransportError> {
        let selector = format!("involvedObject.kind=Pod,involvedObject.name={}", name);
        let out = self
            .run(
                "checking for events",
                &["get", "events", "--field-selector", &selector, "-o", "json", "--request-timeout=2s"],
                None,
            )
            .await?;
        let events: List<EventJson> = parse_json("event list", &out)?;
        Ok(events
            .items
            .into_iter()
            .map(|e| PodEvent {
                uid: e.metadata.uid,
                reason: e.reason,
                message: e.message,
            })
            .collect())
    }

    async fn list_user_pods(&self, user: &str) -> Result<Vec<PodStatus>, TransportError> {
        let selector = format!("radiopadre_user={}", user);
        let out = self
            .run("checking for pods", &["get", "pods", "-l", &selector, "-o", "json"], None)
            .await?;
        let pods: List<PodJson> = parse_json("pod list", &out)?;
        Ok(pods.items.into_iter().map(PodStatus::from).collect())
    }

    async fn delete_pod(&self, name: &str, force: bool) -> Result<(), TransportError> {
        let mut args = vec!["delete", "pod", name, "--wait=false"];
        if force {
            args.extend(["--grace-period=0", "--force"]);
        }
        match self.run("deleting pod", &args, None).await {
            Err(TransportError::Rejected(detail)) if is_not_found(&detail) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    fn log_command(&self, pod: &str) -> Command {
        let mut cmd = self.command();
        cmd.args(["logs", "-f", "--timestamps", pod, "-c", CONTAINER]);
        cmd
    }

    fn port_forward_command(&self, pod: &str, local: u16, remote: u16) -> Command {
        let mut cmd = self.command();
        cmd.args(["port-forward", pod]).arg(format!("{}:{}", local, remote));
        cmd
    }
}

/// Identity the pod runs as
#[derive(Debug, Clone)]
pub struct PodUser {
    pub name: String,
    pub group: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: String,
}

impl PodUser {
    /// The local user, with the configured uid/gid overrides
    pub fn local(config: &KubernetesConfig) -> Self {
        let name = config::user_name();
        let (uid, gid) = current_uid_gid();
        Self {
            group: group_name(gid).unwrap_or_else(|| name.clone()),
            uid: config.uid.unwrap_or(uid),
            gid: config.gid.unwrap_or(gid),
            gecos: config::real_name(),
            home: format!("/home/{}", name),
            name,
        }
    }

    pub fn radiopadre_dir(&self) -> String {
        format!("{}/.radiopadre", self.home)
    }
}

/// Pod name for a session
pub fn pod_name(user: &str, session_id: &SessionId) -> String {
    format!("{}-padre-server-{}", user, session_id)
}

/// Split a notebook path relative to the data volume into the directory to
/// mount and the path the session opens
pub fn notebook_location(notebook: Option<&str>) -> (String, String) {
    let path = notebook.unwrap_or("").trim_start_matches('/');
    let dir = if path.is_empty() || path.ends_with('/') {
        path.trim_end_matches('/')
    } else {
        path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
    };
    let dir = if dir.is_empty() { "." } else { dir };
    (dir.to_string(), format!("{}/{}", DATA_MOUNT, path))
}

fn volume_source(name: &str, source: &str) -> Value {
    if source.starts_with('/') {
        json!({ "name": name, "hostPath": { "path": source } })
    } else {
        json!({ "name": name, "persistentVolumeClaim": { "claimName": source } })
    }
}

/// Everything the manifest is built from
pub struct PodRequest<'a> {
    pub name: &'a str,
    pub session_id: &'a SessionId,
    pub image: &'a str,
    pub user: &'a PodUser,
    pub data_volume: &'a str,
    pub notebook: Option<&'a str>,
    pub ports: &'a [u16],
    pub extra_args: &'a [String],
}

/// Build the pod manifest
pub fn pod_manifest(req: &PodRequest<'_>, config: &KubernetesConfig) -> Result<Value, TransportError> {
    let invalid = |e: padre_core::error::ConfigError| TransportError::LaunchFailed(e.to_string());
    let node_selector = config.node_selector_map().map_err(invalid)?;
    let home = config.home_volume().map_err(invalid)?;

    let (notebook_dir, notebook_path) = notebook_location(req.notebook);
    let mut data_mount = json!({ "name": "data", "mountPath": DATA_MOUNT });
    if notebook_dir != "." {
        data_mount["mountPath"] = json!(format!("{}/{}", DATA_MOUNT, notebook_dir));
        data_mount["subPath"] = json!(notebook_dir);
    }
    let mut home_mount = json!({ "name": "home", "mountPath": req.user.home });
    let home_volume = match home {
        HomeVolume::EmptyDir => json!({ "name": "home", "emptyDir": {} }),
        HomeVolume::Ram => json!({ "name": "home", "emptyDir": { "medium": "Memory" } }),
        HomeVolume::Claim { claim, subpath } => {
            home_mount["subPath"] = json!(subpath);
            volume_source("home", &claim)
        }
    };

    let ports = req
        .ports
        .iter()
        .chain(req.ports)
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(":");
    let mut args = vec![
        "--backend".to_string(),
        "venv".to_string(),
        "--inside-container".to_string(),
        ports,
        notebook_path,
    ];
    args.extend(req.extra_args.iter().cloned());

    let mut requests = BTreeMap::new();
    if let Some(cpu) = &config.cpu_request {
        requests.insert("cpu", cpu.clone());
    }
    if let Some(ram) = &config.ram_request {
        requests.insert("memory", ram.clone());
    }

    let user = req.user;
    let env: Vec<Value> = [
        ("USER", user.name.clone()),
        ("GROUP", user.group.clone()),
        ("HOME", user.home.clone()),
        ("USER_UID", user.uid.to_string()),
        ("USER_GID", user.gid.to_string()),
        ("USER_GECOS", user.gecos.clone()),
        ("RADIOPADRE_DIR", user.radiopadre_dir()),
        ("RADIOPADRE_SESSION_ID", req.session_id.to_string()),
        ("RADIOPADRE_CONTAINER_NAME", req.name.to_string()),
    ]
    .into_iter()
    .map(|(name, value)| json!({ "name": name, "value": value }))
    .collect();

    Ok(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": req.name,
            "labels": {
                "radiopadre_user": user.name,
                "radiopadre_session_id": req.session_id.as_str(),
            },
        },
        "spec": {
            "containers": [{
                "name": CONTAINER,
                "image": req.image,
                "imagePullPolicy": "IfNotPresent",
                "args": args,
                "env": env,
                "securityContext": {
                    "runAsNonRoot": user.uid != 0,
                    "runAsUser": user.uid,
                    "runAsGroup": user.gid,
                },
                "volumeMounts": [data_mount, home_mount],
                "resources": { "requests": requests },
            }],
            "volumes": [volume_source("data", req.data_volume), home_volume],
            "restartPolicy": "Never",
            "nodeSelector": node_selector,
        },
    }))
}

/// Drops log lines already seen before a stream was reopened
#[derive(Debug, Default)]
pub struct LogDeduper {
    seen: HashSet<(String, String)>,
}

impl LogDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strip the timestamp; `None` if this line was already delivered
    pub fn process(&mut self, line: &str) -> Option<String> {
        let (timestamp, content) = line.split_once(' ').unwrap_or((line, ""));
        if self.seen.insert((timestamp.to_string(), content.to_string())) {
            Some(content.to_string())
        } else {
            None
        }
    }
}

/// Polls one pod, reporting events and connectivity changes
pub struct PodWatcher {
    pod: String,
    link: LinkMonitor,
    reported: HashSet<String>,
    provisioning: Watchdog,
}

impl PodWatcher {
    pub fn new(pod: impl Into<String>, warn_interval: Duration) -> Self {
        Self {
            pod: pod.into(),
            link: LinkMonitor::new("k8s cluster", "k8s"),
            reported: HashSet::new(),
            provisioning: Watchdog::new(warn_interval),
        }
    }

    pub fn link(&self) -> &LinkMonitor {
        &self.link
    }

    /// Log events not reported before
    pub async fn report_events(&mut self, api: &dyn PodApi) {
        match api.pod_events(&self.pod).await {
            Ok(events) => {
                self.link.record_success();
                for event in events {
                    if self.reported.insert(event.uid.clone()) {
                        tracing::info!("k8s event: {}: {}", event.reason, event.message);
                    }
                }
            }
            Err(e) if e.is_recoverable() => {
                self.link.record_failure(&e);
            }
            Err(e) => tracing::error!("k8s API error checking for events: {}", e),
        }
    }

    /// Current pod status; `None` while the API is unreachable
    pub async fn poll(&mut self, api: &dyn PodApi) -> Result<Option<PodStatus>, TransportError> {
        match api.pod_status(&self.pod).await {
            Ok(status) => {
                self.link.record_success();
                Ok(Some(status))
            }
            Err(e) if e.is_recoverable() => {
                self.link.record_failure(&e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Wait until the pod has started (or failed)
    pub async fn wait_started(&mut self, api: &dyn PodApi, interval: Duration) -> Result<PodStatus, TransportError> {
        self.provisioning.reset();
        loop {
            self.report_events(api).await;
            if let Some(status) = self.poll(api).await? {
                match status.phase {
                    PodPhase::Running | PodPhase::Succeeded => {
                        tracing::info!("radiopadre pod started");
                        return Ok(status);
                    }
                    PodPhase::Failed => {
                        tracing::error!("pod status is failed -- will proceed to collect logs below");
                        return Ok(status);
                    }
                    PodPhase::Gone => {
                        return Err(TransportError::LaunchFailed(format!(
                            "pod {} disappeared before it started",
                            self.pod
                        )));
                    }
                    PodPhase::Pending | PodPhase::Unknown => {}
                }
            }
            if let Some(waited) = self.provisioning.check() {
                tracing::warn!(
                    "Still waiting for pod to start ({}s). Messages above may contain more information.",
                    waited.as_secs()
                );
                tracing::warn!("Press Ctrl+C to give up.");
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// Runs the session in a pod
pub struct KubernetesBackend {
    api: Arc<dyn PodApi>,
    config: KubernetesConfig,
    image: String,
    user: PodUser,
    retry: RetryPolicy,
    poll_interval: Duration,
    pod: Option<String>,
    /// Ports the pod was started with
    ports: Option<Vec<u16>>,
    /// The pod may exist: set before creation, cleared once the API says it is gone
    pod_present: bool,
    /// A (non-forced) delete has been issued
    delete_requested: bool,
    watcher: Option<PodWatcher>,
    logs: LogDeduper,
}

impl KubernetesBackend {
    pub fn new(api: impl PodApi + 'static, config: &ClientConfig) -> Result<Self, TransportError> {
        config
            .kubernetes
            .node_selector_map()
            .map_err(|e| TransportError::LaunchFailed(e.to_string()))?;
        Ok(Self {
            api: Arc::new(api),
            user: PodUser::local(&config.kubernetes),
            config: config.kubernetes.clone(),
            image: config.docker_image.clone(),
            retry: RetryPolicy::new(config.retry.clone()),
            poll_interval: config.poll_interval,
            pod: None,
            ports: None,
            pod_present: false,
            delete_requested: false,
            watcher: None,
            logs: LogDeduper::new(),
        })
    }

    /// Run as someone else (tests, or a cluster-side identity)
    pub fn with_user(mut self, user: PodUser) -> Self {
        self.user = user;
        self
    }

    pub fn pod(&self) -> Option<&str> {
        self.pod.as_deref()
    }

    /// Report (and with auto-cleanup, delete) pods left from earlier runs
    async fn clean_stale_pods(&self) -> Result<(), TransportError> {
        let pods = self.api.list_user_pods(&self.user.name).await?;
        let active: Vec<&PodStatus> = pods.iter().filter(|p| p.phase.is_active() && !p.deleting).collect();
        if active.is_empty() {
            return Ok(());
        }
        tracing::warn!("you have {} radiopadre pod(s) pending or running", active.len());
        if self.config.auto_cleanup {
            for pod in active {
                tracing::warn!("deleting pod {}", pod.name);
                self.api.delete_pod(&pod.name, false).await?;
            }
        }
        Ok(())
    }

    fn follow_logs(&mut self, pod: &str, registry: &mut ChildRegistry) -> Result<ControlChannel, TransportError> {
        let mut cmd = self.api.log_command(pod);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = registry::spawn_command(&mut cmd, "kubectl logs")?;
        Ok(ControlChannel::from_child(registry, format!("kubectl logs {}", pod), child))
    }

    /// Delete the pod; a graceful delete is only issued once, a forced one
    /// whenever the pod may still be there
    async fn delete(&mut self, force: bool) -> Result<(), TransportError> {
        let Some(pod) = self.pod.clone().filter(|_| self.pod_present) else {
            return Ok(());
        };
        if force {
            tracing::warn!("force-deleting pod {}", pod);
        } else if self.delete_requested {
            return Ok(());
        } else {
            tracing::info!("deleting pod {}", pod);
        }
        self.api.delete_pod(&pod, force).await?;
        self.delete_requested = true;
        Ok(())
    }
}

#[async_trait]
impl Backend for KubernetesBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::Kubernetes
    }

    async fn launch(
        &mut self,
        spec: &LaunchSpec,
        registry: &mut ChildRegistry,
    ) -> Result<ControlChannel, TransportError> {
        let data_volume = self.config.data_volume.clone().ok_or_else(|| {
            TransportError::LaunchFailed("no data volume configured for the k8s backend".into())
        })?;
        self.clean_stale_pods().await?;

        let ports = match &spec.userside_ports {
            Some(ports) => ports.clone(),
            None => suggest_ports(spec.num_ports, default_port_base())?,
        };
        let name = pod_name(&self.user.name, &spec.session_id);
        let manifest = pod_manifest(
            &PodRequest {
                name: &name,
                session_id: &spec.session_id,
                image: &self.image,
                user: &self.user,
                data_volume: &data_volume,
                notebook: spec.notebook.as_deref(),
                ports: &ports,
                extra_args: &spec.extra_args,
            },
            &self.config,
        )?;
        tracing::info!(
            "starting radiopadre pod, arguments are: {}",
            manifest["spec"]["containers"][0]["args"]
        );
        tracing::debug!("pod manifest: {}", manifest);

        // from here on cleanup must try to delete the pod
        self.pod = Some(name.clone());
        self.ports = Some(ports.clone());
        self.pod_present = true;
        self.delete_requested = false;
        let api = self.api.clone();
        self.retry
            .run("pod creation", || {
                let api = api.clone();
                let manifest = manifest.clone();
                async move { api.create_pod(&manifest).await }
            })
            .await?;

        let mut watcher = PodWatcher::new(&name, self.config.provisioning_warning);
        let started = watcher.wait_started(self.api.as_ref(), self.poll_interval).await;
        self.watcher = Some(watcher);
        started?;

        let channel = self.follow_logs(&name, registry)?;
        Ok(channel
            .announce(BootstrapEvent::ContainerNameAnnounced(name))
            .announce(BootstrapEvent::SessionIdAnnounced(spec.session_id.to_string()))
            .announce(BootstrapEvent::PortsAnnounced {
                internal: ports.clone(),
                external: ports,
            }))
    }

    async fn reopen(&mut self, registry: &mut ChildRegistry) -> Result<Option<ControlChannel>, TransportError> {
        let Some(pod) = self.pod.clone() else {
            return Ok(None);
        };
        if self.poll_status(registry).await? != Liveness::Alive {
            return Ok(None);
        }
        tracing::debug!("log stream of {} ended, reopening", pod);
        let mut channel = self.follow_logs(&pod, registry)?;
        // earlier lines are deduplicated away, so restate the ports to get
        // dead forwards reopened
        if let Some(ports) = self.ports.clone() {
            channel = channel.announce(BootstrapEvent::PortsAnnounced {
                internal: ports.clone(),
                external: ports,
            });
        }
        Ok(Some(channel))
    }

    fn preprocess_line(&mut self, line: String) -> Option<String> {
        self.logs.process(&line)
    }

    async fn poll_status(&mut self, _registry: &mut ChildRegistry) -> Result<Liveness, TransportError> {
        let Some(pod) = self.pod.clone().filter(|_| self.pod_present) else {
            return Ok(Liveness::Exited(None));
        };
        let api = self.api.clone();
        let watcher = self
            .watcher
            .get_or_insert_with(|| PodWatcher::new(pod.clone(), Duration::from_secs(60)));
        watcher.report_events(api.as_ref()).await;
        Ok(match watcher.poll(api.as_ref()).await? {
            Some(status) if status.phase == PodPhase::Gone => {
                tracing::info!("pod {} is gone", pod);
                self.pod_present = false;
                status.liveness()
            }
            Some(status) => {
                let liveness = status.liveness();
                if let Liveness::Exited(code) = liveness {
                    tracing::info!("container state is 'terminated', exit code is {:?}", code);
                } else if status.deleting {
                    tracing::debug!("pod {} is terminating", pod);
                }
                liveness
            }
            None => Liveness::Unknown,
        })
    }

    /// Pods cannot be signalled: anything but a kill is a graceful delete
    async fn send_signal(&mut self, kind: SignalKind, _registry: &mut ChildRegistry) -> Result<(), TransportError> {
        self.delete(kind == SignalKind::Kill).await
    }

    async fn cleanup(
        &mut self,
        _session: &Session,
        _mode: CleanupMode,
        _registry: &mut ChildRegistry,
    ) -> Result<(), TransportError> {
        self.delete(false).await
    }

    fn forwarder(&self) -> Box<dyn Forwarder> {
        Box::new(KubectlForwarder::new(
            self.api.clone(),
            self.pod.clone().unwrap_or_default(),
        ))
    }
}
