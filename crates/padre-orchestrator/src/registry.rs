//! Registry of every process spawned for a session
//!
//! Port forwarders, browser helpers and the control channel itself are
//! registered here by whoever spawns them and removed only by the teardown
//! routines. The supervisor owns the registry, so no locking is needed.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::process::Stdio;
use std::time::Duration;

use padre_core::process::{self, SignalKind};
use padre_core::TransportError;
use tokio::process::{Child, Command};
use tokio::time::Instant;

/// How long a killed process gets to disappear before it is reported stubborn
pub const KILL_WAIT: Duration = Duration::from_secs(1);

/// Handle to a registered child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChildId(u64);

impl fmt::Display for ChildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "child-{}", self.0)
    }
}

/// What a child is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildRole {
    /// The process whose stdio is the session control channel
    ControlChannel,
    /// A port forwarding process
    Forwarder,
    /// A helper such as a browser
    Helper,
    /// Anything else
    Auxiliary,
}

/// Observed state of a child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Running,
    Exited(Option<i32>),
}

struct ChildEntry {
    label: String,
    role: ChildRole,
    pid: Option<u32>,
    child: Child,
}

/// Outcome of a teardown pass
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Children that exited (on their own or after SIGTERM), with exit codes
    pub exited: Vec<(String, Option<i32>)>,
    /// Children that needed SIGKILL
    pub killed: Vec<String>,
    /// Children still not gone after SIGKILL
    pub stubborn: Vec<String>,
    /// Errors hit along the way
    pub errors: Vec<String>,
}

impl TeardownReport {
    /// Whether everything went away without force
    pub fn is_clean(&self) -> bool {
        self.killed.is_empty() && self.stubborn.is_empty() && self.errors.is_empty()
    }

    /// Fold another report into this one
    pub fn merge(&mut self, other: TeardownReport) {
        self.exited.extend(other.exited);
        self.killed.extend(other.killed);
        self.stubborn.extend(other.stubborn);
        self.errors.extend(other.errors);
    }
}

/// Arena of spawned processes with a uniform terminate/reap contract
#[derive(Default)]
pub struct ChildRegistry {
    next_id: u64,
    children: BTreeMap<ChildId, ChildEntry>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an already spawned child
    pub fn register(&mut self, label: impl Into<String>, role: ChildRole, child: Child) -> ChildId {
        let id = ChildId(self.next_id);
        self.next_id += 1;
        let label = label.into();
        let pid = child.id();
        tracing::debug!(%id, ?pid, ?role, "registered {}", label);
        self.children.insert(
            id,
            ChildEntry {
                label,
                role,
                pid,
                child,
            },
        );
        id
    }

    /// Spawn a command and track it
    ///
    /// The child is killed if the registry is dropped without a teardown.
    pub fn spawn(
        &mut self,
        label: impl Into<String>,
        role: ChildRole,
        cmd: &mut Command,
    ) -> Result<ChildId, TransportError> {
        let label = label.into();
        cmd.kill_on_drop(true);
        let child = spawn_command(cmd, &label)?;
        Ok(self.register(label, role, child))
    }

    /// Spawn a command with stdio detached from ours
    pub fn spawn_quiet(
        &mut self,
        label: impl Into<String>,
        role: ChildRole,
        cmd: &mut Command,
    ) -> Result<ChildId, TransportError> {
        cmd.stdin(Stdio::null()).stdout(Stdio::null());
        self.spawn(label, role, cmd)
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn contains(&self, id: ChildId) -> bool {
        self.children.contains_key(&id)
    }

    /// PID recorded at spawn time
    pub fn pid(&self, id: ChildId) -> Option<u32> {
        self.children.get(&id).and_then(|e| e.pid)
    }

    /// PIDs of every tracked child
    pub fn pids(&self) -> Vec<u32> {
        self.children.values().filter_map(|e| e.pid).collect()
    }

    pub fn label(&self, id: ChildId) -> Option<&str> {
        self.children.get(&id).map(|e| e.label.as_str())
    }

    /// Non-blocking status check
    ///
    /// An untracked id reports as exited with no code.
    pub fn status(&mut self, id: ChildId) -> io::Result<ChildStatus> {
        let Some(entry) = self.children.get_mut(&id) else {
            return Ok(ChildStatus::Exited(None));
        };
        match entry.child.try_wait()? {
            Some(status) => Ok(ChildStatus::Exited(status.code())),
            None => Ok(ChildStatus::Running),
        }
    }

    /// Reap children that have already exited, removing them from the registry
    pub fn scan(&mut self) -> Vec<(ChildId, String, Option<i32>)> {
        let mut dead = Vec::new();
        for (id, entry) in self.children.iter_mut() {
            match entry.child.try_wait() {
                Ok(Some(status)) => dead.push((*id, status.code())),
                Ok(None) => {}
                Err(e) => tracing::warn!("cannot check {} process: {}", entry.label, e),
            }
        }
        dead.into_iter()
            .filter_map(|(id, code)| {
                let entry = self.children.remove(&id)?;
                Some((id, entry.label, code))
            })
            .collect()
    }

    /// Send a signal to a tracked child
    pub fn signal(&mut self, id: ChildId, kind: SignalKind) -> io::Result<()> {
        let Some(entry) = self.children.get_mut(&id) else {
            return Ok(());
        };
        if kind == SignalKind::Kill {
            return entry.child.start_kill();
        }
        match entry.pid {
            Some(pid) if cfg!(unix) => process::send_signal(pid, kind),
            _ => entry.child.start_kill(),
        }
    }

    /// Terminate one child: SIGTERM, wait up to `grace`, then SIGKILL
    pub async fn terminate(&mut self, id: ChildId, grace: Duration) -> TeardownReport {
        self.terminate_ids(vec![id], grace).await
    }

    /// Terminate everything, leaving the registry empty
    ///
    /// Best-effort: a child that fails to die is reported and the remaining
    /// ones are still torn down.
    pub async fn terminate_all(&mut self, grace: Duration) -> TeardownReport {
        let mut report = TeardownReport::default();
        // see who's died
        for (_, label, code) in self.scan() {
            tracing::info!("{} process has died with code {:?}", label, code);
            report.exited.push((label, code));
        }
        let ids: Vec<ChildId> = self.children.keys().copied().collect();
        report.merge(self.terminate_ids(ids, grace).await);
        report
    }

    async fn terminate_ids(&mut self, ids: Vec<ChildId>, grace: Duration) -> TeardownReport {
        let mut report = TeardownReport::default();

        for id in &ids {
            if let Some(label) = self.label(*id).map(str::to_owned) {
                tracing::debug!("terminating {} process", label);
                if let Err(e) = self.signal(*id, SignalKind::Terminate) {
                    if !is_no_such_process(&e) {
                        report.errors.push(format!("{}: {}", label, e));
                    }
                }
            }
        }

        let deadline = Instant::now() + grace;
        let mut stubborn = Vec::new();
        for id in ids {
            let Some(mut entry) = self.children.remove(&id) else {
                continue;
            };
            match tokio::time::timeout_at(deadline, entry.child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(role = ?entry.role, "{} process has exited with code {:?}", entry.label, status.code());
                    report.exited.push((entry.label, status.code()));
                }
                Ok(Err(e)) => {
                    tracing::warn!("error waiting for {} process: {}", entry.label, e);
                    report.errors.push(format!("{}: {}", entry.label, e));
                }
                Err(_) => {
                    tracing::warn!("{} process hasn't terminated -- killing it", entry.label);
                    if let Err(e) = entry.child.start_kill() {
                        report.errors.push(format!("{}: {}", entry.label, e));
                    }
                    stubborn.push(entry);
                }
            }
        }

        let deadline = Instant::now() + KILL_WAIT;
        for mut entry in stubborn {
            match tokio::time::timeout_at(deadline, entry.child.wait()).await {
                Ok(Ok(_)) => report.killed.push(entry.label),
                _ => {
                    tracing::warn!("{} process refuses to die", entry.label);
                    report.stubborn.push(entry.label);
                }
            }
        }

        report
    }
}

#[cfg(unix)]
fn is_no_such_process(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn is_no_such_process(_e: &io::Error) -> bool {
    false
}

/// Spawn a command, mapping a missing executable to `BinaryNotFound`
pub fn spawn_command(cmd: &mut Command, label: &str) -> Result<Child, TransportError> {
    cmd.spawn().map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            TransportError::BinaryNotFound {
                binary: program_name(cmd),
            }
        } else {
            TransportError::LaunchFailed(format!("{}: {}", label, e))
        }
    })
}

/// Program name of a command, for error messages
pub fn program_name(cmd: &Command) -> String {
    cmd.as_std().get_program().to_string_lossy().into_owned()
}
