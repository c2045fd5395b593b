//! Starting, resuming and supervising a session

use std::path::PathBuf;

use anyhow::{Context, Result};
use futures::channel::mpsc;
use padre_core::config::ClientConfig;
use padre_core::{Operation, Session, SessionId, TransportKind};
use padre_orchestrator::backend::{identify_session, select_backend};
use padre_orchestrator::{
    Backend, BrowserHook, ExitReason, LaunchSpec, Supervisor, SupervisorOptions,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::output::{format_teardown, print_info, print_warning};

/// What `padre load` should start
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Notebook or subdirectory to open
    pub notebook: Option<String>,
    /// Mount the work directory read-only
    pub read_only: bool,
    /// Userside ports chosen by a calling client
    pub userside_ports: Option<Vec<u16>>,
    /// Extra runscript arguments
    pub extra_args: Vec<String>,
    /// Session directory; defaults to the current directory
    pub workdir: Option<PathBuf>,
}

/// Start a new session and supervise it until it ends
///
/// Returns the process exit code.
pub async fn load_command(
    config: &ClientConfig,
    preferred: Option<TransportKind>,
    options: LoadOptions,
    cancel: CancellationToken,
) -> Result<i32> {
    let backend = select_backend(preferred, config)?;
    let workdir = match options.workdir {
        Some(dir) => dir,
        None => std::env::current_dir().context("cannot determine the current directory")?,
    };

    let mut spec = LaunchSpec::new(SessionId::generate(), config.num_ports, workdir);
    spec.notebook = options.notebook;
    spec.read_only_workdir = options.read_only;
    spec.userside_ports = options.userside_ports;
    spec.extra_args = options.extra_args;

    tracing::debug!(session_id = %spec.session_id, "launching {} session", backend.kind());
    supervise(config, backend, spec, cancel).await
}

/// Reattach to a running session, by ordinal or container id
pub async fn resume_command(
    config: &ClientConfig,
    preferred: Option<TransportKind>,
    session: Option<&str>,
    cancel: CancellationToken,
) -> Result<i32> {
    let mut backend = select_backend(preferred, config)?;
    let caps = backend.capabilities();
    caps.require(Operation::Resume)?;

    let sessions = backend.list_sessions().await?;
    if sessions.is_empty() {
        anyhow::bail!("no running sessions to resume");
    }
    let info = identify_session(&caps, &sessions, session.unwrap_or("0"))?.clone();
    print_info(&format!("Resuming session {} in {}", info.session_id, info.workdir));

    let mut spec = LaunchSpec::new(info.session_id.clone(), config.num_ports, info.workdir.clone());
    spec.resume = Some(info);
    supervise(config, backend, spec, cancel).await
}

async fn supervise(
    config: &ClientConfig,
    backend: Box<dyn Backend>,
    spec: LaunchSpec,
    cancel: CancellationToken,
) -> Result<i32> {
    let caps = backend.capabilities();
    let session = Session::new(backend.kind(), spec.num_ports).with_session_id(spec.session_id.clone());
    let mut supervisor = Supervisor::new(backend, session, SupervisorOptions::from_config(config, &caps));
    if let Some(hook) = BrowserHook::from_config(&config.browser) {
        supervisor = supervisor.with_ready_hook(Box::new(hook));
    }

    let outcome = supervisor.run(&spec, keyboard_lines(), cancel).await;
    if let Some(summary) = format_teardown(&outcome.report) {
        print_warning(&summary);
    }

    let code = outcome.exit_code();
    match outcome.reason {
        ExitReason::Failed(e) => Err(e).context("session failed"),
        ExitReason::Detached => {
            if let Some(id) = &supervisor.session().container_name {
                print_info(&format!("Session {} is still running; use `padre resume` to reattach", id));
            }
            Ok(code)
        }
        _ => Ok(code),
    }
}

/// Lines typed on stdin, read on a background task
fn keyboard_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.unbounded_send(line).is_err() {
                break;
            }
        }
    });
    rx
}
