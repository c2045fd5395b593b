//! End-to-end supervision of local `sh` sessions
#![cfg(unix)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::channel::mpsc;
use padre_core::process::{is_process_alive, SignalKind};
use padre_core::{Session, SessionId, SessionState, TransportError, TransportKind};
use padre_orchestrator::backend::LocalBackend;
use padre_orchestrator::forward::DirectForwarder;
use padre_orchestrator::{
    Backend, ChildRegistry, ChildRole, ControlChannel, ExitReason, Forwarder, LaunchSpec, Liveness,
    ReadyHook, Supervisor, SupervisorOptions,
};
use tempfile::TempDir;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const PORTS_LINE: &str = "Selected ports: 9000:9001:9002:9003:9004:9000:9001:9002:9003:9004";

fn options() -> SupervisorOptions {
    SupervisorOptions {
        shutdown_grace: Duration::from_millis(500),
        poll_interval: Duration::from_millis(50),
        child_grace: Duration::from_millis(500),
        allow_detach: false,
    }
}

fn supervisor(script: &str) -> Supervisor {
    let backend = LocalBackend::new("sh", vec!["-c".into(), script.into()]);
    Supervisor::new(Box::new(backend), Session::new(TransportKind::Venv, 5), options())
}

fn spec(dir: &Path) -> LaunchSpec {
    LaunchSpec::new(SessionId::new("0123abcd"), 5, dir)
}

fn read_pid(dir: &Path) -> u32 {
    std::fs::read_to_string(dir.join("session.pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}

/// One status poll: the answer, and output lines written before answering
type Step = (Result<Liveness, TransportError>, Vec<&'static str>);

/// Backend driven by a fixed script of status answers and output
struct ScriptedBackend {
    steps: VecDeque<Step>,
    output: Option<DuplexStream>,
    signals: Arc<Mutex<Vec<SignalKind>>>,
}

impl ScriptedBackend {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: steps.into(),
            output: None,
            signals: Arc::default(),
        }
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::Kubernetes
    }

    async fn launch(&mut self, _spec: &LaunchSpec, _registry: &mut ChildRegistry) -> Result<ControlChannel, TransportError> {
        let (reader, writer) = tokio::io::duplex(64 * 1024);
        self.output = Some(writer);
        Ok(ControlChannel::from_streams(Some(Box::pin(reader)), None, None))
    }

    async fn poll_status(&mut self, _registry: &mut ChildRegistry) -> Result<Liveness, TransportError> {
        let Some((status, lines)) = self.steps.pop_front() else {
            return Ok(Liveness::Exited(Some(0)));
        };
        if let Some(output) = self.output.as_mut() {
            for line in lines {
                output.write_all(format!("{}\n", line).as_bytes()).await?;
            }
        }
        status
    }

    async fn send_signal(&mut self, kind: SignalKind, _registry: &mut ChildRegistry) -> Result<(), TransportError> {
        self.signals.lock().unwrap().push(kind);
        Ok(())
    }

    fn forwarder(&self) -> Box<dyn Forwarder> {
        Box::new(DirectForwarder)
    }
}

/// Remembers the URLs of every call
#[derive(Default, Clone)]
struct RecordingHook {
    calls: Arc<Mutex<Vec<Vec<String>>>>,
}

#[async_trait]
impl ReadyHook for RecordingHook {
    async fn on_ready(&mut self, urls: &[String], _registry: &mut ChildRegistry) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push(urls.to_vec());
        Ok(())
    }
}

fn scripted_options() -> SupervisorOptions {
    SupervisorOptions {
        shutdown_grace: Duration::from_secs(2),
        poll_interval: Duration::from_millis(20),
        child_grace: Duration::from_millis(200),
        allow_detach: false,
    }
}

/// Counts calls and starts a long-lived helper process
#[derive(Default, Clone)]
struct CountingHook {
    calls: Arc<AtomicUsize>,
    helper_pid: Arc<AtomicU32>,
}

#[async_trait]
impl ReadyHook for CountingHook {
    async fn on_ready(&mut self, _urls: &[String], registry: &mut ChildRegistry) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let id = registry.spawn_quiet("helper", ChildRole::Helper, &mut cmd)?;
        self.helper_pid.store(registry.pid(id).unwrap_or(0), Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_ready_then_exit() {
    let dir = TempDir::new().unwrap();
    let script = format!(
        "echo $$ > session.pid; echo '{}'; echo 'Browse to URL: http://localhost:9000/?token=0123abcd'; \
         echo 'jupyter notebook server is running'; read x",
        PORTS_LINE
    );
    let mut sup = supervisor(&script);
    let (tx, rx) = mpsc::unbounded();
    tx.unbounded_send("exit".to_string()).unwrap();

    let outcome = sup.run(&spec(dir.path()), rx, CancellationToken::new()).await;

    assert!(matches!(outcome.reason, ExitReason::UserExit));
    assert_eq!(outcome.exit_code(), 0);
    assert!(sup.state_history().contains(&SessionState::Ready));
    assert_eq!(sup.session().state(), SessionState::Terminated);

    let ports = sup.session().ports().unwrap();
    assert_eq!(ports.internal(), &[9000, 9001, 9002, 9003, 9004]);
    assert_eq!(ports.external(), &[9000, 9001, 9002, 9003, 9004]);
    assert_eq!(
        sup.session().launch_urls(),
        &["http://localhost:9000/?token=0123abcd"]
    );

    assert!(sup.registry().is_empty());
    assert!(!is_process_alive(read_pid(dir.path())));
    drop(tx);
}

#[tokio::test]
async fn test_ignored_sigterm_is_killed_after_grace() {
    let dir = TempDir::new().unwrap();
    let script = "trap 'touch term.seen' TERM; echo $$ > session.pid; \
                  echo 'jupyter notebook server is running'; while true; do sleep 0.1; done";
    let mut sup = supervisor(script);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let (_tx, rx) = mpsc::unbounded::<String>();
    let started = Instant::now();
    let outcome = sup.run(&spec(dir.path()), rx, cancel).await;
    let elapsed = started.elapsed();

    assert!(matches!(outcome.reason, ExitReason::Interrupted));
    assert_eq!(outcome.exit_code(), 1);
    assert!(elapsed >= Duration::from_millis(300) + options().shutdown_grace);
    assert!(elapsed < Duration::from_secs(5));
    assert!(sup.registry().is_empty());
    // SIGTERM reached the trap and was survived, so only SIGKILL can have ended it
    assert!(dir.path().join("term.seen").exists());
    assert!(!is_process_alive(read_pid(dir.path())));
}

#[tokio::test]
async fn test_remote_exit_code_is_reported() {
    let dir = TempDir::new().unwrap();
    let script = "echo 'jupyter notebook server is running'; sleep 0.2; exit 3";
    let mut sup = supervisor(script);
    let (_tx, rx) = mpsc::unbounded::<String>();

    let outcome = sup.run(&spec(dir.path()), rx, CancellationToken::new()).await;

    assert!(matches!(outcome.reason, ExitReason::RemoteEnded(Some(3))));
    assert_eq!(outcome.exit_code(), 3);
    assert_eq!(outcome.remote_exit_code, Some(3));
    assert!(sup.registry().is_empty());
}

#[tokio::test]
async fn test_helpers_are_torn_down_and_hook_fires_once() {
    let dir = TempDir::new().unwrap();
    let script = "echo 'jupyter notebook server is running'; \
                  echo 'jupyter notebook server is running'; read x";
    let hook = CountingHook::default();
    let mut sup = supervisor(script).with_ready_hook(Box::new(hook.clone()));
    let (tx, rx) = mpsc::unbounded();
    tx.unbounded_send("exit".to_string()).unwrap();

    let outcome = sup.run(&spec(dir.path()), rx, CancellationToken::new()).await;

    assert!(matches!(outcome.reason, ExitReason::UserExit));
    assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    let readies = sup
        .state_history()
        .iter()
        .filter(|s| **s == SessionState::Ready)
        .count();
    assert_eq!(readies, 1);

    let helper = hook.helper_pid.load(Ordering::SeqCst);
    assert_ne!(helper, 0);
    assert!(sup.registry().is_empty());
    assert!(!is_process_alive(helper));
    drop(tx);
}

#[tokio::test]
async fn test_missing_runscript_fails_cleanly() {
    let dir = TempDir::new().unwrap();
    let backend = LocalBackend::new("no-such-runscript-padre", Vec::new());
    let mut sup = Supervisor::new(Box::new(backend), Session::new(TransportKind::Venv, 5), options());
    let (_tx, rx) = mpsc::unbounded::<String>();

    let outcome = sup.run(&spec(dir.path()), rx, CancellationToken::new()).await;

    assert!(matches!(outcome.reason, ExitReason::Failed(_)));
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(sup.session().state(), SessionState::Terminated);
    assert!(sup.registry().is_empty());
}

const READY_LINE: &str = "jupyter notebook server is running";
const FIRST_URL: &str = "Browse to URL: http://localhost:9000/?token=0123abcd";
const SECOND_URL: &str = "Browse to URL: http://localhost:9000/lab?token=0123abcd";

#[tokio::test]
async fn test_disconnect_while_provisioning_then_ready() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedBackend::new(vec![
        (Ok(Liveness::Alive), vec![PORTS_LINE, FIRST_URL]),
        (Ok(Liveness::Unknown), vec![]),
        (Ok(Liveness::Unknown), vec![]),
        (Ok(Liveness::Alive), vec![PORTS_LINE, SECOND_URL]),
        (Ok(Liveness::Alive), vec![READY_LINE]),
        (Ok(Liveness::Unknown), vec![]),
        (Ok(Liveness::Alive), vec![READY_LINE]),
    ]);
    let signals = backend.signals.clone();
    let hook = RecordingHook::default();
    let mut sup = Supervisor::new(
        Box::new(backend),
        Session::new(TransportKind::Kubernetes, 5),
        scripted_options(),
    )
    .with_ready_hook(Box::new(hook.clone()));
    let (_tx, rx) = mpsc::unbounded::<String>();

    let outcome = sup.run(&spec(dir.path()), rx, CancellationToken::new()).await;

    assert!(matches!(outcome.reason, ExitReason::RemoteEnded(Some(0))));
    use SessionState::*;
    assert_eq!(
        sup.state_history(),
        &[Connecting, Provisioning, Connecting, Provisioning, Ready, Interactive, Terminating, Terminated]
    );
    assert_eq!(
        *hook.calls.lock().unwrap(),
        vec![vec![
            "http://localhost:9000/lab?token=0123abcd".to_string(),
            "http://localhost:9000/?token=0123abcd".to_string(),
        ]]
    );
    assert_eq!(sup.session().ports().unwrap().external(), &[9000, 9001, 9002, 9003, 9004]);
    assert!(signals.lock().unwrap().is_empty());
    assert!(sup.registry().is_empty());
}

#[tokio::test]
async fn test_failed_poll_during_grace_does_not_kill() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedBackend::new(vec![
        (Ok(Liveness::Alive), vec![READY_LINE]),
        (Err(TransportError::Rejected("pods is forbidden".into())), vec![]),
        (Ok(Liveness::Alive), vec![]),
    ]);
    let signals = backend.signals.clone();
    let mut sup = Supervisor::new(
        Box::new(backend),
        Session::new(TransportKind::Kubernetes, 5),
        scripted_options(),
    );
    let (tx, rx) = mpsc::unbounded();
    tx.unbounded_send("exit".to_string()).unwrap();

    let started = Instant::now();
    let outcome = sup.run(&spec(dir.path()), rx, CancellationToken::new()).await;

    assert!(matches!(outcome.reason, ExitReason::UserExit));
    assert_eq!(outcome.remote_exit_code, Some(0));
    assert_eq!(*signals.lock().unwrap(), vec![SignalKind::Terminate]);
    assert!(started.elapsed() < scripted_options().shutdown_grace);
    assert_eq!(sup.session().state(), SessionState::Terminated);
    drop(tx);
}
