//! Session lifecycle supervision
//!
//! The [`Supervisor`] owns the session, the backend, the port forwards and
//! the child registry. [`Supervisor::run`] multiplexes the control channel's
//! stdout and stderr, the user's keyboard lines, a liveness poll and the
//! cancellation token in one `select!` loop, then always runs the shutdown
//! sequence: graceful stop, forced stop after the grace period, forward
//! teardown, registry teardown, backend cleanup.

use std::time::Duration;

use futures::{Stream, StreamExt};
use padre_core::config::{self, ClientConfig};
use padre_core::{Capabilities, Operation, PadreError, Session, SessionId, SessionState, TransportError};
use padre_protocol::{BootstrapEvent, BootstrapParser, LineCodec, ProtocolError, Severity};
use tokio::io::AsyncWriteExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, BoxedReader, BoxedWriter, CleanupMode, ControlChannel, LaunchSpec, Liveness};
use crate::browser::ReadyHook;
use crate::forward::PortForwardManager;
use crate::registry::{ChildRegistry, TeardownReport, KILL_WAIT};

type LineStream = FramedRead<BoxedReader, LineCodec>;

/// Timing and policy knobs
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// How long a graceful stop may take before the session is killed
    pub shutdown_grace: Duration,
    /// Liveness poll interval
    pub poll_interval: Duration,
    /// Grace given to helper processes on teardown
    pub child_grace: Duration,
    /// Whether `D`/`Q` detaches instead of being ignored
    pub allow_detach: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            child_grace: KILL_WAIT,
            allow_detach: false,
        }
    }
}

impl SupervisorOptions {
    pub fn from_config(config: &ClientConfig, caps: &Capabilities) -> Self {
        Self {
            shutdown_grace: config.shutdown_grace,
            poll_interval: config.poll_interval,
            child_grace: KILL_WAIT,
            allow_detach: caps.supports(Operation::Detach) && config.container_persist,
        }
    }
}

/// Why a session ended
#[derive(Debug)]
pub enum ExitReason {
    /// The user typed `exit`
    UserExit,
    /// The user detached; the remote session keeps running
    Detached,
    /// The session process (or pod) finished by itself
    RemoteEnded(Option<i32>),
    /// Ctrl+C or SIGTERM
    Interrupted,
    /// A fatal error
    Failed(PadreError),
}

/// Result of [`Supervisor::run`]
#[derive(Debug)]
pub struct SessionOutcome {
    pub reason: ExitReason,
    /// Exit code reported by the session, when known
    pub remote_exit_code: Option<i32>,
    pub report: TeardownReport,
}

impl SessionOutcome {
    /// Process exit status for the client
    pub fn exit_code(&self) -> i32 {
        match &self.reason {
            ExitReason::UserExit | ExitReason::Detached => 0,
            ExitReason::RemoteEnded(code) => code.unwrap_or(0),
            ExitReason::Interrupted | ExitReason::Failed(_) => 1,
        }
    }
}

pub struct Supervisor {
    session: Session,
    backend: Box<dyn Backend>,
    forwards: Option<PortForwardManager>,
    registry: ChildRegistry,
    parser: BootstrapParser,
    options: SupervisorOptions,
    ready_hook: Option<Box<dyn ReadyHook>>,
    stdin: Option<BoxedWriter>,
    history: Vec<SessionState>,
    local_host: String,
}

impl Supervisor {
    pub fn new(backend: Box<dyn Backend>, session: Session, options: SupervisorOptions) -> Self {
        let parser = BootstrapParser::new(session.num_ports());
        let history = vec![session.state()];
        Self {
            session,
            backend,
            forwards: None,
            registry: ChildRegistry::new(),
            parser,
            options,
            ready_hook: None,
            stdin: None,
            history,
            local_host: config::local_hostname(),
        }
    }

    /// Run `hook` once the session is ready
    pub fn with_ready_hook(mut self, hook: Box<dyn ReadyHook>) -> Self {
        self.ready_hook = Some(hook);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn registry(&self) -> &ChildRegistry {
        &self.registry
    }

    pub fn forwards(&self) -> Option<&PortForwardManager> {
        self.forwards.as_ref()
    }

    /// Every state the session has been in, in order
    pub fn state_history(&self) -> &[SessionState] {
        &self.history
    }

    /// Launch the session and supervise it until it ends
    ///
    /// `input` yields the user's keyboard lines. Cancelling `cancel` is an
    /// interrupt. Cleanup always runs to completion, whatever ended the
    /// session.
    pub async fn run<I>(&mut self, spec: &LaunchSpec, mut input: I, cancel: CancellationToken) -> SessionOutcome
    where
        I: Stream<Item = String> + Unpin + Send,
    {
        if self.session.session_id.is_none() {
            self.session.session_id = Some(spec.session_id.clone());
        }
        let reason = self.drive(spec, &mut input, &cancel).await;
        match &reason {
            ExitReason::Interrupted => tracing::warn!("interrupted, shutting down the session"),
            ExitReason::Failed(e) => tracing::debug!("session failed: {}", e),
            ExitReason::Detached => tracing::info!("detaching, the session will remain running"),
            ExitReason::UserExit | ExitReason::RemoteEnded(_) => {}
        }
        let (remote_exit_code, report) = self.shutdown(&reason).await;
        let remote_exit_code = match &reason {
            ExitReason::RemoteEnded(code) => *code,
            _ => remote_exit_code,
        };
        SessionOutcome {
            reason,
            remote_exit_code,
            report,
        }
    }

    async fn drive<I>(&mut self, spec: &LaunchSpec, input: &mut I, cancel: &CancellationToken) -> ExitReason
    where
        I: Stream<Item = String> + Unpin + Send,
    {
        let launched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ExitReason::Interrupted,
            result = self.backend.launch(spec, &mut self.registry) => result,
        };
        let channel = match launched {
            Ok(channel) => channel,
            Err(e) => return ExitReason::Failed(e.into()),
        };
        self.transition(SessionState::Provisioning);

        let (mut stdout, mut stderr) = self.attach(channel).await;
        let mut input_open = true;
        let mut tick = tokio::time::interval(self.options.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return ExitReason::Interrupted,

                item = read_line(&mut stdout), if stdout.is_some() => match item {
                    Some(Ok(line)) => self.on_line(line, "stdout").await,
                    Some(Err(e)) => {
                        tracing::warn!("error reading session output: {}", e);
                        stdout = None;
                    }
                    None => stdout = None,
                },

                item = read_line(&mut stderr), if stderr.is_some() => match item {
                    Some(Ok(line)) => self.on_line(line, "stderr").await,
                    Some(Err(e)) => {
                        tracing::warn!("error reading session output: {}", e);
                        stderr = None;
                    }
                    None => stderr = None,
                },

                line = input.next(), if input_open && self.session.state() == SessionState::Interactive => {
                    match line {
                        Some(line) => {
                            if let Some(reason) = self.on_keyboard(&line) {
                                return reason;
                            }
                        }
                        None => input_open = false,
                    }
                }

                _ = tick.tick() => {
                    match self.backend.poll_status(&mut self.registry).await {
                        Ok(Liveness::Exited(code)) => {
                            self.drain(&mut stdout, &mut stderr).await;
                            tracing::info!("session process has exited with code {:?}", code);
                            return ExitReason::RemoteEnded(code);
                        }
                        Ok(Liveness::Unknown) => {
                            if self.session.state() == SessionState::Provisioning {
                                self.transition(SessionState::Connecting);
                            }
                        }
                        Ok(Liveness::Alive) => {
                            if self.session.state() == SessionState::Connecting {
                                self.transition(SessionState::Provisioning);
                            }
                            if stdout.is_none() && stderr.is_none() {
                                match self.backend.reopen(&mut self.registry).await {
                                    Ok(Some(channel)) => {
                                        (stdout, stderr) = self.attach(channel).await;
                                    }
                                    Ok(None) => {}
                                    Err(e) if e.is_recoverable() => tracing::debug!("cannot reopen output yet: {}", e),
                                    Err(e) => return ExitReason::Failed(e.into()),
                                }
                            }
                        }
                        Err(e) if e.is_recoverable() => tracing::debug!("status poll failed: {}", e),
                        Err(e) => return ExitReason::Failed(e.into()),
                    }
                    for (_, label, code) in self.registry.scan() {
                        tracing::warn!("{} process has died with code {:?}", label, code);
                    }
                }
            }
        }
    }

    /// Take over a control channel: apply its known events, keep its stdin
    async fn attach(&mut self, channel: ControlChannel) -> (Option<LineStream>, Option<LineStream>) {
        let ControlChannel {
            stdout,
            stderr,
            stdin,
            announced,
            ..
        } = channel;
        if stdin.is_some() {
            self.stdin = stdin;
        }
        for event in announced {
            self.handle_event(event, "backend").await;
        }
        (
            stdout.map(|r| FramedRead::new(r, LineCodec::new())),
            stderr.map(|r| FramedRead::new(r, LineCodec::new())),
        )
    }

    /// Process output still buffered after the session exited
    async fn drain(&mut self, stdout: &mut Option<LineStream>, stderr: &mut Option<LineStream>) {
        let deadline = Instant::now() + self.options.poll_interval;
        for (stream, source) in [(stdout, "stdout"), (stderr, "stderr")] {
            let Some(lines) = stream.as_mut() else {
                continue;
            };
            while let Ok(Some(Ok(line))) = tokio::time::timeout_at(deadline, lines.next()).await {
                self.on_line(line, source).await;
            }
            *stream = None;
        }
    }

    async fn on_line(&mut self, line: String, source: &'static str) {
        let Some(line) = self.backend.preprocess_line(line) else {
            return;
        };
        let event = self.parser.classify(&line);
        self.handle_event(event, source).await;
    }

    /// Apply one bootstrap event to the session
    pub async fn handle_event(&mut self, event: BootstrapEvent, source: &'static str) {
        tracing::trace!(source, kind = event.kind(), "bootstrap event");
        match event {
            BootstrapEvent::SessionIdAnnounced(id) => {
                let id = SessionId::new(id);
                if self.session.session_id.as_ref() != Some(&id) {
                    tracing::info!("session ID/notebook token is '{}'", id);
                    self.session.session_id = Some(id);
                }
            }
            BootstrapEvent::PortsAnnounced { internal, external } => {
                match self.session.apply_ports(internal, external) {
                    Ok(changed) => {
                        if changed {
                            if let Some(ports) = self.session.ports() {
                                let all: Vec<String> = ports
                                    .internal()
                                    .iter()
                                    .chain(ports.external())
                                    .map(u16::to_string)
                                    .collect();
                                tracing::info!("Selected ports: {}", all.join(":"));
                            }
                        }
                        self.establish_forwards().await;
                    }
                    Err(e) => tracing::warn!("ignoring port announcement: {}", e),
                }
            }
            BootstrapEvent::LaunchUrlAnnounced(url) => {
                tracing::debug!("launch URL {}", url);
                self.session.add_launch_url(url);
            }
            BootstrapEvent::ContainerNameAnnounced(name) => {
                if self.session.container_name.as_deref() != Some(name.as_str()) {
                    tracing::info!("container name: {}", name);
                    self.session.container_name = Some(name);
                }
            }
            BootstrapEvent::RemoteHostnameAnnounced(host) => {
                if self.session.remote_host.as_deref() != Some(host.as_str()) {
                    tracing::info!("radiopadre is running on host {}", host);
                    self.session.remote_host = Some(host);
                    if self.session.ports().is_some() {
                        self.establish_forwards().await;
                    }
                }
            }
            BootstrapEvent::ReadySignal => self.on_ready().await,
            BootstrapEvent::PlainLogLine { text, severity } => log_remote(source, &text, severity),
        }
    }

    /// Host the forwards should point at
    fn forward_target(&self) -> String {
        match &self.session.remote_host {
            Some(host) if *host != self.local_host => host.clone(),
            _ => "localhost".to_string(),
        }
    }

    async fn establish_forwards(&mut self) {
        let Some(ports) = self.session.ports().cloned() else {
            return;
        };
        let target = self.forward_target();
        let backend = &self.backend;
        let forwards = self
            .forwards
            .get_or_insert_with(|| PortForwardManager::new(backend.forwarder()));
        if let Err(e) = forwards.establish(&ports, &target, &mut self.registry).await {
            tracing::error!("failed to forward ports: {}", e);
        }
    }

    async fn on_ready(&mut self) {
        if self.session.state() == SessionState::Connecting {
            self.transition(SessionState::Provisioning);
        }
        if self.session.state() != SessionState::Provisioning {
            tracing::debug!("ignoring repeated ready signal in state {}", self.session.state());
            return;
        }
        self.transition(SessionState::Ready);

        let urls = self.session.urls_for_display();
        for url in &urls {
            tracing::info!("Browse to URL: {}", url);
        }
        if let Some(mut hook) = self.ready_hook.take() {
            if let Err(e) = hook.on_ready(&urls, &mut self.registry).await {
                tracing::warn!("ready hook failed: {}", e);
            }
        }
        tracing::info!("the radiopadre session is now fully up");

        self.transition(SessionState::Interactive);
        self.prompt();
    }

    fn prompt(&self) {
        if self.options.allow_detach {
            tracing::info!("Type 'exit' to kill the session, or D<Enter> to detach from it. Ctrl+C also kills it.");
        } else {
            tracing::info!("Type 'exit' to kill the session, or use Ctrl+C.");
        }
    }

    fn on_keyboard(&self, line: &str) -> Option<ExitReason> {
        let line = line.trim();
        if line.eq_ignore_ascii_case("exit") {
            return Some(ExitReason::UserExit);
        }
        let first = line.chars().next().map(|c| c.to_ascii_uppercase());
        if matches!(first, Some('D') | Some('Q')) {
            if self.options.allow_detach {
                return Some(ExitReason::Detached);
            }
            tracing::warn!("this session cannot be detached from");
        }
        if !line.is_empty() {
            self.prompt();
        }
        None
    }

    fn transition(&mut self, next: SessionState) {
        match self.session.transition(next) {
            Ok(()) => self.history.push(next),
            Err(e) => tracing::debug!("{}", e),
        }
    }

    /// Graceful stop: write `exit`, ask the backend, poll until the grace
    /// period runs out, then force
    async fn stop_session(&mut self) -> Option<i32> {
        if let Some(mut stdin) = self.stdin.take() {
            let written = async {
                stdin.write_all(b"exit\n").await?;
                stdin.flush().await
            };
            if let Err(e) = written.await {
                tracing::debug!("could not send exit to the session: {}", e);
            }
        }
        if let Err(e) = self.backend.request_stop(&self.session, &mut self.registry).await {
            tracing::warn!("failed to stop the session: {}", e);
        }

        let deadline = Instant::now() + self.options.shutdown_grace;
        loop {
            // a failed check counts as unknown; only the deadline escalates
            match self.backend.poll_status(&mut self.registry).await {
                Ok(Liveness::Exited(code)) => return code,
                Ok(_) => {}
                Err(e) => tracing::warn!("cannot check whether the session has stopped: {}", e),
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.options.poll_interval.min(deadline - now)).await;
        }

        tracing::warn!(
            "session did not stop within {:?}, killing it",
            self.options.shutdown_grace
        );
        if let Err(e) = self.backend.force_stop(&self.session, &mut self.registry).await {
            tracing::warn!("failed to kill the session: {}", e);
        }
        None
    }

    async fn shutdown(&mut self, reason: &ExitReason) -> (Option<i32>, TeardownReport) {
        self.transition(SessionState::Terminating);
        let mode = match reason {
            ExitReason::Detached => CleanupMode::Detach,
            _ => CleanupMode::Teardown,
        };

        let mut exit_code = None;
        if mode == CleanupMode::Teardown && !matches!(reason, ExitReason::RemoteEnded(_)) {
            exit_code = self.stop_session().await;
        }
        self.stdin = None;

        if let Some(forwards) = self.forwards.as_mut() {
            forwards.teardown_all(&mut self.registry).await;
        }
        let mut report = self.registry.terminate_all(self.options.child_grace).await;
        if let Err(e) = self.backend.cleanup(&self.session, mode, &mut self.registry).await {
            tracing::warn!("cleanup failed: {}", e);
            report.errors.push(e.to_string());
        }
        if !self.registry.is_empty() {
            report.merge(self.registry.terminate_all(self.options.child_grace).await);
        }

        self.transition(SessionState::Terminated);
        (exit_code, report)
    }
}

async fn read_line(stream: &mut Option<LineStream>) -> Option<Result<String, ProtocolError>> {
    match stream {
        Some(lines) => lines.next().await,
        None => std::future::pending().await,
    }
}

fn log_remote(source: &'static str, text: &str, severity: Severity) {
    match severity {
        Severity::Error => tracing::error!(source, "{}", text),
        Severity::Warning => tracing::warn!(source, "{}", text),
        Severity::Debug => tracing::debug!(source, "{}", text),
        Severity::Info => tracing::info!(source, "{}", text),
    }
}

impl From<TransportError> for ExitReason {
    fn from(e: TransportError) -> Self {
        ExitReason::Failed(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use async_trait::async_trait;
    use padre_core::TransportKind;
    use std::sync::{Arc, Mutex};

    fn supervisor(allow_detach: bool) -> Supervisor {
        let options = SupervisorOptions {
            allow_detach,
            ..SupervisorOptions::default()
        };
        Supervisor::new(
            Box::new(LocalBackend::new("true", Vec::new())),
            Session::new(TransportKind::Venv, 2),
            options,
        )
    }

    #[tokio::test]
    async fn test_ready_fires_once() {
        let mut sup = supervisor(false);
        sup.transition(SessionState::Provisioning);
        sup.handle_event(BootstrapEvent::LaunchUrlAnnounced("http://a".into()), "stdout").await;
        sup.handle_event(BootstrapEvent::ReadySignal, "stdout").await;
        sup.handle_event(BootstrapEvent::ReadySignal, "stdout").await;
        assert_eq!(sup.session().state(), SessionState::Interactive);
        let readies = sup.state_history().iter().filter(|s| **s == SessionState::Ready).count();
        assert_eq!(readies, 1);
    }

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

    #[tokio::test]
    async fn test_ready_in_any_order_with_ports_and_url() {
        let ports = || BootstrapEvent::PortsAnnounced {
            internal: vec![9000, 9001],
            external: vec![9000, 9001],
        };
        let url = || BootstrapEvent::LaunchUrlAnnounced("http://localhost:9000/".into());
        let orders: [[usize; 3]; 6] = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

        for order in orders {
            let hook = RecordingHook::default();
            let mut sup = supervisor(false).with_ready_hook(Box::new(hook.clone()));
            sup.transition(SessionState::Provisioning);
            for i in order {
                let event = match i {
                    0 => ports(),
                    1 => url(),
                    _ => BootstrapEvent::ReadySignal,
                };
                sup.handle_event(event, "stdout").await;
            }
            sup.handle_event(BootstrapEvent::ReadySignal, "stdout").await;

            let calls = hook.calls.lock().unwrap().clone();
            assert_eq!(calls.len(), 1, "order {:?}", order);
            let url_before_ready = order.iter().position(|i| *i == 1) < order.iter().position(|i| *i == 2);
            let expected: Vec<String> = if url_before_ready {
                vec!["http://localhost:9000/".into()]
            } else {
                Vec::new()
            };
            assert_eq!(calls[0], expected, "order {:?}", order);
            assert_eq!(sup.session().launch_urls(), &["http://localhost:9000/"]);
            assert_eq!(sup.session().ports().unwrap().external(), &[9000, 9001]);
            assert_eq!(sup.forwards().unwrap().tunnel_count(), 2);
            assert_eq!(sup.session().state(), SessionState::Interactive);
        }
    }

    #[tokio::test]
    async fn test_repeated_ports_do_not_duplicate_tunnels() {
        let mut sup = supervisor(false);
        let ports = || BootstrapEvent::PortsAnnounced {
            internal: vec![9000, 9001],
            external: vec![9000, 9001],
        };
        sup.handle_event(ports(), "stdout").await;
        sup.handle_event(ports(), "stdout").await;
        assert_eq!(sup.forwards().unwrap().tunnel_count(), 2);
    }

    #[tokio::test]
    async fn test_bad_port_count_is_ignored() {
        let mut sup = supervisor(false);
        sup.handle_event(
            BootstrapEvent::PortsAnnounced {
                internal: vec![1, 2, 3],
                external: vec![1, 2, 3],
            },
            "stdout",
        )
        .await;
        assert!(sup.session().ports().is_none());
        assert!(sup.forwards().is_none());
    }

    #[test]
    fn test_keyboard_commands() {
        let sup = supervisor(true);
        assert!(matches!(sup.on_keyboard("exit"), Some(ExitReason::UserExit)));
        assert!(matches!(sup.on_keyboard(" EXIT "), Some(ExitReason::UserExit)));
        assert!(matches!(sup.on_keyboard("d"), Some(ExitReason::Detached)));
        assert!(matches!(sup.on_keyboard("Quit"), Some(ExitReason::Detached)));
        assert!(sup.on_keyboard("hello").is_none());

        let no_detach = supervisor(false);
        assert!(no_detach.on_keyboard("D").is_none());
    }

    #[test]
    fn test_exit_codes() {
        let outcome = |reason| SessionOutcome {
            reason,
            remote_exit_code: None,
            report: TeardownReport::default(),
        };
        assert_eq!(outcome(ExitReason::UserExit).exit_code(), 0);
        assert_eq!(outcome(ExitReason::Detached).exit_code(), 0);
        assert_eq!(outcome(ExitReason::Interrupted).exit_code(), 1);
        assert_eq!(outcome(ExitReason::RemoteEnded(Some(3))).exit_code(), 3);
        assert_eq!(outcome(ExitReason::RemoteEnded(None)).exit_code(), 0);
        let failed: ExitReason = TransportError::LaunchFailed("x".into()).into();
        assert_eq!(outcome(failed).exit_code(), 1);
    }

    #[test]
    fn test_forward_target() {
        let mut sup = supervisor(false);
        assert_eq!(sup.forward_target(), "localhost");
        sup.session.remote_host = Some(sup.local_host.clone());
        assert_eq!(sup.forward_target(), "localhost");
        sup.session.remote_host = Some("node7".into());
        assert_eq!(sup.forward_target(), "node7");
    }
}
