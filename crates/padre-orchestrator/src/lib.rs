//! padre-orchestrator: launches and supervises radiopadre sessions
//!
//! A [`Supervisor`] asks a transport [`Backend`] to launch the session,
//! feeds every line the session prints through the bootstrap parser,
//! establishes port forwards as ports are announced, and on exit tears
//! down everything recorded in the [`ChildRegistry`].

pub mod backend;
pub mod browser;
pub mod forward;
pub mod ports;
pub mod registry;
pub mod retry;
pub mod supervisor;

pub use backend::{Backend, CleanupMode, ControlChannel, LaunchSpec, Liveness, SessionInfo};
pub use browser::{BrowserHook, ReadyHook};
pub use forward::{ForwardedPort, Forwarder, PortForwardManager, TunnelHandle};
pub use registry::{ChildId, ChildRegistry, ChildRole, TeardownReport};
pub use retry::{ExponentialBackoff, LinkMonitor, LinkTransition, RetryPolicy, Watchdog};
pub use supervisor::{ExitReason, SessionOutcome, Supervisor, SupervisorOptions};
