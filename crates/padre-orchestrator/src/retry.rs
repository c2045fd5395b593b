//! Retry policy for transient transport failures
//!
//! Errors are split into recoverable ([`TransportError::Transient`]) and
//! fatal ones. Recoverable failures are retried with exponential backoff;
//! fatal ones are returned immediately. While a link is down the user is
//! told so once, and told again when it comes back.

use std::future::Future;
use std::time::Duration;

use padre_core::config::RetryConfig;
use padre_core::TransportError;
use tokio::time::Instant;

/// Exponential backoff with jitter
pub struct ExponentialBackoff {
    /// Initial delay, restored by `reset`
    initial: Duration,
    /// Current delay
    current: Duration,
    /// Maximum delay
    max: Duration,
    /// Multiplier
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    /// Create a new backoff with custom parameters
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            current: initial,
            max,
            multiplier,
            jitter,
        }
    }

    /// Get the next delay and advance the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = std::cmp::min(next, self.max);

        let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        delay + Duration::from_secs_f64(jitter_amount)
    }

    /// Reset the backoff to its initial delay
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Emits a reminder at a fixed interval while something is taking long
#[derive(Debug)]
pub struct Watchdog {
    started: Instant,
    interval: Duration,
    next: Instant,
}

impl Watchdog {
    pub fn new(interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            interval,
            next: now + interval,
        }
    }

    /// Time since the watchdog was started or reset
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Returns the elapsed time when a reminder is due, and schedules the next one
    pub fn check(&mut self) -> Option<Duration> {
        let now = Instant::now();
        if now < self.next {
            return None;
        }
        self.next = now + self.interval;
        Some(now - self.started)
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.interval);
    }
}

/// Change in link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTransition {
    Lost,
    Resumed,
}

/// Tracks whether a remote API is reachable and logs each change once
#[derive(Debug)]
pub struct LinkMonitor {
    /// What we lose the connection to, e.g. "k8s cluster"
    target: String,
    /// Short name used when the link resumes, e.g. "k8s"
    label: String,
    connected: bool,
    history: Vec<LinkTransition>,
}

impl LinkMonitor {
    pub fn new(target: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            label: label.into(),
            connected: true,
            history: Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Transitions seen so far, oldest first
    pub fn history(&self) -> &[LinkTransition] {
        &self.history
    }

    /// Record a failed call; logs a warning on the first failure in a row
    pub fn record_failure(&mut self, err: &TransportError) -> Option<LinkTransition> {
        if !self.connected {
            tracing::debug!("{} still unreachable: {}", self.target, err);
            return None;
        }
        self.connected = false;
        tracing::warn!("lost connection to {}: {}", self.target, err);
        tracing::warn!("this is not fatal if the connection eventually resumes");
        tracing::warn!("use Ctrl+C if you want to give up");
        self.history.push(LinkTransition::Lost);
        Some(LinkTransition::Lost)
    }

    /// Record a successful call; logs once if the link had been lost
    pub fn record_success(&mut self) -> Option<LinkTransition> {
        if self.connected {
            return None;
        }
        self.connected = true;
        tracing::info!("{} connection resumed", self.label);
        self.history.push(LinkTransition::Resumed);
        Some(LinkTransition::Resumed)
    }
}

/// Bounded or unbounded retry of recoverable failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    /// Interval between "still retrying" reminders
    warn_interval: Duration,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            warn_interval: Duration::from_secs(60),
        }
    }

    pub fn with_warn_interval(mut self, interval: Duration) -> Self {
        self.warn_interval = interval;
        self
    }

    /// Run `op` until it succeeds, fails fatally, or runs out of attempts
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut backoff = ExponentialBackoff::from_config(&self.config);
        let mut watchdog = Watchdog::new(self.warn_interval);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!("{} succeeded after {} attempts", what, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_recoverable() => {
                    if let Some(max) = self.config.max_attempts {
                        if attempt >= max {
                            tracing::warn!("{} failed {} times, giving up: {}", what, attempt, e);
                            return Err(e);
                        }
                    }
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        "{} failed (attempt {}): {}; retrying in {:.1}s",
                        what,
                        attempt,
                        e,
                        delay.as_secs_f64()
                    );
                    if let Some(elapsed) = watchdog.check() {
                        tracing::warn!(
                            "still retrying {} after {}s, press Ctrl+C to give up",
                            what,
                            elapsed.as_secs()
                        );
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
