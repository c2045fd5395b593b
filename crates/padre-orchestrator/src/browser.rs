//! Actions run once when a session becomes ready

use std::process::Stdio;

use async_trait::async_trait;
use padre_core::config::BrowserConfig;
use padre_core::TransportError;
use tokio::process::Command;

use crate::registry::{self, ChildRegistry, ChildRole};

/// Called exactly once, on the transition to Ready
#[async_trait]
pub trait ReadyHook: Send {
    async fn on_ready(&mut self, urls: &[String], registry: &mut ChildRegistry) -> Result<(), TransportError>;
}

/// Opens the launch URLs in a browser
#[derive(Debug, Clone)]
pub struct BrowserHook {
    command: String,
    multi: bool,
    background: bool,
}

impl BrowserHook {
    pub fn new(command: impl Into<String>, multi: bool, background: bool) -> Self {
        Self {
            command: command.into(),
            multi,
            background,
        }
    }

    /// Hook for the configured browser; `None` when no browser is set
    pub fn from_config(config: &BrowserConfig) -> Option<Self> {
        let command = config.command.as_deref()?.trim();
        if command.is_empty() || command.eq_ignore_ascii_case("none") {
            return None;
        }
        let command = if command == "default" { default_opener() } else { command };
        Some(Self::new(command, config.multi, config.background))
    }

    /// One argument list per browser invocation
    pub fn invocations(&self, urls: &[String]) -> Vec<Vec<String>> {
        if self.multi {
            vec![urls.to_vec()]
        } else {
            urls.iter().map(|u| vec![u.clone()]).collect()
        }
    }
}

fn default_opener() -> &'static str {
    if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    }
}

#[async_trait]
impl ReadyHook for BrowserHook {
    async fn on_ready(&mut self, urls: &[String], registry: &mut ChildRegistry) -> Result<(), TransportError> {
        if urls.is_empty() {
            return Ok(());
        }
        tracing::info!("running {} {}", self.command, urls.join(" "));
        tracing::info!("  if this fails, specify a correct browser invocation command with --browser and rerun,");
        tracing::info!("  or else browse to the URL given above (\"Browse to URL:\") yourself.");

        for args in self.invocations(urls) {
            let mut cmd = Command::new(&self.command);
            cmd.args(&args).stdin(Stdio::null()).stdout(Stdio::null());
            let result = if self.background {
                registry
                    .spawn(format!("browser {}", args.join(" ")), ChildRole::Helper, &mut cmd)
                    .map(|_| ())
            } else {
                match registry::spawn_command(&mut cmd, &self.command) {
                    Ok(child) => child.wait_with_output().await.map(|_| ()).map_err(Into::into),
                    Err(e) => Err(e),
                }
            };
            match result {
                Ok(()) => {}
                Err(TransportError::BinaryNotFound { binary }) => {
                    tracing::warn!("{} not found", binary);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
