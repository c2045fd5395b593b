//! Listing and killing running sessions

use anyhow::Result;
use padre_core::config::ClientConfig;
use padre_core::{Operation, TransportKind};
use padre_orchestrator::backend::{identify_session, select_backend};

use crate::output::{format_sessions, print_success, print_warning};

/// List running sessions of this user
pub async fn ps_command(config: &ClientConfig, preferred: Option<TransportKind>) -> Result<()> {
    let mut backend = select_backend(preferred, config)?;
    backend.capabilities().require(Operation::ListSessions)?;

    let sessions = backend.list_sessions().await?;
    println!("{}", format_sessions(&sessions));
    Ok(())
}

/// Kill sessions given by ordinal or container id; `all` kills everything
pub async fn kill_command(
    config: &ClientConfig,
    preferred: Option<TransportKind>,
    targets: &[String],
) -> Result<()> {
    let mut backend = select_backend(preferred, config)?;
    let caps = backend.capabilities();
    caps.require(Operation::KillSessions)?;

    let sessions = backend.list_sessions().await?;
    if sessions.is_empty() {
        print_warning("No running sessions");
        return Ok(());
    }

    let ids: Vec<String> = if targets.iter().any(|t| t == "all") {
        sessions.iter().map(|s| s.container_id.clone()).collect()
    } else {
        targets
            .iter()
            .map(|t| identify_session(&caps, &sessions, t).map(|s| s.container_id.clone()))
            .collect::<Result<_, _>>()?
    };

    backend.kill_sessions(&sessions, &ids).await?;
    print_success(&format!("Killed {} session(s)", ids.len()));
    Ok(())
}
