//! Recently used command lines

use std::path::Path;

use anyhow::Result;
use padre_core::recent::{RecentSessions, NON_PERSISTING_OPTIONS};

use crate::output::{format_recent, print_info, print_warning};

/// List remembered sessions, most recent first
pub fn recent_command(path: &Path) {
    let recent = RecentSessions::load(path);
    if recent.is_empty() {
        print_info("No recent radiopadre sessions");
    } else {
        print!("{}", format_recent(&recent));
    }
}

/// Arguments of recent session `#index`
///
/// Non-persisting options given on this invocation are carried over.
pub fn recall_session(path: &Path, index: usize, current: &[String]) -> Result<Vec<String>> {
    let recent = RecentSessions::load(path);
    if recent.is_empty() {
        anyhow::bail!("no recent radiopadre sessions");
    }
    let session = recent
        .get(index)
        .ok_or_else(|| anyhow::anyhow!("no recent session #{}, {} remembered", index, recent.len()))?;

    print!("{}", format_recent(&recent));
    print_info(&format!("Rerunning session #{}: {}", index, session.command_line()));

    let mut args = session.args.clone();
    args.extend(
        current
            .iter()
            .filter(|a| NON_PERSISTING_OPTIONS.contains(&a.as_str()))
            .cloned(),
    );
    Ok(args)
}

/// Remember a command line; failing to save is only a warning
pub fn remember_session(path: &Path, key: String, args: &[String]) {
    let mut recent = RecentSessions::load(path);
    recent.record(key, args);
    if let Err(e) = recent.save(path) {
        print_warning(&format!("cannot save recent sessions to {}: {}", path.display(), e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn test_remember_then_recall() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("recent");
        remember_session(&path, "a".into(), &strings(&["obs1", "--auto-init"]));
        remember_session(&path, "b".into(), &strings(&["-b", "docker", "obs2"]));

        assert_eq!(recall_session(&path, 0, &[]).unwrap(), strings(&["-b", "docker", "obs2"]));
        assert_eq!(
            recall_session(&path, 1, &strings(&["#1", "--auto-init"])).unwrap(),
            strings(&["obs1", "--auto-init"])
        );
        let err = recall_session(&path, 2, &[]).unwrap_err();
        assert!(err.to_string().contains("no recent session #2"));
    }

    #[test]
    fn test_recall_without_history() {
        let dir = TempDir::new().unwrap();
        let err = recall_session(&dir.path().join("recent"), 0, &[]).unwrap_err();
        assert!(err.to_string().contains("no recent radiopadre sessions"));
    }
}
