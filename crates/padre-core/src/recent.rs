//! Recently launched sessions
//!
//! The command lines of the last few sessions are kept in
//! `~/.radiopadre/padre.sessions.recent`, one entry per session key, so that
//! `padre '#N'` can start one of them again. `#0` is the most recent.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config;
use crate::error::ConfigError;
use crate::types::TransportKind;

/// How many sessions are remembered
pub const MAX_RECENT: usize = 5;

/// Options that apply only to the invocation they were given on
pub const NON_PERSISTING_OPTIONS: &[&str] = &["--auto-init"];

/// Default location of the recent sessions file
pub fn recent_sessions_path() -> PathBuf {
    config::radiopadre_dir().join("padre.sessions.recent")
}

/// Key under which a session is remembered: one entry per backend, host
/// and directory
pub fn session_key(backend: Option<TransportKind>, host: Option<&str>, workdir: &Path, notebook: Option<&str>) -> String {
    format!(
        "{}:{}:{}:{}",
        backend.map(|b| b.to_string()).unwrap_or_default(),
        host.unwrap_or_default(),
        workdir.display(),
        notebook.unwrap_or_default()
    )
}

/// One remembered command line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentSession {
    pub key: String,
    pub args: Vec<String>,
}

impl RecentSession {
    /// Arguments joined for display, empty ones shown as `''`
    pub fn command_line(&self) -> String {
        self.args
            .iter()
            .map(|a| if a.is_empty() { "''" } else { a.as_str() })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentSessions {
    /// Oldest first
    #[serde(default)]
    sessions: Vec<RecentSession>,
}

impl RecentSessions {
    /// Load the file; a missing or unreadable one yields an empty list
    pub fn load(path: &Path) -> Self {
        config::load_or_default(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        config::save_config(path, self)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remember `args` under `key`, replacing an older entry with the same key
    /// and dropping the oldest entry once [`MAX_RECENT`] are kept
    pub fn record(&mut self, key: impl Into<String>, args: &[String]) {
        let key = key.into();
        self.sessions.retain(|s| s.key != key);
        while self.sessions.len() >= MAX_RECENT {
            self.sessions.remove(0);
        }
        let args = args
            .iter()
            .filter(|a| !NON_PERSISTING_OPTIONS.contains(&a.as_str()))
            .cloned()
            .collect();
        self.sessions.push(RecentSession { key, args });
    }

    /// Session `#index`, counting back from the most recent
    pub fn get(&self, index: usize) -> Option<&RecentSession> {
        let pos = self.sessions.len().checked_sub(index + 1)?;
        self.sessions.get(pos)
    }

    /// Most recent first
    pub fn iter(&self) -> impl Iterator<Item = &RecentSession> {
        self.sessions.iter().rev()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn test_newest_is_zero() {
        let mut recent = RecentSessions::default();
        recent.record("a", &args("obs1"));
        recent.record("b", &args("--backend docker obs2"));
        assert_eq!(recent.get(0).unwrap().key, "b");
        assert_eq!(recent.get(1).unwrap().key, "a");
        assert!(recent.get(2).is_none());
        assert_eq!(
            recent.iter().map(|s| s.key.as_str()).collect::<Vec<_>>(),
            vec!["b", "a"]
        );
    }

    #[test]
    fn test_same_key_moves_to_front() {
        let mut recent = RecentSessions::default();
        recent.record("a", &args("obs1"));
        recent.record("b", &args("obs2"));
        recent.record("a", &args("obs1 --read-only"));
        assert_eq!(recent.len(), 2);
        assert_eq!(recent.get(0).unwrap().command_line(), "obs1 --read-only");
    }

    #[test]
    fn test_oldest_is_evicted() {
        let mut recent = RecentSessions::default();
        for i in 0..MAX_RECENT + 2 {
            recent.record(format!("k{}", i), &args("x"));
        }
        assert_eq!(recent.len(), MAX_RECENT);
        assert_eq!(recent.get(MAX_RECENT - 1).unwrap().key, "k2");
    }

    #[test]
    fn test_non_persisting_options_are_dropped() {
        let mut recent = RecentSessions::default();
        recent.record("a", &["--auto-init".to_string(), String::new(), "nb.ipynb".to_string()]);
        assert_eq!(recent.get(0).unwrap().command_line(), "'' nb.ipynb");
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("padre.sessions.recent");
        assert!(RecentSessions::load(&path).is_empty());

        let mut recent = RecentSessions::default();
        recent.record(session_key(Some(TransportKind::Docker), None, Path::new("/data"), None), &args("-b docker"));
        recent.save(&path).unwrap();
        let loaded = RecentSessions::load(&path);
        assert_eq!(loaded, recent);
        assert_eq!(loaded.get(0).unwrap().key, "docker::/data:");

        std::fs::write(&path, "sessions = 3").unwrap();
        assert!(RecentSessions::load(&path).is_empty());
    }
}
