//! Output formatting utilities for the CLI
//!
//! Session tables and colored status messages.

use padre_core::recent::RecentSessions;
use padre_orchestrator::SessionInfo;
use padre_orchestrator::TeardownReport;
use tabled::{settings::Style, Table, Tabled};

/// Format running sessions as an ASCII table, numbered the way `resume` and
/// `kill` accept them
pub fn format_sessions(sessions: &[SessionInfo]) -> String {
    if sessions.is_empty() {
        return "No running sessions".to_string();
    }

    #[derive(Tabled)]
    struct SessionRow {
        #[tabled(rename = "#")]
        index: usize,
        #[tabled(rename = "CONTAINER")]
        id: String,
        #[tabled(rename = "DIRECTORY")]
        workdir: String,
        #[tabled(rename = "CREATED")]
        created: String,
        #[tabled(rename = "URL")]
        url: String,
    }

    let rows: Vec<SessionRow> = sessions
        .iter()
        .enumerate()
        .map(|(index, s)| SessionRow {
            index,
            id: truncate(&s.container_id, 12),
            workdir: s.workdir.clone(),
            created: s.created.clone(),
            url: s.resume_url().unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// One-line summary of a teardown that needed force
pub fn format_teardown(report: &TeardownReport) -> Option<String> {
    if report.is_clean() {
        return None;
    }
    let mut parts = Vec::new();
    if !report.killed.is_empty() {
        parts.push(format!("killed: {}", report.killed.join(", ")));
    }
    if !report.stubborn.is_empty() {
        parts.push(format!("still running: {}", report.stubborn.join(", ")));
    }
    if !report.errors.is_empty() {
        parts.push(format!("errors: {}", report.errors.join("; ")));
    }
    Some(format!("cleanup was not clean ({})", parts.join("; ")))
}

/// Truncate a string with ellipsis if too long
/// Numbered list of remembered command lines, most recent first
pub fn format_recent(recent: &RecentSessions) -> String {
    let mut out = String::from("Your most recent radiopadre sessions are:\n\n");
    for (i, session) in recent.iter().enumerate() {
        out.push_str(&format!("    [#{}] {}\n", i, session.command_line()));
    }
    out.push('\n');
    out
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix
///
/// Outputs to stderr.
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message in cyan
pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use padre_core::{PortMap, SessionId};

    #[test]
    fn test_empty_session_table() {
        assert_eq!(format_sessions(&[]), "No running sessions");
    }

    #[test]
    fn test_session_table_has_resume_url() {
        let info = SessionInfo {
            container_id: "0123456789abcdef".into(),
            name: "radiopadre-joe-cafe".into(),
            workdir: "/data/obs".into(),
            created: "2024-05-01 12:00:00".into(),
            session_id: SessionId::new("cafe"),
            ports: PortMap::new(vec![11001, 11002], vec![10001, 10002], 2).unwrap(),
        };
        let table = format_sessions(&[info]);
        assert!(table.contains("012345678..."));
        assert!(table.contains("http://localhost:10001/tree#running?token=cafe"));
        assert!(table.contains("/data/obs"));
    }

    #[test]
    fn test_recent_list() {
        let mut recent = RecentSessions::default();
        recent.record("a", &["obs1".to_string()]);
        recent.record("b", &["-b".to_string(), "docker".to_string()]);
        let text = format_recent(&recent);
        assert!(text.starts_with("Your most recent radiopadre sessions are:"));
        assert!(text.contains("    [#0] -b docker\n    [#1] obs1\n"));
    }

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(truncate("abc", 12), "abc");
        assert_eq!(truncate("ééééééééééééé", 12), "ééééééééé...");
        assert_eq!(truncate("€€€€", 4), "€€€€");
    }

    #[test]
    fn test_teardown_summary() {
        assert!(format_teardown(&TeardownReport::default()).is_none());
        let report = TeardownReport {
            killed: vec!["browser".into()],
            ..TeardownReport::default()
        };
        assert!(format_teardown(&report).unwrap().contains("killed: browser"));
    }
}
