//! Process liveness and signalling helpers

/// Signal kinds the orchestrator sends to child processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Polite request to exit (SIGTERM)
    Terminate,
    /// Interrupt (SIGINT)
    Interrupt,
    /// Forced kill (SIGKILL)
    Kill,
}

/// Check if a process with the given PID is still alive
///
/// On Unix, uses kill(pid, 0) to check if the process exists.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    // ESRCH means gone, EPERM means it exists but belongs to someone else
    unsafe {
        let result = libc::kill(pid as libc::pid_t, 0);
        if result == 0 {
            return true;
        }
        let err = std::io::Error::last_os_error();
        err.raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

/// Send a signal to a process
#[cfg(unix)]
pub fn send_signal(pid: u32, kind: SignalKind) -> std::io::Result<()> {
    let sig = match kind {
        SignalKind::Terminate => libc::SIGTERM,
        SignalKind::Interrupt => libc::SIGINT,
        SignalKind::Kill => libc::SIGKILL,
    };
    let result = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn send_signal(_pid: u32, _kind: SignalKind) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "signals are only supported on unix",
    ))
}

/// Numeric uid and gid of the current user
#[cfg(unix)]
pub fn current_uid_gid() -> (u32, u32) {
    unsafe { (libc::getuid(), libc::getgid()) }
}

#[cfg(not(unix))]
pub fn current_uid_gid() -> (u32, u32) {
    (0, 0)
}

/// Name of a group, if the group database knows it
#[cfg(unix)]
pub fn group_name(gid: u32) -> Option<String> {
    unsafe {
        let grp = libc::getgrgid(gid as libc::gid_t);
        if grp.is_null() || (*grp).gr_name.is_null() {
            return None;
        }
        Some(std::ffi::CStr::from_ptr((*grp).gr_name).to_string_lossy().into_owned())
    }
}

#[cfg(not(unix))]
pub fn group_name(_gid: u32) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_nonexistent_process_is_dead() {
        // PID 0 would signal our process group, use a large unlikely PID instead
        assert!(!is_process_alive(4_000_000));
    }
}
