//! Local port suggestion for sessions whose ports we choose

use std::net::TcpListener;

use padre_core::process::current_uid_gid;
use padre_core::TransportError;

/// Ports tried per slot before giving up
const MAX_ATTEMPTS: u32 = 10_000;

/// First port to try for this user
///
/// Spreading users apart by uid keeps concurrent users on a shared host from
/// racing for the same ports.
pub fn default_port_base() -> u16 {
    let (uid, _) = current_uid_gid();
    let offset = (uid as u64 * 3) % 50_000;
    (10_000 + offset) as u16
}

/// Whether a local TCP port can be bound right now
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Find `count` distinct free local ports, scanning upwards from `start`
pub fn suggest_ports(count: usize, start: u16) -> Result<Vec<u16>, TransportError> {
    let mut ports = Vec::with_capacity(count);
    let mut candidate = start as u32;
    for _ in 0..count {
        let found = (candidate + 1..candidate + 1 + MAX_ATTEMPTS)
            .take_while(|p| *p <= u16::MAX as u32)
            .map(|p| p as u16)
            .find(|p| is_port_free(*p))
            .ok_or_else(|| {
                TransportError::LaunchFailed(format!("no free local port above {}", candidate))
            })?;
        ports.push(found);
        candidate = found as u32;
    }
    tracing::debug!(?ports, "suggested local ports");
    Ok(ports)
}
