//! padre-cli: command-line interface for radiopadre
//!
//! Provides the `padre` binary, which starts a notebook session on the
//! chosen transport and supervises it until the user exits, detaches or
//! interrupts it.

pub mod commands;
pub mod output;

use padre_core::TransportError;

/// Suggested fix for an error, looked up anywhere in its source chain
pub fn remediation_for(err: &anyhow::Error) -> Option<String> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<TransportError>())
        .and_then(TransportError::remediation)
}

/// Parse a `p1:p2:...` port list with exactly `count` entries
pub fn parse_port_list(spec: &str, count: usize) -> anyhow::Result<Vec<u16>> {
    let ports = spec
        .split(':')
        .map(|p| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| anyhow::anyhow!("invalid port '{}' in '{}'", p, spec))
        })
        .collect::<anyhow::Result<Vec<u16>>>()?;
    if ports.len() != count {
        anyhow::bail!("expected {} ports, got {} in '{}'", count, ports.len(), spec);
    }
    Ok(ports)
}

/// `#N` refers to recent session N
pub fn parse_recent_ref(arg: &str) -> Option<usize> {
    let digits = arg.strip_prefix('#')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use padre_core::PadreError;

    #[test]
    fn test_parse_port_list() {
        assert_eq!(parse_port_list("1:2:3", 3).unwrap(), vec![1, 2, 3]);
        assert!(parse_port_list("1:2", 3).is_err());
        assert!(parse_port_list("1:x:3", 3).is_err());
        assert!(parse_port_list("1:2:70000", 3).is_err());
    }

    #[test]
    fn test_parse_recent_ref() {
        assert_eq!(parse_recent_ref("#0"), Some(0));
        assert_eq!(parse_recent_ref("#12"), Some(12));
        assert_eq!(parse_recent_ref("#"), None);
        assert_eq!(parse_recent_ref("#-1"), None);
        assert_eq!(parse_recent_ref("0"), None);
        assert_eq!(parse_recent_ref("#notebook.ipynb"), None);
    }

    #[test]
    fn test_remediation_through_context() {
        let err: anyhow::Result<()> = Err(PadreError::from(TransportError::BinaryNotFound {
            binary: "kubectl".into(),
        }))
        .context("failed to start session");
        let fix = remediation_for(&err.unwrap_err()).unwrap();
        assert!(fix.contains("`kubectl`"));

        let plain = anyhow::anyhow!("something else");
        assert!(remediation_for(&plain).is_none());
    }
}
