//! On-disk session records
//!
//! Each running container session has a directory `<sessions_dir>/<name>/`
//! holding an `info` file (`"<id> p1 .. pN q1 .. qN"`, owner-only) and a
//! `js9prefs.js` pointing the JS9 viewer at the external helper port. The
//! directory is also mounted into the container.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::SessionError;
use crate::types::{PortMap, PortSlot, SessionId};

const INFO_FILE: &str = "info";
const JS9_PREFS_FILE: &str = "js9prefs.js";

/// Prefix of session directory names
pub const SESSION_DIR_PREFIX: &str = "radiopadre-";

/// Contents of a session `info` file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub ports: PortMap,
}

/// Directory of a named session record
pub fn record_dir(sessions_dir: &Path, name: &str) -> PathBuf {
    sessions_dir.join(name)
}

impl SessionRecord {
    pub fn new(session_id: SessionId, ports: PortMap) -> Self {
        Self { session_id, ports }
    }

    /// Serialized `info` line
    pub fn to_line(&self) -> String {
        std::iter::once(self.session_id.to_string())
            .chain(self.ports.internal().iter().map(u16::to_string))
            .chain(self.ports.external().iter().map(u16::to_string))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Write `info` and `js9prefs.js` under `<sessions_dir>/<name>`
    pub fn save(&self, sessions_dir: &Path, name: &str) -> io::Result<PathBuf> {
        let dir = record_dir(sessions_dir, name);
        fs::create_dir_all(&dir)?;

        write_private(&dir.join(INFO_FILE), self.to_line().as_bytes())?;

        if let Some(helper) = self.ports.external_port(PortSlot::Helper) {
            fs::write(
                dir.join(JS9_PREFS_FILE),
                format!("JS9Prefs.globalOpts.helperPort = {};\n", helper),
            )?;
        }
        Ok(dir)
    }

    /// Read the record of a named session
    ///
    /// Fails if the record does not hold exactly `1 + 2 * num_ports` fields.
    pub fn read(sessions_dir: &Path, name: &str, num_ports: usize) -> Result<Self, SessionError> {
        let path = record_dir(sessions_dir, name).join(INFO_FILE);
        let invalid = |reason: String| SessionError::InvalidRecord {
            path: path.clone(),
            reason,
        };

        let content = fs::read_to_string(&path).map_err(|e| invalid(e.to_string()))?;
        let fields: Vec<&str> = content.split_whitespace().collect();
        if fields.len() != 1 + 2 * num_ports {
            return Err(invalid(format!(
                "expected {} fields, found {}",
                1 + 2 * num_ports,
                fields.len()
            )));
        }

        let ports = fields[1..]
            .iter()
            .map(|p| p.parse::<u16>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| invalid(e.to_string()))?;
        let (internal, external) = ports.split_at(num_ports);

        Ok(Self {
            session_id: SessionId::new(fields[0]),
            ports: PortMap::new(internal.to_vec(), external.to_vec(), num_ports)?,
        })
    }
}

/// Remove a session record directory
///
/// Returns `Ok(())` even if the directory doesn't exist.
pub fn remove_record(sessions_dir: &Path, name: &str) -> io::Result<()> {
    match fs::remove_dir_all(record_dir(sessions_dir, name)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Names of all session record directories
pub fn list_record_names(sessions_dir: &Path) -> io::Result<Vec<String>> {
    let entries = match fs::read_dir(sessions_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(SESSION_DIR_PREFIX) && entry.path().is_dir() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Write a file readable by its owner only, from the moment it exists
#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode only applies on creation
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    fs::write(path, contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record() -> SessionRecord {
        SessionRecord::new(
            SessionId::new("abc123"),
            PortMap::new(vec![1, 2, 3, 4, 5], vec![11, 12, 13, 14, 15], 5).unwrap(),
        )
    }

    #[test]
    fn test_info_line_format() {
        assert_eq!(record().to_line(), "abc123 1 2 3 4 5 11 12 13 14 15");
    }

    #[test]
    fn test_save_writes_info_and_prefs() {
        let dir = TempDir::new().unwrap();
        let path = record().save(dir.path(), "radiopadre-joe-1").unwrap();

        let prefs = fs::read_to_string(path.join("js9prefs.js")).unwrap();
        assert_eq!(prefs, "JS9Prefs.globalOpts.helperPort = 12;\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(path.join("info")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let read = SessionRecord::read(dir.path(), "radiopadre-joe-1", 5).unwrap();
        assert_eq!(read, record());
    }

    #[cfg(unix)]
    #[test]
    fn test_save_tightens_existing_info_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("radiopadre-y");
        fs::create_dir_all(&sub).unwrap();
        let info = sub.join("info");
        fs::write(&info, "stale token and a much longer line than the new one").unwrap();
        fs::set_permissions(&info, fs::Permissions::from_mode(0o644)).unwrap();

        record().save(dir.path(), "radiopadre-y").unwrap();
        let mode = fs::metadata(&info).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(fs::read_to_string(&info).unwrap(), record().to_line());
    }

    #[test]
    fn test_read_rejects_wrong_field_count() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("radiopadre-x");
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join("info"), "abc 1 2 3").unwrap();
        let err = SessionRecord::read(dir.path(), "radiopadre-x", 5).unwrap_err();
        assert!(matches!(err, SessionError::InvalidRecord { .. }));
    }

    #[test]
    fn test_list_and_remove() {
        let dir = TempDir::new().unwrap();
        record().save(dir.path(), "radiopadre-b").unwrap();
        record().save(dir.path(), "radiopadre-a").unwrap();
        fs::create_dir_all(dir.path().join("other")).unwrap();

        assert_eq!(
            list_record_names(dir.path()).unwrap(),
            vec!["radiopadre-a", "radiopadre-b"]
        );
        remove_record(dir.path(), "radiopadre-a").unwrap();
        remove_record(dir.path(), "radiopadre-a").unwrap();
        assert_eq!(list_record_names(dir.path()).unwrap(), vec!["radiopadre-b"]);
        assert!(list_record_names(&dir.path().join("missing")).unwrap().is_empty());
    }
}
