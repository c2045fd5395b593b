//! Pieces shared by the Docker and Singularity backends: the mount layout
//! and the launcher arguments passed inside the container.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use padre_core::config;
use padre_core::record;

/// Remove the record of a session whose launch failed; errors are only logged
pub fn discard_record(sessions_dir: &Path, name: &str) {
    if let Err(e) = record::remove_record(sessions_dir, name) {
        tracing::warn!("failed to remove session record {}: {}", name, e);
    }
}

/// Ports the launcher listens on inside a Docker container
pub const CONTAINER_PORT_BASE: u16 = 11001;

/// Virtualenv baked into the image
pub const CONTAINER_VENV: &str = "/.radiopadre/venv";

/// Name of the session directory below the work directory
const SESSION_SUBDIR: &str = ".radiopadre-session";

/// One bind mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub src: PathBuf,
    pub dst: PathBuf,
    pub read_only: bool,
}

impl Mount {
    fn new(src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            read_only: false,
        }
    }

    /// `src:dst[:ro]`, the form both runtimes accept
    pub fn to_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.src.display(), self.dst.display());
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// Host directories a container session needs
#[derive(Debug, Clone)]
pub struct ContainerLayout {
    pub workdir: PathBuf,
    pub home: PathBuf,
    pub radiopadre_dir: PathBuf,
    /// Session record directory on the host
    pub session_dir: PathBuf,
    pub read_only_workdir: bool,
}

impl ContainerLayout {
    pub fn new(workdir: impl Into<PathBuf>, session_dir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            home: config::home_dir(),
            radiopadre_dir: config::radiopadre_dir(),
            session_dir: session_dir.into(),
            read_only_workdir: false,
        }
    }

    /// Directory hidden over `~/.local` inside the container
    pub fn docker_local(&self) -> PathBuf {
        self.radiopadre_dir.join(".docker-local")
    }

    /// Writable scratch directory for the JS9 helper
    pub fn js9_tmp(&self) -> PathBuf {
        self.radiopadre_dir.join(".js9-tmp")
    }

    /// Session directory as seen below the work directory
    pub fn local_session_dir(&self) -> PathBuf {
        self.workdir.join(SESSION_SUBDIR)
    }

    /// Session directory in the shadow tree under `~/.radiopadre`
    pub fn shadow_session_dir(&self) -> PathBuf {
        let relative = self.workdir.strip_prefix("/").unwrap_or(&self.workdir);
        self.radiopadre_dir.join(relative).join(SESSION_SUBDIR)
    }

    /// Create the host directories that get mounted
    pub fn prepare(&self) -> io::Result<()> {
        for dir in [self.docker_local(), self.js9_tmp(), self.session_dir.clone()] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Mounts in the order they are passed to the runtime
    ///
    /// Singularity mounts the home directory by itself, so only Docker asks
    /// for it explicitly.
    pub fn mounts(&self, mount_home: bool) -> Vec<Mount> {
        let mut mounts = vec![Mount {
            read_only: self.read_only_workdir,
            ..Mount::new(&self.workdir, &self.workdir)
        }];
        if mount_home {
            mounts.push(Mount::new(&self.home, &self.home));
        }
        mounts.push(Mount::new(self.docker_local(), self.home.join(".local")));
        mounts.push(Mount::new(&self.session_dir, self.local_session_dir()));
        mounts.push(Mount::new(&self.session_dir, self.shadow_session_dir()));
        mounts.push(Mount::new(self.js9_tmp(), Path::new(CONTAINER_VENV).join("js9-www/tmp")));
        mounts
    }
}

/// The ports the launcher binds inside a Docker container
pub fn container_ports(count: usize) -> Vec<u16> {
    (0..count as u16).map(|i| CONTAINER_PORT_BASE + i).collect()
}

/// Launcher invocation inside the container
///
/// `--inside-container` carries the internal ports followed by the external
/// ones, so the session can announce both.
pub fn runscript_args(
    runscript: &str,
    internal: &[u16],
    external: &[u16],
    workdir: &Path,
    trailing: &[String],
) -> Vec<String> {
    let ports = internal
        .iter()
        .chain(external)
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(":");
    let mut args = vec![
        runscript.to_string(),
        "--inside-container".to_string(),
        ports,
        "--workdir".to_string(),
        workdir.display().to_string(),
        "--radiopadre-venv".to_string(),
        CONTAINER_VENV.to_string(),
    ];
    args.extend(trailing.iter().cloned());
    args
}
