//! Client configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use crate::error::ConfigError;
use crate::types::{TransportKind, DEFAULT_NUM_PORTS};

/// Default container image
pub const DEFAULT_DOCKER_IMAGE: &str = "osmirnov/radiopadre:latest";

/// Configuration for the `padre` client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Backends to try, in order of preference
    pub backends: Vec<TransportKind>,

    /// Launcher script started locally or inside the container
    pub runscript: String,

    /// Image used by the Docker, Singularity and Kubernetes backends
    pub docker_image: String,

    /// Keep container sessions running after the client exits
    pub container_persist: bool,

    /// Run containers attached (no `-d`) for debugging
    pub container_debug: bool,

    /// Kill stale sessions for the current directory before starting
    pub grim_reaper: bool,

    /// Number of port slots announced by a session
    pub num_ports: usize,

    /// How long to wait for a graceful shutdown before killing
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,

    /// Liveness poll interval
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Browser launched once the session is ready
    pub browser: BrowserConfig,

    /// Retry policy for transient transport failures
    pub retry: RetryConfig,

    /// Remote host settings
    pub ssh: SshConfig,

    /// Cluster settings
    pub kubernetes: KubernetesConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backends: vec![
                TransportKind::Docker,
                TransportKind::Singularity,
                TransportKind::Venv,
            ],
            runscript: "run-radiopadre".to_string(),
            docker_image: DEFAULT_DOCKER_IMAGE.to_string(),
            container_persist: false,
            container_debug: false,
            grim_reaper: true,
            num_ports: DEFAULT_NUM_PORTS,
            shutdown_grace: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            browser: BrowserConfig::default(),
            retry: RetryConfig::default(),
            ssh: SshConfig::default(),
            kubernetes: KubernetesConfig::default(),
        }
    }
}

/// Browser launch settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Command to run; `None` prints the URLs only
    pub command: Option<String>,

    /// Pass all URLs to a single browser invocation
    pub multi: bool,

    /// Leave the browser running as a session helper instead of waiting for it
    pub background: bool,
}

/// Retry configuration for transient failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Initial delay
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,

    /// Give up after this many attempts; unbounded when absent
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: None,
        }
    }
}

/// SSH transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Remote host (`[user@]host`)
    pub host: Option<String>,

    /// ControlPath template for the multiplexed master
    pub control_path: String,

    /// How long the master lingers after the last client
    pub control_persist: String,

    /// Launcher script on the remote side
    pub remote_command: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: None,
            control_path: "/tmp/ssh_mux_radiopadre_%C".to_string(),
            control_persist: "1h".to_string(),
            remote_command: "run-radiopadre".to_string(),
        }
    }
}

/// How the pod home directory is provided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HomeVolume {
    /// Scratch directory on node disk
    EmptyDir,
    /// Memory-backed scratch directory
    Ram,
    /// Sub-path of a persistent volume claim (or host path if it starts with `/`)
    Claim { claim: String, subpath: String },
}

/// Kubernetes transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    /// kubectl binary
    pub kubectl: String,

    /// kubeconfig context; current context when absent
    pub context: Option<String>,

    /// Namespace; the context default when absent
    pub namespace: Option<String>,

    /// Volume holding the data: a PVC name, or a host path starting with `/`
    pub data_volume: Option<String>,

    /// Node selector in `key=value,key=value` form
    pub node_selector: String,

    pub cpu_request: Option<String>,
    pub ram_request: Option<String>,

    /// Override the uid the pod runs as
    pub uid: Option<u32>,
    /// Override the gid the pod runs as
    pub gid: Option<u32>,

    /// Home directory: `PVC:subpath`, `RAM`, or empty for scratch
    pub home_dir: Option<String>,

    /// Delete leftover pods of this user before starting
    pub auto_cleanup: bool,

    /// Interval between "still waiting" warnings while the pod is provisioned
    #[serde(with = "duration_secs")]
    pub provisioning_warning: Duration,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            context: None,
            namespace: None,
            data_volume: None,
            node_selector: String::new(),
            cpu_request: None,
            ram_request: None,
            uid: None,
            gid: None,
            home_dir: None,
            auto_cleanup: false,
            provisioning_warning: Duration::from_secs(60),
        }
    }
}

impl KubernetesConfig {
    /// Parse the node selector into a label map
    pub fn node_selector_map(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        let mut map = BTreeMap::new();
        for keyval in self.node_selector.split(',').filter(|kv| !kv.is_empty()) {
            match keyval.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    map.insert(key.to_string(), value.to_string());
                }
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "invalid node selector setting: {}",
                        keyval
                    )))
                }
            }
        }
        Ok(map)
    }

    /// Interpret the home directory setting
    pub fn home_volume(&self) -> Result<HomeVolume, ConfigError> {
        match self.home_dir.as_deref() {
            None | Some("") => Ok(HomeVolume::EmptyDir),
            Some(spec) if spec.eq_ignore_ascii_case("ram") => Ok(HomeVolume::Ram),
            Some(spec) => match spec.split_once(':') {
                Some((claim, subpath)) if !claim.is_empty() => Ok(HomeVolume::Claim {
                    claim: claim.to_string(),
                    subpath: subpath.trim_start_matches('/').to_string(),
                }),
                _ => Err(ConfigError::Invalid(format!(
                    "invalid home dir setting: {}",
                    spec
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.kubernetes.provisioning_warning, Duration::from_secs(60));
        assert_eq!(config.ssh.control_path, "/tmp/ssh_mux_radiopadre_%C");
    }

    #[test]
    fn test_partial_toml() {
        let config: ClientConfig = toml::from_str(
            r#"
            backends = ["k8s", "venv"]
            shutdown_grace = 3

            [kubernetes]
            node_selector = "disk=ssd,zone=a"
            home_dir = "homes:/users/joe"
            "#,
        )
        .unwrap();
        assert_eq!(config.backends, vec![TransportKind::Kubernetes, TransportKind::Venv]);
        assert_eq!(config.shutdown_grace, Duration::from_secs(3));
        assert_eq!(config.num_ports, 5);

        let sel = config.kubernetes.node_selector_map().unwrap();
        assert_eq!(sel.get("disk").map(String::as_str), Some("ssd"));
        assert_eq!(
            config.kubernetes.home_volume().unwrap(),
            HomeVolume::Claim {
                claim: "homes".into(),
                subpath: "users/joe".into()
            }
        );
    }

    #[test]
    fn test_bad_node_selector() {
        let k8s = KubernetesConfig {
            node_selector: "disk".into(),
            ..Default::default()
        };
        assert!(k8s.node_selector_map().is_err());
    }

    #[test]
    fn test_home_volume_variants() {
        let mut k8s = KubernetesConfig::default();
        assert_eq!(k8s.home_volume().unwrap(), HomeVolume::EmptyDir);
        k8s.home_dir = Some("RAM".into());
        assert_eq!(k8s.home_volume().unwrap(), HomeVolume::Ram);
        k8s.home_dir = Some("nonsense".into());
        assert!(k8s.home_volume().is_err());
    }
}
