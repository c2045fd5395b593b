//! Config command implementations

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use padre_core::config::{self, ClientConfig};

use crate::output::{print_info, print_success, print_warning};

/// Config file to use: the explicit one, or the default location
pub fn config_path(explicit: Option<&PathBuf>) -> PathBuf {
    explicit.cloned().unwrap_or_else(config::default_config_path)
}

/// Load the client configuration
///
/// An explicitly given file must exist and parse; the default file may be
/// missing.
pub fn load_client_config(explicit: Option<&PathBuf>) -> Result<ClientConfig> {
    match explicit {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load config file {}", path.display())),
        None => Ok(config::load_or_default(&config::default_config_path())),
    }
}

/// Print the effective configuration as TOML
pub fn config_show(explicit: Option<&PathBuf>) -> Result<()> {
    let path = config_path(explicit);
    let config = load_client_config(explicit)?;
    if !path.exists() {
        print_info(&format!("No config file at {}, showing defaults", path.display()));
    }
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

/// Write a default configuration file
pub fn config_init(explicit: Option<&PathBuf>, force: bool) -> Result<()> {
    let path = config_path(explicit);
    if path.exists() && !force {
        print_warning(&format!(
            "Config file already exists at {}; use --force to overwrite",
            path.display()
        ));
        return Ok(());
    }
    write_default(&path)?;
    print_success(&format!("Created config file at {}", path.display()));
    Ok(())
}

fn write_default(path: &Path) -> Result<()> {
    config::save_config(path, &ClientConfig::default())
        .with_context(|| format!("Failed to write config file {}", path.display()))
}
