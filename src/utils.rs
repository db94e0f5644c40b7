//! Utility functions for directory management and system integration
//!
//! Directories follow the XDG Base Directory specification:
//!
//! - Config: `~/.config/drnat/` - Per-user configuration (`drnat init` as non-root)
//! - State: `~/.local/state/drnat/` - NAT ledger, audit log, optional log file
//!
//! When run as root the system config lives in `/etc/drnat/` instead.
//!
//! # Example
//!
//! ```
//! use drnat::utils::{ensure_dirs, get_state_dir};
//!
//! ensure_dirs().expect("Failed to create directories");
//!
//! if let Some(state) = get_state_dir() {
//!     let ledger = state.join("nat_rules.json");
//!     # let _ = ledger;
//! }
//! ```

use directories::ProjectDirs;
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use std::path::PathBuf;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "drnat", "drnat")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
}

pub fn ensure_dirs() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700); // User read/write/execute only
        builder.recursive(true);

        if let Some(dir) = get_state_dir() {
            builder.create(dir)?;
        }
    }

    #[cfg(not(unix))]
    {
        if let Some(dir) = get_state_dir() {
            std::fs::create_dir_all(dir)?;
        }
    }

    Ok(())
}

/// Names of the host's network interfaces, sorted, loopback excluded
pub fn list_interfaces() -> Vec<String> {
    let mut interfaces: Vec<String> = match NetworkInterface::show() {
        Ok(list) => list
            .into_iter()
            .map(|iface| iface.name)
            .filter(|name| name != "lo")
            .collect(),
        Err(e) => {
            tracing::debug!("Interface discovery failed: {e}");
            Vec::new()
        }
    };
    interfaces.sort();
    interfaces.dedup();
    interfaces
}

/// True if `name` is a live interface on this host
pub fn interface_exists(name: &str) -> bool {
    list_interfaces().iter().any(|iface| iface == name)
}
