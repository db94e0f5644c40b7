use crate::core::backend::LxdBackend;
use crate::core::driver::IptablesDriver;
use crate::core::error::{Error, Result};
use crate::core::executor::{CommandExecutor, DEFAULT_COMMAND_TIMEOUT};
use crate::core::ledger::LEDGER_FILE_NAME;
use crate::core::lifecycle::{BootstrapSettings, RetryPolicy};
use crate::core::sync::NatSettings;
use crate::utils::{get_config_dir, get_state_dir};
use crate::validators::{validate_instance_name, validate_interface, validate_port_range};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an alternative config file
pub const CONFIG_ENV_VAR: &str = "DRNAT_CONFIG";

/// System-wide config location, overridable by packagers at build time
pub const SYSTEM_CONFIG_PATH: &str = match option_env!("DRNAT_SYSTEM_CONFIG_PATH") {
    Some(path) => path,
    None => "/etc/drnat/config.json",
};

/// File name of the per-user config inside the XDG config directory
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Complete drnat configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Host address that external clients connect to
    pub listen_ip: Ipv4Addr,
    /// Outbound interface for MASQUERADE rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uplink_interface: Option<String>,
    #[serde(default)]
    pub skip_masquerade: bool,
    /// Defaults to `nat_rules.json` in the state directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_path: Option<PathBuf>,
    #[serde(default = "default_iptables_path")]
    pub iptables_path: String,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Forwards per instance when LXD sets no limit (0 = unlimited)
    #[serde(default)]
    pub default_rule_quota: u32,
    /// Per-instance overrides of `default_rule_quota`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rule_quotas: BTreeMap<String, u32>,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    #[serde(default)]
    pub lxd: LxdConfig,
    /// Write logs to `drnat.log` in the state directory instead of stderr
    #[serde(default)]
    pub log_to_file: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootstrapConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_port_min")]
    pub port_min: u16,
    #[serde(default = "default_port_max")]
    pub port_max: u16,
    #[serde(default = "default_resolve_attempts")]
    pub resolve_attempts: u32,
    #[serde(default = "default_resolve_delay")]
    pub resolve_delay_secs: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port_min: default_port_min(),
            port_max: default_port_max(),
            resolve_attempts: default_resolve_attempts(),
            resolve_delay_secs: default_resolve_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LxdConfig {
    #[serde(default = "default_lxc_path")]
    pub lxc_path: String,
    /// Bridge whose NIC address is used as the forward destination
    #[serde(default = "default_bridge")]
    pub bridge: String,
}

impl Default for LxdConfig {
    fn default() -> Self {
        Self {
            lxc_path: default_lxc_path(),
            bridge: default_bridge(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_iptables_path() -> String {
    "iptables".to_string()
}

fn default_command_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT.as_secs()
}

fn default_port_min() -> u16 {
    10000
}

fn default_port_max() -> u16 {
    65535
}

fn default_resolve_attempts() -> u32 {
    3
}

fn default_resolve_delay() -> u64 {
    5
}

fn default_lxc_path() -> String {
    "lxc".to_string()
}

fn default_bridge() -> String {
    "lxdbr0".to_string()
}

impl AppConfig {
    pub fn new(listen_ip: Ipv4Addr) -> Self {
        Self {
            listen_ip,
            uplink_interface: None,
            skip_masquerade: false,
            ledger_path: None,
            iptables_path: default_iptables_path(),
            command_timeout_secs: default_command_timeout(),
            default_rule_quota: 0,
            rule_quotas: BTreeMap::new(),
            bootstrap: BootstrapConfig::default(),
            lxd: LxdConfig::default(),
            log_to_file: false,
        }
    }

    /// Checks everything that would otherwise fail at the first kernel call
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.listen_ip.is_unspecified()
            || self.listen_ip.is_broadcast()
            || self.listen_ip.is_multicast()
        {
            return Err(Error::Config(format!(
                "listen_ip {} cannot be used as a DNAT match address",
                self.listen_ip
            )));
        }

        match (&self.uplink_interface, self.skip_masquerade) {
            (Some(iface), _) => {
                validate_interface(iface)
                    .map_err(|e| Error::Config(format!("uplink_interface: {e}")))?;
            }
            (None, false) => {
                return Err(Error::Config(
                    "uplink_interface is required unless skip_masquerade is set".to_string(),
                ));
            }
            (None, true) => {}
        }

        if self.command_timeout_secs == 0 {
            return Err(Error::Config(
                "command_timeout_secs must be at least 1".to_string(),
            ));
        }

        for name in self.rule_quotas.keys() {
            validate_instance_name(name)
                .map_err(|e| Error::Config(format!("rule_quotas key '{name}': {e}")))?;
        }

        validate_port_range(self.bootstrap.port_min, self.bootstrap.port_max)
            .map_err(|e| Error::Config(format!("bootstrap port range: {e}")))?;

        validate_interface(&self.lxd.bridge)
            .map_err(|e| Error::Config(format!("lxd.bridge: {e}")))?;

        Ok(())
    }

    /// Non-fatal problems worth a warning at startup
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Some(iface) = self.masquerade_interface()
            && !crate::utils::interface_exists(iface)
        {
            warnings.push(format!(
                "Uplink interface '{iface}' does not exist on this host"
            ));
        }
        if self.bootstrap.enabled && self.bootstrap.resolve_attempts == 0 {
            warnings.push(
                "bootstrap.resolve_attempts is 0, bootstrap forwards will never be created"
                    .to_string(),
            );
        }
        warnings
    }

    /// Interface for MASQUERADE rules, `None` when masquerading is off
    pub fn masquerade_interface(&self) -> Option<&str> {
        if self.skip_masquerade {
            None
        } else {
            self.uplink_interface.as_deref()
        }
    }

    /// Configured ledger path, or the state directory default
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no ledger path is set and there is no state directory.
    pub fn resolved_ledger_path(&self) -> Result<PathBuf> {
        match &self.ledger_path {
            Some(path) => Ok(path.clone()),
            None => get_state_dir()
                .map(|dir| dir.join(LEDGER_FILE_NAME))
                .ok_or_else(|| {
                    Error::Config("No state directory; set ledger_path explicitly".to_string())
                }),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn nat_settings(&self) -> NatSettings {
        let mut settings =
            NatSettings::new(self.listen_ip).with_default_quota(self.default_rule_quota);
        if let Some(iface) = self.masquerade_interface() {
            settings = settings.with_masquerade(iface);
        }
        for (instance, quota) in &self.rule_quotas {
            settings = settings.with_quota(instance.clone(), *quota);
        }
        settings
    }

    pub fn bootstrap_settings(&self) -> BootstrapSettings {
        BootstrapSettings {
            enabled: self.bootstrap.enabled,
            port_range: self.bootstrap.port_min..=self.bootstrap.port_max,
            retry: RetryPolicy::fixed(
                self.bootstrap.resolve_attempts,
                Duration::from_secs(self.bootstrap.resolve_delay_secs),
            ),
        }
    }

    pub fn iptables_driver(&self) -> IptablesDriver {
        IptablesDriver::new(
            CommandExecutor::iptables(&self.iptables_path).with_timeout(self.command_timeout()),
        )
    }

    pub fn lxd_backend(&self) -> LxdBackend {
        LxdBackend::new(
            CommandExecutor::new(&self.lxd.lxc_path).with_timeout(self.command_timeout()),
            &self.lxd.bridge,
        )
    }
}

/// Config file location: explicit path, then `DRNAT_CONFIG`, then the system
/// path for root or the per-user XDG config for everyone else
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    resolve_config_path(explicit, nix::unistd::getuid().is_root())
}

fn resolve_config_path(explicit: Option<&Path>, is_root: bool) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR)
        && !path.is_empty()
    {
        return PathBuf::from(path);
    }
    if !is_root && let Some(dir) = get_config_dir() {
        return dir.join(CONFIG_FILE_NAME);
    }
    PathBuf::from(SYSTEM_CONFIG_PATH)
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
///
/// # Async
/// Uses `tokio::fs` for non-blocking I/O.
pub async fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(config)?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    // Create file with restrictive permissions from the start to prevent
    // race condition where file is briefly world-readable
    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600) // Set permissions BEFORE any data is written
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            ))
        } else {
            Error::Io(e)
        }
    })?;
    Ok(())
}

/// Loads and validates the config at `path`
///
/// # Errors
///
/// - [`Error::Config`] if the file is missing, unparsable or invalid
pub async fn load_config(path: &Path) -> Result<AppConfig> {
    let json = match tokio::fs::read_to_string(path).await {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::Config(format!(
                "No configuration at {} (run `drnat init`)",
                path.display()
            )));
        }
        Err(e) => return Err(Error::Config(format!("{}: {e}", path.display()))),
    };

    let config: AppConfig = serde_json::from_str(&json)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}
