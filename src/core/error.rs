use std::time::Duration;
use thiserror::Error;

/// Core error types for drnat
#[derive(Debug, Error)]
pub enum Error {
    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// The compute backend does not know this instance
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// No ledger record matches the request
    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    /// Duplicate rule key or external port already forwarded
    #[error("Conflict on {rule_id}: {reason}")]
    Conflict { rule_id: String, reason: String },

    /// Per-instance rule limit reached
    #[error("Instance {instance_id} reached its NAT rule limit ({limit})")]
    QuotaExceeded { instance_id: String, limit: u32 },

    /// Compute backend unreachable or instance address unresolved
    #[error("Compute backend unavailable: {0}")]
    UpstreamUnavailable(String),

    /// External command (iptables, lxc) failed
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Ledger could not be parsed
    #[error("Ledger corrupted: {0}")]
    Corruption(String),

    /// Configuration missing or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn conflict(rule_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            rule_id: rule_id.into(),
            reason: reason.into(),
        }
    }
}

/// Outcome classification for external command invocations
#[derive(Debug, Error)]
pub enum CommandError {
    /// The process did not finish in time and was killed
    #[error("`{command}` timed out after {}s", timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    /// The binary could not be found
    #[error("`{0}` not found - is it installed and in PATH?")]
    BinaryNotFound(String),

    /// The process ran and reported failure
    #[error("`{command}` failed ({}): {}", exit_code.map_or_else(|| "killed by signal".to_string(), |c| format!("exit code {c}")), stderr.trim())]
    NonZeroExit {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// Privilege escalation could not be arranged
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// Spawning or waiting failed for another reason
    #[error("Failed to run `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl CommandError {
    /// Captured stderr for non-zero exits, empty otherwise
    pub fn stderr(&self) -> &str {
        match self {
            Self::NonZeroExit { stderr, .. } => stderr,
            _ => "",
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::NonZeroExit { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("you must be root")
        {
            return ErrorTranslation::new("Insufficient permissions to modify NAT rules")
                .with_suggestion("Run drnat as root or configure sudo for iptables")
                .with_suggestion("Or set DRNAT_ELEVATION_METHOD=sudo with a NOPASSWD sudoers entry")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        // Missing iptables
        if lower.contains("not found - is it installed") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables-nft  (Fedora/RHEL)")
                .with_suggestion("Or set iptables_path in the drnat config");
        }

        // xtables lock held by another process
        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Another process is holding the iptables lock")
                .with_suggestion("Wait a moment and try again")
                .with_suggestion(
                    "Check for conflicting firewall managers: sudo systemctl status firewalld ufw",
                );
        }

        // Missing kernel support for the nat table or comment match
        if lower.contains("table does not exist")
            || lower.contains("can't initialize iptables table")
            || lower.contains("couldn't load match")
            || lower.contains("couldn't load target")
        {
            return ErrorTranslation::new("Kernel NAT support is not available")
                .with_suggestion("Load the modules: sudo modprobe iptable_nat xt_comment")
                .with_suggestion("Check kernel modules: lsmod | grep -E 'nat|comment'")
                .with_help("https://wiki.archlinux.org/title/Iptables");
        }

        // Chain errors
        if lower.contains("no chain/target/match by that name") {
            return ErrorTranslation::new("NAT chain, target or match not found")
                .with_suggestion("The rule may already have been removed")
                .with_suggestion("List the nat table: sudo iptables -t nat -S");
        }

        // Rule did not match on delete/check
        if lower.contains("bad rule") || lower.contains("does a matching rule exist") {
            return ErrorTranslation::new("No matching NAT rule in the kernel")
                .with_suggestion("The kernel rule table and the ledger have drifted")
                .with_suggestion("Run `drnat verify` to compare them");
        }

        // Invalid arguments
        if lower.contains("bad argument")
            || lower.contains("invalid port")
            || lower.contains("host/network")
            || lower.contains("try `iptables -h'")
        {
            return ErrorTranslation::new("iptables rejected the rule arguments")
                .with_suggestion("Verify ports are between 1 and 65535")
                .with_suggestion("Check listen_ip and uplink_interface in the config");
        }

        // Timeout errors
        if lower.contains("timeout") || lower.contains("timed out") {
            return ErrorTranslation::new("Operation timed out")
                .with_suggestion("The iptables call took too long")
                .with_suggestion("Check system load: uptime")
                .with_suggestion("Try again when the system is less busy");
        }

        // Generic fallback
        ErrorTranslation::new(format!("NAT rule error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Inspect the nat table: sudo iptables -t nat -S")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
