//! Privilege elevation for packet-filter operations
//!
//! drnat is normally run as root by the container controller, but it can also
//! be used interactively by an unprivileged operator. Only `iptables` (and its
//! `-legacy` / `-nft` variants) is ever elevated.
//!
//! # Elevation Strategy
//!
//! 1. `DRNAT_TEST_NO_ELEVATION` set: run the binary directly (tests only)
//! 2. Already root: run the binary directly
//! 3. `DRNAT_ELEVATION_METHOD` set: use `sudo`, `run0`, or `pkexec` as requested
//! 4. Otherwise prefer `run0`, then `sudo` on a terminal, then `pkexec`
//!
//! # Security
//!
//! - Only iptables binaries can be elevated
//! - Arguments are passed directly without shell interpolation
//! - Elevation binaries are checked for availability

use std::path::Path;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `DRNAT_ELEVATION_METHOD`
    #[error("Invalid DRNAT_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// The program is not on the elevation allow-list
    #[error("Refusing to elevate '{0}': only iptables binaries may be elevated")]
    NotAllowed(String),
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Returns true if `program` names an iptables binary, by path or bare name
pub fn is_iptables_binary(program: &str) -> bool {
    Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| {
            matches!(name, "iptables" | "iptables-legacy" | "iptables-nft")
        })
}

fn wrapped(wrapper: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(wrapper);
    cmd.arg(program).args(args);
    cmd
}

fn direct(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

/// Internal helper to build an elevated command for a specific program.
fn build_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    // 1. Strict Test Mode Override (Highest Priority)
    if std::env::var("DRNAT_TEST_NO_ELEVATION").is_ok() {
        return Ok(direct(program, args));
    }

    // 2. Direct Root Execution (the usual case for the controller)
    if nix::unistd::getuid().is_root() {
        return Ok(direct(program, args));
    }

    // 3. Explicit elevation method override (for sudoers NOPASSWD setups)
    if let Ok(method) = std::env::var("DRNAT_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if !binary_exists(&method) {
                        return Err(ElevationError::MethodNotAvailable(method));
                    }
                    Ok(wrapped(&method, program, args))
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection - prefer run0 (no SUID), fall back to sudo/pkexec
    if binary_exists("run0") {
        return Ok(wrapped("run0", program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty {
        Ok(wrapped("sudo", program, args))
    } else {
        if !binary_exists("pkexec") {
            return Err(ElevationError::PkexecNotFound);
        }
        Ok(wrapped("pkexec", program, args))
    }
}

/// Creates an elevated iptables command with the specified arguments
///
/// `program` is the configured iptables binary (`iptables`, a full path, or
/// an `-legacy`/`-nft` variant). Anything else is rejected with
/// [`ElevationError::NotAllowed`].
///
/// # Testing
///
/// Set `DRNAT_TEST_NO_ELEVATION=1` to run the binary directly.
pub fn create_elevated_iptables_command(
    program: &str,
    args: &[&str],
) -> Result<Command, ElevationError> {
    if !is_iptables_binary(program) {
        return Err(ElevationError::NotAllowed(program.to_string()));
    }
    build_elevated_command(program, args)
}
