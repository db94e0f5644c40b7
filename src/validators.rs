//! Input validation for DRNAT
//!
//! Everything that ends up in an iptables argument vector or an `lxc query`
//! path passes through here first. Validators return `Result<T, String>` with a
//! user-facing message; callers wrap it into [`crate::core::error::Error::Validation`].

use crate::core::rule::Protocol;
use std::str::FromStr;

/// Longest instance name LXD accepts
pub const MAX_INSTANCE_NAME_LEN: usize = 63;

/// Validates an instance name.
///
/// LXD instance names follow hostname rules:
/// - 1 to 63 characters
/// - ASCII letters, digits and `-` only
/// - Must start with a letter
/// - Must not end with `-`
///
/// The name is embedded in rule tags and API paths, so nothing else is allowed.
///
/// # Examples
///
/// ```
/// use drnat::validators::validate_instance_name;
///
/// assert!(validate_instance_name("web1").is_ok());
/// assert!(validate_instance_name("1web").is_err());
/// assert!(validate_instance_name("web/../etc").is_err());
/// ```
///
/// # Errors
///
/// Returns `Err` describing the first rule violated.
pub fn validate_instance_name(name: &str) -> Result<&str, String> {
    if name.is_empty() {
        return Err("Instance name cannot be empty".to_string());
    }

    if name.len() > MAX_INSTANCE_NAME_LEN {
        return Err(format!(
            "Instance name too long (max {MAX_INSTANCE_NAME_LEN} characters)"
        ));
    }

    // SECURITY: ASCII-only so the name is safe in iptables comments and URL paths
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err("Instance name may only contain letters, digits and '-'".to_string());
    }

    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err("Instance name must start with a letter".to_string());
    }

    if name.ends_with('-') {
        return Err("Instance name cannot end with '-'".to_string());
    }

    Ok(name)
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either port is 0
/// - Start port is greater than end port
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - 1 to 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<&str, String> {
    if name.is_empty() {
        return Err("Interface name cannot be empty".to_string());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name)
}

/// Parses a protocol name (`tcp` / `udp`, any case).
///
/// # Errors
///
/// Returns `Err` for anything else.
pub fn validate_protocol(input: &str) -> Result<Protocol, String> {
    Protocol::from_str(input.trim())
        .map_err(|_| format!("Unsupported protocol '{input}' (expected tcp or udp)"))
}

/// Checks if a port is well-known and returns informational message.
///
/// This is informational only and never blocks a forward.
pub fn check_well_known_port(port: u16) -> Option<String> {
    if port <= 1024 {
        let name = match port {
            22 => "SSH",
            80 => "HTTP",
            443 => "HTTPS",
            53 => "DNS",
            25 => "SMTP",
            21 => "FTP",
            _ => return Some(format!("Privileged port {port}")),
        };
        Some(format!("Port {port}: {name}"))
    } else {
        None
    }
}
