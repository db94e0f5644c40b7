//! NAT rule data structures and iptables argument generation
//!
//! A [`RuleRecord`] is one ledger entry: a single port forward from the host's
//! listen address to a port inside an instance. Each record is backed by up to
//! two kernel rules, described structurally by [`NatRule`]:
//!
//! - a DNAT rule in `PREROUTING`, tagged with the record's `rule_id`
//! - a MASQUERADE rule in `POSTROUTING`, tagged with `rule_id` + [`MASQ_SUFFIX`]
//!
//! iptables arguments are always rebuilt from these structured fields. The
//! comment tag written into the kernel is never parsed back.
//!
//! # Example
//!
//! ```
//! use drnat::core::rule::{NatRule, Protocol, RuleKey, RuleOp};
//! use std::net::Ipv4Addr;
//!
//! let key = RuleKey::new("web1", Protocol::Tcp, 8080);
//! assert_eq!(key.rule_id(), "drnat_web1_tcp_8080");
//!
//! let rule = NatRule::dnat(
//!     Ipv4Addr::new(203, 0, 113, 10),
//!     &key,
//!     Ipv4Addr::new(10, 0, 3, 15),
//!     80,
//! );
//! let args = rule.to_args(RuleOp::Append);
//! assert_eq!(&args[..4], ["-t", "nat", "-A", "PREROUTING"]);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Prefix of every rule tag written by drnat
pub const RULE_TAG_PREFIX: &str = "drnat";

/// Suffix appended to `rule_id` for the masquerade half of a forward
pub const MASQ_SUFFIX: &str = "_masq";

/// Internal port of the bootstrap remote-access (SSH) rule
pub const BOOTSTRAP_INTERNAL_PORT: u16 = 22;

/// Transport protocol of a forward
///
/// `Copy` trait allows efficient passing by value for this small enum.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Protocol {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Identity of a forward: at most one active record exists per key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleKey {
    pub instance_id: String,
    pub protocol: Protocol,
    pub external_port: u16,
}

impl RuleKey {
    pub fn new(instance_id: impl Into<String>, protocol: Protocol, external_port: u16) -> Self {
        Self {
            instance_id: instance_id.into(),
            protocol,
            external_port,
        }
    }

    /// Deterministic ledger key and kernel comment tag
    pub fn rule_id(&self) -> String {
        format!(
            "{RULE_TAG_PREFIX}_{}_{}_{}",
            self.instance_id, self.protocol, self.external_port
        )
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}",
            self.instance_id, self.protocol, self.external_port
        )
    }
}

/// One ledger entry describing a single active forward
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleRecord {
    pub instance_id: String,
    pub protocol: Protocol,
    pub external_port: u16,
    pub internal_port: u16,
    /// Instance address at creation time, never refreshed
    pub instance_ip: Ipv4Addr,
    pub rule_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl RuleRecord {
    pub fn new(key: &RuleKey, internal_port: u16, instance_ip: Ipv4Addr) -> Self {
        Self {
            instance_id: key.instance_id.clone(),
            protocol: key.protocol,
            external_port: key.external_port,
            internal_port,
            instance_ip,
            rule_id: key.rule_id(),
            created_at: Some(Utc::now()),
        }
    }

    pub fn key(&self) -> RuleKey {
        RuleKey::new(self.instance_id.clone(), self.protocol, self.external_port)
    }

    /// True for the SSH rule that may exceed the instance quota
    pub fn is_bootstrap(&self) -> bool {
        is_bootstrap_request(self.protocol, self.internal_port)
    }

    pub fn matches(
        &self,
        instance_id: &str,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
    ) -> bool {
        self.instance_id == instance_id
            && self.protocol == protocol
            && self.external_port == external_port
            && self.internal_port == internal_port
    }

    pub fn dnat_rule(&self, listen_ip: Ipv4Addr) -> NatRule {
        NatRule::Dnat {
            listen_ip,
            protocol: self.protocol,
            external_port: self.external_port,
            destination: SocketAddrV4::new(self.instance_ip, self.internal_port),
            tag: self.rule_id.clone(),
        }
    }

    pub fn masquerade_rule(&self, out_interface: &str) -> NatRule {
        NatRule::Masquerade {
            source: self.instance_ip,
            out_interface: out_interface.to_string(),
            tag: format!("{}{MASQ_SUFFIX}", self.rule_id),
        }
    }
}

/// tcp → 22 forwards are always admitted past the quota
pub fn is_bootstrap_request(protocol: Protocol, internal_port: u16) -> bool {
    protocol == Protocol::Tcp && internal_port == BOOTSTRAP_INTERNAL_PORT
}

/// iptables rule operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOp {
    /// `-A`: append to the chain
    Append,
    /// `-D`: delete the first exact match
    Delete,
    /// `-C`: check whether an exact match exists
    Check,
}

impl RuleOp {
    pub const fn flag(self) -> &'static str {
        match self {
            RuleOp::Append => "-A",
            RuleOp::Delete => "-D",
            RuleOp::Check => "-C",
        }
    }
}

/// Structured description of a single kernel rule in the `nat` table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NatRule {
    /// Inbound destination rewrite to the instance
    Dnat {
        listen_ip: Ipv4Addr,
        protocol: Protocol,
        external_port: u16,
        destination: SocketAddrV4,
        tag: String,
    },
    /// Outbound source rewrite for traffic leaving the instance
    Masquerade {
        source: Ipv4Addr,
        out_interface: String,
        tag: String,
    },
}

impl NatRule {
    pub fn dnat(
        listen_ip: Ipv4Addr,
        key: &RuleKey,
        instance_ip: Ipv4Addr,
        internal_port: u16,
    ) -> Self {
        NatRule::Dnat {
            listen_ip,
            protocol: key.protocol,
            external_port: key.external_port,
            destination: SocketAddrV4::new(instance_ip, internal_port),
            tag: key.rule_id(),
        }
    }

    pub fn masquerade(key: &RuleKey, instance_ip: Ipv4Addr, out_interface: &str) -> Self {
        NatRule::Masquerade {
            source: instance_ip,
            out_interface: out_interface.to_string(),
            tag: format!("{}{MASQ_SUFFIX}", key.rule_id()),
        }
    }

    pub const fn table(&self) -> &'static str {
        "nat"
    }

    pub const fn chain(&self) -> &'static str {
        match self {
            NatRule::Dnat { .. } => "PREROUTING",
            NatRule::Masquerade { .. } => "POSTROUTING",
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            NatRule::Dnat { tag, .. } | NatRule::Masquerade { tag, .. } => tag,
        }
    }

    /// Match and target arguments, without table/op/chain
    pub fn rule_spec(&self) -> Vec<String> {
        let mut spec: Vec<String> = match self {
            NatRule::Dnat {
                listen_ip,
                protocol,
                external_port,
                destination,
                ..
            } => vec![
                "-d".into(),
                listen_ip.to_string(),
                "-p".into(),
                protocol.as_str().into(),
                "--dport".into(),
                external_port.to_string(),
                "-j".into(),
                "DNAT".into(),
                "--to-destination".into(),
                destination.to_string(),
            ],
            NatRule::Masquerade {
                source,
                out_interface,
                ..
            } => vec![
                "-s".into(),
                source.to_string(),
                "-o".into(),
                out_interface.clone(),
                "-j".into(),
                "MASQUERADE".into(),
            ],
        };
        spec.extend([
            "-m".into(),
            "comment".into(),
            "--comment".into(),
            self.tag().to_string(),
        ]);
        spec
    }

    /// Full iptables argument vector for `op`
    pub fn to_args(&self, op: RuleOp) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table().to_string(),
            op.flag().to_string(),
            self.chain().to_string(),
        ];
        args.extend(self.rule_spec());
        args
    }
}

impl fmt::Display for NatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NatRule::Dnat {
                listen_ip,
                protocol,
                external_port,
                destination,
                tag,
            } => write!(
                f,
                "DNAT {listen_ip}:{external_port}/{protocol} -> {destination} [{tag}]"
            ),
            NatRule::Masquerade {
                source,
                out_interface,
                tag,
            } => write!(f, "MASQUERADE {source} via {out_interface} [{tag}]"),
        }
    }
}
