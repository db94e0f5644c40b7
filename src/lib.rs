//! DRNAT - Dumb Rust NAT
//!
//! Port-forwarding (DNAT + MASQUERADE) rules for LXD containers, tracked in a
//! local ledger and kept in sync with the iptables `nat` table across the
//! container lifecycle.
//!
//! # Architecture
//!
//! - [`core`] - Rule ledger, synchronizer, lifecycle hooks, iptables and LXD seams
//! - [`audit`] - Audit logging for all privileged operations
//! - [`validators`] - Input validation
//! - [`config`] - Configuration loading and persistence
//! - [`elevation`] - Privilege elevation for iptables
//! - [`utils`] - XDG directories and interface discovery
//!
//! # Safety Features
//!
//! - Kernel rules are applied before the ledger is written, with rollback
//! - Per-instance critical sections plus a `flock`-guarded ledger
//! - SHA-256 ledger checksums
//! - Atomic file operations with secure permissions
//! - Command timeouts on every external call

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::lifecycle::{BootstrapOutcome, LifecycleCoordinator};
pub use core::rule::{Protocol, RuleRecord};
pub use core::sync::RuleSynchronizer;
