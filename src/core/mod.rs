//! Core NAT forwarding functionality
//!
//! Leaf-first:
//!
//! - [`error`]: Error types and iptables error translation
//! - [`rule`]: Rule records and structured `nat` table rules
//! - [`executor`]: Bounded execution of external binaries
//! - [`driver`]: The packet-filter seam and its iptables implementation
//! - [`ledger`]: Durable JSON record of active forwards
//! - [`backend`]: The compute platform seam and its LXD implementation
//! - [`sync`]: Adds, removes and verifies forwards against ledger and kernel
//! - [`lifecycle`]: Teardown and bootstrap hooks around instance operations

pub mod backend;
pub mod driver;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod lifecycle;
pub mod rule;
pub mod sync;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
