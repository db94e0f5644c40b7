//! Packet-filter driver abstraction
//!
//! [`PacketFilter`] is the seam between rule synchronization and the kernel.
//! Production code uses [`IptablesDriver`]; tests use the in-memory filter in
//! `core::test_helpers` or drive [`IptablesDriver`] against a mock script.

use crate::core::error::CommandError;
use crate::core::executor::CommandExecutor;
use crate::core::rule::{NatRule, RuleOp};
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Result of a best-effort kernel rule deletion
#[derive(Debug)]
pub enum RemoveOutcome {
    /// The rule existed and was deleted
    Removed,
    /// The kernel had no matching rule (expected drift)
    AlreadyAbsent,
    /// The delete failed for another reason
    Failed(CommandError),
}

impl RemoveOutcome {
    /// True unless the kernel reported a real failure
    pub fn is_clean(&self) -> bool {
        !matches!(self, RemoveOutcome::Failed(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RemoveOutcome::Removed => "removed",
            RemoveOutcome::AlreadyAbsent => "already_absent",
            RemoveOutcome::Failed(_) => "failed",
        }
    }
}

/// Kernel NAT rule operations over structured rule descriptions
#[async_trait]
pub trait PacketFilter: Send + Sync {
    /// Appends the rule to its chain
    async fn apply(&self, rule: &NatRule) -> Result<(), CommandError>;

    /// Deletes one exact match of the rule
    async fn remove(&self, rule: &NatRule) -> RemoveOutcome;

    /// Checks whether an exact match is present
    async fn exists(&self, rule: &NatRule) -> Result<bool, CommandError>;
}

/// iptables reports "no such rule" with exit code 1 and this message.
///
/// "No chain/target/match by that name" also exits 1, but it means a missing
/// extension or chain, so it stays a real failure.
fn is_missing_rule(err: &CommandError) -> bool {
    err.exit_code() == Some(1)
        && err
            .stderr()
            .to_lowercase()
            .contains("does a matching rule exist")
}

/// [`PacketFilter`] backed by the `iptables` binary
#[derive(Debug, Clone)]
pub struct IptablesDriver {
    executor: CommandExecutor,
    /// Seconds to wait for the xtables lock (`-w`)
    lock_wait_secs: u32,
}

impl IptablesDriver {
    pub fn new(executor: CommandExecutor) -> Self {
        Self {
            executor,
            lock_wait_secs: 5,
        }
    }

    pub fn with_lock_wait(mut self, secs: u32) -> Self {
        self.lock_wait_secs = secs;
        self
    }

    fn args(&self, rule: &NatRule, op: RuleOp) -> Vec<String> {
        let mut args = vec!["-w".to_string(), self.lock_wait_secs.to_string()];
        args.extend(rule.to_args(op));
        args
    }
}

#[async_trait]
impl PacketFilter for IptablesDriver {
    async fn apply(&self, rule: &NatRule) -> Result<(), CommandError> {
        self.executor.run(&self.args(rule, RuleOp::Append)).await?;
        info!("Applied {rule}");
        Ok(())
    }

    async fn remove(&self, rule: &NatRule) -> RemoveOutcome {
        match self.executor.run(&self.args(rule, RuleOp::Delete)).await {
            Ok(_) => {
                info!("Removed {rule}");
                RemoveOutcome::Removed
            }
            Err(e) if is_missing_rule(&e) => {
                debug!("Rule already absent from kernel: {rule}");
                RemoveOutcome::AlreadyAbsent
            }
            Err(e) => {
                warn!("Failed to remove {rule}: {e}");
                RemoveOutcome::Failed(e)
            }
        }
    }

    async fn exists(&self, rule: &NatRule) -> Result<bool, CommandError> {
        match self.executor.run(&self.args(rule, RuleOp::Check)).await {
            Ok(_) => Ok(true),
            Err(e) if is_missing_rule(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
