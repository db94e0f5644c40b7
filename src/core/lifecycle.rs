//! Instance lifecycle hooks
//!
//! - Before an instance is deleted or reinstalled, all its forwards are torn
//!   down ([`LifecycleCoordinator::teardown`])
//! - After first boot, a remote-access forward to port 22 is provisioned on a
//!   random external port ([`LifecycleCoordinator::on_first_boot`])
//!
//! None of these hooks fail the surrounding instance operation: problems are
//! logged and returned as reports or outcomes.

use crate::audit::AuditEvent;
use crate::core::error::{Error, Result};
use crate::core::rule::{BOOTSTRAP_INTERNAL_PORT, Protocol, RuleRecord};
use crate::core::sync::{RemovalReport, RuleSynchronizer};
use rand::Rng;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Delay between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^n`, capped at `max`
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay after the failed attempt with 0-based index `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => 1u32
                .checked_shl(attempt)
                .and_then(|factor| base.checked_mul(factor))
                .map_or(max, |delay| delay.min(max)),
        }
    }
}

/// Bounded retry for operations that may not be ready yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(5))
    }
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(delay),
        }
    }

    pub const fn exponential(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential { base, max },
        }
    }

    /// Sleeps taken between attempts; there is none after the last one
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts.saturating_sub(1)).map(|attempt| self.backoff.delay(attempt))
    }

    /// Calls `op` until it yields `Some`, at most `max_attempts` times
    ///
    /// `op` receives the 1-based attempt number. Zero attempts never calls it.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Option<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let mut delays = self.delays();
        for attempt in 1..=self.max_attempts {
            if let Some(value) = op(attempt).await {
                return Some(value);
            }
            if let Some(delay) = delays.next() {
                debug!("Attempt {attempt}/{} failed, retrying in {delay:?}", self.max_attempts);
                tokio::time::sleep(delay).await;
            }
        }
        None
    }
}

/// Bootstrap forward parameters
#[derive(Debug, Clone)]
pub struct BootstrapSettings {
    /// Provision the forward after `reimage`
    pub enabled: bool,
    /// Candidate external ports
    pub port_range: RangeInclusive<u16>,
    /// Address resolution retry
    pub retry: RetryPolicy,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port_range: 10000..=65535,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub enum BootstrapOutcome {
    Provisioned(RuleRecord),
    /// The chosen external port is already taken
    PortCollision(u16),
    /// The instance never reported an address
    AddressUnresolved,
    Failed(String),
}

impl BootstrapOutcome {
    pub fn record(&self) -> Option<&RuleRecord> {
        match self {
            BootstrapOutcome::Provisioned(record) => Some(record),
            _ => None,
        }
    }
}

/// Result of tearing down one instance
#[derive(Debug)]
pub struct TeardownReport {
    pub instance_id: String,
    pub removals: Vec<RemovalReport>,
    /// `(rule_id, error)` for records whose removal returned an error
    pub failures: Vec<(String, String)>,
}

impl TeardownReport {
    /// Every record was dropped and every kernel delete succeeded or found nothing
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.removals.iter().all(RemovalReport::is_clean)
    }

    pub fn removed_count(&self) -> usize {
        self.removals.iter().filter(|r| r.ledger_removed).count()
    }

    /// Kernel deletes that failed and were abandoned
    pub fn discrepancies(&self) -> usize {
        self.removals.iter().filter(|r| !r.is_clean()).count()
    }
}

/// Result of `reimage`
#[derive(Debug)]
pub struct ReimageReport<T> {
    pub teardown: TeardownReport,
    pub rebuilt: T,
    /// `None` when bootstrap is disabled
    pub bootstrap: Option<BootstrapOutcome>,
}

#[derive(Debug)]
pub struct LifecycleCoordinator {
    sync: Arc<RuleSynchronizer>,
    bootstrap: BootstrapSettings,
}

impl LifecycleCoordinator {
    pub fn new(sync: Arc<RuleSynchronizer>, bootstrap: BootstrapSettings) -> Self {
        Self { sync, bootstrap }
    }

    pub fn synchronizer(&self) -> &Arc<RuleSynchronizer> {
        &self.sync
    }

    /// Removes every forward owned by `instance_id`
    ///
    /// Each record's snapshot address is used for the kernel deletes, so this
    /// works for stopped or already vanished instances.
    pub async fn teardown(&self, instance_id: &str) -> TeardownReport {
        let _guard = self.sync.lock_instance(instance_id).await;
        self.teardown_locked(instance_id).await
    }

    /// Body of `teardown`; the caller holds the instance lock, so adds for
    /// this instance wait until every record is gone
    async fn teardown_locked(&self, instance_id: &str) -> TeardownReport {
        let records = self.sync.list_rules(instance_id).await;
        info!("Tearing down {} forward(s) for {instance_id}", records.len());

        let mut report = TeardownReport {
            instance_id: instance_id.to_string(),
            removals: Vec::with_capacity(records.len()),
            failures: Vec::new(),
        };

        for record in records {
            match self
                .sync
                .remove_locked(
                    &record.instance_id,
                    record.protocol,
                    record.external_port,
                    record.internal_port,
                    Some(record.instance_ip),
                )
                .await
            {
                Ok(removal) => report.removals.push(removal),
                Err(e) => {
                    error!("Teardown of {} failed: {e}", record.rule_id);
                    report.failures.push((record.rule_id, e.to_string()));
                }
            }
        }

        if report.is_clean() {
            info!(
                "Teardown of {instance_id} complete ({} removed)",
                report.removed_count()
            );
        } else {
            warn!(
                "Teardown of {instance_id} finished with {} discrepancy(ies) and {} failure(s)",
                report.discrepancies(),
                report.failures.len()
            );
        }

        if let Some(audit) = self.sync.audit() {
            audit
                .record(AuditEvent::teardown(
                    instance_id,
                    report.removed_count(),
                    report.failures.len() + report.discrepancies(),
                ))
                .await;
        }
        report
    }

    /// Tears down forwards, then runs the caller's destroy operation
    ///
    /// # Errors
    ///
    /// Returns whatever `destroy` returns. Teardown problems are only logged.
    ///
    /// The instance lock is held until `destroy` finishes; an `add_rule`
    /// racing with it then fails with [`crate::Error::InstanceNotFound`].
    pub async fn decommission<T, F, Fut>(&self, instance_id: &str, destroy: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _guard = self.sync.lock_instance(instance_id).await;
        self.teardown_locked(instance_id).await;
        destroy().await
    }

    /// Tears down forwards, rebuilds the instance, then provisions the bootstrap forward
    ///
    /// # Errors
    ///
    /// Returns the error from `rebuild`; bootstrap is not attempted in that case.
    pub async fn reimage<T, F, Fut>(&self, instance_id: &str, rebuild: F) -> Result<ReimageReport<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.sync.lock_instance(instance_id).await;
        let teardown = self.teardown_locked(instance_id).await;
        let rebuilt = rebuild().await;
        // Bootstrap goes through add_rule, which takes the lock itself
        drop(guard);
        let rebuilt = rebuilt?;
        let bootstrap = if self.bootstrap.enabled {
            Some(self.on_first_boot(instance_id).await)
        } else {
            debug!("Bootstrap disabled, not provisioning remote access for {instance_id}");
            None
        };

        Ok(ReimageReport {
            teardown,
            rebuilt,
            bootstrap,
        })
    }

    /// Provisions the remote-access forward on a random external port
    pub async fn on_first_boot(&self, instance_id: &str) -> BootstrapOutcome {
        if self.bootstrap.port_range.is_empty() {
            error!("Bootstrap port range is empty, no remote-access forward for {instance_id}");
            return BootstrapOutcome::Failed("empty bootstrap port range".to_string());
        }
        let port = rand::rng().random_range(self.bootstrap.port_range.clone());
        self.on_first_boot_with_port(instance_id, port).await
    }

    /// Provisions the remote-access forward on `external_port`
    pub async fn on_first_boot_with_port(
        &self,
        instance_id: &str,
        external_port: u16,
    ) -> BootstrapOutcome {
        let outcome = self.bootstrap_inner(instance_id, external_port).await;

        if let Some(audit) = self.sync.audit() {
            let error = match &outcome {
                BootstrapOutcome::Provisioned(_) => None,
                BootstrapOutcome::PortCollision(port) => Some(format!("port {port} in use")),
                BootstrapOutcome::AddressUnresolved => Some("address unresolved".to_string()),
                BootstrapOutcome::Failed(reason) => Some(reason.clone()),
            };
            audit
                .record(AuditEvent::bootstrap(instance_id, outcome.record(), error))
                .await;
        }
        outcome
    }

    async fn bootstrap_inner(&self, instance_id: &str, external_port: u16) -> BootstrapOutcome {
        let backend = self.sync.backend();
        let address: Option<Ipv4Addr> = self
            .bootstrap
            .retry
            .run(|attempt| async move {
                match backend.internal_address(instance_id).await {
                    Ok(Some(ip)) => Some(ip),
                    Ok(None) => {
                        debug!("No address for {instance_id} yet (attempt {attempt})");
                        None
                    }
                    Err(e) => {
                        warn!("Address lookup for {instance_id} failed (attempt {attempt}): {e}");
                        None
                    }
                }
            })
            .await;

        if address.is_none() {
            error!(
                "Could not resolve an address for {instance_id}, no remote-access forward created"
            );
            return BootstrapOutcome::AddressUnresolved;
        }

        match self
            .sync
            .add_rule(
                instance_id,
                Protocol::Tcp,
                external_port,
                BOOTSTRAP_INTERNAL_PORT,
            )
            .await
        {
            Ok(record) => {
                info!(
                    "Remote access for {instance_id} on external port {external_port}"
                );
                BootstrapOutcome::Provisioned(record)
            }
            Err(Error::Conflict { reason, .. }) => {
                warn!("Bootstrap port {external_port} for {instance_id} collides: {reason}");
                BootstrapOutcome::PortCollision(external_port)
            }
            Err(e) => {
                error!("Bootstrap forward for {instance_id} failed: {e}");
                BootstrapOutcome::Failed(e.to_string())
            }
        }
    }
}
