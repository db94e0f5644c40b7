//! Rule synchronization between the ledger and the kernel
//!
//! [`RuleSynchronizer`] is the only writer of NAT state. Every add or remove
//! runs inside a per-instance critical section covering the quota check, the
//! duplicate check, the kernel changes and the ledger write.
//!
//! # Add
//!
//! 1. Validate input, check the instance exists
//! 2. Enforce the quota (the bootstrap SSH forward is exempt)
//! 3. Reject duplicates and external port collisions
//! 4. Resolve the instance address on the bridge
//! 5. Append DNAT, then MASQUERADE (unless disabled)
//! 6. Persist the record
//!
//! A failure at step 5 or 6 deletes whatever was already applied, so the
//! ledger is only ever written after both kernel rules are in place.
//!
//! # Remove
//!
//! Removal is best effort and idempotent. Kernel deletes report
//! [`RemoveOutcome`]s; the ledger record is dropped regardless.

use crate::audit::{AuditEvent, AuditLog};
use crate::core::backend::ComputeBackend;
use crate::core::driver::{PacketFilter, RemoveOutcome};
use crate::core::error::{Error, Result};
use crate::core::ledger::Ledger;
use crate::core::rule::{NatRule, Protocol, RuleKey, RuleRecord, is_bootstrap_request};
use crate::validators::{validate_instance_name, validate_port};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// Host-side NAT parameters shared by every forward
#[derive(Debug, Clone)]
pub struct NatSettings {
    /// Destination address matched by DNAT rules
    pub listen_ip: Ipv4Addr,
    /// Outbound interface for MASQUERADE; `None` disables masquerading
    pub uplink_interface: Option<String>,
    /// Forwards per instance when neither backend nor override sets one (0 = unlimited)
    pub default_quota: u32,
    pub quota_overrides: HashMap<String, u32>,
}

impl NatSettings {
    pub fn new(listen_ip: Ipv4Addr) -> Self {
        Self {
            listen_ip,
            uplink_interface: None,
            default_quota: 0,
            quota_overrides: HashMap::new(),
        }
    }

    pub fn with_masquerade(mut self, interface: impl Into<String>) -> Self {
        self.uplink_interface = Some(interface.into());
        self
    }

    pub fn with_default_quota(mut self, quota: u32) -> Self {
        self.default_quota = quota;
        self
    }

    pub fn with_quota(mut self, instance_id: impl Into<String>, quota: u32) -> Self {
        self.quota_overrides.insert(instance_id.into(), quota);
        self
    }

    pub fn masquerade_interface(&self) -> Option<&str> {
        self.uplink_interface.as_deref()
    }

    fn configured_quota(&self, instance_id: &str) -> u32 {
        self.quota_overrides
            .get(instance_id)
            .copied()
            .unwrap_or(self.default_quota)
    }
}

/// Async mutex per instance id
#[derive(Debug, Default)]
pub struct InstanceLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InstanceLocks {
    pub async fn lock(&self, instance_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop entries nobody holds or waits on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(instance_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// What `remove_rule` did
#[derive(Debug)]
pub struct RemovalReport {
    pub rule_id: String,
    /// A ledger record was found and dropped
    pub ledger_removed: bool,
    /// `None` when no address was known, so nothing was sent to the kernel
    pub dnat: Option<RemoveOutcome>,
    /// `None` when masquerading is disabled or no address was known
    pub masquerade: Option<RemoveOutcome>,
}

impl RemovalReport {
    /// No kernel delete failed
    pub fn is_clean(&self) -> bool {
        self.dnat.as_ref().is_none_or(RemoveOutcome::is_clean)
            && self.masquerade.as_ref().is_none_or(RemoveOutcome::is_clean)
    }

    /// Nothing existed to remove anywhere
    pub fn was_noop(&self) -> bool {
        !self.ledger_removed
            && [&self.dnat, &self.masquerade]
                .iter()
                .all(|o| !matches!(o, Some(RemoveOutcome::Removed)))
    }
}

/// Kernel presence of one rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelState {
    Present,
    Missing,
    Unknown(String),
}

impl KernelState {
    fn from_check(result: std::result::Result<bool, crate::core::error::CommandError>) -> Self {
        match result {
            Ok(true) => KernelState::Present,
            Ok(false) => KernelState::Missing,
            Err(e) => KernelState::Unknown(e.to_string()),
        }
    }
}

/// Ledger record compared against the kernel and the live instance
#[derive(Debug, Clone)]
pub struct DriftReport {
    pub record: RuleRecord,
    pub dnat: KernelState,
    /// `None` when masquerading is disabled
    pub masquerade: Option<KernelState>,
    /// Current address, if the instance is running and has one
    pub live_address: Option<Ipv4Addr>,
}

impl DriftReport {
    /// The live address differs from the record's snapshot
    pub fn snapshot_stale(&self) -> bool {
        self.live_address
            .is_some_and(|ip| ip != self.record.instance_ip)
    }

    pub fn is_in_sync(&self) -> bool {
        self.dnat == KernelState::Present
            && self
                .masquerade
                .as_ref()
                .is_none_or(|m| *m == KernelState::Present)
            && !self.snapshot_stale()
    }
}

pub struct RuleSynchronizer {
    ledger: Arc<Ledger>,
    filter: Arc<dyn PacketFilter>,
    backend: Arc<dyn ComputeBackend>,
    settings: NatSettings,
    locks: InstanceLocks,
    audit: Option<AuditLog>,
}

impl std::fmt::Debug for RuleSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleSynchronizer")
            .field("ledger", &self.ledger.path())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RuleSynchronizer {
    pub fn new(
        ledger: Arc<Ledger>,
        filter: Arc<dyn PacketFilter>,
        backend: Arc<dyn ComputeBackend>,
        settings: NatSettings,
    ) -> Self {
        Self {
            ledger,
            filter,
            backend,
            settings,
            locks: InstanceLocks::default(),
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.backend
    }

    pub fn settings(&self) -> &NatSettings {
        &self.settings
    }

    pub(crate) fn audit(&self) -> Option<&AuditLog> {
        self.audit.as_ref()
    }

    /// Backend quota, then the configured override, then the default
    async fn resolve_quota(&self, instance_id: &str) -> Result<u32> {
        Ok(match self.backend.rule_quota(instance_id).await? {
            Some(quota) => quota,
            None => self.settings.configured_quota(instance_id),
        })
    }

    /// Best-effort delete used to undo a partially applied forward
    async fn rollback(&self, rule: &NatRule) {
        match self.filter.remove(rule).await {
            RemoveOutcome::Removed => info!("Rolled back {rule}"),
            RemoveOutcome::AlreadyAbsent => warn!("Rollback found {rule} already absent"),
            RemoveOutcome::Failed(e) => error!(
                "Rollback of {rule} failed, kernel rule may be orphaned (run `drnat verify`): {e}"
            ),
        }
    }

    /// Creates a forward from `listen_ip:external_port` to `instance:internal_port`
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for a malformed instance name or port 0
    /// - [`Error::InstanceNotFound`] if the backend does not know the instance
    /// - [`Error::QuotaExceeded`] if the instance is at its quota
    /// - [`Error::Conflict`] if the key exists or another instance owns the external port
    /// - [`Error::UpstreamUnavailable`] if the instance has no address yet
    /// - [`Error::Command`] if a kernel rule could not be applied (after rollback)
    pub async fn add_rule(
        &self,
        instance_id: &str,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
    ) -> Result<RuleRecord> {
        validate_instance_name(instance_id).map_err(|m| Error::validation("instance_id", m))?;
        validate_port(external_port).map_err(|m| Error::validation("external_port", m))?;
        validate_port(internal_port).map_err(|m| Error::validation("internal_port", m))?;

        let result = self
            .add_rule_locked(instance_id, protocol, external_port, internal_port)
            .await;

        if let Some(audit) = &self.audit {
            audit
                .record(AuditEvent::add_rule(
                    instance_id,
                    protocol,
                    external_port,
                    internal_port,
                    result.as_ref().err().map(ToString::to_string),
                ))
                .await;
        }
        result
    }

    async fn add_rule_locked(
        &self,
        instance_id: &str,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
    ) -> Result<RuleRecord> {
        let _guard = self.locks.lock(instance_id).await;

        if !self.backend.exists(instance_id).await? {
            return Err(Error::InstanceNotFound(instance_id.to_string()));
        }

        let key = RuleKey::new(instance_id, protocol, external_port);
        let rule_id = key.rule_id();
        let records = self.ledger.load().await;

        let owned = records
            .iter()
            .filter(|r| r.instance_id == instance_id)
            .count();
        let quota = self.resolve_quota(instance_id).await?;
        if quota != 0 && owned >= quota as usize {
            if is_bootstrap_request(protocol, internal_port) {
                info!(
                    "Bootstrap forward for {instance_id} admitted past quota ({owned}/{quota})"
                );
            } else {
                return Err(Error::QuotaExceeded {
                    instance_id: instance_id.to_string(),
                    limit: quota,
                });
            }
        }

        if records.iter().any(|r| r.rule_id == rule_id) {
            return Err(Error::conflict(
                &rule_id,
                "a rule for this instance, protocol and external port already exists",
            ));
        }
        if let Some(owner) = records
            .iter()
            .find(|r| r.protocol == protocol && r.external_port == external_port)
        {
            return Err(Error::conflict(
                &rule_id,
                format!(
                    "external port {external_port}/{protocol} is already forwarded to {}",
                    owner.instance_id
                ),
            ));
        }

        let instance_ip = self
            .backend
            .internal_address(instance_id)
            .await?
            .ok_or_else(|| {
                Error::UpstreamUnavailable(format!(
                    "Instance {instance_id} has no IPv4 address on the NAT bridge"
                ))
            })?;

        let record = RuleRecord::new(&key, internal_port, instance_ip);
        let dnat = record.dnat_rule(self.settings.listen_ip);
        self.filter.apply(&dnat).await?;

        let masquerade = self
            .settings
            .masquerade_interface()
            .map(|iface| record.masquerade_rule(iface));
        if let Some(rule) = &masquerade
            && let Err(e) = self.filter.apply(rule).await
        {
            warn!("Masquerade failed for {rule_id}, rolling back DNAT: {e}");
            self.rollback(&dnat).await;
            return Err(e.into());
        }

        if let Err(e) = self.ledger.insert_unique(record.clone()).await {
            warn!("Ledger write failed for {rule_id}, rolling back kernel rules: {e}");
            if let Some(rule) = &masquerade {
                self.rollback(rule).await;
            }
            self.rollback(&dnat).await;
            return Err(e);
        }

        info!(
            "Forwarded {}:{external_port}/{protocol} -> {instance_id} ({instance_ip}:{internal_port})",
            self.settings.listen_ip
        );
        Ok(record)
    }

    /// Removes a forward from the kernel and the ledger
    ///
    /// The address used for the kernel deletes comes from the ledger record,
    /// then `known_ip`, then a live lookup if the instance is running. Kernel
    /// failures are reported in the [`RemovalReport`], never as an error.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for a malformed instance name or port 0
    /// - [`Error::Io`] if the ledger could not be rewritten
    pub async fn remove_rule(
        &self,
        instance_id: &str,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        known_ip: Option<Ipv4Addr>,
    ) -> Result<RemovalReport> {
        validate_instance_name(instance_id).map_err(|m| Error::validation("instance_id", m))?;
        validate_port(external_port).map_err(|m| Error::validation("external_port", m))?;
        validate_port(internal_port).map_err(|m| Error::validation("internal_port", m))?;

        self.remove_unchecked(instance_id, protocol, external_port, internal_port, known_ip)
            .await
    }

    /// `remove_rule` without input validation, for records already in the ledger
    pub(crate) async fn remove_unchecked(
        &self,
        instance_id: &str,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        known_ip: Option<Ipv4Addr>,
    ) -> Result<RemovalReport> {
        let _guard = self.locks.lock(instance_id).await;
        self.remove_locked(instance_id, protocol, external_port, internal_port, known_ip)
            .await
    }

    /// Serializes with every add and remove for `instance_id` while held
    pub(crate) async fn lock_instance(&self, instance_id: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(instance_id).await
    }

    /// Body of `remove_unchecked`; the caller holds the instance lock
    pub(crate) async fn remove_locked(
        &self,
        instance_id: &str,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        known_ip: Option<Ipv4Addr>,
    ) -> Result<RemovalReport> {
        let key = RuleKey::new(instance_id, protocol, external_port);
        let record = self
            .ledger
            .load()
            .await
            .into_iter()
            .find(|r| r.matches(instance_id, protocol, external_port, internal_port));

        let address = match (&record, known_ip) {
            (Some(record), _) => Some(record.instance_ip),
            (None, Some(ip)) => Some(ip),
            (None, None) => self.live_address(instance_id).await,
        };

        let (dnat, masquerade) = match address {
            Some(ip) => {
                let target = record
                    .clone()
                    .unwrap_or_else(|| RuleRecord::new(&key, internal_port, ip));
                let dnat = self
                    .remove_logged(&target.dnat_rule(self.settings.listen_ip))
                    .await;
                let masquerade = match self.settings.masquerade_interface() {
                    Some(iface) => Some(self.remove_logged(&target.masquerade_rule(iface)).await),
                    None => None,
                };
                (Some(dnat), masquerade)
            }
            None => {
                info!("No address known for {key}, skipping kernel cleanup");
                (None, None)
            }
        };

        let removed = self
            .ledger
            .remove_matching(|r| r.matches(instance_id, protocol, external_port, internal_port))
            .await?;

        let report = RemovalReport {
            rule_id: key.rule_id(),
            ledger_removed: !removed.is_empty(),
            dnat,
            masquerade,
        };

        if report.was_noop() {
            info!("Nothing to remove for {key}");
        }
        if let Some(audit) = &self.audit {
            audit
                .record(AuditEvent::remove_rule(
                    &report.rule_id,
                    report.ledger_removed,
                    report.is_clean(),
                ))
                .await;
        }
        Ok(report)
    }

    async fn remove_logged(&self, rule: &NatRule) -> RemoveOutcome {
        let outcome = self.filter.remove(rule).await;
        match &outcome {
            RemoveOutcome::Removed => {}
            RemoveOutcome::AlreadyAbsent => info!("Kernel drift: {rule} was already gone"),
            RemoveOutcome::Failed(e) => {
                warn!("Discrepancy: could not delete {rule}, dropping it from the ledger anyway: {e}");
            }
        }
        outcome
    }

    /// Current address of a running instance; lookup errors count as unknown
    async fn live_address(&self, instance_id: &str) -> Option<Ipv4Addr> {
        match self.backend.status(instance_id).await {
            Ok(status) if status.is_running() => {}
            Ok(status) => {
                debug!("Instance {instance_id} is {status:?}, no live address");
                return None;
            }
            Err(e) => {
                debug!("Status lookup for {instance_id} failed: {e}");
                return None;
            }
        }

        match self.backend.internal_address(instance_id).await {
            Ok(address) => address,
            Err(e) => {
                warn!("Address lookup for {instance_id} failed: {e}");
                None
            }
        }
    }

    /// Ledger records owned by `instance_id`, in ledger order
    pub async fn list_rules(&self, instance_id: &str) -> Vec<RuleRecord> {
        self.ledger.records_for(instance_id).await
    }

    /// Looks up a record by its `rule_id`
    ///
    /// # Errors
    ///
    /// Returns [`Error::RuleNotFound`] if no record carries that id.
    pub async fn find_rule(&self, rule_id: &str) -> Result<RuleRecord> {
        self.ledger
            .find(rule_id)
            .await
            .ok_or_else(|| Error::RuleNotFound(rule_id.to_string()))
    }

    /// Compares ledger records with the kernel and the live instance addresses
    ///
    /// Read-only. With `instance_id` set only that instance's records are checked.
    pub async fn verify_rules(&self, instance_id: Option<&str>) -> Vec<DriftReport> {
        let records: Vec<RuleRecord> = match instance_id {
            Some(id) => self.ledger.records_for(id).await,
            None => self.ledger.load().await,
        };

        let mut live: HashMap<String, Option<Ipv4Addr>> = HashMap::new();
        let mut reports = Vec::with_capacity(records.len());

        for record in records {
            let dnat =
                KernelState::from_check(self.filter.exists(&record.dnat_rule(self.settings.listen_ip)).await);
            let masquerade = match self.settings.masquerade_interface() {
                Some(iface) => Some(KernelState::from_check(
                    self.filter.exists(&record.masquerade_rule(iface)).await,
                )),
                None => None,
            };

            let live_address = match live.get(&record.instance_id) {
                Some(address) => *address,
                None => {
                    let address = self.live_address(&record.instance_id).await;
                    live.insert(record.instance_id.clone(), address);
                    address
                }
            };

            let report = DriftReport {
                record,
                dnat,
                masquerade,
                live_address,
            };
            if !report.is_in_sync() {
                warn!("Drift detected for {}", report.record.rule_id);
            }
            reports.push(report);
        }
        reports
    }
}
