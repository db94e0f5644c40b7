//! Shared test utilities for core module tests
//!
//! Provides in-memory stand-ins for the kernel and the compute platform so
//! synchronizer and lifecycle tests never touch iptables or LXD.
//! This module is only compiled in test mode.

use crate::core::backend::{ComputeBackend, InstanceStatus};
use crate::core::driver::{PacketFilter, RemoveOutcome};
use crate::core::error::{CommandError, Error, Result};
use crate::core::ledger::{LEDGER_FILE_NAME, Ledger};
use crate::core::lifecycle::{BootstrapSettings, LifecycleCoordinator, RetryPolicy};
use crate::core::rule::NatRule;
use crate::core::sync::{NatSettings, RuleSynchronizer};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::remove_var("DRNAT_TEST_NO_ELEVATION");
///     std::env::set_var("DRNAT_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("DRNAT_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

pub const LISTEN_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 10);
pub const UPLINK: &str = "eth0";

fn injected_failure(rule: &NatRule) -> CommandError {
    CommandError::NonZeroExit {
        command: format!("iptables -t nat {}", rule.chain()),
        exit_code: Some(4),
        stdout: String::new(),
        stderr: "iptables v1.8.10 (legacy): RULE_APPEND failed (Resource temporarily unavailable)"
            .to_string(),
    }
}

/// In-memory `nat` table with failure injection
#[derive(Debug, Default)]
pub struct MockPacketFilter {
    rules: Mutex<Vec<NatRule>>,
    failing_chains: Mutex<HashSet<&'static str>>,
    fail_removals: Mutex<bool>,
    removal_delay: Mutex<Duration>,
}

impl MockPacketFilter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every `apply` on `chain` fail
    pub fn fail_apply_on(&self, chain: &'static str) {
        self.failing_chains.lock().unwrap().insert(chain);
    }

    pub fn fail_removals(&self, fail: bool) {
        *self.fail_removals.lock().unwrap() = fail;
    }

    /// Makes every `remove` sleep first, like a contended xtables lock
    pub fn delay_removals(&self, delay: Duration) {
        *self.removal_delay.lock().unwrap() = delay;
    }

    pub fn rules(&self) -> Vec<NatRule> {
        self.rules.lock().unwrap().clone()
    }

    /// True if any rule carries `tag` or `tag_masq`
    pub fn has_tag_prefix(&self, tag: &str) -> bool {
        self.rules
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.tag().starts_with(tag))
    }

    /// Simulates a rule flushed out-of-band
    pub fn drop_rule(&self, rule: &NatRule) {
        self.rules.lock().unwrap().retain(|r| r != rule);
    }
}

#[async_trait]
impl PacketFilter for MockPacketFilter {
    async fn apply(&self, rule: &NatRule) -> std::result::Result<(), CommandError> {
        if self.failing_chains.lock().unwrap().contains(rule.chain()) {
            return Err(injected_failure(rule));
        }
        self.rules.lock().unwrap().push(rule.clone());
        Ok(())
    }

    async fn remove(&self, rule: &NatRule) -> RemoveOutcome {
        let delay = *self.removal_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_removals.lock().unwrap() {
            return RemoveOutcome::Failed(injected_failure(rule));
        }
        let mut rules = self.rules.lock().unwrap();
        match rules.iter().position(|r| r == rule) {
            Some(index) => {
                rules.remove(index);
                RemoveOutcome::Removed
            }
            None => RemoveOutcome::AlreadyAbsent,
        }
    }

    async fn exists(&self, rule: &NatRule) -> std::result::Result<bool, CommandError> {
        Ok(self.rules.lock().unwrap().contains(rule))
    }
}

#[derive(Debug, Clone)]
pub struct MockInstance {
    pub address: Option<Ipv4Addr>,
    pub status: InstanceStatus,
    pub quota: Option<u32>,
}

/// Scripted compute platform
#[derive(Debug, Default)]
pub struct MockBackend {
    instances: Mutex<HashMap<String, MockInstance>>,
    /// Address lookups to answer with `None` before the real address
    pending_address: Mutex<HashMap<String, u32>>,
    address_lookups: AtomicU32,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a running instance with `address`
    pub fn add_instance(&self, id: &str, address: Ipv4Addr) {
        self.instances.lock().unwrap().insert(
            id.to_string(),
            MockInstance {
                address: Some(address),
                status: InstanceStatus::Running,
                quota: None,
            },
        );
    }

    pub fn remove_instance(&self, id: &str) {
        self.instances.lock().unwrap().remove(id);
    }

    pub fn set_quota(&self, id: &str, quota: u32) {
        if let Some(instance) = self.instances.lock().unwrap().get_mut(id) {
            instance.quota = Some(quota);
        }
    }

    pub fn set_address(&self, id: &str, address: Option<Ipv4Addr>) {
        if let Some(instance) = self.instances.lock().unwrap().get_mut(id) {
            instance.address = address;
        }
    }

    pub fn set_status(&self, id: &str, status: InstanceStatus) {
        if let Some(instance) = self.instances.lock().unwrap().get_mut(id) {
            instance.status = status;
        }
    }

    /// The next `misses` address lookups for `id` report no address
    pub fn delay_address(&self, id: &str, misses: u32) {
        self.pending_address
            .lock()
            .unwrap()
            .insert(id.to_string(), misses);
    }

    pub fn address_lookups(&self) -> u32 {
        self.address_lookups.load(Ordering::SeqCst)
    }

    fn instance(&self, id: &str) -> Result<MockInstance> {
        self.instances
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))
    }
}

#[async_trait]
impl ComputeBackend for MockBackend {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, instance_id: &str) -> Result<bool> {
        Ok(self.instances.lock().unwrap().contains_key(instance_id))
    }

    async fn internal_address(&self, instance_id: &str) -> Result<Option<Ipv4Addr>> {
        self.address_lookups.fetch_add(1, Ordering::SeqCst);
        let instance = self.instance(instance_id)?;

        let mut pending = self.pending_address.lock().unwrap();
        if let Some(misses) = pending.get_mut(instance_id)
            && *misses > 0
        {
            *misses -= 1;
            return Ok(None);
        }
        Ok(instance.address)
    }

    async fn status(&self, instance_id: &str) -> Result<InstanceStatus> {
        Ok(self.instance(instance_id)?.status)
    }

    async fn rule_quota(&self, instance_id: &str) -> Result<Option<u32>> {
        Ok(self.instance(instance_id)?.quota)
    }
}

/// Synchronizer and lifecycle wired to fresh mocks and a temporary ledger
pub struct Harness {
    // Keeps the ledger directory alive
    pub dir: tempfile::TempDir,
    pub filter: Arc<MockPacketFilter>,
    pub backend: Arc<MockBackend>,
    pub sync: Arc<RuleSynchronizer>,
    pub lifecycle: LifecycleCoordinator,
}

impl Harness {
    /// Masquerading on [`UPLINK`], no quota, instant retries
    pub fn new() -> Self {
        Self::with_settings(NatSettings::new(LISTEN_IP).with_masquerade(UPLINK))
    }

    pub fn with_settings(settings: NatSettings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let filter = MockPacketFilter::new();
        let backend = MockBackend::new();
        let ledger = Arc::new(Ledger::new(dir.path().join(LEDGER_FILE_NAME)));

        let sync = Arc::new(RuleSynchronizer::new(
            ledger,
            filter.clone(),
            backend.clone(),
            settings,
        ));
        let lifecycle = LifecycleCoordinator::new(
            sync.clone(),
            BootstrapSettings {
                retry: RetryPolicy::fixed(3, Duration::from_millis(1)),
                ..BootstrapSettings::default()
            },
        );

        Self {
            dir,
            filter,
            backend,
            sync,
            lifecycle,
        }
    }

    pub async fn ledger_bytes(&self) -> Option<Vec<u8>> {
        tokio::fs::read(self.sync.ledger().path()).await.ok()
    }
}
