//! Compute backend: the container platform that owns instances
//!
//! Rule synchronization needs only a narrow view of the platform: whether an
//! instance exists, whether it is running, its address on the NAT bridge and an
//! optional per-instance rule quota. [`ComputeBackend`] is that view;
//! [`LxdBackend`] implements it with `lxc query` against the local LXD daemon.

use crate::core::error::{CommandError, Error, Result};
use crate::core::executor::CommandExecutor;
use async_trait::async_trait;
use serde_json::Value;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// Instance config key holding the maximum number of forwards
pub const QUOTA_CONFIG_KEY: &str = "user.nat_acl_limit";

/// Run state of an instance as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Running,
    Stopped,
    Other(String),
}

impl InstanceStatus {
    pub fn parse(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "running" => InstanceStatus::Running,
            "stopped" => InstanceStatus::Stopped,
            _ => InstanceStatus::Other(status.to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, InstanceStatus::Running)
    }
}

#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Checks that the platform is reachable
    async fn ping(&self) -> Result<()>;

    async fn exists(&self, instance_id: &str) -> Result<bool>;

    /// IPv4 address of the instance on the NAT bridge, if it has one
    async fn internal_address(&self, instance_id: &str) -> Result<Option<Ipv4Addr>>;

    async fn status(&self, instance_id: &str) -> Result<InstanceStatus>;

    /// Per-instance forward quota set on the platform side (0 = unlimited)
    async fn rule_quota(&self, _instance_id: &str) -> Result<Option<u32>> {
        Ok(None)
    }
}

/// [`ComputeBackend`] backed by the `lxc` client
#[derive(Debug, Clone)]
pub struct LxdBackend {
    executor: CommandExecutor,
    bridge: String,
}

fn is_not_found(err: &CommandError) -> bool {
    matches!(err, CommandError::NonZeroExit { .. }) && err.stderr().to_lowercase().contains("not found")
}

fn upstream(err: CommandError) -> Error {
    Error::UpstreamUnavailable(err.to_string())
}

impl LxdBackend {
    pub fn new(executor: CommandExecutor, bridge: impl Into<String>) -> Self {
        Self {
            executor,
            bridge: bridge.into(),
        }
    }

    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    /// `lxc query <endpoint>`, `None` when the daemon answers "not found"
    async fn query(&self, endpoint: &str) -> Result<Option<Value>> {
        let args = vec!["query".to_string(), endpoint.to_string()];
        match self.executor.run(&args).await {
            Ok(output) => {
                let value = serde_json::from_str(&output.stdout).map_err(|e| {
                    Error::UpstreamUnavailable(format!("Unexpected response from {endpoint}: {e}"))
                })?;
                Ok(Some(value))
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(upstream(e)),
        }
    }

    async fn instance(&self, instance_id: &str) -> Result<Value> {
        self.query(&format!("/1.0/instances/{instance_id}"))
            .await?
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))
    }
}

/// Name of the guest interface whose NIC device is attached to `bridge`
///
/// A device counts when its `type` is `nic` and either `network` or `parent`
/// names the bridge. The guest-side name is the device's `name` key, falling
/// back to the device name itself.
pub fn bridge_interface(instance: &Value, bridge: &str) -> Option<String> {
    let devices = instance
        .get("expanded_devices")
        .or_else(|| instance.get("devices"))?
        .as_object()?;

    let mut names: Vec<&String> = devices.keys().collect();
    names.sort();

    names.into_iter().find_map(|device_name| {
        let device = &devices[device_name];
        let is_nic = device.get("type").and_then(Value::as_str) == Some("nic");
        let on_bridge = ["network", "parent"]
            .iter()
            .any(|key| device.get(*key).and_then(Value::as_str) == Some(bridge));
        if is_nic && on_bridge {
            Some(
                device
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or(device_name)
                    .to_string(),
            )
        } else {
            None
        }
    })
}

/// First global-scope IPv4 address of `interface` in an instance state document
pub fn global_ipv4(state: &Value, interface: &str) -> Option<Ipv4Addr> {
    state
        .get("network")?
        .get(interface)?
        .get("addresses")?
        .as_array()?
        .iter()
        .filter(|addr| {
            addr.get("family").and_then(Value::as_str) == Some("inet")
                && addr.get("scope").and_then(Value::as_str) == Some("global")
        })
        .find_map(|addr| addr.get("address")?.as_str()?.parse().ok())
}

/// Parses the quota key from an instance's expanded config
pub fn quota_from_config(instance: &Value) -> Option<u32> {
    let raw = instance
        .get("expanded_config")
        .or_else(|| instance.get("config"))?
        .get(QUOTA_CONFIG_KEY)?;

    // LXD stores all user keys as strings
    match raw {
        Value::String(s) => match s.trim().parse() {
            Ok(limit) => Some(limit),
            Err(_) => {
                warn!("Ignoring non-numeric {QUOTA_CONFIG_KEY} value '{s}'");
                None
            }
        },
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        _ => None,
    }
}

#[async_trait]
impl ComputeBackend for LxdBackend {
    async fn ping(&self) -> Result<()> {
        match self.query("/1.0").await? {
            Some(_) => Ok(()),
            None => Err(Error::UpstreamUnavailable(
                "LXD API root not found".to_string(),
            )),
        }
    }

    async fn exists(&self, instance_id: &str) -> Result<bool> {
        Ok(self
            .query(&format!("/1.0/instances/{instance_id}"))
            .await?
            .is_some())
    }

    async fn internal_address(&self, instance_id: &str) -> Result<Option<Ipv4Addr>> {
        let instance = self.instance(instance_id).await?;
        let Some(interface) = bridge_interface(&instance, &self.bridge) else {
            warn!(
                "Instance {instance_id} has no NIC attached to bridge {}",
                self.bridge
            );
            return Ok(None);
        };

        let Some(state) = self
            .query(&format!("/1.0/instances/{instance_id}/state"))
            .await?
        else {
            return Err(Error::InstanceNotFound(instance_id.to_string()));
        };

        let address = global_ipv4(&state, &interface);
        match address {
            Some(ip) => debug!("Instance {instance_id} has address {ip} on {interface}"),
            None => debug!("Instance {instance_id} has no global IPv4 on {interface} yet"),
        }
        Ok(address)
    }

    async fn status(&self, instance_id: &str) -> Result<InstanceStatus> {
        let instance = self.instance(instance_id).await?;
        Ok(instance
            .get("status")
            .and_then(Value::as_str)
            .map_or_else(|| InstanceStatus::Other(String::new()), InstanceStatus::parse))
    }

    async fn rule_quota(&self, instance_id: &str) -> Result<Option<u32>> {
        let instance = self.instance(instance_id).await?;
        Ok(quota_from_config(&instance))
    }
}
