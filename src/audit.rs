/// Audit logging for privileged NAT operations
///
/// Every kernel-touching operation (adding or removing a forward, tearing down
/// an instance, provisioning its bootstrap rule) is recorded as one JSON line.
/// Audit failures are logged and never fail the operation itself.
use crate::core::rule::{Protocol, RuleRecord};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AddRule,
    RemoveRule,
    Teardown,
    Bootstrap,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Type of event
    pub event_type: EventType,

    /// Whether the operation succeeded
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    /// Creates a new audit event
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }

    pub fn add_rule(
        instance_id: &str,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        error: Option<String>,
    ) -> Self {
        Self::new(
            EventType::AddRule,
            error.is_none(),
            serde_json::json!({
                "instance_id": instance_id,
                "protocol": protocol,
                "external_port": external_port,
                "internal_port": internal_port,
            }),
            error,
        )
    }

    /// `clean` is false when a kernel delete failed and was abandoned
    pub fn remove_rule(rule_id: &str, ledger_removed: bool, clean: bool) -> Self {
        Self::new(
            EventType::RemoveRule,
            clean,
            serde_json::json!({
                "rule_id": rule_id,
                "ledger_removed": ledger_removed,
            }),
            (!clean).then(|| "kernel rule removal failed; ledger entry dropped".to_string()),
        )
    }

    pub fn teardown(instance_id: &str, removed: usize, failures: usize) -> Self {
        Self::new(
            EventType::Teardown,
            failures == 0,
            serde_json::json!({
                "instance_id": instance_id,
                "removed": removed,
                "failures": failures,
            }),
            None,
        )
    }

    pub fn bootstrap(instance_id: &str, record: Option<&RuleRecord>, error: Option<String>) -> Self {
        Self::new(
            EventType::Bootstrap,
            record.is_some(),
            serde_json::json!({
                "instance_id": instance_id,
                "external_port": record.map(|r| r.external_port),
            }),
            error,
        )
    }
}

/// Audit log writer
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Creates an audit log in the state directory
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    /// Creates an audit log at an explicit path
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event to the audit log
    ///
    /// Events are written as JSON-lines format (one JSON object per line)
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: &AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Writes an event, downgrading any failure to a warning
    pub async fn record(&self, event: AuditEvent) {
        if let Err(e) = self.log(&event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }

    /// Reads the most recent events from the log, newest first
    ///
    /// Lines that do not parse are skipped.
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str(line).ok())
            .take(count)
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}
