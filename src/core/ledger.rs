//! Durable record of all believed-active forwards
//!
//! The ledger is a pretty-printed JSON array of [`RuleRecord`]s. It never talks
//! to the kernel.
//!
//! # Consistency
//!
//! - Writes replace the file atomically (temp file with mode 0o600, `fsync`, rename)
//! - Read-modify-write mutators run inside a transaction: an in-process async
//!   mutex plus an exclusive `flock` on `<ledger>.lock`, so concurrent drnat
//!   processes cannot interleave updates
//! - A SHA-256 sidecar (`<ledger>.sha256`) flags hand edits on load (warning only)
//! - A missing or corrupt file loads as an empty ledger; a corrupt file is
//!   copied aside to `<ledger>.corrupt` before it is next overwritten

use crate::core::error::{Error, Result};
use crate::core::rule::RuleRecord;
use nix::fcntl::{Flock, FlockArg};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

/// File name of the ledger inside the state directory
pub const LEDGER_FILE_NAME: &str = "nat_rules.json";

/// Held for the duration of a read-modify-write
struct Transaction<'a> {
    _local: MutexGuard<'a, ()>,
    _file: Flock<std::fs::File>,
}

#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    local: Mutex<()>,
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            local: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'_>> {
        let local = self.local.lock().await;
        self.ensure_parent().await?;

        let lock_path = sidecar(&self.path, ".lock");
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<Flock<std::fs::File>> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| errno.into())
        })
        .await
        .map_err(|e| Error::Internal(format!("Ledger lock task failed: {e}")))??;

        Ok(Transaction {
            _local: local,
            _file: file,
        })
    }

    /// Strict load: a missing file is empty, anything unparsable is [`Error::Corruption`]
    pub async fn try_load(&self) -> Result<Vec<RuleRecord>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Corruption(format!("{}: {e}", self.path.display()))),
        };

        if let Ok(expected) = tokio::fs::read_to_string(sidecar(&self.path, ".sha256")).await {
            let actual = checksum(&bytes);
            if expected.trim() != actual {
                warn!(
                    "Ledger {} checksum mismatch (expected: {}, got: {})",
                    self.path.display(),
                    expected.trim(),
                    actual
                );
            }
        }

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Corruption(format!("{}: {e}", self.path.display())))
    }

    /// Lenient load: corruption is logged and treated as an empty ledger
    pub async fn load(&self) -> Vec<RuleRecord> {
        match self.try_load().await {
            Ok(records) => records,
            Err(e) => {
                error!("{e}; treating ledger as empty");
                Vec::new()
            }
        }
    }

    /// Load inside a transaction, preserving a corrupt file before it gets replaced
    async fn load_for_update(&self) -> Vec<RuleRecord> {
        match self.try_load().await {
            Ok(records) => records,
            Err(e) => {
                error!("{e}; treating ledger as empty");
                let backup = sidecar(&self.path, ".corrupt");
                match tokio::fs::copy(&self.path, &backup).await {
                    Ok(_) => warn!("Corrupt ledger preserved at {}", backup.display()),
                    Err(copy_err) => warn!("Could not preserve corrupt ledger: {copy_err}"),
                }
                Vec::new()
            }
        }
    }

    async fn write(&self, records: &[RuleRecord]) -> Result<()> {
        self.ensure_parent().await?;
        let json = serde_json::to_string_pretty(records)?;
        let temp_path = sidecar(&self.path, ".tmp");

        #[cfg(unix)]
        {
            use tokio::fs::OpenOptions;
            use tokio::io::AsyncWriteExt;

            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(0o600)
                .open(&temp_path)
                .await?;

            file.write_all(json.as_bytes()).await?;
            file.sync_all().await?;
        }

        #[cfg(not(unix))]
        {
            tokio::fs::write(&temp_path, &json).await?;
        }

        tokio::fs::rename(&temp_path, &self.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::StorageFull {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::StorageFull,
                    "Disk full: cannot save NAT ledger. Free up space and try again.",
                ))
            } else {
                Error::Io(e)
            }
        })?;

        tokio::fs::write(sidecar(&self.path, ".sha256"), checksum(json.as_bytes())).await?;
        Ok(())
    }

    /// Persists the full record set, replacing prior content
    pub async fn save(&self, records: &[RuleRecord]) -> Result<()> {
        let _txn = self.begin().await?;
        self.write(records).await
    }

    /// Appends a record without any uniqueness check
    pub async fn append(&self, record: RuleRecord) -> Result<()> {
        let _txn = self.begin().await?;
        let mut records = self.load_for_update().await;
        records.push(record);
        self.write(&records).await
    }

    /// Appends a record unless its `rule_id` or its `(protocol, external_port)`
    /// is already taken. Nothing is written on conflict.
    pub async fn insert_unique(&self, record: RuleRecord) -> Result<()> {
        let _txn = self.begin().await?;
        let mut records = self.load_for_update().await;

        if records.iter().any(|r| r.rule_id == record.rule_id) {
            return Err(Error::conflict(
                &record.rule_id,
                "a rule for this instance, protocol and external port already exists",
            ));
        }
        if let Some(owner) = records
            .iter()
            .find(|r| r.protocol == record.protocol && r.external_port == record.external_port)
        {
            return Err(Error::conflict(
                &record.rule_id,
                format!(
                    "external port {}/{} is already forwarded to {}",
                    record.external_port, record.protocol, owner.instance_id
                ),
            ));
        }

        records.push(record);
        self.write(&records).await
    }

    /// Removes every record matching `predicate`, returning the removed ones
    pub async fn remove_matching<F>(&self, predicate: F) -> Result<Vec<RuleRecord>>
    where
        F: Fn(&RuleRecord) -> bool,
    {
        let _txn = self.begin().await?;
        let records = self.load_for_update().await;
        let (removed, kept): (Vec<_>, Vec<_>) = records.into_iter().partition(|r| predicate(r));

        if !removed.is_empty() {
            self.write(&kept).await?;
            info!("Removed {} record(s) from ledger", removed.len());
        }
        Ok(removed)
    }

    /// Records owned by `instance_id`, in ledger order
    pub async fn records_for(&self, instance_id: &str) -> Vec<RuleRecord> {
        self.load()
            .await
            .into_iter()
            .filter(|r| r.instance_id == instance_id)
            .collect()
    }

    pub async fn find(&self, rule_id: &str) -> Option<RuleRecord> {
        self.load().await.into_iter().find(|r| r.rule_id == rule_id)
    }
}
