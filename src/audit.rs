//! Audit Logger
//!
//! Append-only, rotation-bounded log of every pipeline lifecycle event.
//! All writes funnel through a single writer task fed by an ordered channel,
//! so rotation and appends never interleave across concurrent callers.
//! `log` awaits the writer's ack, which means the entry is on disk (or its
//! failure recorded) before the caller proceeds. Disk errors are telemetry
//! events, never failures of the in-flight operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use crate::config::AuditConfig;
use crate::telemetry::TelemetrySink;

/// Outcome classification of an audited event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Failure,
    Warning,
}

/// A single append-only audit record, serialized as one JSON line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the event occurred (UTC)
    pub timestamp: DateTime<Utc>,

    /// Action tag, e.g. `tool_execution_started`
    pub action: String,

    /// Identity on whose behalf the action ran
    pub identity: String,

    /// Tool or command name the action concerns
    pub resource: String,

    /// Outcome classification
    pub status: AuditStatus,

    /// Free-form metadata
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl AuditEntry {
    pub fn new(action: &str, identity: &str, resource: &str, status: AuditStatus) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.to_string(),
            identity: identity.to_string(),
            resource: resource.to_string(),
            status,
            metadata: serde_json::Map::new(),
        }
    }

    /// Attach a metadata field
    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

struct WriteRequest {
    entry: AuditEntry,
    ack: oneshot::Sender<()>,
}

/// Ordered, rotating audit logger
#[derive(Clone)]
pub struct AuditLogger {
    sender: mpsc::UnboundedSender<WriteRequest>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger").finish_non_exhaustive()
    }
}

impl AuditLogger {
    /// Create the logger and spawn its writer task
    pub fn new(config: AuditConfig, telemetry: Arc<dyn TelemetrySink>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(config, receiver));
        Self { sender, telemetry }
    }

    /// Record an entry. Ordered with respect to all other `log` calls; the
    /// write has been attempted before this returns. Persistence problems
    /// are reported through telemetry and tracing, never to the caller.
    pub async fn log(&self, entry: AuditEntry) {
        self.telemetry.capture(
            "audit_entry",
            serde_json::json!({
                "action": entry.action,
                "resource": entry.resource,
                "status": entry.status,
            }),
        );

        let (ack, done) = oneshot::channel();
        if self.sender.send(WriteRequest { entry, ack }).is_err() {
            error!("audit writer task is gone, entry dropped");
            return;
        }
        // Writer acks after the append (or after recording its failure)
        let _ = done.await;
    }
}

async fn writer_task(config: AuditConfig, mut receiver: mpsc::UnboundedReceiver<WriteRequest>) {
    if let Some(parent) = config.file.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            error!("failed to create audit log directory: {e}");
        }
    }

    while let Some(request) = receiver.recv().await {
        if let Err(e) = rotate_if_needed(&config) {
            warn!("audit rotation failed: {e}");
        }
        if let Err(e) = append_line(&config.file, &request.entry) {
            error!("audit append failed: {e}");
        }
        let _ = request.ack.send(());
    }
}

/// Rotation check preceding every append: once the active file exceeds the
/// size threshold, shift `file.N -> file.N+1` and drop the generation past
/// the configured count.
fn rotate_if_needed(config: &AuditConfig) -> std::io::Result<()> {
    let size = match fs::metadata(&config.file) {
        Ok(meta) => meta.len(),
        Err(_) => return Ok(()),
    };
    if size <= config.max_size_bytes {
        return Ok(());
    }

    let oldest = generation_path(&config.file, config.max_generations);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..config.max_generations).rev() {
        let from = generation_path(&config.file, n);
        if from.exists() {
            fs::rename(&from, generation_path(&config.file, n + 1))?;
        }
    }
    fs::rename(&config.file, generation_path(&config.file, 1))?;
    Ok(())
}

fn generation_path(active: &Path, n: u32) -> PathBuf {
    let mut name = active.as_os_str().to_os_string();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

fn append_line(path: &Path, entry: &AuditEntry) -> std::io::Result<()> {
    let line = serde_json::to_string(entry)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemoryTelemetry;
    use tempfile::tempdir;

    fn config(dir: &Path, max_size: u64, generations: u32) -> AuditConfig {
        AuditConfig {
            file: dir.join("audit.log"),
            max_size_bytes: max_size,
            max_generations: generations,
        }
    }

    fn read_lines(path: &Path) -> Vec<AuditEntry> {
        fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_entries_are_appended_in_order() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), 1024 * 1024, 3);
        let logger = AuditLogger::new(cfg.clone(), Arc::new(MemoryTelemetry::new()));

        for i in 0..5 {
            logger
                .log(
                    AuditEntry::new("tool_execution_started", "alice", "nmap", AuditStatus::Success)
                        .with_metadata("seq", serde_json::json!(i)),
                )
                .await;
        }

        let entries = read_lines(&cfg.file);
        assert_eq!(entries.len(), 5);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.metadata["seq"], serde_json::json!(i));
        }
    }

    #[tokio::test]
    async fn test_log_returns_after_write() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), 1024 * 1024, 3);
        let logger = AuditLogger::new(cfg.clone(), Arc::new(MemoryTelemetry::new()));

        logger
            .log(AuditEntry::new("permission_denied", "bob", "hydra", AuditStatus::Failure))
            .await;

        // The entry must be on disk by the time log() returns
        let entries = read_lines(&cfg.file);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "permission_denied");
        assert_eq!(entries[0].status, AuditStatus::Failure);
    }

    #[tokio::test]
    async fn test_rotation_bounds_generations() {
        let dir = tempdir().unwrap();
        // Tiny threshold: every append after the first triggers rotation
        let cfg = config(dir.path(), 10, 2);
        let logger = AuditLogger::new(cfg.clone(), Arc::new(MemoryTelemetry::new()));

        for _ in 0..6 {
            logger
                .log(AuditEntry::new(
                    "tool_execution_completed",
                    "alice",
                    "nmap",
                    AuditStatus::Success,
                ))
                .await;
        }

        assert!(generation_path(&cfg.file, 1).exists());
        assert!(generation_path(&cfg.file, 2).exists());
        assert!(!generation_path(&cfg.file, 3).exists());
    }

    #[tokio::test]
    async fn test_telemetry_summary_forwarded() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), 1024, 2);
        let telemetry = MemoryTelemetry::new();
        let logger = AuditLogger::new(cfg, Arc::new(telemetry.clone()));

        logger
            .log(AuditEntry::new("rate_limit_exceeded", "carol", "nmap", AuditStatus::Warning))
            .await;

        let events = telemetry.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1["action"], "rate_limit_exceeded");
    }

    #[tokio::test]
    async fn test_concurrent_writers_never_interleave() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), 1024 * 1024, 3);
        let logger = AuditLogger::new(cfg.clone(), Arc::new(MemoryTelemetry::new()));

        let mut handles = Vec::new();
        for i in 0..20 {
            let logger = logger.clone();
            handles.push(tokio::spawn(async move {
                logger
                    .log(
                        AuditEntry::new("tool_execution_started", "alice", "nmap", AuditStatus::Success)
                            .with_metadata("task", serde_json::json!(i)),
                    )
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Every line parses cleanly: no interleaved partial writes
        let entries = read_lines(&cfg.file);
        assert_eq!(entries.len(), 20);
    }
}
