//! Execution History Store
//!
//! Bounded, persisted record of past executions. Entries are inserted
//! newest-first and evicted oldest-first once capacity is reached. An entry
//! is mutable only while `Running`; once finalized it never changes.
//! Persistence to disk is debounced: mutations nudge a flusher task, writes
//! within the window coalesce into one snapshot, and in-memory reads always
//! reflect the latest mutation even when the on-disk copy lags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::config::HistoryConfig;
use crate::telemetry::TelemetrySink;
use crate::validate::ArgumentMap;

/// Lifecycle state of a history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Running,
    Success,
    Failed,
}

/// A recorded execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Unique identifier (UUID)
    pub id: String,

    /// When the execution was recorded (UTC)
    pub timestamp: DateTime<Utc>,

    /// Identity the execution ran under
    pub identity: String,

    /// Composed command text
    pub command: String,

    /// Argument map the command was built from
    pub arguments: ArgumentMap,

    /// Lifecycle state
    pub status: HistoryStatus,

    /// Captured output, for finalized successful runs
    pub output: Option<String>,

    /// Error text, for finalized failed runs
    pub error: Option<String>,

    /// Wall-clock duration in milliseconds
    pub duration_ms: Option<u64>,

    /// Tool name
    pub tool: String,

    /// Free-form metadata (e.g. replay lineage)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Fields for a new entry; id and timestamp are assigned by the store
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub identity: String,
    pub command: String,
    pub arguments: ArgumentMap,
    pub tool: String,
    pub status: HistoryStatus,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl NewEntry {
    /// A `Running` entry for an execution that is about to start
    pub fn running(identity: &str, tool: &str, command: &str, arguments: ArgumentMap) -> Self {
        Self {
            identity: identity.to_string(),
            command: command.to_string(),
            arguments,
            tool: tool.to_string(),
            status: HistoryStatus::Running,
            metadata: serde_json::Map::new(),
        }
    }

    /// Attach a metadata field
    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Partial update applied to a `Running` entry
#[derive(Debug, Clone, Default)]
pub struct HistoryPatch {
    pub status: Option<HistoryStatus>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
}

impl HistoryPatch {
    pub fn success(output: String, duration_ms: u64) -> Self {
        Self {
            status: Some(HistoryStatus::Success),
            output: Some(output),
            error: None,
            duration_ms: Some(duration_ms),
        }
    }

    pub fn failed(error: String, duration_ms: u64) -> Self {
        Self {
            status: Some(HistoryStatus::Failed),
            output: None,
            error: Some(error),
            duration_ms: Some(duration_ms),
        }
    }
}

struct Inner {
    entries: Mutex<Vec<HistoryEntry>>,
    capacity: usize,
    path: PathBuf,
    flush_tx: mpsc::UnboundedSender<()>,
    telemetry: Arc<dyn TelemetrySink>,
}

/// Bounded, persisted execution history
#[derive(Clone)]
pub struct HistoryStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore")
            .field("capacity", &self.inner.capacity)
            .field("path", &self.inner.path)
            .finish()
    }
}

impl HistoryStore {
    /// Open the store, loading any existing snapshot, and spawn the
    /// debounced flusher task.
    pub fn open(config: &HistoryConfig, path: PathBuf, telemetry: Arc<dyn TelemetrySink>) -> Self {
        let entries = load_snapshot(&path);
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            entries: Mutex::new(entries),
            capacity: config.capacity,
            path,
            flush_tx,
            telemetry,
        });

        tokio::spawn(flusher_task(
            Arc::downgrade(&inner),
            flush_rx,
            Duration::from_millis(config.flush_debounce_ms),
        ));

        Self { inner }
    }

    /// Insert a new entry; assigns id and timestamp, prepends, trims to
    /// capacity (oldest-first eviction). Returns the new id.
    pub fn add(&self, new: NewEntry) -> String {
        let entry = HistoryEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            identity: new.identity,
            command: new.command,
            arguments: new.arguments,
            status: new.status,
            output: None,
            error: None,
            duration_ms: None,
            tool: new.tool,
            metadata: new.metadata,
        };
        let id = entry.id.clone();

        {
            let mut entries = self.inner.entries.lock().expect("history lock");
            entries.insert(0, entry);
            entries.truncate(self.inner.capacity);
        }
        self.schedule_flush();
        id
    }

    /// Apply a partial update to a `Running` entry. Returns false when the
    /// id is unknown or the entry is already finalized.
    pub fn update(&self, id: &str, patch: HistoryPatch) -> bool {
        let updated = {
            let mut entries = self.inner.entries.lock().expect("history lock");
            match entries.iter_mut().find(|e| e.id == id) {
                Some(entry) if entry.status == HistoryStatus::Running => {
                    if let Some(status) = patch.status {
                        entry.status = status;
                    }
                    if let Some(output) = patch.output {
                        entry.output = Some(output);
                    }
                    if let Some(error) = patch.error {
                        entry.error = Some(error);
                    }
                    if let Some(duration_ms) = patch.duration_ms {
                        entry.duration_ms = Some(duration_ms);
                    }
                    true
                }
                _ => false,
            }
        };
        if updated {
            self.schedule_flush();
        }
        updated
    }

    /// Fetch a single entry by id
    pub fn get(&self, id: &str) -> Option<HistoryEntry> {
        let entries = self.inner.entries.lock().expect("history lock");
        entries.iter().find(|e| e.id == id).cloned()
    }

    /// List entries, newest first, optionally filtered by identity
    pub fn list(&self, identity: Option<&str>, limit: usize, offset: usize) -> Vec<HistoryEntry> {
        let entries = self.inner.entries.lock().expect("history lock");
        entries
            .iter()
            .filter(|e| identity.map_or(true, |id| e.identity == id))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Case-insensitive substring search over command text, tool name, and
    /// captured output.
    pub fn search(&self, query: &str, identity: Option<&str>, limit: usize) -> Vec<HistoryEntry> {
        let needle = query.to_lowercase();
        let entries = self.inner.entries.lock().expect("history lock");
        entries
            .iter()
            .filter(|e| identity.map_or(true, |id| e.identity == id))
            .filter(|e| {
                e.command.to_lowercase().contains(&needle)
                    || e.tool.to_lowercase().contains(&needle)
                    || e.output
                        .as_deref()
                        .map_or(false, |o| o.to_lowercase().contains(&needle))
            })
            .take(limit)
            .cloned()
            .collect()
    }

    /// Remove entries, optionally only those of one identity. Returns the
    /// number removed.
    pub fn clear(&self, identity: Option<&str>) -> usize {
        let removed = {
            let mut entries = self.inner.entries.lock().expect("history lock");
            let before = entries.len();
            match identity {
                Some(id) => entries.retain(|e| e.identity != id),
                None => entries.clear(),
            }
            before - entries.len()
        };
        if removed > 0 {
            self.schedule_flush();
        }
        removed
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.inner.entries.lock().expect("history lock").len()
    }

    /// True when no entries are retained
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the current snapshot immediately (shutdown, tests)
    pub fn flush_now(&self) {
        write_snapshot(&self.inner);
    }

    fn schedule_flush(&self) {
        // The flusher coalesces bursts of nudges into one write
        let _ = self.inner.flush_tx.send(());
    }
}

async fn flusher_task(
    inner: Weak<Inner>,
    mut rx: mpsc::UnboundedReceiver<()>,
    debounce: Duration,
) {
    while rx.recv().await.is_some() {
        tokio::time::sleep(debounce).await;
        // Drain everything that arrived during the window
        while rx.try_recv().is_ok() {}
        match inner.upgrade() {
            Some(inner) => write_snapshot(&inner),
            None => break,
        }
    }
    debug!("history flusher stopped");
}

fn write_snapshot(inner: &Inner) {
    let snapshot = {
        let entries = inner.entries.lock().expect("history lock");
        entries.clone()
    };
    let result = serde_json::to_string_pretty(&snapshot)
        .map_err(std::io::Error::other)
        .and_then(|json| {
            if let Some(parent) = inner.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&inner.path, json)
        });
    if let Err(e) = result {
        error!("history flush failed: {e}");
        inner.telemetry.capture(
            "history_flush_failed",
            serde_json::json!({ "error": e.to_string() }),
        );
    }
}

fn load_snapshot(path: &PathBuf) -> Vec<HistoryEntry> {
    match std::fs::read_to_string(path) {
        Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
            error!("history snapshot unreadable, starting empty: {e}");
            Vec::new()
        }),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemoryTelemetry;
    use tempfile::tempdir;

    fn store(capacity: usize, dir: &std::path::Path) -> HistoryStore {
        HistoryStore::open(
            &HistoryConfig {
                capacity,
                flush_debounce_ms: 20,
            },
            dir.join("history.json"),
            Arc::new(MemoryTelemetry::new()),
        )
    }

    fn running(identity: &str, tool: &str, command: &str) -> NewEntry {
        NewEntry::running(identity, tool, command, ArgumentMap::new())
    }

    #[tokio::test]
    async fn test_add_assigns_id_and_prepends() {
        let dir = tempdir().unwrap();
        let store = store(10, dir.path());

        let first = store.add(running("alice", "nmap", "nmap host1"));
        let second = store.add(running("alice", "nikto", "nikto --host host1"));

        let listed = store.list(None, 10, 0);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second);
        assert_eq!(listed[1].id, first);
        assert_eq!(listed[0].status, HistoryStatus::Running);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_first() {
        let dir = tempdir().unwrap();
        let store = store(3, dir.path());

        let ids: Vec<String> = (0..4)
            .map(|i| store.add(running("alice", "nmap", &format!("nmap host{i}"))))
            .collect();

        assert_eq!(store.len(), 3);
        // First insertion is gone, the most recent three remain newest-first
        assert!(store.get(&ids[0]).is_none());
        let listed = store.list(None, 10, 0);
        assert_eq!(listed[0].id, ids[3]);
        assert_eq!(listed[1].id, ids[2]);
        assert_eq!(listed[2].id, ids[1]);
    }

    #[tokio::test]
    async fn test_update_only_while_running() {
        let dir = tempdir().unwrap();
        let store = store(10, dir.path());

        let id = store.add(running("alice", "nmap", "nmap host1"));
        assert!(store.update(&id, HistoryPatch::success("ok".into(), 120)));

        let entry = store.get(&id).unwrap();
        assert_eq!(entry.status, HistoryStatus::Success);
        assert_eq!(entry.output.as_deref(), Some("ok"));
        assert_eq!(entry.duration_ms, Some(120));

        // Finalized entries are immutable
        assert!(!store.update(&id, HistoryPatch::failed("nope".into(), 1)));
        assert_eq!(store.get(&id).unwrap().status, HistoryStatus::Success);

        assert!(!store.update("unknown-id", HistoryPatch::default()));
    }

    #[tokio::test]
    async fn test_list_filters_by_identity() {
        let dir = tempdir().unwrap();
        let store = store(10, dir.path());

        store.add(running("alice", "nmap", "nmap host1"));
        store.add(running("bob", "nmap", "nmap host2"));
        store.add(running("alice", "nikto", "nikto --host host3"));

        assert_eq!(store.list(Some("alice"), 10, 0).len(), 2);
        assert_eq!(store.list(Some("bob"), 10, 0).len(), 1);
        assert_eq!(store.list(None, 2, 0).len(), 2);
        assert_eq!(store.list(None, 10, 2).len(), 1);
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive() {
        let dir = tempdir().unwrap();
        let store = store(10, dir.path());

        let id = store.add(running("alice", "nmap", "nmap -p 80 HOST1"));
        store.update(&id, HistoryPatch::success("80/tcp open http".into(), 10));
        store.add(running("alice", "nikto", "nikto --host host2"));

        assert_eq!(store.search("host1", None, 10).len(), 1);
        assert_eq!(store.search("NIKTO", None, 10).len(), 1);
        // Output text is searched too
        assert_eq!(store.search("tcp open", None, 10).len(), 1);
        assert_eq!(store.search("sqlmap", None, 10).len(), 0);
    }

    #[tokio::test]
    async fn test_clear_by_identity() {
        let dir = tempdir().unwrap();
        let store = store(10, dir.path());

        store.add(running("alice", "nmap", "nmap host1"));
        store.add(running("bob", "nmap", "nmap host2"));

        assert_eq!(store.clear(Some("alice")), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.clear(None), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_debounced_flush_coalesces_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");
        let store = HistoryStore::open(
            &HistoryConfig {
                capacity: 10,
                flush_debounce_ms: 50,
            },
            path.clone(),
            Arc::new(MemoryTelemetry::new()),
        );

        for i in 0..5 {
            store.add(running("alice", "nmap", &format!("nmap host{i}")));
        }
        // Within the window nothing is on disk yet
        assert!(!path.exists());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let snapshot: Vec<HistoryEntry> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(snapshot.len(), 5);
    }

    #[tokio::test]
    async fn test_snapshot_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");

        let store = HistoryStore::open(
            &HistoryConfig {
                capacity: 10,
                flush_debounce_ms: 1000,
            },
            path.clone(),
            Arc::new(MemoryTelemetry::new()),
        );
        let id = store.add(running("alice", "nmap", "nmap host1"));
        store.flush_now();
        drop(store);

        let reloaded = HistoryStore::open(
            &HistoryConfig {
                capacity: 10,
                flush_debounce_ms: 1000,
            },
            path,
            Arc::new(MemoryTelemetry::new()),
        );
        assert!(reloaded.get(&id).is_some());
    }
}
