//! Task Scheduler
//!
//! Cron-driven recurring invocation of the execution pipeline. Each enabled
//! task owns exactly one live timer task; enabling a task or changing its
//! cron expression replaces the timer atomically (the old timer is aborted
//! under the state lock before a new one is spawned). Every fire enters the
//! pipeline at the same validation/admission entry point as a direct caller,
//! so scheduled work competes for the same concurrency slots.
//!
//! The clock is a trait so tests can compress the wait between occurrences.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLogger, AuditStatus};
use crate::error::GateError;
use crate::gateway::{CallResult, Identity, PipelineRunner};
use crate::validate::ArgumentMap;

/// A recurring task definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Unique identifier (UUID)
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Cron expression (seconds-resolution, six or seven fields)
    pub cron: String,

    /// Target tool name
    pub tool: String,

    /// Fixed arguments passed on every fire
    pub arguments: ArgumentMap,

    /// Whether the task owns a live timer
    pub enabled: bool,

    /// Owning identity the pipeline runs under
    pub identity: String,

    /// Roles granted to the owning identity
    #[serde(default)]
    pub roles: Vec<String>,

    /// Last fire time
    pub last_run: Option<DateTime<Utc>>,

    /// Next computed fire time (None while disabled)
    pub next_run: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Free-form metadata
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Input for creating a task
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub cron: String,
    pub tool: String,
    pub arguments: ArgumentMap,
    pub enabled: bool,
    pub identity: String,
    pub roles: Vec<String>,
}

/// Partial update applied to an existing task
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub cron: Option<String>,
    pub arguments: Option<ArgumentMap>,
    pub enabled: Option<bool>,
}

/// Clock seam: wall time plus the wait between occurrences
#[async_trait]
pub trait SchedulerClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation used in production
#[derive(Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl SchedulerClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

struct TaskState {
    task: ScheduledTask,
    timer: Option<JoinHandle<()>>,
}

struct SchedInner {
    runner: Arc<dyn PipelineRunner>,
    audit: AuditLogger,
    clock: Arc<dyn SchedulerClock>,
    path: PathBuf,
    state: Mutex<HashMap<String, TaskState>>,
}

/// Cron-driven task scheduler
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedInner>,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("tasks", &self.inner.state.lock().expect("scheduler lock").len())
            .finish_non_exhaustive()
    }
}

/// Next occurrence of a cron expression strictly after `from`
fn next_occurrence(cron: &str, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let schedule = Schedule::from_str(cron).ok()?;
    schedule.after(&from).next()
}

fn validate_cron(expr: &str) -> Result<(), GateError> {
    Schedule::from_str(expr).map(|_| ()).map_err(|e| {
        GateError::InvalidArgumentValue {
            argument: "cron".to_string(),
            reason: format!("invalid cron expression: {e}"),
        }
    })
}

impl TaskScheduler {
    /// Open the scheduler, loading persisted tasks and starting timers for
    /// the enabled ones.
    pub fn open(
        runner: Arc<dyn PipelineRunner>,
        audit: AuditLogger,
        clock: Arc<dyn SchedulerClock>,
        path: PathBuf,
    ) -> Self {
        let tasks = load_tasks(&path);
        let inner = Arc::new(SchedInner {
            runner,
            audit,
            clock,
            path,
            state: Mutex::new(HashMap::new()),
        });

        {
            let mut state = inner.state.lock().expect("scheduler lock");
            for mut task in tasks {
                let timer = if task.enabled {
                    task.next_run = next_occurrence(&task.cron, inner.clock.now());
                    Some(spawn_timer(&inner, task.id.clone()))
                } else {
                    task.next_run = None;
                    None
                };
                state.insert(task.id.clone(), TaskState { task, timer });
            }
        }

        Self { inner }
    }

    /// Create a task. Its timer starts immediately when enabled.
    pub async fn create(&self, spec: TaskSpec) -> Result<ScheduledTask, GateError> {
        validate_cron(&spec.cron)?;

        let now = self.inner.clock.now();
        let mut task = ScheduledTask {
            id: Uuid::new_v4().to_string(),
            name: spec.name,
            cron: spec.cron,
            tool: spec.tool,
            arguments: spec.arguments,
            enabled: spec.enabled,
            identity: spec.identity,
            roles: spec.roles,
            last_run: None,
            next_run: None,
            created_at: now,
            updated_at: now,
            metadata: serde_json::Map::new(),
        };

        {
            let mut state = self.inner.state.lock().expect("scheduler lock");
            let timer = if task.enabled {
                task.next_run = next_occurrence(&task.cron, now);
                Some(spawn_timer(&self.inner, task.id.clone()))
            } else {
                None
            };
            state.insert(task.id.clone(), TaskState { task: task.clone(), timer });
        }

        persist(&self.inner);
        self.inner
            .audit
            .log(
                AuditEntry::new("scheduled_task_created", &task.identity, &task.tool, AuditStatus::Success)
                    .with_metadata("taskId", serde_json::json!(task.id))
                    .with_metadata("cron", serde_json::json!(task.cron)),
            )
            .await;
        info!(task = %task.name, enabled = task.enabled, "scheduled task created");
        Ok(task)
    }

    /// Update a task. The old timer is always stopped before any new one
    /// starts, so a task never owns two live timers.
    pub async fn update(&self, id: &str, patch: TaskPatch) -> Result<ScheduledTask, GateError> {
        if let Some(cron) = &patch.cron {
            validate_cron(cron)?;
        }

        let now = self.inner.clock.now();
        let task = {
            let mut state = self.inner.state.lock().expect("scheduler lock");
            let entry = state
                .get_mut(id)
                .ok_or_else(|| GateError::UnknownId {
                    resource: "Scheduled task",
                    id: id.to_string(),
                })?;

            // Stop-then-start: abort the old timer before touching the task
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }

            if let Some(name) = patch.name {
                entry.task.name = name;
            }
            if let Some(cron) = patch.cron {
                entry.task.cron = cron;
            }
            if let Some(arguments) = patch.arguments {
                entry.task.arguments = arguments;
            }
            if let Some(enabled) = patch.enabled {
                entry.task.enabled = enabled;
            }
            entry.task.updated_at = now;

            if entry.task.enabled {
                entry.task.next_run = next_occurrence(&entry.task.cron, now);
                entry.timer = Some(spawn_timer(&self.inner, id.to_string()));
            } else {
                entry.task.next_run = None;
            }
            entry.task.clone()
        };

        persist(&self.inner);
        self.inner
            .audit
            .log(
                AuditEntry::new("scheduled_task_updated", &task.identity, &task.tool, AuditStatus::Success)
                    .with_metadata("taskId", serde_json::json!(task.id)),
            )
            .await;
        Ok(task)
    }

    /// Delete a task, stopping its timer. Returns false for unknown ids.
    pub async fn delete(&self, id: &str) -> bool {
        let removed = {
            let mut state = self.inner.state.lock().expect("scheduler lock");
            state.remove(id)
        };
        match removed {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                persist(&self.inner);
                self.inner
                    .audit
                    .log(
                        AuditEntry::new(
                            "scheduled_task_deleted",
                            &entry.task.identity,
                            &entry.task.tool,
                            AuditStatus::Success,
                        )
                        .with_metadata("taskId", serde_json::json!(id)),
                    )
                    .await;
                true
            }
            None => false,
        }
    }

    /// Fetch a task snapshot
    pub fn get(&self, id: &str) -> Option<ScheduledTask> {
        let state = self.inner.state.lock().expect("scheduler lock");
        state.get(id).map(|e| e.task.clone())
    }

    /// List all tasks, oldest first
    pub fn list(&self) -> Vec<ScheduledTask> {
        let state = self.inner.state.lock().expect("scheduler lock");
        let mut tasks: Vec<ScheduledTask> = state.values().map(|e| e.task.clone()).collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Trigger an out-of-band execution without altering the schedule.
    pub async fn run_now(&self, id: &str) -> Result<CallResult, GateError> {
        if self.get(id).is_none() {
            return Err(GateError::UnknownId {
                resource: "Scheduled task",
                id: id.to_string(),
            });
        }
        Ok(execute_task(&self.inner, id, false).await)
    }
}

/// Spawn the timer loop for one task. The loop holds only a weak reference;
/// it exits when the scheduler is dropped, the task disappears, or the task
/// is disabled.
fn spawn_timer(inner: &Arc<SchedInner>, id: String) -> JoinHandle<()> {
    let weak: Weak<SchedInner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        loop {
            let (cron, clock) = match weak.upgrade() {
                Some(inner) => {
                    let state = inner.state.lock().expect("scheduler lock");
                    match state.get(&id) {
                        Some(entry) if entry.task.enabled => {
                            (entry.task.cron.clone(), Arc::clone(&inner.clock))
                        }
                        _ => return,
                    }
                }
                None => return,
            };

            let now = clock.now();
            let next = match next_occurrence(&cron, now) {
                Some(next) => next,
                None => {
                    warn!(task = %id, "cron expression has no future occurrence");
                    return;
                }
            };
            let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
            clock.sleep(delay).await;

            match weak.upgrade() {
                Some(inner) => {
                    execute_task(&inner, &id, true).await;
                }
                None => return,
            }
        }
    })
}

/// Run one fire of a task through the pipeline, updating run bookkeeping
/// and writing the completion audit entry.
async fn execute_task(inner: &Arc<SchedInner>, id: &str, update_schedule: bool) -> CallResult {
    let now = inner.clock.now();
    let snapshot = {
        let mut state = inner.state.lock().expect("scheduler lock");
        match state.get_mut(id) {
            Some(entry) => {
                entry.task.last_run = Some(now);
                if update_schedule {
                    entry.task.next_run = next_occurrence(&entry.task.cron, now);
                }
                entry.task.clone()
            }
            None => {
                return CallResult::failure(
                    format!("scheduled task '{id}' not found"),
                    crate::gateway::CallMeta {
                        tool: String::new(),
                        execution_time_ms: 0,
                        status: "failed".to_string(),
                        error: Some("task not found".to_string()),
                    },
                )
            }
        }
    };
    persist(inner);

    let identity = Identity {
        id: snapshot.identity.clone(),
        roles: snapshot.roles.clone(),
    };
    let mut metadata = serde_json::Map::new();
    metadata.insert("scheduledTask".to_string(), serde_json::json!(snapshot.id));
    metadata.insert("taskName".to_string(), serde_json::json!(snapshot.name));

    debug!(task = %snapshot.name, tool = %snapshot.tool, "scheduled task firing");
    let result = inner
        .runner
        .run_tool(&snapshot.tool, snapshot.arguments.clone(), &identity, metadata)
        .await;

    let (action, status) = if result.is_error {
        ("scheduled_task_failed", AuditStatus::Failure)
    } else {
        ("scheduled_task_completed", AuditStatus::Success)
    };
    inner
        .audit
        .log(
            AuditEntry::new(action, &snapshot.identity, &snapshot.tool, status)
                .with_metadata("taskId", serde_json::json!(snapshot.id))
                .with_metadata("taskName", serde_json::json!(snapshot.name)),
        )
        .await;

    result
}

fn persist(inner: &Arc<SchedInner>) {
    let tasks = {
        let state = inner.state.lock().expect("scheduler lock");
        let mut tasks: Vec<ScheduledTask> = state.values().map(|e| e.task.clone()).collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    };
    let result = serde_json::to_string_pretty(&tasks)
        .map_err(std::io::Error::other)
        .and_then(|json| {
            if let Some(parent) = inner.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&inner.path, json)
        });
    if let Err(e) = result {
        // Non-fatal: the in-memory task set stays authoritative
        error!("scheduled task persistence failed: {e}");
    }
}

fn load_tasks(path: &PathBuf) -> Vec<ScheduledTask> {
    match std::fs::read_to_string(path) {
        Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
            error!("scheduled task store unreadable, starting empty: {e}");
            Vec::new()
        }),
        Err(_) => Vec::new(),
    }
}
