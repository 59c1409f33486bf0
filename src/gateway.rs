//! Tool Gateway
//!
//! The security-mediated execution pipeline: registry lookup, argument
//! validation, permission and rate-limit admission, safe command
//! construction, timed subprocess execution, output validation, and audit +
//! history recording. `execute` never returns `Err`; every failure becomes a
//! structured result whose text distinguishes not-found, bad arguments,
//! policy denial, rate limiting, and execution failure without leaking
//! internals.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::audit::{AuditEntry, AuditLogger, AuditStatus};
use crate::command::build_command;
use crate::error::GateError;
use crate::executor::Executor;
use crate::history::{HistoryEntry, HistoryPatch, HistoryStore, NewEntry};
use crate::policy::PermissionManager;
use crate::rate_limit::RateLimiter;
use crate::registry::ToolRegistry;
use crate::validate::{apply_defaults, validate_arguments, ArgumentMap};

/// Verified caller identity, supplied by an external authentication layer
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: String,
    pub roles: Vec<String>,
}

impl Identity {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            roles: Vec::new(),
        }
    }

    pub fn with_roles(mut self, roles: &[&str]) -> Self {
        self.roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }
}

/// One piece of result content
#[derive(Debug, Clone, Serialize)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl ContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: text.into(),
        }
    }
}

/// Execution metadata attached to a call result
#[derive(Debug, Clone, Serialize)]
pub struct CallMeta {
    pub tool: String,
    #[serde(rename = "executionTime")]
    pub execution_time_ms: u64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Caller-facing result of an execution call
#[derive(Debug, Clone, Serialize)]
pub struct CallResult {
    #[serde(rename = "isError")]
    pub is_error: bool,
    pub content: Vec<ContentItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<CallMeta>,
}

impl CallResult {
    pub fn success(text: impl Into<String>, meta: CallMeta) -> Self {
        Self {
            is_error: false,
            content: vec![ContentItem::text(text)],
            meta: Some(meta),
        }
    }

    pub fn failure(text: impl Into<String>, meta: CallMeta) -> Self {
        Self {
            is_error: true,
            content: vec![ContentItem::text(text)],
            meta: Some(meta),
        }
    }

    /// The first content item's text
    pub fn text(&self) -> &str {
        self.content.first().map(|c| c.text.as_str()).unwrap_or("")
    }
}

/// Seam between the scheduler and the pipeline, mockable in tests
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn run_tool(
        &self,
        tool: &str,
        args: ArgumentMap,
        identity: &Identity,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> CallResult;
}

/// The mediated execution pipeline
pub struct ToolGateway {
    registry: Arc<ToolRegistry>,
    permissions: Arc<PermissionManager>,
    rate_limiter: Arc<RateLimiter>,
    executor: Executor,
    audit: AuditLogger,
    history: HistoryStore,
}

impl std::fmt::Debug for ToolGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolGateway")
            .field("tools", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl ToolGateway {
    pub fn new(
        registry: Arc<ToolRegistry>,
        permissions: Arc<PermissionManager>,
        rate_limiter: Arc<RateLimiter>,
        executor: Executor,
        audit: AuditLogger,
        history: HistoryStore,
    ) -> Self {
        Self {
            registry,
            permissions,
            rate_limiter,
            executor,
            audit,
            history,
        }
    }

    /// Redacted tool catalog
    pub fn list_tools(&self) -> Vec<crate::registry::ToolSummary> {
        self.registry.list()
    }

    /// History store handle
    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Execute a tool on behalf of an identity. Never returns `Err`.
    pub async fn execute(
        &self,
        tool_name: &str,
        args: ArgumentMap,
        identity: &Identity,
    ) -> CallResult {
        let (result, _history_id) = self
            .mediate(tool_name, args, identity, serde_json::Map::new())
            .await;
        result
    }

    /// Re-execute a past history entry under a new identity.
    ///
    /// A fresh `Running` entry referencing the original is created by the
    /// pipeline; the original entry is never touched.
    pub async fn replay(
        &self,
        history_id: &str,
        identity: &Identity,
    ) -> Result<HistoryEntry, GateError> {
        let original = self.history.get(history_id).ok_or_else(|| GateError::UnknownId {
            resource: "History entry",
            id: history_id.to_string(),
        })?;

        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "replayedFrom".to_string(),
            serde_json::Value::String(original.id.clone()),
        );
        metadata.insert(
            "originalIdentity".to_string(),
            serde_json::Value::String(original.identity.clone()),
        );

        let (result, new_id) = self
            .mediate(&original.tool, original.arguments.clone(), identity, metadata)
            .await;

        self.audit
            .log(
                AuditEntry::new(
                    "history_replayed",
                    &identity.id,
                    &original.tool,
                    if result.is_error {
                        AuditStatus::Failure
                    } else {
                        AuditStatus::Success
                    },
                )
                .with_metadata("originalId", serde_json::json!(original.id)),
            )
            .await;

        match new_id {
            Some(id) => self.history.get(&id).ok_or_else(|| {
                GateError::Persistence("replay entry vanished from history".to_string())
            }),
            // Admission failed before a history entry was created
            None => Err(result
                .meta
                .and_then(|m| m.error)
                .map(GateError::ExecutionFailure)
                .unwrap_or_else(|| GateError::ExecutionFailure(result.content[0].text.clone()))),
        }
    }

    /// Run the pipeline and translate the outcome. Every call produces a
    /// `tool_execution_started` entry and exactly one terminal audit entry,
    /// written before the result is returned.
    async fn mediate(
        &self,
        tool_name: &str,
        args: ArgumentMap,
        identity: &Identity,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> (CallResult, Option<String>) {
        let start = Instant::now();

        self.audit
            .log(AuditEntry::new(
                "tool_execution_started",
                &identity.id,
                tool_name,
                AuditStatus::Success,
            ))
            .await;

        let mut history_id = None;
        let outcome = self
            .run_pipeline(tool_name, args, identity, metadata, &mut history_id)
            .await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(output) => {
                self.audit
                    .log(
                        AuditEntry::new(
                            "tool_execution_completed",
                            &identity.id,
                            tool_name,
                            AuditStatus::Success,
                        )
                        .with_metadata("executionTimeMs", serde_json::json!(elapsed_ms)),
                    )
                    .await;
                info!(tool = tool_name, identity = %identity.id, elapsed_ms, "execution succeeded");
                CallResult::success(
                    output,
                    CallMeta {
                        tool: tool_name.to_string(),
                        execution_time_ms: elapsed_ms,
                        status: "success".to_string(),
                        error: None,
                    },
                )
            }
            Err(err) => {
                if err.is_admission_failure() {
                    warn!(tool = tool_name, identity = %identity.id, %err, "request rejected");
                } else {
                    error!(tool = tool_name, identity = %identity.id, %err, "execution failed");
                }
                let (action, status) = terminal_audit_for(&err);
                self.audit
                    .log(
                        AuditEntry::new(action, &identity.id, tool_name, status)
                            .with_metadata("error", serde_json::json!(err.to_string()))
                            .with_metadata("kind", serde_json::json!(err.kind())),
                    )
                    .await;
                CallResult::failure(
                    err.to_string(),
                    CallMeta {
                        tool: tool_name.to_string(),
                        execution_time_ms: elapsed_ms,
                        status: "failed".to_string(),
                        error: Some(err.to_string()),
                    },
                )
            }
        };

        (result, history_id)
    }

    async fn run_pipeline(
        &self,
        tool_name: &str,
        args: ArgumentMap,
        identity: &Identity,
        metadata: serde_json::Map<String, serde_json::Value>,
        history_id: &mut Option<String>,
    ) -> Result<String, GateError> {
        // Registry lookup comes before every other check
        let tool = self.registry.get(tool_name)?;

        let args = apply_defaults(tool, &args);
        validate_arguments(tool, &args)?;

        // Admission: permission rules, then rate limit, then the in-flight
        // slot. The slot guard releases on every exit path below.
        let decision = self
            .permissions
            .check(&tool.executable, &identity.id, &identity.roles)?;
        self.rate_limiter
            .check_with(&identity.id, 1, decision.rate_limit.as_ref())?;
        let _slot =
            self.permissions
                .track_start(&identity.id, &tool.executable, decision.max_concurrent)?;

        let command = build_command(tool, &args);

        let mut entry = NewEntry::running(&identity.id, &tool.name, &command, args);
        entry.metadata = metadata;
        let id = self.history.add(entry);
        *history_id = Some(id.clone());

        let run_started = Instant::now();
        let result = self.executor.run(&command, tool.timeout).await;
        let duration_ms = run_started.elapsed().as_millis() as u64;

        // An output validator may downgrade a successful run
        let result = result.and_then(|output| match tool.output_validator {
            Some(validate) => validate(&output)
                .map(|_| output)
                .map_err(GateError::OutputValidation),
            None => Ok(output),
        });

        match &result {
            Ok(output) => {
                self.history
                    .update(&id, HistoryPatch::success(output.clone(), duration_ms));
            }
            Err(err) => {
                self.history
                    .update(&id, HistoryPatch::failed(err.to_string(), duration_ms));
            }
        }

        result
    }
}

fn terminal_audit_for(err: &GateError) -> (&'static str, AuditStatus) {
    match err {
        GateError::PermissionDenied(_) => ("permission_denied", AuditStatus::Failure),
        GateError::RateLimited { .. } => ("rate_limit_exceeded", AuditStatus::Warning),
        _ => ("tool_execution_failed", AuditStatus::Failure),
    }
}

#[async_trait]
impl PipelineRunner for ToolGateway {
    async fn run_tool(
        &self,
        tool: &str,
        args: ArgumentMap,
        identity: &Identity,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> CallResult {
        let (result, _) = self.mediate(tool, args, identity, metadata).await;
        result
    }
}
