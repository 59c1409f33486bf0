//! Subprocess Executor
//!
//! Runs one composed command line per call through `sh -c`, with a hard
//! timeout and a bounded output buffer. The command line arriving here has
//! already passed the dangerous-input screen and the escaping rules of the
//! command builder. Timeout expiry kills the child (`kill_on_drop`), and an
//! output buffer overflow is reported as a failure rather than silently
//! truncated.

use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command as TokioCommand;
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::error::GateError;

/// Read a child pipe to EOF, keeping at most `cap` bytes in memory.
/// Returns the retained prefix and the total byte count seen; the stream is
/// always drained so the child never blocks on a full pipe.
async fn drain_capped<R: AsyncRead + Unpin>(
    reader: Option<R>,
    cap: usize,
) -> std::io::Result<(Vec<u8>, usize)> {
    let mut retained = Vec::new();
    let mut total = 0usize;
    let Some(mut reader) = reader else {
        return Ok((retained, 0));
    };

    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok((retained, total));
        }
        total += n;
        if retained.len() < cap {
            let take = n.min(cap - retained.len());
            retained.extend_from_slice(&chunk[..take]);
        }
    }
}

/// Timed subprocess executor
#[derive(Debug, Clone)]
pub struct Executor {
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Default timeout for tools without an override
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.config.default_timeout_secs)
    }

    /// Clamp a tool's requested timeout to the configured ceiling
    pub fn clamp_timeout(&self, requested: Duration) -> Duration {
        requested.min(Duration::from_secs(self.config.max_timeout_secs))
    }

    /// Execute a command line, returning captured stdout on success. A zero
    /// timeout means the configured default.
    ///
    /// # Errors
    ///
    /// * `GateError::Timeout` when the subprocess outlives the deadline
    /// * `GateError::ExecutionFailure` for spawn errors, non-zero exit, or
    ///   output exceeding the configured buffer size
    pub async fn run(&self, command_line: &str, timeout: Duration) -> Result<String, GateError> {
        let timeout = if timeout.is_zero() {
            self.default_timeout()
        } else {
            self.clamp_timeout(timeout)
        };
        let start = std::time::Instant::now();

        info!(command = command_line, timeout_secs = timeout.as_secs(), "executing");

        let mut process = TokioCommand::new("sh");
        process
            .arg("-c")
            .arg(command_line)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let mut child = process
            .spawn()
            .map_err(|e| GateError::ExecutionFailure(format!("failed to spawn process: {e}")))?;

        let cap = self.config.max_output_bytes;
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        // Both pipes are drained concurrently with the exit wait, so memory
        // stays bounded at the cap per stream and the child never stalls on
        // a full pipe.
        let collected = tokio::time::timeout(timeout, async {
            let (stdout, stderr, status) = tokio::join!(
                drain_capped(stdout_pipe, cap),
                drain_capped(stderr_pipe, cap),
                child.wait(),
            );
            Ok::<_, std::io::Error>((stdout?, stderr?, status?))
        })
        .await;

        let ((stdout_buf, stdout_total), (stderr_buf, stderr_total), status) = match collected {
            Ok(Ok(collected)) => collected,
            Ok(Err(e)) => {
                return Err(GateError::ExecutionFailure(format!(
                    "failed to collect process output: {e}"
                )))
            }
            Err(_) => {
                // kill_on_drop reaps the child as it leaves scope
                warn!(command = command_line, "execution timed out");
                return Err(GateError::Timeout(timeout));
            }
        };

        let duration = start.elapsed();
        debug!(elapsed_ms = duration.as_millis() as u64, "process finished");

        if stdout_total + stderr_total > cap {
            return Err(GateError::ExecutionFailure(format!(
                "output exceeded the {cap} byte buffer limit"
            )));
        }

        let stdout = String::from_utf8_lossy(&stdout_buf).to_string();
        let stderr = String::from_utf8_lossy(&stderr_buf).to_string();

        if status.success() {
            Ok(stdout)
        } else {
            let detail = if stderr.trim().is_empty() { &stdout } else { &stderr };
            warn!(
                command = command_line,
                exit_code = status.code(),
                "command failed"
            );
            Err(GateError::ExecutionFailure(format!(
                "exit code {:?}: {}",
                status.code(),
                detail.trim()
            )))
        }
    }
}
