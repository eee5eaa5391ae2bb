//! DSC executor
//!
//! Invokes the external enforcement binary with JSON trace and JSON result
//! output. Stdout is the single result document; stderr is line-delimited
//! JSON trace messages forwarded to the logger at their mapped severity.
//! Stdout and stderr are pumped concurrently so neither pipe can fill up
//! and stall the child.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use opendsc_core::dsc::{DscResult, TraceLevel, TraceLine};
use opendsc_core::types::OperationKind;
use opendsc_core::{Error, Result};

/// Grace period between cancellation and force-kill
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Outcome of one child invocation
#[derive(Debug, Clone)]
pub struct Execution {
    pub result: DscResult,
    pub exit_code: i32,
}

/// Seam for the worker: run one enforcement operation
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Enforcer: Send + Sync {
    async fn run(
        &self,
        operation: OperationKind,
        file: &Path,
        cancel: &CancellationToken,
    ) -> Result<Execution>;
}

/// Runs the real enforcement binary
pub struct DscExecutor {
    executable: PathBuf,
    trace_level: String,
}

impl DscExecutor {
    pub fn new(executable: PathBuf, log_level: &str) -> Self {
        Self {
            executable,
            trace_level: map_trace_level(log_level).to_string(),
        }
    }
}

/// Map the worker's log level onto the child's trace level
fn map_trace_level(log_level: &str) -> &'static str {
    match log_level.to_ascii_lowercase().as_str() {
        "error" => "error",
        "warn" | "warning" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    }
}

#[async_trait]
impl Enforcer for DscExecutor {
    async fn run(
        &self,
        operation: OperationKind,
        file: &Path,
        cancel: &CancellationToken,
    ) -> Result<Execution> {
        let subcommand = match operation {
            OperationKind::Test => "test",
            OperationKind::Set => "set",
        };
        let working_dir = file.parent().unwrap_or_else(|| Path::new("."));

        let mut child = Command::new(&self.executable)
            .arg("--trace-level")
            .arg(&self.trace_level)
            .arg("--trace-format")
            .arg("json")
            .arg("--progress-format")
            .arg("none")
            .arg("config")
            .arg(subcommand)
            .arg("--file")
            .arg(file)
            .arg("--output-format")
            .arg("json")
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::ChildExecution(format!(
                    "cannot start {}: {}",
                    self.executable.display(),
                    e
                ))
            })?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let stderr_pump = tokio::spawn(pump_stderr(stderr));
        let stdout_pump = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut buffer = Vec::new();
            let read = reader.read_to_end(&mut buffer).await;
            (buffer, read)
        });

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let status = match waited {
            Some(status) => {
                status.map_err(|e| Error::ChildExecution(format!("wait failed: {}", e)))?
            }
            None => {
                tracing::warn!("cancellation requested, stopping enforcement child");
                // Give the child a moment to exit on its own before forcing.
                match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                    Ok(status) => {
                        status.map_err(|e| Error::ChildExecution(format!("wait failed: {}", e)))?
                    }
                    Err(_) => {
                        child
                            .kill()
                            .await
                            .map_err(|e| Error::ChildExecution(format!("kill failed: {}", e)))?;
                        return Err(Error::Cancelled("enforcement child terminated".into()));
                    }
                }
            }
        };

        let (stdout_bytes, read_result) = stdout_pump
            .await
            .map_err(|e| Error::ChildExecution(format!("stdout pump: {}", e)))?;
        read_result.map_err(|e| Error::ChildExecution(format!("stdout read: {}", e)))?;
        stderr_pump.await.ok();

        let exit_code = status.code().unwrap_or(-1);
        let result = DscResult::parse(&stdout_bytes)?;

        Ok(Execution { result, exit_code })
    }
}

/// Forward stderr trace lines to the logger
async fn pump_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match TraceLine::parse(&line) {
            Some(trace) => {
                let message = trace.message().to_string();
                match trace.level() {
                    TraceLevel::Error => tracing::error!(target: "dsc", "{}", message),
                    TraceLevel::Warn => tracing::warn!(target: "dsc", "{}", message),
                    TraceLevel::Info => tracing::info!(target: "dsc", "{}", message),
                    TraceLevel::Debug => tracing::debug!(target: "dsc", "{}", message),
                    TraceLevel::Trace => tracing::trace!(target: "dsc", "{}", message),
                }
            }
            // Lines that are not JSON are logged verbatim.
            None => tracing::warn!(target: "dsc", "{}", line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_level_mapping() {
        assert_eq!(map_trace_level("error"), "error");
        assert_eq!(map_trace_level("WARN"), "warn");
        assert_eq!(map_trace_level("info"), "info");
        assert_eq!(map_trace_level("debug"), "debug");
        assert_eq!(map_trace_level("unknown"), "info");
    }

    #[tokio::test]
    async fn test_missing_executable_is_child_error() {
        let executor = DscExecutor::new(PathBuf::from("/nonexistent/dsc"), "info");
        let cancel = CancellationToken::new();
        let err = executor
            .run(OperationKind::Test, Path::new("/tmp/config.dsc.yaml"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChildExecution(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_child_and_parses_result() {
        // A stand-in child that emits one trace line and a result document.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-dsc");
        std::fs::write(
            &script,
            concat!(
                "#!/bin/sh\n",
                "echo '{\"level\":\"INFO\",\"fields\":{\"message\":\"starting\"}}' >&2\n",
                "echo '{\"exitCode\":0,\"hadErrors\":false,\"results\":[",
                "{\"type\":\"T\",\"name\":\"a\",\"result\":{\"inDesiredState\":true}}]}'\n",
            ),
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = dir.path().join("config.dsc.yaml");
        std::fs::write(&config, "resources: []\n").unwrap();

        let executor = DscExecutor::new(script, "info");
        let cancel = CancellationToken::new();
        let execution = executor
            .run(OperationKind::Test, &config, &cancel)
            .await
            .unwrap();

        assert_eq!(execution.exit_code, 0);
        assert!(execution.result.all_in_desired_state());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_garbage_stdout_is_malformed_result() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-dsc");
        std::fs::write(&script, "#!/bin/sh\necho 'not json'\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = dir.path().join("config.dsc.yaml");
        std::fs::write(&config, "resources: []\n").unwrap();

        let executor = DscExecutor::new(script, "info");
        let err = executor
            .run(OperationKind::Test, &config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChildExecution(_)));
    }
}
