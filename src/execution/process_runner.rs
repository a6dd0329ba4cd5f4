// src/execution/process_runner.rs
//! Isolated-process execution backend
//!
//! Each call writes the parameter assignments plus the script body to a
//! private temporary file, launches the interpreter non-interactively with
//! restriction bypass, captures stdout/stderr into memory, and awaits exit
//! under the request's effective deadline. On timeout or cancellation the
//! whole process group is terminated and exit is awaited with a bound.
//!
//! The temporary file is removed on every exit path: it lives in a
//! [`tempfile::NamedTempFile`] whose drop never panics. Calls share no
//! mutable state, so parallelism is limited only by host resources.

use crate::execution::interpreter::InterpreterProfile;
use crate::execution::types::{parse_objects, ExecutionRequest, ExecutionResult, FailureKind};
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Configuration for the process runner backend
#[derive(Debug, Clone)]
pub struct ProcessRunnerConfig {
    /// Interpreter to launch
    pub profile: InterpreterProfile,

    /// Whether the child inherits the host environment
    pub inherit_environment: bool,

    /// Extra environment variables for the child
    pub env_vars: Vec<(String, String)>,

    /// Directory for the private script files; system temp dir when `None`
    pub script_dir: Option<PathBuf>,

    /// Grace between SIGTERM and SIGKILL when a deadline fires
    pub kill_grace: Duration,
}

impl ProcessRunnerConfig {
    pub fn new(profile: InterpreterProfile) -> Self {
        Self {
            profile,
            inherit_environment: true,
            env_vars: vec![],
            script_dir: None,
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// Process runner backend
pub struct ProcessRunner {
    config: ProcessRunnerConfig,
}

impl ProcessRunner {
    /// Create a new process runner
    pub fn new(config: ProcessRunnerConfig) -> Self {
        Self { config }
    }

    /// Build a runner from engine configuration, discovering the interpreter
    pub fn from_engine_config(config: &EngineConfig) -> Result<Self> {
        let kind = config.execution.interpreter;
        let profile = match &config.execution.interpreter_path {
            Some(path) => InterpreterProfile::with_program(kind, path),
            None => InterpreterProfile::discover(kind)?,
        };

        let mut runner_config = ProcessRunnerConfig::new(profile);
        runner_config.inherit_environment = config.execution.inherit_environment;
        runner_config.env_vars = config
            .execution
            .env_vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self::new(runner_config))
    }

    /// The interpreter this runner launches
    pub fn profile(&self) -> &InterpreterProfile {
        &self.config.profile
    }

    /// Run one script in an isolated process.
    ///
    /// `Err` means the mechanism itself could not run (spawn failure, script
    /// file I/O); script errors, timeouts and cancellations come back as
    /// classified `Ok` results.
    pub async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let started = Instant::now();

        // Script file is deleted when `script_file` drops, on every path.
        let script_file = self.write_script_file(request)?;
        let args = self
            .config
            .profile
            .kind
            .script_args(script_file.path());

        debug!(
            "Spawning {:?} for one-shot execution",
            self.config.profile.program
        );

        let mut command = Command::new(&self.config.profile.program);
        command.args(&args);

        if !self.config.inherit_environment {
            command.env_clear();
        }
        for (key, value) in &self.config.env_vars {
            command.env(key, value);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so a deadline can terminate the whole tree.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| EngineError::ProcessSpawnFailed(format!("Failed to spawn process: {}", e)))?;

        debug!("Process spawned with PID: {:?}", child.id());

        let stdout_task = drain_stream(child.stdout.take());
        let stderr_task = drain_stream(child.stderr.take());

        let outcome = tokio::select! {
            status = child.wait() => ProcessOutcome::Exited(status),
            _ = tokio::time::sleep(request.timeout) => ProcessOutcome::Deadline(FailureKind::Timeout),
            _ = request.cancellation.cancelled() => ProcessOutcome::Deadline(FailureKind::Cancelled),
        };

        let result = match outcome {
            ProcessOutcome::Exited(Ok(status)) => {
                let output = stdout_task.await.unwrap_or_default();
                let error = stderr_task.await.unwrap_or_default();
                let elapsed = started.elapsed();

                if status.success() && error.trim().is_empty() {
                    let objects = if request.capture_objects {
                        parse_objects(&output)
                    } else {
                        Vec::new()
                    };
                    ExecutionResult::succeeded(output, objects, elapsed)
                } else {
                    let error = if error.trim().is_empty() {
                        format!("interpreter exited with {}", status)
                    } else {
                        error
                    };
                    ExecutionResult::failed(FailureKind::Script, output, error, elapsed)
                }
            }
            ProcessOutcome::Exited(Err(e)) => {
                return Err(EngineError::RuntimeError(format!(
                    "Failed waiting for process: {}",
                    e
                )));
            }
            ProcessOutcome::Deadline(kind) => {
                self.terminate(&mut child).await;
                let output = stdout_task.await.unwrap_or_default();
                let error = stderr_task.await.unwrap_or_default();
                ExecutionResult::failed(
                    kind,
                    output,
                    format!("execution {} after {:?}", kind, request.timeout),
                    started.elapsed(),
                )
            }
        };

        Ok(result)
    }

    fn write_script_file(&self, request: &ExecutionRequest) -> Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        let suffix = format!(".{}", self.config.profile.kind.extension());
        builder.prefix("virtops-").suffix(&suffix);

        let mut file = match &self.config.script_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };

        let kind = self.config.profile.kind;
        for (name, value) in &request.parameters {
            writeln!(file, "{}", kind.render_assignment(name, value))?;
        }
        writeln!(file, "{}", request.script)?;
        file.flush()?;

        Ok(file)
    }

    /// Terminate the child's process group, escalating SIGTERM to SIGKILL,
    /// then await exit with a bound.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let pgid = Pid::from_raw(pid as i32);

            debug!("Sending SIGTERM to process group {}", pgid);
            if let Err(e) = killpg(pgid, Signal::SIGTERM) {
                warn!("Failed to send SIGTERM: {}", e);
            }

            if tokio::time::timeout(self.config.kill_grace, child.wait())
                .await
                .is_err()
            {
                debug!("Process group still alive, sending SIGKILL to {}", pgid);
                if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                    warn!("Failed to send SIGKILL: {}", e);
                }
            }
        }

        #[cfg(not(unix))]
        if let Err(e) = child.start_kill() {
            warn!("Failed to kill process: {}", e);
        }

        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => debug!("Process exited with status: {}", status),
            Ok(Err(e)) => warn!("Error waiting for killed process: {}", e),
            Err(_) => warn!("Process did not exit after SIGKILL within bound"),
        }
    }
}

enum ProcessOutcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    Deadline(FailureKind),
}

/// Read a child stream to the end, lossily decoding to UTF-8
fn drain_stream<S>(stream: Option<S>) -> tokio::task::JoinHandle<String>
where
    S: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::interpreter::{InterpreterKind, InterpreterProfile};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn shell_runner(script_dir: Option<PathBuf>) -> ProcessRunner {
        let profile = InterpreterProfile::discover(InterpreterKind::PosixShell).unwrap();
        let mut config = ProcessRunnerConfig::new(profile);
        config.script_dir = script_dir;
        config.kill_grace = Duration::from_millis(100);
        ProcessRunner::new(config)
    }

    #[tokio::test]
    async fn test_successful_execution() {
        let runner = shell_runner(None);
        let request = ExecutionRequest::new("printf 'hello\\n'");

        let result = runner.run(&request).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output.trim(), "hello");
        assert!(result.execution_time > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_parameters_are_rendered() {
        let runner = shell_runner(None);
        let request = ExecutionRequest::new("printf '%s\\n' \"$greeting\"")
            .with_parameter("greeting", json!("bonjour"));

        let result = runner.run(&request).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output.trim(), "bonjour");
    }

    #[tokio::test]
    async fn test_script_failure_classification() {
        let runner = shell_runner(None);
        let request = ExecutionRequest::new("printf 'broken\\n' 1>&2; exit 3");

        let result = runner.run(&request).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Script));
        assert!(result.error.contains("broken"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_with_quiet_stderr_fails() {
        let runner = shell_runner(None);
        let request = ExecutionRequest::new("exit 7");

        let result = runner.run(&request).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Script));
        assert!(!result.error.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_kills_process_and_removes_script_file() {
        let dir = tempfile::tempdir().unwrap();
        let runner = shell_runner(Some(dir.path().to_path_buf()));
        let request =
            ExecutionRequest::new("sleep 30").with_timeout(Duration::from_millis(200));

        let started = Instant::now();
        let result = runner.run(&request).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Timeout));
        // timeout + SIGTERM grace + margin, nowhere near the 30s sleep
        assert!(started.elapsed() < Duration::from_secs(5));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_classification() {
        let runner = shell_runner(None);
        let token = CancellationToken::new();
        let request = ExecutionRequest::new("sleep 30")
            .with_timeout(Duration::from_secs(60))
            .with_cancellation(token.clone());

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let result = runner.run(&request).await.unwrap();
        cancel.await.unwrap();

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Cancelled));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_mechanism_error() {
        let profile = InterpreterProfile::with_program(
            InterpreterKind::PosixShell,
            "/nonexistent/interpreter",
        );
        let runner = ProcessRunner::new(ProcessRunnerConfig::new(profile));
        let request = ExecutionRequest::new("printf 'unreachable'");

        let err = runner.run(&request).await.unwrap_err();
        assert!(matches!(err, EngineError::ProcessSpawnFailed(_)));
    }

    #[tokio::test]
    async fn test_captured_objects() {
        let runner = shell_runner(None);
        let request = ExecutionRequest::new("printf '{\"Name\": \"esx01\"}\\n'")
            .with_captured_objects();

        let result = runner.run(&request).await.unwrap();
        assert!(result.success);
        assert_eq!(result.field_str(0, "Name").unwrap(), "esx01");
    }
}
