// src/execution/worker.rs
//! Persistent interpreter worker
//!
//! A worker is one long-lived interpreter process reading commands from
//! stdin. Each execution writes the parameter assignments, the script body,
//! and a pair of unique end markers (one per stream); the worker then reads
//! stdout until its marker appears and drains stderr until the second marker.
//!
//! EOF before the marker means the script terminated the interpreter; the
//! worker reports that as a death so its owner can replace it. Deadlines
//! kill the process group outright; a half-executed interpreter cannot be
//! reused.

use crate::execution::interpreter::{InterpreterKind, InterpreterProfile};
use crate::execution::types::ExecutionRequest;
use crate::utils::errors::{EngineError, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Configuration for spawning workers
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Interpreter to host
    pub profile: InterpreterProfile,

    /// Whether the worker inherits the host environment
    pub inherit_environment: bool,

    /// Extra environment variables for the worker process
    pub env_vars: Vec<(String, String)>,
}

impl WorkerConfig {
    pub fn new(profile: InterpreterProfile) -> Self {
        Self {
            profile,
            inherit_environment: true,
            env_vars: vec![],
        }
    }
}

/// Output of one worker execution
#[derive(Debug)]
pub struct WorkerOutput {
    /// Captured stdout up to the end marker
    pub output: String,

    /// Captured stderr up to the end marker
    pub error: String,

    /// The interpreter process exited while running the script
    pub died: bool,
}

/// One persistent interpreter process
pub struct ShellWorker {
    /// Worker id within its owner
    pub id: usize,

    config: WorkerConfig,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr_rx: mpsc::UnboundedReceiver<String>,
    alive: bool,
    execution_count: u64,
}

impl ShellWorker {
    /// Spawn a new worker process
    pub async fn spawn(id: usize, config: WorkerConfig) -> Result<Self> {
        debug!("Spawning worker #{} ({:?})", id, config.profile.program);

        let mut command = Command::new(&config.profile.program);
        command.args(config.profile.kind.repl_args());

        if !config.inherit_environment {
            command.env_clear();
        }
        for (key, value) in &config.env_vars {
            command.env(key, value);
        }

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| EngineError::ProcessSpawnFailed(format!("Failed to spawn worker: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::ProcessSpawnFailed("Failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::ProcessSpawnFailed("Failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::ProcessSpawnFailed("Failed to capture stderr".into()))?;

        // Background drain keeps the stderr pipe from filling while stdout
        // is being read; lines are picked up after each execution.
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stderr_tx.send(line).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            id,
            config,
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            stderr_rx,
            alive: true,
            execution_count: 0,
        })
    }

    /// Spawn a worker and run the standard preparation sequence: raise the
    /// execution restriction ceiling, then load vendor modules per the plan.
    /// Returns the worker plus the names of modules that failed every load
    /// strategy.
    pub async fn spawn_prepared(
        id: usize,
        config: WorkerConfig,
        load_script: Option<&str>,
        init_timeout: Duration,
    ) -> Result<(Self, Vec<String>)> {
        let kind = config.profile.kind;
        let mut worker = Self::spawn(id, config).await?;

        if let Some(bypass) = kind.policy_bypass_command() {
            let out = worker.execute_raw(bypass, init_timeout).await?;
            if out.died {
                return Err(EngineError::ProcessSpawnFailed(
                    "interpreter exited while applying the execution policy bypass".to_string(),
                ));
            }
        }

        let mut load_failures = Vec::new();
        if let Some(script) = load_script {
            let out = worker.execute_raw(script, init_timeout).await?;
            if out.died {
                return Err(EngineError::ProcessSpawnFailed(
                    "interpreter exited while loading vendor modules".to_string(),
                ));
            }
            load_failures = crate::modules::resolver::parse_load_failures(&out.error);
            if !load_failures.is_empty() {
                warn!(
                    "Worker #{} failed to load modules: {}",
                    worker.id,
                    load_failures.join(", ")
                );
            }
        }

        Ok((worker, load_failures))
    }

    /// Whether the worker process is believed to be usable
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Interpreter kind this worker hosts
    pub fn kind(&self) -> InterpreterKind {
        self.config.profile.kind
    }

    /// Number of scripts this worker has executed
    pub fn execution_count(&self) -> u64 {
        self.execution_count
    }

    /// Run a bare command with no parameters under a timeout
    pub async fn execute_raw(&mut self, script: &str, timeout: Duration) -> Result<WorkerOutput> {
        let request = ExecutionRequest::new(script).with_timeout(timeout);
        self.execute(&request).await
    }

    /// Execute a request on this worker.
    ///
    /// `Err(ExecutionTimeout)`/`Err(ExecutionCancelled)` mean the deadline
    /// fired: the process group has been killed and the worker must be
    /// discarded by its owner.
    pub async fn execute(&mut self, request: &ExecutionRequest) -> Result<WorkerOutput> {
        if !self.alive {
            return Err(EngineError::RuntimeError(format!(
                "worker #{} process is dead",
                self.id
            )));
        }

        self.execution_count += 1;
        let kind = self.config.profile.kind;
        let marker = format!("__VIRTOPS_END_{}_{}__", self.id, self.execution_count);

        let mut block = String::new();
        for (name, value) in &request.parameters {
            block.push_str(&kind.render_assignment(name, value));
            block.push('\n');
        }
        block.push_str(&request.script);
        block.push('\n');
        block.push_str(&kind.stdout_marker(&marker));
        block.push('\n');
        block.push_str(&kind.stderr_marker(&marker));
        block.push('\n');

        if let Err(e) = self.write_block(&block).await {
            debug!("Worker #{} stdin write failed: {}", self.id, e);
            self.alive = false;
            return Ok(WorkerOutput {
                output: String::new(),
                error: format!("worker process exited: {}", e),
                died: true,
            });
        }

        let deadline = tokio::time::sleep(request.timeout);
        tokio::pin!(deadline);

        let mut output = String::new();
        let mut died = false;

        // Stdout until marker or EOF
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    self.kill().await;
                    return Err(EngineError::ExecutionTimeout);
                }
                _ = request.cancellation.cancelled() => {
                    self.kill().await;
                    return Err(EngineError::ExecutionCancelled);
                }
                line = self.stdout.next_line() => match line {
                    Ok(Some(line)) if line == marker => break,
                    Ok(Some(line)) => {
                        output.push_str(&line);
                        output.push('\n');
                    }
                    Ok(None) | Err(_) => {
                        died = true;
                        break;
                    }
                }
            }
        }

        let mut error = String::new();

        if died {
            // Give the stderr drain a beat to observe EOF, then collect
            // whatever the interpreter said on its way out.
            self.alive = false;
            tokio::time::sleep(Duration::from_millis(50)).await;
            while let Ok(line) = self.stderr_rx.try_recv() {
                error.push_str(&line);
                error.push('\n');
            }
            return Ok(WorkerOutput {
                output,
                error,
                died: true,
            });
        }

        // Stderr until its marker
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    self.kill().await;
                    return Err(EngineError::ExecutionTimeout);
                }
                _ = request.cancellation.cancelled() => {
                    self.kill().await;
                    return Err(EngineError::ExecutionCancelled);
                }
                line = self.stderr_rx.recv() => match line {
                    Some(line) if line == marker => break,
                    Some(line) => {
                        error.push_str(&line);
                        error.push('\n');
                    }
                    None => {
                        self.alive = false;
                        died = true;
                        break;
                    }
                }
            }
        }

        Ok(WorkerOutput {
            output,
            error,
            died,
        })
    }

    async fn write_block(&mut self, block: &str) -> std::io::Result<()> {
        self.stdin.write_all(block.as_bytes()).await?;
        self.stdin.flush().await
    }

    /// Kill the worker's process group immediately
    pub async fn kill(&mut self) {
        self.alive = false;

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let pgid = Pid::from_raw(pid as i32);
            debug!("Sending SIGKILL to worker #{} group {}", self.id, pgid);
            if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                warn!("Failed to SIGKILL worker #{}: {}", self.id, e);
            }
        }

        #[cfg(not(unix))]
        if let Err(e) = self.child.start_kill() {
            warn!("Failed to kill worker #{}: {}", self.id, e);
        }

        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(status)) => debug!("Worker #{} exited with status: {}", self.id, status),
            Ok(Err(e)) => warn!("Error waiting for worker #{}: {}", self.id, e),
            Err(_) => warn!("Worker #{} did not exit in time", self.id),
        }
    }

    /// Gracefully shut the worker down: ask the interpreter to exit, then
    /// kill whatever is left
    pub async fn shutdown(&mut self) {
        debug!("Shutting down worker #{}", self.id);

        // `exit` is understood by every supported interpreter kind.
        let _ = self.write_block("exit\n").await;

        if tokio::time::timeout(Duration::from_secs(2), self.child.wait())
            .await
            .is_ok()
        {
            self.alive = false;
            return;
        }

        self.kill().await;
    }
}
