// src/execution/gateway.rs
//! Script execution gateway
//!
//! The single public entry point for running scripts. Callers hand over a
//! request and always get an [`ExecutionResult`] back; backend exceptions
//! are converted, never propagated.
//!
//! Backend selection:
//! - `PreferProcess` (default): isolated process first; a mechanism failure
//!   (spawn error, unexpected fault) triggers exactly one attempt on the
//!   pooled backend. A script-level failure never falls back.
//! - `EmbeddedOnly`: pooled backend only.
//! - `ProcessOnly`: isolated process only, no fallback.
//!
//! A troubleshooting override can force embedded execution; it is sticky
//! until explicitly cleared.

use crate::execution::pool::ShellPool;
use crate::execution::process_runner::ProcessRunner;
use crate::execution::types::{ExecutionRequest, ExecutionResult, FailureKind};
use crate::modules::resolver::ModuleResolver;
use crate::modules::version::ModuleVersion;
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Backend selection mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Isolated process first, pooled backend on mechanism failure
    #[default]
    PreferProcess,

    /// Pooled backend only
    EmbeddedOnly,

    /// Isolated process only, no fallback
    ProcessOnly,
}

/// Script execution gateway
pub struct ExecutionGateway {
    mode: ExecutionMode,
    runner: Arc<ProcessRunner>,
    pool: Arc<ShellPool>,
    force_embedded: AtomicBool,
}

impl ExecutionGateway {
    /// Create a gateway over explicit backends
    pub fn new(mode: ExecutionMode, runner: Arc<ProcessRunner>, pool: Arc<ShellPool>) -> Self {
        Self {
            mode,
            runner,
            pool,
            force_embedded: AtomicBool::new(false),
        }
    }

    /// Build the full backend stack from engine configuration
    pub fn from_engine_config(config: &EngineConfig) -> Result<Self> {
        let runner = Arc::new(ProcessRunner::from_engine_config(config)?);

        let pinned = match &config.modules.pinned_version {
            Some(text) => Some(text.parse::<ModuleVersion>().map_err(|e| {
                EngineError::ModuleResolution(e.to_string())
            })?),
            None => None,
        };
        let resolver =
            Arc::new(ModuleResolver::discovering(Arc::clone(&runner)).with_pinned(pinned));

        let pool_config = crate::execution::pool::PoolConfig::from_engine_config(
            config,
            runner.profile().clone(),
        );
        let pool = Arc::new(ShellPool::new(pool_config, resolver));

        Ok(Self::new(config.execution.mode, runner, pool))
    }

    /// The pooled backend, for diagnostics and statistics
    pub fn pool(&self) -> &Arc<ShellPool> {
        &self.pool
    }

    /// Force all executions onto the embedded backend until cleared
    pub fn set_embedded_override(&self, enabled: bool) {
        self.force_embedded.store(enabled, Ordering::SeqCst);
    }

    /// Whether the embedded override is active
    pub fn embedded_override(&self) -> bool {
        self.force_embedded.load(Ordering::SeqCst)
    }

    /// Execute a request on whichever backend applies.
    ///
    /// Never returns an error: every backend fault becomes a classified
    /// failed result, and `execution_time` is always populated.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();

        let embedded_only =
            self.mode == ExecutionMode::EmbeddedOnly || self.embedded_override();

        if embedded_only {
            return self.run_embedded(&request, started).await;
        }

        match self.runner.run(&request).await {
            Ok(result) => result,
            Err(e) if self.mode == ExecutionMode::PreferProcess && e.is_mechanism_failure() => {
                warn!(
                    "Process backend could not run ({}), falling back to pooled backend",
                    e
                );
                self.run_embedded(&request, started).await
            }
            Err(e) => {
                debug!("Process backend failed without fallback: {}", e);
                ExecutionResult::failure_message(
                    FailureKind::Mechanism,
                    e.to_string(),
                    started.elapsed(),
                )
            }
        }
    }

    /// Shut down the pooled backend's workers
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    async fn run_embedded(&self, request: &ExecutionRequest, started: Instant) -> ExecutionResult {
        match self.pool.execute(request).await {
            Ok(result) => result,
            Err(e) => ExecutionResult::failure_message(
                FailureKind::Mechanism,
                e.to_string(),
                started.elapsed(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::interpreter::{InterpreterKind, InterpreterProfile};
    use crate::execution::pool::PoolConfig;
    use crate::execution::process_runner::ProcessRunnerConfig;
    use crate::execution::worker::WorkerConfig;
    use std::time::Duration;

    fn shell_profile() -> InterpreterProfile {
        InterpreterProfile::discover(InterpreterKind::PosixShell).unwrap()
    }

    fn broken_profile() -> InterpreterProfile {
        InterpreterProfile::with_program(InterpreterKind::PosixShell, "/nonexistent/sh")
    }

    fn gateway(mode: ExecutionMode, runner_profile: InterpreterProfile, pool_profile: InterpreterProfile) -> ExecutionGateway {
        let runner = Arc::new(ProcessRunner::new(ProcessRunnerConfig::new(runner_profile)));
        let resolver = Arc::new(ModuleResolver::with_inventory(vec![]));
        let pool = Arc::new(ShellPool::new(
            PoolConfig::new(1, WorkerConfig::new(pool_profile)),
            resolver,
        ));
        ExecutionGateway::new(mode, runner, pool)
    }

    #[tokio::test]
    async fn test_mechanism_failure_falls_back_to_embedded() {
        let gw = gateway(ExecutionMode::PreferProcess, broken_profile(), shell_profile());

        let result = gw
            .execute(ExecutionRequest::new("printf 'fell back\\n'"))
            .await;

        assert!(result.success);
        assert_eq!(result.output.trim(), "fell back");
        assert!(result.execution_time > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_no_fallback_in_process_only_mode() {
        let gw = gateway(ExecutionMode::ProcessOnly, broken_profile(), shell_profile());

        let result = gw.execute(ExecutionRequest::new("printf 'x'")).await;

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Mechanism));
    }

    #[tokio::test]
    async fn test_script_failure_does_not_fall_back() {
        // The pool is broken: if the gateway fell back, the result would be
        // a mechanism failure instead of the script's own error.
        let gw = gateway(ExecutionMode::PreferProcess, shell_profile(), broken_profile());

        let result = gw
            .execute(ExecutionRequest::new("printf 'bang\\n' 1>&2; exit 1"))
            .await;

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Script));
        assert!(result.error.contains("bang"));
    }

    #[tokio::test]
    async fn test_embedded_override_is_sticky() {
        let gw = gateway(ExecutionMode::PreferProcess, shell_profile(), shell_profile());

        gw.set_embedded_override(true);
        assert!(gw.embedded_override());

        // Pooled workers keep shell state between calls; the isolated
        // process backend cannot.
        gw.execute(ExecutionRequest::new("gw_probe=11")).await;
        let result = gw
            .execute(ExecutionRequest::new("printf '%s\\n' \"$gw_probe\""))
            .await;
        assert_eq!(result.output.trim(), "11");

        gw.set_embedded_override(false);
        let result = gw
            .execute(ExecutionRequest::new("printf '%s\\n' \"$gw_probe\""))
            .await;
        assert!(result.output.trim().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_classification_passes_through() {
        let gw = gateway(ExecutionMode::PreferProcess, shell_profile(), shell_profile());

        let result = gw
            .execute(
                ExecutionRequest::new("sleep 30").with_timeout(Duration::from_millis(200)),
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Timeout));
        assert!(result.execution_time > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_embedded_only_mode_uses_pool() {
        let gw = gateway(ExecutionMode::EmbeddedOnly, broken_profile(), shell_profile());

        let result = gw
            .execute(ExecutionRequest::new("printf 'embedded\\n'"))
            .await;

        assert!(result.success);
        assert_eq!(result.output.trim(), "embedded");
    }
}
