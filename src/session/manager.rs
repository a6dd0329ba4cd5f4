// src/session/manager.rs
//! Session lifecycle and registry
//!
//! State machine per session: Created → Connecting → Connected →
//! (command execution)* → Disconnected. A session becomes visible in the
//! registry only after the connect script reported explicit success; on any
//! connect failure the dedicated worker is disposed immediately and a
//! classified error raised; no partially-connected state ever escapes.

use crate::execution::types::{ExecutionRequest, ExecutionResult};
use crate::execution::worker::{ShellWorker, WorkerConfig};
use crate::modules::resolver::{self, ModuleResolver};
use crate::session::session::{
    connect_script, Session, SessionId, SessionSummary, CONNECT_MARKER,
};
use crate::utils::config::{EngineConfig, SessionSettings};
use crate::utils::errors::{ConnectionErrorKind, EngineError, Result};
use dashmap::DashMap;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Owns every active session; explicitly constructed and passed to whoever
/// needs it; no ambient registry state.
pub struct SessionManager {
    settings: SessionSettings,
    worker_config: WorkerConfig,
    resolver: Arc<ModuleResolver>,
    sessions: DashMap<SessionId, Arc<Session>>,
    next_worker_id: AtomicUsize,
}

impl SessionManager {
    /// Create a manager over explicit settings and worker configuration
    pub fn new(
        settings: SessionSettings,
        worker_config: WorkerConfig,
        resolver: Arc<ModuleResolver>,
    ) -> Self {
        Self {
            settings,
            worker_config,
            resolver,
            sessions: DashMap::new(),
            next_worker_id: AtomicUsize::new(1),
        }
    }

    /// Build a manager from engine configuration, discovering the interpreter
    pub fn from_engine_config(config: &EngineConfig) -> Result<Self> {
        use crate::execution::interpreter::InterpreterProfile;
        use crate::execution::process_runner::{ProcessRunner, ProcessRunnerConfig};

        let kind = config.execution.interpreter;
        let profile = match &config.execution.interpreter_path {
            Some(path) => InterpreterProfile::with_program(kind, path),
            None => InterpreterProfile::discover(kind)?,
        };

        let mut worker_config = WorkerConfig::new(profile.clone());
        worker_config.inherit_environment = config.execution.inherit_environment;
        worker_config.env_vars = config
            .execution
            .env_vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let runner = Arc::new(ProcessRunner::new(ProcessRunnerConfig::new(profile)));
        let resolver = Arc::new(ModuleResolver::discovering(runner));

        Ok(Self::new(
            config.session.clone(),
            worker_config,
            resolver,
        ))
    }

    /// Open an authenticated connection to `endpoint`.
    ///
    /// The session id is returned only after the connect script printed its
    /// success marker; every failure path disposes the worker first.
    pub async fn connect(
        &self,
        endpoint: &str,
        username: &str,
        password: &str,
    ) -> Result<SessionId> {
        let id = SessionId::new();
        info!("Session {} connecting to {}", id, endpoint);

        let kind = self.worker_config.profile.kind;
        let load_script = if kind.supports_vendor_modules() {
            resolver::load_script(self.resolver.plan().await?)
        } else {
            None
        };

        let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let (mut worker, _) = ShellWorker::spawn_prepared(
            worker_id,
            self.worker_config.clone(),
            load_script.as_deref(),
            self.settings.connect_timeout(),
        )
        .await?;

        let request = ExecutionRequest::new(connect_script(kind))
            .with_parameter("Endpoint", json!(endpoint))
            .with_parameter("Username", json!(username))
            .with_parameter("Password", json!(password))
            .with_timeout(self.settings.connect_timeout());

        match worker.execute(&request).await {
            Ok(out) if !out.died && out.output.contains(CONNECT_MARKER) => {
                let session = Arc::new(Session::new(
                    id,
                    endpoint.to_string(),
                    username.to_string(),
                    worker,
                ));
                self.sessions.insert(id, session);
                info!("Session {} connected to {}", id, endpoint);
                Ok(id)
            }
            Ok(out) => {
                worker.kill().await;
                let text = if out.error.trim().is_empty() {
                    "connect script did not report success".to_string()
                } else {
                    out.error
                };
                let kind = ConnectionErrorKind::classify(&text);
                warn!("Session {} connect failed ({}): {}", id, kind, text.trim());
                Err(EngineError::ConnectionFailed {
                    kind,
                    message: format!("{}. {}", text.trim(), kind.recommendation()),
                })
            }
            Err(EngineError::ExecutionTimeout) => {
                // The deadline already killed the worker
                let kind = ConnectionErrorKind::Network;
                Err(EngineError::ConnectionFailed {
                    kind,
                    message: format!(
                        "connect timed out after {:?}. {}",
                        self.settings.connect_timeout(),
                        kind.recommendation()
                    ),
                })
            }
            Err(e) => {
                worker.kill().await;
                Err(e)
            }
        }
    }

    /// Run a command on a connected session. Commands on one session
    /// serialize through its command slot; distinct sessions run in
    /// parallel.
    pub async fn execute(
        &self,
        id: SessionId,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult> {
        let session = self.get(id)?;
        session.execute(request).await
    }

    /// Look up a session by id
    pub fn get(&self, id: SessionId) -> Result<Arc<Session>> {
        self.sessions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))
    }

    /// Summaries of all registered sessions
    pub fn list(&self) -> Vec<SessionSummary> {
        self.sessions
            .iter()
            .map(|entry| entry.value().summary())
            .collect()
    }

    /// Number of registered sessions
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Disconnect a session: best-effort remote logout, unconditional local
    /// teardown and registry removal.
    pub async fn disconnect(&self, id: SessionId) -> Result<()> {
        let (_, session) = self
            .sessions
            .remove(&id)
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))?;

        session.disconnect(self.settings.disconnect_grace()).await;
        info!("Session {} disconnected", id);
        Ok(())
    }

    /// Force-disconnect every open session, bounded per session by the
    /// configured grace period.
    pub async fn shutdown_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        info!("Shutting down {} open sessions", ids.len());

        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.disconnect(self.settings.disconnect_grace()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::interpreter::{InterpreterKind, InterpreterProfile};
    use std::time::Duration;

    fn shell_manager() -> SessionManager {
        let profile = InterpreterProfile::discover(InterpreterKind::PosixShell).unwrap();
        let mut settings = SessionSettings::default();
        settings.connect_timeout_secs = 10;
        settings.disconnect_grace_secs = 2;
        SessionManager::new(
            settings,
            WorkerConfig::new(profile),
            Arc::new(ModuleResolver::with_inventory(vec![])),
        )
    }

    #[tokio::test]
    async fn test_connect_execute_disconnect() {
        let manager = shell_manager();
        let id = manager
            .connect("vcenter.lab.local", "admin", "secret")
            .await
            .unwrap();
        assert_eq!(manager.count(), 1);

        let result = manager
            .execute(id, &ExecutionRequest::new("printf 'session cmd\\n'"))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output.trim(), "session cmd");

        manager.disconnect(id).await.unwrap();
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_never_registers_session() {
        let manager = shell_manager();

        // The POSIX connect handshake rejects an empty endpoint
        let err = manager.connect("", "admin", "secret").await.unwrap_err();
        assert!(matches!(err, EngineError::ConnectionFailed { .. }));
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_session_state_persists_across_commands() {
        let manager = shell_manager();
        let id = manager
            .connect("vcenter.lab.local", "admin", "secret")
            .await
            .unwrap();

        manager
            .execute(id, &ExecutionRequest::new("session_var=99"))
            .await
            .unwrap();
        let result = manager
            .execute(
                id,
                &ExecutionRequest::new("printf '%s\\n' \"$session_var\""),
            )
            .await
            .unwrap();
        assert_eq!(result.output.trim(), "99");

        manager.disconnect(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_with_dead_worker_still_removes_session() {
        let manager = shell_manager();
        let id = manager
            .connect("vcenter.lab.local", "admin", "secret")
            .await
            .unwrap();

        // Kill the session's interpreter from inside; the logout can only fail
        let result = manager
            .execute(id, &ExecutionRequest::new("exit 0"))
            .await
            .unwrap();
        assert!(!result.success);

        // Disconnect must still remove the session and release resources
        manager.disconnect(id).await.unwrap();
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_session_is_an_error() {
        let manager = shell_manager();
        let err = manager
            .execute(SessionId::new(), &ExecutionRequest::new("printf 'x'"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_distinct_sessions_run_in_parallel() {
        let manager = Arc::new(shell_manager());
        let a = manager.connect("vc-a", "admin", "s").await.unwrap();
        let b = manager.connect("vc-b", "admin", "s").await.unwrap();

        let started = std::time::Instant::now();
        let req_a = ExecutionRequest::new("sleep 0.3; printf 'a\\n'");
        let req_b = ExecutionRequest::new("sleep 0.3; printf 'b\\n'");
        let (ra, rb) = tokio::join!(
            manager.execute(a, &req_a),
            manager.execute(b, &req_b),
        );
        assert!(ra.unwrap().success);
        assert!(rb.unwrap().success);

        // Two 300ms commands overlapped rather than serializing
        assert!(started.elapsed() < Duration::from_millis(550));

        manager.shutdown_all().await;
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_commands_on_one_session_serialize() {
        let manager = Arc::new(shell_manager());
        let id = manager.connect("vc", "admin", "s").await.unwrap();

        let started = std::time::Instant::now();
        let req = ExecutionRequest::new("sleep 0.2");
        let (ra, rb) = tokio::join!(
            manager.execute(id, &req),
            manager.execute(id, &req),
        );
        assert!(ra.unwrap().success);
        assert!(rb.unwrap().success);
        assert!(started.elapsed() >= Duration::from_millis(400));

        manager.disconnect(id).await.unwrap();
    }
}
