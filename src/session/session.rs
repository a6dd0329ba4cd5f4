// src/session/session.rs
//! A persistent authenticated connection to one management endpoint
//!
//! Each session owns exactly one interpreter worker in which the vendor
//! connect command was run; every command on the session reuses that worker.
//! The worker sits behind a single command slot (`tokio::Mutex`), so
//! concurrent commands against one session serialize by construction.

use crate::execution::interpreter::InterpreterKind;
use crate::execution::types::{ExecutionRequest, ExecutionResult, FailureKind};
use crate::execution::worker::ShellWorker;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use ulid::Ulid;

/// Marker the connect script prints when the endpoint accepted the login
pub const CONNECT_MARKER: &str = "VIRTOPS_CONNECTED";

/// Unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Ulid);

impl SessionId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read-only session summary for registries and surfaces
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub endpoint: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub connected: bool,
}

/// One authenticated connection, bound to one interpreter worker
pub struct Session {
    id: SessionId,
    endpoint: String,
    username: String,
    created_at: DateTime<Utc>,
    last_activity: parking_lot::Mutex<DateTime<Utc>>,
    connected: AtomicBool,

    /// The single command slot: at most one command runs at a time
    worker: Mutex<ShellWorker>,
}

impl Session {
    /// Wrap a worker that has just completed the connect handshake
    pub(crate) fn new(
        id: SessionId,
        endpoint: String,
        username: String,
        worker: ShellWorker,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            endpoint,
            username,
            created_at: now,
            last_activity: parking_lot::Mutex::new(now),
            connected: AtomicBool::new(true),
            worker: Mutex::new(worker),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Summary snapshot for listings
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            endpoint: self.endpoint.clone(),
            username: self.username.clone(),
            created_at: self.created_at,
            last_activity: *self.last_activity.lock(),
            connected: self.is_connected(),
        }
    }

    /// Run a command on this session's worker.
    ///
    /// Deadlines and worker death drop the session to disconnected: the
    /// interpreter that held the authenticated connection is gone.
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        if !self.is_connected() {
            return Err(EngineError::SessionNotFound(format!(
                "session {} is no longer connected",
                self.id
            )));
        }

        let started = Instant::now();
        let mut worker = self.worker.lock().await;

        let result = match worker.execute(request).await {
            Ok(output) if output.died => {
                self.connected.store(false, Ordering::SeqCst);
                let error = if output.error.trim().is_empty() {
                    "session interpreter exited while running the command".to_string()
                } else {
                    output.error
                };
                Ok(ExecutionResult::failed(
                    FailureKind::Script,
                    output.output,
                    error,
                    started.elapsed(),
                ))
            }
            Ok(output) => {
                let elapsed = started.elapsed();
                if output.error.trim().is_empty() {
                    let objects = if request.capture_objects {
                        crate::execution::types::parse_objects(&output.output)
                    } else {
                        Vec::new()
                    };
                    Ok(ExecutionResult::succeeded(output.output, objects, elapsed))
                } else {
                    Ok(ExecutionResult::failed(
                        FailureKind::Script,
                        output.output,
                        output.error,
                        elapsed,
                    ))
                }
            }
            Err(EngineError::ExecutionTimeout) => {
                self.connected.store(false, Ordering::SeqCst);
                Ok(ExecutionResult::failure_message(
                    FailureKind::Timeout,
                    format!("session command timed out after {:?}", request.timeout),
                    started.elapsed(),
                ))
            }
            Err(EngineError::ExecutionCancelled) => {
                self.connected.store(false, Ordering::SeqCst);
                Ok(ExecutionResult::failure_message(
                    FailureKind::Cancelled,
                    "session command cancelled by caller",
                    started.elapsed(),
                ))
            }
            Err(e) => Err(e),
        };

        *self.last_activity.lock() = Utc::now();
        result
    }

    /// Best-effort remote logout, then unconditional local teardown.
    ///
    /// A failing logout is logged, never propagated; the worker is always
    /// shut down.
    pub async fn disconnect(&self, grace: Duration) {
        let mut worker = self.worker.lock().await;

        if self.connected.swap(false, Ordering::SeqCst) {
            let logout = logout_script(worker.kind());
            match worker.execute_raw(logout, grace).await {
                Ok(out) if !out.error.trim().is_empty() => {
                    warn!(
                        "Session {} logout reported errors: {}",
                        self.id,
                        out.error.trim()
                    );
                }
                Ok(_) => debug!("Session {} logged out", self.id),
                Err(e) => warn!("Session {} logout failed: {}", self.id, e),
            }
        }

        worker.shutdown().await;
    }
}

/// Script that opens the authenticated connection.
///
/// The marker line only prints after the vendor connect command succeeded,
/// followed by a JSON summary of the established connection. The POSIX
/// variant performs the same handshake shape without a remote toolkit so
/// the pipeline stays exercisable on hosts without PowerShell.
pub fn connect_script(kind: InterpreterKind) -> &'static str {
    match kind {
        InterpreterKind::PowerShellCore | InterpreterKind::WindowsPowerShell => {
            "$ErrorActionPreference = 'Stop'\n\
             $__conn = Connect-VIServer -Server $Endpoint -User $Username -Password $Password\n\
             Write-Output 'VIRTOPS_CONNECTED'\n\
             @{ Name = $__conn.Name; Port = $__conn.Port; User = $__conn.User } | ConvertTo-Json -Compress"
        }
        InterpreterKind::PosixShell => {
            "[ -n \"$Endpoint\" ] || { printf 'no endpoint configured\\n' 1>&2; exit 1; }\n\
             printf '%s\\n' 'VIRTOPS_CONNECTED'\n\
             printf '{\"Name\": \"%s\", \"User\": \"%s\"}\\n' \"$Endpoint\" \"$Username\""
        }
    }
}

/// Script that closes the remote connection
pub fn logout_script(kind: InterpreterKind) -> &'static str {
    match kind {
        InterpreterKind::PowerShellCore | InterpreterKind::WindowsPowerShell => {
            "Disconnect-VIServer -Server * -Confirm:$false -ErrorAction SilentlyContinue"
        }
        InterpreterKind::PosixShell => ":",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_connect_script_gates_marker_on_success() {
        let script = connect_script(InterpreterKind::PowerShellCore);
        let marker_pos = script.find(CONNECT_MARKER).unwrap();
        let connect_pos = script.find("Connect-VIServer").unwrap();
        assert!(connect_pos < marker_pos);
        assert!(script.contains("$ErrorActionPreference = 'Stop'"));
    }

    #[test]
    fn test_logout_script_never_prompts() {
        let script = logout_script(InterpreterKind::PowerShellCore);
        assert!(script.contains("-Confirm:$false"));
    }
}
