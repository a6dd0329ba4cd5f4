// src/utils/errors.rs
//! Engine error types
//!
//! All fallible engine operations return [`Result`]. Expected failure modes
//! (script errors, timeouts, missing modules) are modelled as values on
//! `ExecutionResult`; `EngineError` covers mechanism-level faults only.

use thiserror::Error;

/// Result type used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine error variants
#[derive(Debug, Error)]
pub enum EngineError {
    /// The interpreter executable could not be found or launched
    #[error("failed to spawn interpreter process: {0}")]
    ProcessSpawnFailed(String),

    /// An operation exceeded its allotted time
    #[error("execution timed out")]
    ExecutionTimeout,

    /// The caller cancelled the operation
    #[error("execution cancelled")]
    ExecutionCancelled,

    /// The interpreter pool failed to initialize and is permanently down
    #[error("interpreter pool unavailable: {0}")]
    PoolUnavailable(String),

    /// No pool slot could be leased
    #[error("interpreter pool exhausted")]
    PoolExhausted,

    /// The module resolver could not produce a viable load plan
    #[error("module resolution failed: {0}")]
    ModuleResolution(String),

    /// No session with the given id is registered
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Connecting to the remote management endpoint failed
    #[error("connection failed ({kind}): {message}")]
    ConnectionFailed {
        kind: ConnectionErrorKind,
        message: String,
    },

    /// Catch-all for unexpected runtime faults
    #[error("runtime error: {0}")]
    RuntimeError(String),

    /// I/O error (temp files, pipes)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl EngineError {
    /// Whether this error means the backend mechanism itself could not run,
    /// as opposed to the script failing or the call being cut short.
    pub fn is_mechanism_failure(&self) -> bool {
        !matches!(
            self,
            EngineError::ExecutionTimeout | EngineError::ExecutionCancelled
        )
    }
}

/// Best-effort classification of a connect failure, for actionable messaging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Rejected credentials or insufficient privileges
    Authentication,
    /// Certificate validation problems (untrusted, expired, name mismatch)
    Certificate,
    /// The endpoint could not be reached at all
    Network,
    /// Anything we could not classify
    Unknown,
}

impl ConnectionErrorKind {
    /// Classify raw interpreter error text.
    ///
    /// Certificate markers are checked before network markers because TLS
    /// failures frequently mention the connection as well.
    pub fn classify(error_text: &str) -> Self {
        let text = error_text.to_lowercase();

        if text.contains("incorrect user")
            || text.contains("invalid credential")
            || text.contains("authenticat")
            || text.contains("authoriz")
            || text.contains("login")
            || text.contains("password")
        {
            ConnectionErrorKind::Authentication
        } else if text.contains("certificate")
            || text.contains("x509")
            || text.contains("ssl")
            || text.contains("tls")
            || text.contains("trust")
        {
            ConnectionErrorKind::Certificate
        } else if text.contains("timed out")
            || text.contains("timeout")
            || text.contains("refused")
            || text.contains("unreachable")
            || text.contains("could not resolve")
            || text.contains("no such host")
            || text.contains("proxy")
            || text.contains("network")
        {
            ConnectionErrorKind::Network
        } else {
            ConnectionErrorKind::Unknown
        }
    }

    /// Remediation hint rendered alongside the classified message
    pub fn recommendation(&self) -> &'static str {
        match self {
            ConnectionErrorKind::Authentication => {
                "Verify the username and password, and that the account is not locked out"
            }
            ConnectionErrorKind::Certificate => {
                "Install the endpoint's CA certificate or relax the certificate policy"
            }
            ConnectionErrorKind::Network => {
                "Check the endpoint address, DNS resolution, firewall rules and proxy settings"
            }
            ConnectionErrorKind::Unknown => "Inspect the full error text in the logs",
        }
    }
}

impl std::fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionErrorKind::Authentication => "authentication",
            ConnectionErrorKind::Certificate => "certificate",
            ConnectionErrorKind::Network => "network",
            ConnectionErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_authentication() {
        let kind = ConnectionErrorKind::classify(
            "Cannot complete login due to an incorrect user name or password.",
        );
        assert_eq!(kind, ConnectionErrorKind::Authentication);
    }

    #[test]
    fn test_classify_certificate() {
        let kind = ConnectionErrorKind::classify(
            "The SSL connection could not be established: untrusted certificate chain",
        );
        assert_eq!(kind, ConnectionErrorKind::Certificate);
    }

    #[test]
    fn test_classify_network() {
        let kind = ConnectionErrorKind::classify("No connection: operation timed out");
        assert_eq!(kind, ConnectionErrorKind::Network);
    }

    #[test]
    fn test_classify_unknown() {
        let kind = ConnectionErrorKind::classify("object reference not set");
        assert_eq!(kind, ConnectionErrorKind::Unknown);
    }

    #[test]
    fn test_mechanism_failure_taxonomy() {
        assert!(EngineError::ProcessSpawnFailed("pwsh missing".into()).is_mechanism_failure());
        assert!(EngineError::PoolUnavailable("init failed".into()).is_mechanism_failure());
        assert!(!EngineError::ExecutionTimeout.is_mechanism_failure());
        assert!(!EngineError::ExecutionCancelled.is_mechanism_failure());
    }
}
