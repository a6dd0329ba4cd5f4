// src/execution/types.rs
//! Execution request and result types
//!
//! An [`ExecutionRequest`] is created per call and discarded after use. An
//! [`ExecutionResult`] is the single outcome shape every backend produces:
//! backends never let interpreter exceptions escape to callers.

use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Classification of a failed execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The backend itself could not run (spawn error, pool unavailable)
    Mechanism,

    /// The backend ran correctly but the script reported an error
    Script,

    /// The call exceeded its effective deadline
    Timeout,

    /// The caller cancelled the call
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FailureKind::Mechanism => "mechanism failure",
            FailureKind::Script => "script failure",
            FailureKind::Timeout => "timed out",
            FailureKind::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

/// One script execution request
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Script text to run
    pub script: String,

    /// Named parameters rendered as assignments ahead of the script body
    pub parameters: BTreeMap<String, Value>,

    /// Per-call timeout
    pub timeout: Duration,

    /// Caller-initiated cancellation signal
    pub cancellation: CancellationToken,

    /// Parse stdout as JSON into `ExecutionResult::objects`
    pub capture_objects: bool,
}

impl ExecutionRequest {
    /// Create a request with the default five-minute timeout
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            parameters: BTreeMap::new(),
            timeout: Duration::from_secs(300),
            cancellation: CancellationToken::new(),
            capture_objects: false,
        }
    }

    /// Add a named parameter
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Set the per-call timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attach a caller cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Request JSON parsing of stdout into returned objects
    pub fn with_captured_objects(mut self) -> Self {
        self.capture_objects = true;
        self
    }
}

/// Outcome of a field lookup on a returned object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldAccessError {
    /// No object at that index, or the object has no such field
    Absent { field: String },

    /// The field exists but holds a different JSON type
    WrongType { field: String, expected: &'static str },
}

impl std::fmt::Display for FieldAccessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldAccessError::Absent { field } => write!(f, "field '{}' is absent", field),
            FieldAccessError::WrongType { field, expected } => {
                write!(f, "field '{}' is not a {}", field, expected)
            }
        }
    }
}

impl std::error::Error for FieldAccessError {}

/// Outcome of one script execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// True only when the backend ran and the script reported no errors
    pub success: bool,

    /// Captured standard output
    pub output: String,

    /// Captured error and warning text; empty when `success` is true
    pub error: String,

    /// Wall-clock time spent on the call; always populated, always nonzero
    pub execution_time: Duration,

    /// Objects parsed from stdout when the request asked for them
    pub objects: Vec<Value>,

    /// Failure classification; `None` exactly when `success` is true
    pub failure: Option<FailureKind>,
}

impl ExecutionResult {
    /// Build a successful result
    pub fn succeeded(output: String, objects: Vec<Value>, elapsed: Duration) -> Self {
        Self {
            success: true,
            output,
            error: String::new(),
            execution_time: clamp_elapsed(elapsed),
            objects,
            failure: None,
        }
    }

    /// Build a failed result with classification and captured streams
    pub fn failed(kind: FailureKind, output: String, error: String, elapsed: Duration) -> Self {
        Self {
            success: false,
            output,
            error,
            execution_time: clamp_elapsed(elapsed),
            objects: Vec::new(),
            failure: Some(kind),
        }
    }

    /// Shorthand for a failure with no captured output
    pub fn failure_message(kind: FailureKind, error: impl Into<String>, elapsed: Duration) -> Self {
        Self::failed(kind, String::new(), error.into(), elapsed)
    }

    /// Whether this failure was the backend mechanism rather than the script
    pub fn is_mechanism_failure(&self) -> bool {
        self.failure == Some(FailureKind::Mechanism)
    }

    /// Look up a raw field on the object at `index`
    pub fn object_field(&self, index: usize, field: &str) -> Result<&Value, FieldAccessError> {
        self.objects
            .get(index)
            .and_then(|obj| obj.get(field))
            .ok_or_else(|| FieldAccessError::Absent {
                field: field.to_string(),
            })
    }

    /// String field on the object at `index`
    pub fn field_str(&self, index: usize, field: &str) -> Result<&str, FieldAccessError> {
        let value = self.object_field(index, field)?;
        value.as_str().ok_or(FieldAccessError::WrongType {
            field: field.to_string(),
            expected: "string",
        })
    }

    /// Unsigned integer field on the object at `index`
    pub fn field_u64(&self, index: usize, field: &str) -> Result<u64, FieldAccessError> {
        let value = self.object_field(index, field)?;
        value.as_u64().ok_or(FieldAccessError::WrongType {
            field: field.to_string(),
            expected: "unsigned integer",
        })
    }

    /// Boolean field on the object at `index`
    pub fn field_bool(&self, index: usize, field: &str) -> Result<bool, FieldAccessError> {
        let value = self.object_field(index, field)?;
        value.as_bool().ok_or(FieldAccessError::WrongType {
            field: field.to_string(),
            expected: "boolean",
        })
    }
}

/// Parse captured stdout into returned objects.
///
/// A top-level JSON array yields one object per element; a single JSON value
/// yields one object; anything unparseable yields none (scripts are not
/// required to emit JSON).
pub fn parse_objects(stdout: &str) -> Vec<Value> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Array(items)) => items,
        Ok(value) => vec![value],
        Err(_) => Vec::new(),
    }
}

// Coarse clocks can report zero for sub-tick calls; elapsed time is part of
// the result contract and must stay nonzero.
fn clamp_elapsed(elapsed: Duration) -> Duration {
    elapsed.max(Duration::from_nanos(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_invariant() {
        let result =
            ExecutionResult::succeeded("ok".into(), vec![], Duration::from_millis(5));
        assert!(result.success);
        assert!(result.error.is_empty());
        assert!(result.failure.is_none());
    }

    #[test]
    fn test_elapsed_always_nonzero() {
        let result = ExecutionResult::failure_message(
            FailureKind::Mechanism,
            "spawn failed",
            Duration::ZERO,
        );
        assert!(result.execution_time > Duration::ZERO);
    }

    #[test]
    fn test_parse_objects_array_and_scalar() {
        assert_eq!(parse_objects("[1, 2]").len(), 2);
        assert_eq!(parse_objects("{\"a\": 1}").len(), 1);
        assert_eq!(parse_objects("plain text").len(), 0);
        assert_eq!(parse_objects("").len(), 0);
    }

    #[test]
    fn test_typed_field_access() {
        let mut result =
            ExecutionResult::succeeded(String::new(), vec![], Duration::from_millis(1));
        result.objects = vec![json!({"Name": "esx01", "Count": 3, "Connected": true})];

        assert_eq!(result.field_str(0, "Name").unwrap(), "esx01");
        assert_eq!(result.field_u64(0, "Count").unwrap(), 3);
        assert!(result.field_bool(0, "Connected").unwrap());

        assert_eq!(
            result.field_str(0, "Missing"),
            Err(FieldAccessError::Absent {
                field: "Missing".into()
            })
        );
        assert_eq!(
            result.field_str(0, "Count"),
            Err(FieldAccessError::WrongType {
                field: "Count".into(),
                expected: "string"
            })
        );
    }

    #[test]
    fn test_request_builder() {
        let request = ExecutionRequest::new("Get-VMHost")
            .with_parameter("Name", "esx01")
            .with_timeout(Duration::from_secs(30))
            .with_captured_objects();

        assert_eq!(request.parameters.len(), 1);
        assert_eq!(request.timeout, Duration::from_secs(30));
        assert!(request.capture_objects);
    }
}
