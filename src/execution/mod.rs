// src/execution/mod.rs
//! Script execution subsystem
//!
//! Two interchangeable backends behind one gateway:
//!
//! - **Process Runner**: one isolated interpreter process per call
//! - **Interpreter Pool**: bounded pool of persistent, module-loaded workers
//! - **Gateway**: backend selection, fallback, timeout/cancellation handling
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  ExecutionGateway                    │
//! │      mode selection · fallback · normalization       │
//! │        ┌──────────────┴───────────────┐              │
//! │        ▼                              ▼              │
//! │  ProcessRunner                    ShellPool (N)      │
//! │  temp script file             ┌────────┐ ┌────────┐  │
//! │  spawn / kill tree            │ Worker │ │ Worker │  │
//! │  per-call isolation           └────────┘ └────────┘  │
//! │                               persistent, module-    │
//! │                               loaded interpreters    │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod gateway;
pub mod interpreter;
pub mod pool;
pub mod process_runner;
pub mod types;
pub mod worker;

// Re-export commonly used types
pub use gateway::{ExecutionGateway, ExecutionMode};
pub use interpreter::{InterpreterKind, InterpreterProfile};
pub use pool::{PoolConfig, PoolStats, ShellPool};
pub use process_runner::{ProcessRunner, ProcessRunnerConfig};
pub use types::{ExecutionRequest, ExecutionResult, FailureKind, FieldAccessError};
pub use worker::{ShellWorker, WorkerConfig, WorkerOutput};
