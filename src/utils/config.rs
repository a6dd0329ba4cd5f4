// src/utils/config.rs
//! Engine configuration
//!
//! Layered loading: built-in defaults, then an optional `virtops.toml` file,
//! then environment variables prefixed `VIRTOPS_` (double underscore as the
//! section separator, e.g. `VIRTOPS_POOL__CAPACITY=8`).

use crate::execution::gateway::ExecutionMode;
use crate::execution::interpreter::InterpreterKind;
use crate::utils::errors::Result;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Gateway and backend settings
    pub execution: ExecutionSettings,

    /// Interpreter pool settings
    pub pool: PoolSettings,

    /// Session manager settings
    pub session: SessionSettings,

    /// Vendor module settings
    pub modules: ModuleSettings,

    /// Diagnostics settings
    pub diagnostics: DiagnosticsSettings,
}

/// Gateway and backend settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Backend selection mode
    pub mode: ExecutionMode,

    /// Default per-call timeout in seconds
    pub default_timeout_secs: u64,

    /// Whether spawned interpreters inherit the host environment
    pub inherit_environment: bool,

    /// Extra environment variables passed to every interpreter process
    pub env_vars: BTreeMap<String, String>,

    /// Which interpreter flavor to run
    pub interpreter: InterpreterKind,

    /// Explicit interpreter executable path, overriding PATH discovery
    pub interpreter_path: Option<String>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            default_timeout_secs: 300,
            inherit_environment: true,
            env_vars: BTreeMap::new(),
            interpreter: InterpreterKind::PowerShellCore,
            interpreter_path: None,
        }
    }
}

/// Interpreter pool settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Number of persistent interpreter workers
    pub capacity: usize,

    /// Run a smoke-test command on each worker during initialization
    pub smoke_test: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity: 5,
            smoke_test: true,
        }
    }
}

/// Session manager settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Timeout for the connect script in seconds
    pub connect_timeout_secs: u64,

    /// Default timeout for commands on a session in seconds
    pub command_timeout_secs: u64,

    /// Grace period per session during forced shutdown in seconds
    pub disconnect_grace_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 60,
            command_timeout_secs: 300,
            disconnect_grace_secs: 10,
        }
    }
}

/// Vendor module settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModuleSettings {
    /// Pin the vendor toolkit to one installed version instead of the latest
    pub pinned_version: Option<String>,
}

/// Diagnostics settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiagnosticsSettings {
    /// Management endpoint checked by the network probe
    pub endpoint: Option<String>,

    /// Per-probe timeout in seconds
    pub probe_timeout_secs: u64,
}

impl Default for DiagnosticsSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            probe_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, optional file, and environment
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name("virtops").required(false))
            .add_source(Environment::with_prefix("VIRTOPS").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Default per-call timeout as a `Duration`
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.execution.default_timeout_secs)
    }
}

impl SessionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }
}
