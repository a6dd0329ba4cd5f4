// src/execution/interpreter.rs
//! Interpreter flavors and executable discovery
//!
//! Supported interpreter kinds:
//! - PowerShell Core (pwsh): the primary host for the vendor automation modules
//! - Windows PowerShell (powershell): legacy 5.1 host
//! - POSIX shell (sh): minimal host for exercising the execution pipeline
//!   on machines without PowerShell

use crate::utils::errors::{EngineError, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;

/// Supported interpreter kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterpreterKind {
    PowerShellCore,
    WindowsPowerShell,
    PosixShell,
}

impl InterpreterKind {
    /// Get the executable name for this interpreter kind
    pub fn command(&self) -> &'static str {
        match self {
            InterpreterKind::PowerShellCore => "pwsh",
            InterpreterKind::WindowsPowerShell => "powershell",
            InterpreterKind::PosixShell => "sh",
        }
    }

    /// Whether this kind hosts the vendor automation modules
    pub fn supports_vendor_modules(&self) -> bool {
        !matches!(self, InterpreterKind::PosixShell)
    }

    /// Get the script file extension for this interpreter kind
    pub fn extension(&self) -> &'static str {
        match self {
            InterpreterKind::PowerShellCore | InterpreterKind::WindowsPowerShell => "ps1",
            InterpreterKind::PosixShell => "sh",
        }
    }

    /// Arguments for one-shot, non-interactive execution of a script file.
    ///
    /// PowerShell gets restriction bypass on the command line so a
    /// restrictive host policy cannot block the run.
    pub fn script_args(&self, script_path: &Path) -> Vec<String> {
        match self {
            InterpreterKind::PowerShellCore | InterpreterKind::WindowsPowerShell => vec![
                "-NoProfile".into(),
                "-NonInteractive".into(),
                "-ExecutionPolicy".into(),
                "Bypass".into(),
                "-File".into(),
                script_path.display().to_string(),
            ],
            InterpreterKind::PosixShell => vec![script_path.display().to_string()],
        }
    }

    /// Arguments for a persistent worker reading commands from stdin.
    ///
    /// PowerShell must NOT get `-Command -` here: that form buffers stdin to
    /// EOF before executing anything. With piped stdin and no command
    /// argument the host executes statements as they arrive.
    pub fn repl_args(&self) -> Vec<&'static str> {
        match self {
            InterpreterKind::PowerShellCore | InterpreterKind::WindowsPowerShell => {
                vec!["-NoProfile", "-NonInteractive"]
            }
            InterpreterKind::PosixShell => vec!["-s"],
        }
    }

    /// Command that raises the execution restriction ceiling for the current
    /// process only, the most permissive setting obtainable without
    /// elevation. `None` when the interpreter has no such concept.
    pub fn policy_bypass_command(&self) -> Option<&'static str> {
        match self {
            InterpreterKind::PowerShellCore | InterpreterKind::WindowsPowerShell => {
                Some("Set-ExecutionPolicy -ExecutionPolicy Bypass -Scope Process -Force")
            }
            InterpreterKind::PosixShell => None,
        }
    }

    /// Render a named-parameter assignment placed ahead of the script body
    pub fn render_assignment(&self, name: &str, value: &Value) -> String {
        match self {
            InterpreterKind::PowerShellCore | InterpreterKind::WindowsPowerShell => match value {
                Value::Null => format!("${} = $null", name),
                Value::Bool(true) => format!("${} = $true", name),
                Value::Bool(false) => format!("${} = $false", name),
                Value::Number(n) => format!("${} = {}", name, n),
                Value::String(s) => format!("${} = '{}'", name, escape_powershell(s)),
                other => format!(
                    "${} = ConvertFrom-Json '{}'",
                    name,
                    escape_powershell(&other.to_string())
                ),
            },
            InterpreterKind::PosixShell => {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                format!("{}='{}'", name, escape_posix(&text))
            }
        }
    }

    /// Command that writes `marker` as its own line on stdout
    pub fn stdout_marker(&self, marker: &str) -> String {
        match self {
            InterpreterKind::PowerShellCore | InterpreterKind::WindowsPowerShell => {
                format!("Write-Output '{}'", escape_powershell(marker))
            }
            InterpreterKind::PosixShell => format!("printf '%s\\n' '{}'", escape_posix(marker)),
        }
    }

    /// Command that writes `marker` as its own line on stderr
    pub fn stderr_marker(&self, marker: &str) -> String {
        match self {
            InterpreterKind::PowerShellCore | InterpreterKind::WindowsPowerShell => {
                format!("[Console]::Error.WriteLine('{}')", escape_powershell(marker))
            }
            InterpreterKind::PosixShell => {
                format!("printf '%s\\n' '{}' 1>&2", escape_posix(marker))
            }
        }
    }
}

fn escape_powershell(text: &str) -> String {
    text.replace('\'', "''")
}

fn escape_posix(text: &str) -> String {
    text.replace('\'', "'\\''")
}

/// A resolved interpreter: kind plus the executable to launch
#[derive(Debug, Clone)]
pub struct InterpreterProfile {
    /// Interpreter flavor
    pub kind: InterpreterKind,

    /// Absolute path to the executable
    pub program: PathBuf,
}

impl InterpreterProfile {
    /// Locate the interpreter executable on PATH
    pub fn discover(kind: InterpreterKind) -> Result<Self> {
        let command = kind.command();

        match which::which(command) {
            Ok(path) => {
                info!("Found {} at {:?}", command, path);
                Ok(Self {
                    kind,
                    program: path,
                })
            }
            Err(e) => Err(EngineError::ProcessSpawnFailed(format!(
                "Executable '{}' not found in PATH: {}",
                command, e
            ))),
        }
    }

    /// Use an explicit executable path instead of PATH discovery
    pub fn with_program(kind: InterpreterKind, program: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            program: program.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_interpreter_commands() {
        assert_eq!(InterpreterKind::PowerShellCore.command(), "pwsh");
        assert_eq!(InterpreterKind::WindowsPowerShell.command(), "powershell");
        assert_eq!(InterpreterKind::PosixShell.command(), "sh");
    }

    #[test]
    fn test_extensions() {
        assert_eq!(InterpreterKind::PowerShellCore.extension(), "ps1");
        assert_eq!(InterpreterKind::PosixShell.extension(), "sh");
    }

    #[test]
    fn test_script_args_bypass_restrictions() {
        let args =
            InterpreterKind::PowerShellCore.script_args(Path::new("/tmp/check.ps1"));
        assert!(args.contains(&"-ExecutionPolicy".to_string()));
        assert!(args.contains(&"Bypass".to_string()));
        assert!(args.contains(&"-NonInteractive".to_string()));
    }

    #[test]
    fn test_render_assignment_powershell() {
        let kind = InterpreterKind::PowerShellCore;
        assert_eq!(
            kind.render_assignment("Name", &json!("esx-01")),
            "$Name = 'esx-01'"
        );
        assert_eq!(kind.render_assignment("Count", &json!(3)), "$Count = 3");
        assert_eq!(kind.render_assignment("Dry", &json!(true)), "$Dry = $true");
        assert_eq!(
            kind.render_assignment("Note", &json!("it's")),
            "$Note = 'it''s'"
        );
    }

    #[test]
    fn test_render_assignment_posix() {
        let kind = InterpreterKind::PosixShell;
        assert_eq!(kind.render_assignment("name", &json!("host")), "name='host'");
        assert_eq!(kind.render_assignment("count", &json!(3)), "count='3'");
    }

    #[test]
    fn test_marker_rendering() {
        let marker = "__DONE__";
        let out = InterpreterKind::PosixShell.stdout_marker(marker);
        assert!(out.contains(marker));
        let err = InterpreterKind::PowerShellCore.stderr_marker(marker);
        assert!(err.contains("Error.WriteLine"));
    }

    #[test]
    fn test_discover_posix_shell() {
        // sh is present on any unix host this crate targets
        let profile = InterpreterProfile::discover(InterpreterKind::PosixShell).unwrap();
        assert!(profile.program.is_absolute());
    }
}
