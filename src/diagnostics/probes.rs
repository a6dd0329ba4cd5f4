// src/diagnostics/probes.rs
//! Environment probes
//!
//! Six independent probes: execution-policy restrictiveness across scopes,
//! mandatory module presence, conflicting-version detection, interpreter
//! version/edition, a live smoke test, and network/proxy visibility of the
//! configured endpoint. Probes catch their own failures into issues; one
//! probe failing never blocks the others.

use crate::diagnostics::report::{
    Category, DiagnosticIssue, DiagnosticReport, Severity,
};
use crate::diagnostics::ScriptRunner;
use crate::execution::interpreter::InterpreterKind;
use crate::modules::resolver::{self, InstalledModule};
use crate::utils::config::DiagnosticsSettings;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

const SMOKE_MARKER: &str = "VIRTOPS_DIAG_SMOKE";

/// Scope precedence for the effective execution policy, strongest first
const POLICY_SCOPE_PRECEDENCE: &[&str] = &[
    "MachinePolicy",
    "UserPolicy",
    "Process",
    "CurrentUser",
    "LocalMachine",
];

/// Policies that block script execution
const RESTRICTIVE_POLICIES: &[&str] = &["Restricted", "AllSigned", "Default"];

const POLICY_PROBE_SCRIPT: &str = "Get-ExecutionPolicy -List | ForEach-Object { \
     @{ Scope = $_.Scope.ToString(); Policy = $_.ExecutionPolicy.ToString() } } | \
     ConvertTo-Json";

const POLICY_FIX_SCRIPT: &str =
    "Set-ExecutionPolicy -ExecutionPolicy RemoteSigned -Scope CurrentUser -Force";

const VERSION_PROBE_SCRIPT: &str = "@{ Version = $PSVersionTable.PSVersion.ToString(); \
     Edition = $PSVersionTable.PSEdition } | ConvertTo-Json";

const MODULE_INSTALL_SCRIPT: &str =
    "Install-Module -Name VMware.PowerCLI -Scope CurrentUser -Force -AllowClobber";

/// Output of one probe: findings plus optional free-form detail
struct ProbeOutput {
    issues: Vec<DiagnosticIssue>,
    detail: Option<String>,
}

impl ProbeOutput {
    fn clean(detail: impl Into<String>) -> Self {
        Self {
            issues: vec![],
            detail: Some(detail.into()),
        }
    }

    fn issue(issue: DiagnosticIssue) -> Self {
        Self {
            issues: vec![issue],
            detail: None,
        }
    }
}

/// Runs probes against a script runner and aggregates a report
pub struct DiagnosticsEngine<R> {
    pub(super) runner: R,
    pub(super) settings: DiagnosticsSettings,
    pub(super) interpreter: InterpreterKind,
}

impl<R: ScriptRunner> DiagnosticsEngine<R> {
    pub fn new(runner: R, settings: DiagnosticsSettings, interpreter: InterpreterKind) -> Self {
        Self {
            runner,
            settings,
            interpreter,
        }
    }

    pub(super) fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.probe_timeout_secs)
    }

    /// Run every probe and aggregate the report
    pub async fn run(&self) -> DiagnosticReport {
        let (policy, modules, interpreter, smoke, network) = tokio::join!(
            self.probe_execution_policy(),
            self.probe_modules(),
            self.probe_interpreter(),
            self.probe_smoke_test(),
            self.probe_network(),
        );

        let mut issues = Vec::new();
        let mut details = HashMap::new();

        for (category, output) in [
            (Category::ExecutionPolicy, policy),
            (Category::Modules, modules),
            (Category::Interpreter, interpreter),
            (Category::SmokeTest, smoke),
            (Category::Network, network),
        ] {
            issues.extend(output.issues);
            if let Some(detail) = output.detail {
                details.insert(category, detail);
            }
        }

        DiagnosticReport::new(issues, details)
    }

    async fn probe_execution_policy(&self) -> ProbeOutput {
        if !self.interpreter.supports_vendor_modules() {
            return ProbeOutput::clean("execution policy not applicable to this interpreter");
        }

        let result = self
            .runner
            .run_script(POLICY_PROBE_SCRIPT, self.probe_timeout())
            .await;

        if !result.success {
            return ProbeOutput::issue(DiagnosticIssue::manual(
                Severity::Medium,
                Category::ExecutionPolicy,
                format!("execution policy probe failed: {}", result.error.trim()),
                "Run Get-ExecutionPolicy -List manually to inspect the policy",
            ));
        }

        let scopes = parse_policy_objects(&result.objects);
        let detail = scopes
            .iter()
            .map(|(scope, policy)| format!("{}: {}", scope, policy))
            .collect::<Vec<_>>()
            .join(", ");

        match evaluate_policy(&scopes) {
            Some(issue) => {
                debug!("Execution policy probe found: {}", issue.description);
                ProbeOutput {
                    issues: vec![issue],
                    detail: Some(detail),
                }
            }
            None => ProbeOutput {
                issues: vec![],
                detail: Some(detail),
            },
        }
    }

    async fn probe_modules(&self) -> ProbeOutput {
        if !self.interpreter.supports_vendor_modules() {
            return ProbeOutput::clean("vendor modules require a PowerShell host");
        }

        let result = self
            .runner
            .run_script(resolver::inventory_script(), self.probe_timeout())
            .await;

        if !result.success {
            return ProbeOutput::issue(DiagnosticIssue::manual(
                Severity::Medium,
                Category::Modules,
                format!("module inventory probe failed: {}", result.error.trim()),
                "Run Get-Module -ListAvailable manually to inspect the install",
            ));
        }

        let inventory = resolver::parse_inventory(&result.objects);
        module_issues(&inventory)
    }

    async fn probe_interpreter(&self) -> ProbeOutput {
        if !self.interpreter.supports_vendor_modules() {
            return ProbeOutput::clean(format!(
                "{} host; vendor toolkit requires PowerShell",
                self.interpreter.command()
            ));
        }

        let result = self
            .runner
            .run_script(VERSION_PROBE_SCRIPT, self.probe_timeout())
            .await;

        if !result.success {
            return ProbeOutput::issue(DiagnosticIssue::manual(
                Severity::Medium,
                Category::Interpreter,
                "could not determine the interpreter version",
                "Run $PSVersionTable manually and verify the installation",
            ));
        }

        let version = result.field_str(0, "Version").unwrap_or("unknown");
        let edition = result.field_str(0, "Edition").unwrap_or("unknown");
        let detail = format!("PowerShell {} ({})", version, edition);

        let major = version
            .split('.')
            .next()
            .and_then(|m| m.parse::<u64>().ok())
            .unwrap_or(0);

        if edition == "Desktop" {
            return ProbeOutput {
                issues: vec![DiagnosticIssue::manual(
                    Severity::Medium,
                    Category::Interpreter,
                    format!("Windows PowerShell {} (Desktop edition) detected", version),
                    "Install PowerShell 7 or later; current vendor toolkit releases require the Core edition",
                )],
                detail: Some(detail),
            };
        }

        if major < 7 {
            return ProbeOutput {
                issues: vec![DiagnosticIssue::manual(
                    Severity::Medium,
                    Category::Interpreter,
                    format!("PowerShell {} is older than the supported baseline", version),
                    "Upgrade to PowerShell 7 or later",
                )],
                detail: Some(detail),
            };
        }

        ProbeOutput::clean(detail)
    }

    async fn probe_smoke_test(&self) -> ProbeOutput {
        let script = self.interpreter.stdout_marker(SMOKE_MARKER);
        let result = self.runner.run_script(&script, self.probe_timeout()).await;

        if result.success && result.output.contains(SMOKE_MARKER) {
            ProbeOutput::clean(format!(
                "live execution round-trip completed in {:?}",
                result.execution_time
            ))
        } else {
            ProbeOutput::issue(DiagnosticIssue::manual(
                Severity::High,
                Category::SmokeTest,
                format!(
                    "live script execution failed: {}",
                    if result.error.trim().is_empty() {
                        "no output received"
                    } else {
                        result.error.trim()
                    }
                ),
                "Verify the interpreter installation and the engine execution settings",
            ))
        }
    }

    async fn probe_network(&self) -> ProbeOutput {
        let Some(endpoint) = self.settings.endpoint.as_deref() else {
            return ProbeOutput::clean("no endpoint configured, reachability not checked");
        };

        let mut issues = Vec::new();

        for var in ["HTTPS_PROXY", "HTTP_PROXY", "https_proxy", "http_proxy"] {
            if std::env::var_os(var).is_some() {
                issues.push(DiagnosticIssue::manual(
                    Severity::Low,
                    Category::Network,
                    format!("proxy environment variable {} is set", var),
                    "Confirm the proxy permits traffic to the management endpoint",
                ));
                break;
            }
        }

        let (host, port) = split_endpoint(endpoint);
        let address = format!("{}:{}", host, port);

        let connect = tokio::time::timeout(
            Duration::from_secs(5),
            tokio::net::TcpStream::connect(&address),
        )
        .await;

        match connect {
            Ok(Ok(_)) => ProbeOutput {
                issues,
                detail: Some(format!("{} reachable", address)),
            },
            Ok(Err(e)) => {
                issues.push(DiagnosticIssue::manual(
                    Severity::High,
                    Category::Network,
                    format!("cannot reach {}: {}", address, e),
                    "Check DNS, firewall rules and that the endpoint is online",
                ));
                ProbeOutput {
                    issues,
                    detail: None,
                }
            }
            Err(_) => {
                issues.push(DiagnosticIssue::manual(
                    Severity::High,
                    Category::Network,
                    format!("connection to {} timed out", address),
                    "Check DNS, firewall rules and that the endpoint is online",
                ));
                ProbeOutput {
                    issues,
                    detail: None,
                }
            }
        }
    }
}

/// Parse `(scope, policy)` pairs from the policy probe's JSON output
fn parse_policy_objects(objects: &[Value]) -> Vec<(String, String)> {
    objects
        .iter()
        .filter_map(|object| {
            let scope = object.get("Scope")?.as_str()?;
            let policy = object.get("Policy")?.as_str()?;
            Some((scope.to_string(), policy.to_string()))
        })
        .collect()
}

/// Evaluate scope table restrictiveness.
///
/// The effective policy is the strongest-precedence scope that is not
/// `Undefined`; when every scope is undefined the platform default applies,
/// which blocks scripts on client systems. Yields at most one issue.
fn evaluate_policy(scopes: &[(String, String)]) -> Option<DiagnosticIssue> {
    let by_scope: HashMap<&str, &str> = scopes
        .iter()
        .map(|(scope, policy)| (scope.as_str(), policy.as_str()))
        .collect();

    let effective = POLICY_SCOPE_PRECEDENCE
        .iter()
        .filter_map(|scope| by_scope.get(scope).map(|policy| (*scope, *policy)))
        .find(|(_, policy)| *policy != "Undefined");

    let (description, restrictive) = match effective {
        Some((scope, policy)) => (
            format!("effective execution policy is {} (set at {} scope)", policy, scope),
            RESTRICTIVE_POLICIES.contains(&policy),
        ),
        None => (
            "execution policy is Undefined at every scope; the platform default blocks scripts"
                .to_string(),
            true,
        ),
    };

    if !restrictive {
        return None;
    }

    Some(DiagnosticIssue::fixable(
        Severity::Critical,
        Category::ExecutionPolicy,
        description,
        "Set the CurrentUser execution policy to RemoteSigned",
        POLICY_FIX_SCRIPT,
    ))
}

/// Translate a module inventory into findings
fn module_issues(inventory: &[InstalledModule]) -> ProbeOutput {
    let mut issues = Vec::new();

    // Conflicting versions: one module installed across several branches
    let mut branches: HashMap<&str, HashSet<(u64, u64)>> = HashMap::new();
    for module in inventory {
        branches
            .entry(module.name.as_str())
            .or_default()
            .insert((module.version.major(), module.version.minor()));
    }
    let mut conflicted: Vec<&str> = branches
        .iter()
        .filter(|(_, set)| set.len() > 1)
        .map(|(name, _)| *name)
        .collect();
    conflicted.sort_unstable();

    if !conflicted.is_empty() {
        issues.push(DiagnosticIssue::manual(
            Severity::Medium,
            Category::Modules,
            format!(
                "multiple versions installed side by side: {}",
                conflicted.join(", ")
            ),
            "Uninstall the versions you do not use to avoid loading mismatched module sets",
        ));
    }

    match resolver::resolve(inventory, None) {
        Ok(plan) => {
            for skipped in &plan.skipped {
                let mandatory = resolver::REQUIRED_MODULES
                    .iter()
                    .any(|r| r.mandatory && r.name == skipped.name);
                if mandatory {
                    issues.push(DiagnosticIssue::manual(
                        Severity::High,
                        Category::Modules,
                        format!("{} unusable: {}", skipped.name, skipped.reason),
                        "Install a version matching the rest of the vendor toolkit",
                    ));
                }
            }

            let detail = plan
                .modules
                .iter()
                .map(|m| format!("{} v{}", m.name, m.version))
                .collect::<Vec<_>>()
                .join(", ");

            ProbeOutput {
                issues,
                detail: Some(format!("planned modules: {}", detail)),
            }
        }
        Err(_) => {
            issues.push(DiagnosticIssue::fixable(
                Severity::Critical,
                Category::Modules,
                "no mandatory vendor module is installed",
                "Install the vendor toolkit for the current user",
                MODULE_INSTALL_SCRIPT,
            ));
            ProbeOutput {
                issues,
                detail: None,
            }
        }
    }
}

/// Split `endpoint` into host and port, accepting bare hosts, `host:port`,
/// and full URLs; the management API's TLS port is the default.
fn split_endpoint(endpoint: &str) -> (String, u16) {
    let trimmed = endpoint
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host_port = trimmed.split('/').next().unwrap_or(trimmed);

    match host_port.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (host_port.to_string(), 443),
        },
        None => (host_port.to_string(), 443),
    }
}
