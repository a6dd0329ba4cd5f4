// src/diagnostics/report.rs
//! Diagnostic issues and reports

use std::collections::HashMap;
use std::fmt;

/// How bad an issue is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Which part of the environment an issue belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    ExecutionPolicy,
    Modules,
    Interpreter,
    SmokeTest,
    Network,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Category::ExecutionPolicy => "Execution Policy",
            Category::Modules => "Vendor Modules",
            Category::Interpreter => "Interpreter",
            Category::SmokeTest => "Smoke Test",
            Category::Network => "Network",
        };
        write!(f, "{}", label)
    }
}

/// One classified finding from a probe
#[derive(Debug, Clone)]
pub struct DiagnosticIssue {
    pub severity: Severity,
    pub category: Category,
    pub description: String,
    pub recommendation: String,

    /// Whether [`repair`](crate::diagnostics::DiagnosticsEngine::repair)
    /// can act on this issue
    pub auto_fixable: bool,

    /// Script the repair pass runs when `auto_fixable` is set
    pub fix_script: Option<String>,
}

impl DiagnosticIssue {
    /// An issue with no automated fix
    pub fn manual(
        severity: Severity,
        category: Category,
        description: impl Into<String>,
        recommendation: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            description: description.into(),
            recommendation: recommendation.into(),
            auto_fixable: false,
            fix_script: None,
        }
    }

    /// An issue the repair pass can act on
    pub fn fixable(
        severity: Severity,
        category: Category,
        description: impl Into<String>,
        recommendation: impl Into<String>,
        fix_script: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            description: description.into(),
            recommendation: recommendation.into(),
            auto_fixable: true,
            fix_script: Some(fix_script.into()),
        }
    }
}

/// Overall environment verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Aggregated output of one diagnostics run
#[derive(Debug, Clone)]
pub struct DiagnosticReport {
    /// All findings, ordered by descending severity
    pub issues: Vec<DiagnosticIssue>,

    /// Free-form per-category detail (inventories, version tables)
    pub details: HashMap<Category, String>,

    /// Verdict derived from the worst finding
    pub status: OverallStatus,
}

impl DiagnosticReport {
    /// Build a report from collected findings
    pub fn new(mut issues: Vec<DiagnosticIssue>, details: HashMap<Category, String>) -> Self {
        issues.sort_by(|a, b| b.severity.cmp(&a.severity));

        let status = match issues.iter().map(|i| i.severity).max() {
            None => OverallStatus::Healthy,
            Some(Severity::Low) | Some(Severity::Medium) => OverallStatus::Degraded,
            Some(Severity::High) | Some(Severity::Critical) => OverallStatus::Unhealthy,
        };

        Self {
            issues,
            details,
            status,
        }
    }

    /// Findings in one category
    pub fn issues_in(&self, category: Category) -> Vec<&DiagnosticIssue> {
        self.issues
            .iter()
            .filter(|i| i.category == category)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_worst_issue() {
        let healthy = DiagnosticReport::new(vec![], HashMap::new());
        assert_eq!(healthy.status, OverallStatus::Healthy);

        let degraded = DiagnosticReport::new(
            vec![DiagnosticIssue::manual(
                Severity::Medium,
                Category::Modules,
                "two versions installed",
                "uninstall the older one",
            )],
            HashMap::new(),
        );
        assert_eq!(degraded.status, OverallStatus::Degraded);

        let unhealthy = DiagnosticReport::new(
            vec![
                DiagnosticIssue::manual(
                    Severity::Low,
                    Category::Network,
                    "proxy configured",
                    "verify proxy rules",
                ),
                DiagnosticIssue::fixable(
                    Severity::Critical,
                    Category::ExecutionPolicy,
                    "policy is Restricted",
                    "relax the policy",
                    "Set-ExecutionPolicy RemoteSigned",
                ),
            ],
            HashMap::new(),
        );
        assert_eq!(unhealthy.status, OverallStatus::Unhealthy);
        // Sorted worst-first
        assert_eq!(unhealthy.issues[0].severity, Severity::Critical);
    }

    #[test]
    fn test_issues_in_category() {
        let report = DiagnosticReport::new(
            vec![DiagnosticIssue::manual(
                Severity::High,
                Category::SmokeTest,
                "live execution failed",
                "check the interpreter install",
            )],
            HashMap::new(),
        );
        assert_eq!(report.issues_in(Category::SmokeTest).len(), 1);
        assert!(report.issues_in(Category::Network).is_empty());
    }
}
