// src/diagnostics/repair.rs
//! Automated repair
//!
//! Applies the fix scripts of auto-fixable issues and records a per-issue
//! outcome. One failing fix never aborts the batch, and diagnostics are not
//! re-run afterwards; confirmation belongs to the next explicit
//! diagnostics call.

use crate::diagnostics::probes::DiagnosticsEngine;
use crate::diagnostics::report::DiagnosticIssue;
use crate::diagnostics::ScriptRunner;
use tracing::{info, warn};

/// Result of applying one fix
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    /// Description of the issue the fix targeted
    pub issue: String,

    /// Whether the fix script ran successfully
    pub success: bool,

    /// Fix output on success, error text on failure
    pub message: String,
}

impl<R: ScriptRunner> DiagnosticsEngine<R> {
    /// Apply every auto-fixable issue's fix script.
    ///
    /// Issues without a fix script are skipped silently; the caller chose
    /// what to pass in.
    pub async fn repair(&self, issues: &[DiagnosticIssue]) -> Vec<RepairOutcome> {
        let mut outcomes = Vec::new();

        for issue in issues {
            let Some(fix_script) = issue.fix_script.as_deref().filter(|_| issue.auto_fixable)
            else {
                continue;
            };

            info!("Applying fix for: {}", issue.description);
            let result = self.runner.run_script(fix_script, self.probe_timeout()).await;

            if result.success {
                outcomes.push(RepairOutcome {
                    issue: issue.description.clone(),
                    success: true,
                    message: result.output.trim().to_string(),
                });
            } else {
                warn!(
                    "Fix for '{}' failed: {}",
                    issue.description,
                    result.error.trim()
                );
                outcomes.push(RepairOutcome {
                    issue: issue.description.clone(),
                    success: false,
                    message: result.error.trim().to_string(),
                });
            }
        }

        outcomes
    }
}
