//! Analysis backends
//!
//! A backend takes one failing test plus its assembled context and returns a
//! remediation analysis. Concrete backends differ wildly in strategy (hosted
//! API, IDE assistant handshake, a human pasting JSON) but share one
//! contract: exactly one [`AnalysisResult`] per [`Failure`], with loosely
//! shaped responses normalized through [`PartialAnalysis`]. A backend error
//! becomes a degenerate confidence-0 result, never an exception that escapes
//! the batch.

pub mod api;
pub mod gateway;
pub mod ide;
pub mod interactive;
pub mod parse;

use crate::config::{BackendKind, RemediationConfig};
use crate::context::Failure;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditAction {
    Replace,
    Insert,
    Delete,
}

impl EditAction {
    pub fn label(&self) -> &'static str {
        match self {
            EditAction::Replace => "replace",
            EditAction::Insert => "insert",
            EditAction::Delete => "delete",
        }
    }
}

/// One atomic line-range mutation. Line numbers are 1-based, inclusive, and
/// refer to the file as it was before this edit. `old_code` is a
/// verification anchor only, never the sole source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edit {
    pub file: PathBuf,
    pub action: EditAction,
    #[serde(default = "default_line")]
    pub line_start: usize,
    /// Defaults to `line_start` when the backend omits it
    #[serde(default)]
    pub line_end: usize,
    #[serde(default)]
    pub old_code: Option<String>,
    #[serde(default)]
    pub new_code: Option<String>,
}

fn default_line() -> usize {
    1
}

impl Edit {
    /// Inclusive end line, tolerating backends that omit or invert it.
    pub fn end_line(&self) -> usize {
        self.line_end.max(self.line_start)
    }

    pub fn range_label(&self) -> String {
        let end = self.end_line();
        if end == self.line_start {
            format!("line {}", self.line_start)
        } else {
            format!("lines {}-{}", self.line_start, end)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProposedFix {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub changes: Vec<Edit>,
}

/// The loosely-shaped response a backend actually produces. Every field is
/// optional; [`PartialAnalysis::into_result`] applies the per-field defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialAnalysis {
    #[serde(default)]
    pub analysis: Option<String>,
    #[serde(default)]
    pub root_cause: Option<String>,
    #[serde(default)]
    pub fix: Option<ProposedFix>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub affected_files: Option<Vec<PathBuf>>,
    #[serde(default)]
    pub testing_recommendations: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub analysis: String,
    pub root_cause: String,
    pub fix: ProposedFix,
    /// Trust score in [0, 1]; gates whether the fix is applied
    pub confidence: f64,
    pub affected_files: Vec<PathBuf>,
    pub testing_recommendations: Vec<String>,
}

impl PartialAnalysis {
    /// Normalize into a complete result. Missing confidence defaults to 0.5,
    /// a missing fix to an empty change set, and missing affected files to
    /// the failure's own source file.
    pub fn into_result(self, failure: &Failure) -> AnalysisResult {
        AnalysisResult {
            analysis: self.analysis.unwrap_or_default(),
            root_cause: self.root_cause.unwrap_or_default(),
            fix: self.fix.unwrap_or_default(),
            confidence: self.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
            affected_files: self
                .affected_files
                .filter(|files| !files.is_empty())
                .unwrap_or_else(|| vec![failure.source_file.clone()]),
            testing_recommendations: self.testing_recommendations.unwrap_or_default(),
        }
    }
}

impl AnalysisResult {
    /// Terminal confidence-0 result for a failed or timed-out backend call.
    pub fn degraded(reason: impl Into<String>) -> Self {
        Self {
            analysis: reason.into(),
            root_cause: String::new(),
            fix: ProposedFix::default(),
            confidence: 0.0,
            affected_files: Vec::new(),
            testing_recommendations: Vec::new(),
        }
    }

    /// Terminal confidence-0 result for a request handed off for manual
    /// handling.
    pub fn deferred(note: impl Into<String>) -> Self {
        Self::degraded(note)
    }

    pub fn has_changes(&self) -> bool {
        !self.fix.changes.is_empty()
    }
}

/// One analysis explicitly paired with the failure that produced it.
/// Results are never matched back positionally.
#[derive(Debug, Clone)]
pub struct FailureAnalysis {
    pub failure: Failure,
    pub result: AnalysisResult,
}

#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produce an analysis for one failure. Errors are per-call: the gateway
    /// degrades them to confidence-0 results without touching the rest of
    /// the batch.
    async fn analyze(&self, failure: &Failure, prompt: &str) -> Result<PartialAnalysis>;
}

pub fn create_backend(
    config: &RemediationConfig,
    repo_root: &Path,
) -> Arc<dyn AnalysisBackend> {
    match config.backend {
        BackendKind::Api => Arc::new(api::HostedApiBackend::new(config)),
        BackendKind::Ide => Arc::new(ide::IdeBackend::new(config, repo_root)),
        BackendKind::Interactive => Arc::new(interactive::InteractiveBackend::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixtures::sample_failure;

    #[test]
    fn test_normalization_defaults() {
        let failure = sample_failure();
        let result = PartialAnalysis::default().into_result(&failure);
        assert!((result.confidence - 0.5).abs() < f64::EPSILON);
        assert!(result.fix.changes.is_empty());
        assert_eq!(result.affected_files, vec![failure.source_file.clone()]);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let failure = sample_failure();
        let partial = PartialAnalysis {
            confidence: Some(3.5),
            ..Default::default()
        };
        assert!((partial.into_result(&failure).confidence - 1.0).abs() < f64::EPSILON);

        let partial = PartialAnalysis {
            confidence: Some(-0.2),
            ..Default::default()
        };
        assert_eq!(partial.into_result(&failure).confidence, 0.0);
    }

    #[test]
    fn test_degraded_result_is_terminal_not_an_error() {
        let result = AnalysisResult::degraded("backend timed out");
        assert_eq!(result.confidence, 0.0);
        assert!(!result.has_changes());
    }

    #[test]
    fn test_edit_wire_format_is_camel_case() {
        let edit: Edit = serde_json::from_str(
            r#"{"file":"src/nav.ts","action":"replace","lineStart":10,"lineEnd":12,"oldCode":"a","newCode":"b"}"#,
        )
        .unwrap();
        assert_eq!(edit.action, EditAction::Replace);
        assert_eq!(edit.line_start, 10);
        assert_eq!(edit.end_line(), 12);
        assert_eq!(edit.old_code.as_deref(), Some("a"));
    }

    #[test]
    fn test_edit_missing_line_end_defaults_to_start() {
        let edit: Edit =
            serde_json::from_str(r#"{"file":"a.ts","action":"insert","lineStart":5,"newCode":"x"}"#)
                .unwrap();
        assert_eq!(edit.end_line(), 5);
    }
}
