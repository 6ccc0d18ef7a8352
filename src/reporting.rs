//! Remediation report persistence
//!
//! One append-only report per run, persisted for audit as machine-readable
//! JSON plus a small self-contained HTML projection, with stable `latest.*`
//! pointers in the report directory.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeKind {
    Fixed,
    SkippedLowConfidence,
    /// Confidence cleared the threshold but the analysis proposed no edits
    SkippedNoChanges,
    PatchFailed,
    StillFailingAfterFix,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Fixed => "fixed",
            OutcomeKind::SkippedLowConfidence => "skipped-low-confidence",
            OutcomeKind::SkippedNoChanges => "skipped-no-changes",
            OutcomeKind::PatchFailed => "patch-failed",
            OutcomeKind::StillFailingAfterFix => "still-failing-after-fix",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureOutcome {
    pub test_name: String,
    pub source_file: PathBuf,
    pub outcome: OutcomeKind,
    pub confidence: f64,
    /// Skip reason, patch error, or fix description
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemediationReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Terminal pipeline outcome label, e.g. "success" or "rolled-back"
    pub outcome: String,
    pub total_failures: usize,
    pub analyzed: usize,
    pub fixes_applied: usize,
    pub fixes_failed: usize,
    pub skipped_low_confidence: usize,
    pub skipped_no_changes: usize,
    pub all_tests_passed_after_fix: bool,
    pub rolled_back: bool,
    pub dry_run: bool,
    /// Present only when the run died on an unhandled pipeline error
    pub error: Option<String>,
    pub failures: Vec<FailureOutcome>,
}

impl RemediationReport {
    pub fn new(total_failures: usize, dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: "in-progress".to_string(),
            total_failures,
            analyzed: 0,
            fixes_applied: 0,
            fixes_failed: 0,
            skipped_low_confidence: 0,
            skipped_no_changes: 0,
            all_tests_passed_after_fix: false,
            rolled_back: false,
            dry_run,
            error: None,
            failures: Vec::new(),
        }
    }

    /// Append one failure's outcome and bump the matching counter.
    pub fn record(
        &mut self,
        test_name: &str,
        source_file: &Path,
        outcome: OutcomeKind,
        confidence: f64,
        detail: impl Into<String>,
    ) {
        match outcome {
            OutcomeKind::Fixed => self.fixes_applied += 1,
            OutcomeKind::SkippedLowConfidence => self.skipped_low_confidence += 1,
            OutcomeKind::SkippedNoChanges => self.skipped_no_changes += 1,
            OutcomeKind::PatchFailed => self.fixes_failed += 1,
            OutcomeKind::StillFailingAfterFix => {}
        }
        self.failures.push(FailureOutcome {
            test_name: test_name.to_string(),
            source_file: source_file.to_path_buf(),
            outcome,
            confidence,
            detail: detail.into(),
        });
    }

    /// Verification came back red: what was applied did not stick.
    /// Applied counters are kept for the audit trail.
    pub fn mark_still_failing(&mut self) {
        for entry in &mut self.failures {
            if entry.outcome == OutcomeKind::Fixed {
                entry.outcome = OutcomeKind::StillFailingAfterFix;
            }
        }
    }

    pub fn finish(&mut self, outcome: &str) {
        self.outcome = outcome.to_string();
        self.finished_at = Some(Utc::now());
    }

    /// Persist JSON + HTML under `report_dir`, refreshing the `latest.*`
    /// pointers. Returns the JSON path.
    pub fn write(&self, report_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(report_dir).with_context(|| {
            format!("Failed to create report directory {}", report_dir.display())
        })?;

        let stamp = self.started_at.format("%Y%m%d-%H%M%S");
        let json_path = report_dir.join(format!("remediation-{}.json", stamp));
        let html_path = report_dir.join(format!("remediation-{}.html", stamp));

        let json = serde_json::to_string_pretty(self)?;
        fs::write(&json_path, &json)
            .with_context(|| format!("Failed to write report {}", json_path.display()))?;
        fs::write(&html_path, self.to_html())
            .with_context(|| format!("Failed to write report {}", html_path.display()))?;

        fs::write(report_dir.join("latest.json"), &json)?;
        fs::write(report_dir.join("latest.html"), self.to_html())?;

        Ok(json_path)
    }

    fn to_html(&self) -> String {
        let rows: String = self
            .failures
            .iter()
            .map(|f| {
                format!(
                    "      <tr><td>{}</td><td>{}</td><td class=\"{}\">{}</td><td>{:.2}</td><td>{}</td></tr>\n",
                    escape(&f.test_name),
                    escape(&f.source_file.display().to_string()),
                    f.outcome.as_str(),
                    f.outcome.as_str(),
                    f.confidence,
                    escape(&f.detail)
                )
            })
            .collect();

        format!(
            r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>Remediation report {run_id}</title>
  <style>
    body {{ font-family: ui-monospace, monospace; margin: 2rem; color: #222; }}
    table {{ border-collapse: collapse; width: 100%; }}
    th, td {{ border: 1px solid #ccc; padding: 0.4rem 0.6rem; text-align: left; }}
    .fixed {{ color: #15803d; }}
    .patch-failed, .still-failing-after-fix {{ color: #b91c1c; }}
    .skipped-low-confidence, .skipped-no-changes {{ color: #a16207; }}
  </style>
</head>
<body>
  <h1>Remediation report</h1>
  <p>Run {run_id} &mdash; {outcome}{dry_run}</p>
  <p>{total} failure(s), {analyzed} analyzed, {applied} fixed, {failed} patch failures, {skipped} skipped (low confidence), {no_changes} skipped (no changes)</p>
  <p>All tests passed after fix: {green} &mdash; rolled back: {rolled_back}</p>
  <table>
    <thead>
      <tr><th>Test</th><th>File</th><th>Outcome</th><th>Confidence</th><th>Detail</th></tr>
    </thead>
    <tbody>
{rows}    </tbody>
  </table>
</body>
</html>
"#,
            run_id = self.run_id,
            outcome = escape(&self.outcome),
            dry_run = if self.dry_run { " (dry run)" } else { "" },
            total = self.total_failures,
            analyzed = self.analyzed,
            applied = self.fixes_applied,
            failed = self.fixes_failed,
            skipped = self.skipped_low_confidence,
            no_changes = self.skipped_no_changes,
            green = self.all_tests_passed_after_fix,
            rolled_back = self.rolled_back,
            rows = rows
        )
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
