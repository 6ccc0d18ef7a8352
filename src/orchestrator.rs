//! Remediation Orchestrator
//!
//! The top-level state machine: run tests, extract failures, analyze them,
//! gate on confidence, apply accepted edits, re-run tests, and either
//! finalize or roll back. Stage-local problems (one backend call, one edit)
//! are absorbed into per-failure outcomes; only a missing/unparsable report
//! or a genuinely unhandled error ends the run early, and even then the
//! pipeline persists whatever report state exists.

use crate::backend::gateway::Gateway;
use crate::backend::{create_backend, AnalysisBackend, FailureAnalysis};
use crate::config::RemediationConfig;
use crate::context::build_failures;
use crate::github;
use crate::patch::PatchEngine;
use crate::reporting::{OutcomeKind, RemediationReport};
use crate::runner;
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Idle,
    RunningTests,
    AnalyzingFailures,
    ApplyingFixes,
    VerifyingFixes,
    RollingBack,
    GeneratingReport,
    Done(RunOutcome),
}

impl PipelineState {
    /// Human-readable status for narration
    pub fn status_text(&self) -> &'static str {
        match self {
            PipelineState::Idle => "Ready",
            PipelineState::RunningTests => "Running tests...",
            PipelineState::AnalyzingFailures => "Analyzing failures...",
            PipelineState::ApplyingFixes => "Applying fixes...",
            PipelineState::VerifyingFixes => "Verifying fixes...",
            PipelineState::RollingBack => "Rolling back...",
            PipelineState::GeneratingReport => "Generating report...",
            PipelineState::Done(_) => "Done",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// No failures, nothing actionable, or everything green after fixes
    Success,
    /// Fixes applied but verification stayed red; the tree was restored
    RolledBack,
    /// Verification stayed red (or no fix applied) and rollback was off
    PartialWithWarnings,
    /// Input error or unhandled pipeline error
    Failed,
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::RolledBack => "partial-failure-rolled-back",
            RunOutcome::PartialWithWarnings => "partial-success-with-warnings",
            RunOutcome::Failed => "failed",
        }
    }

    /// Success and no-op exit 0; everything else is non-zero.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::RolledBack | RunOutcome::PartialWithWarnings => 1,
            RunOutcome::Failed => 2,
        }
    }
}

pub struct Orchestrator {
    config: RemediationConfig,
    repo_root: PathBuf,
    backend: Arc<dyn AnalysisBackend>,
    pub state: PipelineState,
}

impl Orchestrator {
    pub fn new(repo_root: &Path, config: RemediationConfig) -> Self {
        let backend = create_backend(&config, repo_root);
        Self::with_backend(repo_root, config, backend)
    }

    /// Inject a backend directly; used by tests and embedding tools.
    pub fn with_backend(
        repo_root: &Path,
        config: RemediationConfig,
        backend: Arc<dyn AnalysisBackend>,
    ) -> Self {
        Self {
            config,
            repo_root: repo_root.to_path_buf(),
            backend,
            state: PipelineState::Idle,
        }
    }

    fn enter(&mut self, state: PipelineState) {
        self.state = state;
        println!("  {}", state.status_text());
    }

    /// Run the full pipeline. This is the boundary where unhandled errors
    /// become a failed-run result; the report is always persisted, even for
    /// a run that died early.
    pub async fn run(&mut self) -> (RemediationReport, RunOutcome) {
        let mut report = RemediationReport::new(0, self.config.dry_run);

        let outcome = match self.run_inner(&mut report).await {
            Ok(outcome) => outcome,
            Err(err) => {
                eprintln!("  Error: {:#}", err);
                report.error = Some(format!("{:#}", err));
                RunOutcome::Failed
            }
        };

        self.enter(PipelineState::GeneratingReport);
        report.finish(outcome.label());
        let report_dir = self.resolve(&self.config.report_dir);
        match report.write(&report_dir) {
            Ok(path) => println!("  Report written to {}", path.display()),
            Err(err) => eprintln!("  Warning: failed to persist report: {:#}", err),
        }

        if outcome == RunOutcome::Success
            && report.all_tests_passed_after_fix
            && report.fixes_applied > 0
            && self.config.create_pr
            && !self.config.dry_run
        {
            match github::open_remediation_pr(&self.repo_root, &report).await {
                Ok(url) => println!("  Pull request created: {}", url),
                Err(err) => eprintln!("  Warning: PR creation failed: {:#}", err),
            }
        }

        self.state = PipelineState::Done(outcome);
        (report, outcome)
    }

    async fn run_inner(&mut self, report: &mut RemediationReport) -> Result<RunOutcome> {
        self.enter(PipelineState::RunningTests);
        let initial = runner::run_tests(&self.repo_root, &self.config)?;
        if initial.passed {
            println!("  All tests pass ({}ms). Nothing to remediate.", initial.duration_ms);
            return Ok(RunOutcome::Success);
        }

        // Hard, caller-visible error before any mutation
        let run_report = runner::load_run_report(&self.repo_root, &self.config)?;
        let failures = build_failures(&run_report, &self.repo_root);
        report.total_failures = failures.len();

        if failures.is_empty() {
            println!("  Test command failed but the report lists no failing tests. Nothing to remediate.");
            return Ok(RunOutcome::Success);
        }
        println!(
            "  {} failing test{} extracted",
            failures.len(),
            if failures.len() == 1 { "" } else { "s" }
        );

        self.enter(PipelineState::AnalyzingFailures);
        let gateway = Gateway::new(self.backend.clone(), &self.config, &self.repo_root);
        let analyses = gateway.analyze_failures(failures).await;
        report.analyzed = analyses.len();

        let actionable = self.gate_by_confidence(analyses, report);
        if actionable.is_empty() {
            println!("  No actionable fix survived gating. Nothing applied.");
            return Ok(RunOutcome::Success);
        }

        self.enter(PipelineState::ApplyingFixes);
        let mut engine = PatchEngine::new(
            &self.repo_root,
            self.config.dry_run,
            self.config.backup_enabled,
        );
        self.apply_fixes(&actionable, &mut engine, report);

        if self.config.dry_run {
            println!(
                "  Dry run: {} fix{} logged, nothing written, skipping verification.",
                report.fixes_applied,
                if report.fixes_applied == 1 { "" } else { "es" }
            );
            return Ok(RunOutcome::Success);
        }

        // Gate on files actually touched, not on clean fix applications: a
        // fix whose later edit failed has still mutated the tree and must
        // flow through verification and, if red, rollback.
        if engine.touched_file_count() == 0 {
            println!("  No file was touched (every accepted fix failed to apply). Leaving the tree as-is.");
            return Ok(RunOutcome::PartialWithWarnings);
        }

        self.enter(PipelineState::VerifyingFixes);
        let verify = runner::run_tests(&self.repo_root, &self.config)?;
        if verify.passed {
            report.all_tests_passed_after_fix = true;
            println!("  All tests pass after fixes ({}ms).", verify.duration_ms);
            return Ok(RunOutcome::Success);
        }

        println!("  Tests still failing after fixes.");
        report.mark_still_failing();

        if self.config.rollback_on_failure {
            self.enter(PipelineState::RollingBack);
            let restore_failures = engine.rollback();
            report.rolled_back = true;
            for (file, err) in &restore_failures {
                eprintln!("  Warning: failed to restore {}: {}", file.display(), err);
            }
            if restore_failures.is_empty() {
                println!("  All touched files restored from backup.");
            }
            return Ok(RunOutcome::RolledBack);
        }

        eprintln!("  Warning: fixes left in place despite red verification (rollback disabled).");
        Ok(RunOutcome::PartialWithWarnings)
    }

    /// Only analyses at or above the confidence threshold, with a non-empty
    /// change set, proceed. Everything else is recorded and skipped.
    fn gate_by_confidence(
        &self,
        analyses: Vec<FailureAnalysis>,
        report: &mut RemediationReport,
    ) -> Vec<FailureAnalysis> {
        let threshold = self.config.confidence_threshold;
        let mut actionable = Vec::new();

        for analysis in analyses {
            let confidence = analysis.result.confidence;
            if confidence >= threshold && analysis.result.has_changes() {
                println!(
                    "    {} -> accepted (confidence {:.2})",
                    analysis.failure.test_name, confidence
                );
                actionable.push(analysis);
                continue;
            }

            let (outcome, reason) = if confidence < threshold {
                (
                    OutcomeKind::SkippedLowConfidence,
                    format!(
                        "skipped: low confidence ({:.2} < {:.2})",
                        confidence, threshold
                    ),
                )
            } else {
                (
                    OutcomeKind::SkippedNoChanges,
                    "skipped: no proposed changes".to_string(),
                )
            };
            println!("    {} -> {}", analysis.failure.test_name, reason);
            report.record(
                &analysis.failure.test_name,
                &analysis.failure.source_file,
                outcome,
                confidence,
                reason,
            );
        }

        actionable
    }

    /// Apply each accepted fix. Edits are serialized per analysis in
    /// received order; a failed edit fails that fix but never the run.
    fn apply_fixes(
        &self,
        actionable: &[FailureAnalysis],
        engine: &mut PatchEngine,
        report: &mut RemediationReport,
    ) {
        for analysis in actionable {
            let mut edit_errors = Vec::new();
            for edit in &analysis.result.fix.changes {
                if let Err(err) = engine.apply(edit) {
                    eprintln!(
                        "  Warning: edit for '{}' failed: {:#}",
                        analysis.failure.test_name, err
                    );
                    edit_errors.push(format!("{:#}", err));
                }
            }

            if edit_errors.is_empty() {
                report.record(
                    &analysis.failure.test_name,
                    &analysis.failure.source_file,
                    OutcomeKind::Fixed,
                    analysis.result.confidence,
                    analysis.result.fix.description.clone(),
                );
            } else {
                report.record(
                    &analysis.failure.test_name,
                    &analysis.failure.source_file,
                    OutcomeKind::PatchFailed,
                    analysis.result.confidence,
                    edit_errors.join("; "),
                );
            }
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.repo_root.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Edit, EditAction, PartialAnalysis, ProposedFix};
    use crate::context::Failure;
    use async_trait::async_trait;
    use std::fs;

    /// Backend scripted per source file: proposes a known replace edit with
    /// a fixed confidence, or a confident analysis with no edits at all.
    struct ScriptedBackend {
        confidence: f64,
        empty_fix: bool,
    }

    #[async_trait]
    impl AnalysisBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn analyze(&self, failure: &Failure, _prompt: &str) -> anyhow::Result<PartialAnalysis> {
            if self.empty_fix {
                return Ok(PartialAnalysis {
                    analysis: Some("flaky environment, no code change needed".to_string()),
                    confidence: Some(self.confidence),
                    ..Default::default()
                });
            }
            let (old, new) = if failure.source_file.ends_with("login.spec.ts") {
                ("page.click('#submit')", "page.click('#login-submit')")
            } else {
                ("expect(total).toBe(9)", "expect(total).toBe(10) // recalculated-total")
            };
            Ok(PartialAnalysis {
                analysis: Some("selector drift".to_string()),
                root_cause: Some("UI id changed".to_string()),
                fix: Some(ProposedFix {
                    description: format!("update {}", failure.source_file.display()),
                    changes: vec![Edit {
                        file: failure.source_file.clone(),
                        action: EditAction::Replace,
                        line_start: 3,
                        line_end: 3,
                        old_code: Some(old.to_string()),
                        new_code: Some(new.to_string()),
                    }],
                }),
                confidence: Some(self.confidence),
                affected_files: None,
                testing_recommendations: None,
            })
        }
    }

    /// Backend whose fix half-applies: the first edit lands, the second has
    /// an anchor that exists nowhere.
    struct PartialFixBackend;

    #[async_trait]
    impl AnalysisBackend for PartialFixBackend {
        fn name(&self) -> &'static str {
            "partial"
        }

        async fn analyze(&self, failure: &Failure, _prompt: &str) -> anyhow::Result<PartialAnalysis> {
            Ok(PartialAnalysis {
                fix: Some(ProposedFix {
                    description: "two-step fix".to_string(),
                    changes: vec![
                        Edit {
                            file: failure.source_file.clone(),
                            action: EditAction::Replace,
                            line_start: 3,
                            line_end: 3,
                            old_code: Some("page.click('#submit')".to_string()),
                            new_code: Some("page.click('#login-submit')".to_string()),
                        },
                        Edit {
                            file: failure.source_file.clone(),
                            action: EditAction::Replace,
                            line_start: 1,
                            line_end: 1,
                            old_code: Some("text that exists nowhere".to_string()),
                            new_code: Some("x".to_string()),
                        },
                    ],
                }),
                confidence: Some(0.95),
                ..Default::default()
            })
        }
    }

    const LOGIN_SPEC: &str = "test('shows an error on bad password', async () => {\n  await page.goto('/login');\n  await page.click('#submit');\n});\n";
    const CART_SPEC: &str = "test('recomputes the total', async () => {\n  const total = add(4, 6);\n  expect(total).toBe(9)\n});\n";

    /// A repo where the "suite" greps for the fixed markers: red before the
    /// edits land, green after.
    fn make_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let tests = dir.path().join("tests");
        fs::create_dir_all(&tests).unwrap();
        fs::write(tests.join("login.spec.ts"), LOGIN_SPEC).unwrap();
        fs::write(tests.join("cart.spec.ts"), CART_SPEC).unwrap();

        fs::write(
            dir.path().join("runner.sh"),
            "grep -q login-submit tests/login.spec.ts && grep -q recalculated-total tests/cart.spec.ts\n",
        )
        .unwrap();

        fs::write(dir.path().join("report.json"), report_with_two_failures()).unwrap();
        dir
    }

    /// 2 failing + 3 passing tests.
    fn report_with_two_failures() -> String {
        serde_json::json!({
            "suites": [{
                "title": "suite",
                "specs": [
                    {
                        "title": "shows an error on bad password",
                        "file": "tests/login.spec.ts", "line": 3, "column": 9,
                        "tests": [{ "status": "unexpected", "results": [{
                            "status": "failed", "duration": 1200.0,
                            "errors": [{ "message": "locator not found",
                                         "location": { "file": "tests/login.spec.ts", "line": 3, "column": 9 } }]
                        }]}]
                    },
                    {
                        "title": "recomputes the total",
                        "file": "tests/cart.spec.ts", "line": 3, "column": 3,
                        "tests": [{ "status": "unexpected", "results": [{
                            "status": "timedOut", "duration": 30000.0,
                            "errors": [{ "message": "assertion failed",
                                         "location": { "file": "tests/cart.spec.ts", "line": 3, "column": 3 } }]
                        }]}]
                    },
                    { "title": "pass one", "file": "tests/ok.spec.ts",
                      "tests": [{ "status": "expected", "results": [{ "status": "passed" }] }] },
                    { "title": "pass two", "file": "tests/ok.spec.ts",
                      "tests": [{ "status": "expected", "results": [{ "status": "passed" }] }] },
                    { "title": "pass three", "file": "tests/ok.spec.ts",
                      "tests": [{ "status": "expected", "results": [{ "status": "passed" }] }] }
                ]
            }]
        })
        .to_string()
    }

    /// Only the login failure; every accepted fix targets one file.
    fn report_with_one_failure() -> String {
        serde_json::json!({
            "suites": [{
                "title": "suite",
                "specs": [{
                    "title": "shows an error on bad password",
                    "file": "tests/login.spec.ts", "line": 3, "column": 9,
                    "tests": [{ "status": "unexpected", "results": [{
                        "status": "failed", "duration": 1200.0,
                        "errors": [{ "message": "locator not found",
                                     "location": { "file": "tests/login.spec.ts", "line": 3, "column": 9 } }]
                    }]}]
                }]
            }]
        })
        .to_string()
    }

    fn config_for(_dir: &tempfile::TempDir) -> RemediationConfig {
        RemediationConfig {
            test_command: Some("sh runner.sh".to_string()),
            test_report_path: PathBuf::from("report.json"),
            test_timeout_secs: 10,
            call_timeout_secs: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_two_failures_fixed_and_verified_green() {
        let dir = make_repo();
        let backend = Arc::new(ScriptedBackend { confidence: 0.9, empty_fix: false });
        let mut orchestrator =
            Orchestrator::with_backend(dir.path(), config_for(&dir), backend);

        let (report, outcome) = orchestrator.run().await;

        assert_eq!(outcome, RunOutcome::Success);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(report.total_failures, 2);
        assert_eq!(report.analyzed, 2);
        assert_eq!(report.fixes_applied, 2);
        assert!(report.all_tests_passed_after_fix);
        assert!(!report.rolled_back);

        // Reports persisted with a latest pointer
        assert!(dir.path().join(".testmend/reports/latest.json").exists());
        assert!(dir.path().join(".testmend/reports/latest.html").exists());
    }

    #[tokio::test]
    async fn test_sub_threshold_analyses_write_nothing() {
        let dir = make_repo();
        let backend = Arc::new(ScriptedBackend { confidence: 0.3, empty_fix: false });
        let mut orchestrator =
            Orchestrator::with_backend(dir.path(), config_for(&dir), backend);

        let (report, outcome) = orchestrator.run().await;

        assert_eq!(outcome, RunOutcome::Success);
        assert_eq!(report.fixes_applied, 0);
        assert_eq!(report.skipped_low_confidence, 2);

        // Confidence gating: nothing below threshold ever reaches disk
        assert_eq!(
            fs::read_to_string(dir.path().join("tests/login.spec.ts")).unwrap(),
            LOGIN_SPEC
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("tests/cart.spec.ts")).unwrap(),
            CART_SPEC
        );
    }

    #[tokio::test]
    async fn test_red_verification_rolls_back_every_touched_file() {
        let dir = make_repo();
        // A runner that never goes green
        fs::write(dir.path().join("runner.sh"), "exit 1\n").unwrap();

        let backend = Arc::new(ScriptedBackend { confidence: 0.95, empty_fix: false });
        let mut orchestrator =
            Orchestrator::with_backend(dir.path(), config_for(&dir), backend);

        let (report, outcome) = orchestrator.run().await;

        assert_eq!(outcome, RunOutcome::RolledBack);
        assert_ne!(outcome.exit_code(), 0);
        assert!(report.rolled_back);
        assert!(!report.all_tests_passed_after_fix);
        assert!(report
            .failures
            .iter()
            .any(|f| f.outcome == OutcomeKind::StillFailingAfterFix));

        // Byte-identical restore of both touched files
        assert_eq!(
            fs::read_to_string(dir.path().join("tests/login.spec.ts")).unwrap(),
            LOGIN_SPEC
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("tests/cart.spec.ts")).unwrap(),
            CART_SPEC
        );
    }

    #[tokio::test]
    async fn test_red_verification_without_rollback_warns_and_keeps_fixes() {
        let dir = make_repo();
        fs::write(dir.path().join("runner.sh"), "exit 1\n").unwrap();

        let backend = Arc::new(ScriptedBackend { confidence: 0.95, empty_fix: false });
        let mut config = config_for(&dir);
        config.rollback_on_failure = false;
        let mut orchestrator = Orchestrator::with_backend(dir.path(), config, backend);

        let (report, outcome) = orchestrator.run().await;

        assert_eq!(outcome, RunOutcome::PartialWithWarnings);
        assert!(!report.rolled_back);
        // The fixes stayed on disk
        assert!(fs::read_to_string(dir.path().join("tests/login.spec.ts"))
            .unwrap()
            .contains("login-submit"));
    }

    #[tokio::test]
    async fn test_dry_run_logs_fixes_but_never_writes() {
        let dir = make_repo();
        let backend = Arc::new(ScriptedBackend { confidence: 0.9, empty_fix: false });
        let mut config = config_for(&dir);
        config.dry_run = true;
        let mut orchestrator = Orchestrator::with_backend(dir.path(), config, backend);

        let (report, outcome) = orchestrator.run().await;

        assert_eq!(outcome, RunOutcome::Success);
        assert!(report.dry_run);
        assert_eq!(report.fixes_applied, 2);
        assert!(!report.all_tests_passed_after_fix);
        assert_eq!(
            fs::read_to_string(dir.path().join("tests/login.spec.ts")).unwrap(),
            LOGIN_SPEC
        );
    }

    #[tokio::test]
    async fn test_already_green_suite_is_a_no_op() {
        let dir = make_repo();
        fs::write(dir.path().join("runner.sh"), "exit 0\n").unwrap();

        let backend = Arc::new(ScriptedBackend { confidence: 0.9, empty_fix: false });
        let mut orchestrator =
            Orchestrator::with_backend(dir.path(), config_for(&dir), backend);

        let (report, outcome) = orchestrator.run().await;
        assert_eq!(outcome, RunOutcome::Success);
        assert_eq!(report.total_failures, 0);
    }

    #[tokio::test]
    async fn test_missing_report_fails_before_any_mutation() {
        let dir = make_repo();
        fs::remove_file(dir.path().join("report.json")).unwrap();

        let backend = Arc::new(ScriptedBackend { confidence: 0.9, empty_fix: false });
        let mut orchestrator =
            Orchestrator::with_backend(dir.path(), config_for(&dir), backend);

        let (report, outcome) = orchestrator.run().await;

        assert_eq!(outcome, RunOutcome::Failed);
        assert_eq!(outcome.exit_code(), 2);
        assert!(report.error.as_deref().unwrap().contains("test report"));

        // The failed run still persisted its report
        assert!(dir.path().join(".testmend/reports/latest.json").exists());
        // And the tree was never touched
        assert_eq!(
            fs::read_to_string(dir.path().join("tests/login.spec.ts")).unwrap(),
            LOGIN_SPEC
        );
    }

    #[tokio::test]
    async fn test_partial_fix_application_still_verifies_and_rolls_back() {
        let dir = make_repo();
        fs::write(dir.path().join("report.json"), report_with_one_failure()).unwrap();
        fs::write(dir.path().join("runner.sh"), "exit 1\n").unwrap();

        let mut orchestrator =
            Orchestrator::with_backend(dir.path(), config_for(&dir), Arc::new(PartialFixBackend));
        let (report, outcome) = orchestrator.run().await;

        // The only accepted fix half-applied: no clean fix application, but
        // the tree was touched, so the run must verify and roll back rather
        // than stop at "nothing applied".
        assert_eq!(report.fixes_applied, 0);
        assert_eq!(report.fixes_failed, 1);
        assert_eq!(outcome, RunOutcome::RolledBack);
        assert!(report.rolled_back);

        assert_eq!(
            fs::read_to_string(dir.path().join("tests/login.spec.ts")).unwrap(),
            LOGIN_SPEC
        );

        // No leaked backup files either
        let leaked: Vec<_> = fs::read_dir(dir.path().join("tests"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".backup."))
            .collect();
        assert!(leaked.is_empty());
    }

    #[tokio::test]
    async fn test_confident_analysis_without_changes_is_not_counted_low_confidence() {
        let dir = make_repo();
        let backend = Arc::new(ScriptedBackend { confidence: 0.9, empty_fix: true });
        let mut orchestrator =
            Orchestrator::with_backend(dir.path(), config_for(&dir), backend);

        let (report, outcome) = orchestrator.run().await;

        assert_eq!(outcome, RunOutcome::Success);
        assert_eq!(report.skipped_no_changes, 2);
        assert_eq!(report.skipped_low_confidence, 0);
        assert_eq!(report.fixes_applied, 0);
        assert!(report
            .failures
            .iter()
            .all(|f| f.outcome == OutcomeKind::SkippedNoChanges));
        assert_eq!(
            fs::read_to_string(dir.path().join("tests/login.spec.ts")).unwrap(),
            LOGIN_SPEC
        );
    }
}
