//! Test runner execution
//!
//! The e2e runner itself is an external tool; this adapter owns invoking it
//! and collecting its structured report. Only the orchestrator calls in
//! here, and only between patch stages, so execution is strictly
//! sequential.

use crate::config::RemediationConfig;
use crate::report::{load_report, RunReport};
use crate::util::run_command_with_timeout;
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

/// Outcome of one full suite run.
#[derive(Debug, Clone)]
pub struct TestRun {
    pub passed: bool,
    pub output: String,
    pub duration_ms: u64,
}

/// The command used when none is configured.
fn default_command() -> (String, Vec<String>) {
    (
        "npx".to_string(),
        vec!["playwright".to_string(), "test".to_string()],
    )
}

fn command_line(config: &RemediationConfig) -> (String, Vec<String>) {
    match &config.test_command {
        Some(raw) => {
            let mut parts = raw.split_whitespace().map(String::from);
            match parts.next() {
                Some(program) => (program, parts.collect()),
                None => default_command(),
            }
        }
        None => default_command(),
    }
}

/// Run the full test suite and report pass/fail from its exit status.
pub fn run_tests(repo_root: &Path, config: &RemediationConfig) -> Result<TestRun> {
    let (program, args) = command_line(config);
    let start = Instant::now();

    let mut command = Command::new(&program);
    command
        .current_dir(repo_root)
        .args(&args)
        // Route the JSON reporter to the configured report path; harmless
        // for runners that ignore it.
        .env("PLAYWRIGHT_JSON_OUTPUT_NAME", &config.test_report_path);

    let result = run_command_with_timeout(&mut command, config.test_timeout())
        .map_err(|e| anyhow::anyhow!("Failed to run test command '{}': {}", program, e))?;

    let duration_ms = start.elapsed().as_millis() as u64;
    let mut output = result.combined_output();
    if result.timed_out {
        output.push_str(&format!(
            "\n(test run killed after {}s timeout)",
            config.test_timeout_secs
        ));
    }

    Ok(TestRun {
        passed: result.success(),
        output,
        duration_ms,
    })
}

/// Where the runner's JSON report lands for this repository.
pub fn report_path(repo_root: &Path, config: &RemediationConfig) -> PathBuf {
    if config.test_report_path.is_absolute() {
        config.test_report_path.clone()
    } else {
        repo_root.join(&config.test_report_path)
    }
}

/// Load the report produced by the most recent run. Missing or unparsable
/// reports are hard errors: triage never proceeds on guesswork.
pub fn load_run_report(repo_root: &Path, config: &RemediationConfig) -> Result<RunReport> {
    load_report(&report_path(repo_root, config))
}
