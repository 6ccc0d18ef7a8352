//! Test-run report parsing
//!
//! Models the nested suites -> specs -> tests -> results JSON emitted by the
//! e2e runner. Field vocabulary drifts across runner versions, so everything
//! an external producer may omit is defaulted, and individual test entries
//! are decoded one by one: a single malformed entry is skipped with a
//! warning instead of poisoning the whole walk.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RunReport {
    #[serde(default)]
    pub suites: Vec<Suite>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Suite {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub suites: Vec<Suite>,
    #[serde(default)]
    pub specs: Vec<Spec>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Spec {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub column: Option<u32>,
    /// Raw test entries; decoded individually via [`parse_test`]
    #[serde(default)]
    pub tests: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TestEntry {
    /// Terminal status. Newer runners report an outcome vocabulary here
    /// ({expected, unexpected, flaky}); older ones mirror the attempt status.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub results: Vec<Attempt>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Attempt {
    #[serde(default)]
    pub status: Option<String>,
    /// Milliseconds; runners emit this as a float
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub retry: u32,
    #[serde(default)]
    pub error: Option<ReportError>,
    #[serde(default)]
    pub errors: Vec<ReportError>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ReportError {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub location: Option<ErrorLocation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorLocation {
    pub file: PathBuf,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub column: u32,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Inline payload, base64-encoded by the runner
    #[serde(default)]
    pub body: Option<String>,
}

/// Load and parse a runner report. A missing or unparsable file is a hard
/// error: triage must never start from a report it cannot trust.
pub fn load_report(path: &Path) -> Result<RunReport> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read test report at {}", path.display()))?;
    let report: RunReport = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse test report at {}", path.display()))?;
    Ok(report)
}

/// Statuses that mark a test (or attempt) as failing, across both the
/// attempt vocabulary ({passed, failed, timedOut}) and the outcome
/// vocabulary ({expected, unexpected, flaky}).
pub fn is_failing_status(status: &str) -> bool {
    status == "failed" || status.eq_ignore_ascii_case("timedout") || status == "unexpected"
}

/// Decode one raw test entry, or skip it with a warning.
pub fn parse_test(spec: &Spec, value: &Value) -> Option<TestEntry> {
    match serde_json::from_value::<TestEntry>(value.clone()) {
        Ok(test) => Some(test),
        Err(err) => {
            eprintln!(
                "  Warning: Skipping malformed test entry in '{}': {}",
                spec.title, err
            );
            None
        }
    }
}

impl RunReport {
    /// Flatten the suite tree into specs, depth-first in document order.
    pub fn all_specs(&self) -> Vec<&Spec> {
        let mut specs = Vec::new();
        for suite in &self.suites {
            collect_specs(suite, &mut specs);
        }
        specs
    }
}

fn collect_specs<'a>(suite: &'a Suite, out: &mut Vec<&'a Spec>) {
    out.extend(suite.specs.iter());
    for child in &suite.suites {
        collect_specs(child, out);
    }
}

impl TestEntry {
    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.results.last()
    }

    /// A test fails if its terminal status, or its last attempt's status,
    /// is in the failing set. For flaky tests only the last attempt counts.
    pub fn is_failure(&self) -> bool {
        if let Some(status) = &self.status {
            if is_failing_status(status) {
                return true;
            }
            // An explicit passing outcome ("expected", "flaky" that recovered)
            // is trusted over earlier failed attempts.
            if status == "expected" || status == "flaky" || status == "passed" {
                return false;
            }
        }
        self.last_attempt()
            .and_then(|a| a.status.as_deref())
            .map(is_failing_status)
            .unwrap_or(false)
    }
}

impl Attempt {
    /// The most specific error: prefer one that carries a source location,
    /// otherwise the first reported error.
    pub fn primary_error(&self) -> Option<&ReportError> {
        self.errors
            .iter()
            .find(|e| e.location.is_some())
            .or_else(|| self.errors.first())
            .or(self.error.as_ref())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// A small runner report: one real failure, one pass, one recovered
    /// flaky test, with a nested suite.
    pub(crate) const SAMPLE_REPORT: &str = r#"{
      "suites": [
        {
          "title": "login.spec.ts",
          "file": "tests/login.spec.ts",
          "specs": [
            {
              "title": "shows an error on bad password",
              "file": "tests/login.spec.ts",
              "line": 12,
              "column": 5,
              "tests": [
                {
                  "status": "unexpected",
                  "results": [
                    {
                      "status": "failed",
                      "duration": 1543.2,
                      "retry": 0,
                      "errors": [
                        {
                          "message": "expect(locator).toBeVisible() failed",
                          "stack": "Error: expect(locator).toBeVisible() failed\n    at tests/login.spec.ts:14:38",
                          "location": { "file": "tests/login.spec.ts", "line": 14, "column": 38 }
                        }
                      ],
                      "attachments": [
                        { "name": "screenshot", "contentType": "image/png", "path": "test-results/login-1/screenshot.png" },
                        { "name": "trace", "contentType": "application/zip", "path": "test-results/login-1/trace.zip" }
                      ]
                    }
                  ]
                }
              ]
            },
            {
              "title": "logs in with valid credentials",
              "file": "tests/login.spec.ts",
              "line": 4,
              "column": 5,
              "tests": [
                { "status": "expected", "results": [ { "status": "passed", "duration": 901.0 } ] }
              ]
            }
          ],
          "suites": [
            {
              "title": "remember me",
              "specs": [
                {
                  "title": "persists the session",
                  "file": "tests/login.spec.ts",
                  "line": 30,
                  "column": 5,
                  "tests": [
                    {
                      "status": "flaky",
                      "results": [
                        { "status": "failed", "duration": 2000.0, "retry": 0 },
                        { "status": "passed", "duration": 1800.0, "retry": 1 }
                      ]
                    }
                  ]
                }
              ]
            }
          ]
        }
      ]
    }"#;
}
