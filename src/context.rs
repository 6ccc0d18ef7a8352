//! Failure Context Builder
//!
//! Turns a raw runner report into canonical [`Failure`] records: one per
//! failing test, carrying the resolved error, a numbered source window
//! around the failure line, and classified artifacts. Built once per run;
//! immutable afterwards. This module (via [`screenshot_data_uri`]) is the
//! only place that touches raw attachment bytes.

use crate::report::{parse_test, Attempt, RunReport, Spec, TestEntry};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// How many characters of source context to offer the analysis backend.
const MAX_CONTEXT_CHARS: usize = 3000;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Artifacts {
    pub screenshots: Vec<PathBuf>,
    pub videos: Vec<PathBuf>,
    pub traces: Vec<PathBuf>,
    /// Error-context document emitted by the runner, read as text
    pub error_context: Option<String>,
}

/// Canonical record of one failing test. Identity = (source_file, test_name).
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub test_name: String,
    pub source_file: PathBuf,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub status: String,
    pub error_message: String,
    pub stack_trace: Option<String>,
    pub duration_ms: u64,
    pub artifacts: Artifacts,
    /// Numbered source window centered on the failure line
    pub code_context: Option<String>,
}

impl Failure {
    pub fn identity(&self) -> (&Path, &str) {
        (self.source_file.as_path(), self.test_name.as_str())
    }

    pub fn location_label(&self) -> String {
        match (self.line, self.column) {
            (Some(line), Some(column)) => {
                format!("{}:{}:{}", self.source_file.display(), line, column)
            }
            (Some(line), None) => format!("{}:{}", self.source_file.display(), line),
            _ => self.source_file.display().to_string(),
        }
    }
}

/// Build one Failure per failing test in the report.
///
/// A flaky test contributes only its last attempt; duplicate
/// (source_file, test_name) identities keep the first occurrence.
pub fn build_failures(report: &RunReport, repo_root: &Path) -> Vec<Failure> {
    let mut failures = Vec::new();
    let mut seen: HashSet<(PathBuf, String)> = HashSet::new();

    for spec in report.all_specs() {
        for raw in &spec.tests {
            let Some(test) = parse_test(spec, raw) else {
                continue;
            };
            if !test.is_failure() {
                continue;
            }
            let failure = build_one(spec, &test, repo_root);
            let key = (failure.source_file.clone(), failure.test_name.clone());
            if seen.insert(key) {
                failures.push(failure);
            }
        }
    }

    failures
}

fn build_one(spec: &Spec, test: &TestEntry, repo_root: &Path) -> Failure {
    // Only the last attempt matters; prefer the last *failed* one so a
    // trailing passed retry cannot mask the error detail.
    let attempt = test
        .results
        .iter()
        .rev()
        .find(|a| {
            a.status
                .as_deref()
                .map(crate::report::is_failing_status)
                .unwrap_or(false)
        })
        .or_else(|| test.last_attempt());

    let error = attempt.and_then(|a| a.primary_error());

    let error_message = error
        .and_then(|e| e.message.clone())
        .unwrap_or_else(|| "Test failed without a reported error message".to_string());
    let stack_trace = error.and_then(|e| e.stack.clone());

    // Location resolution: explicit error location, then the first source
    // frame in the stack, then the spec's declared position.
    let (source_file, line, column) = match error.and_then(|e| e.location.as_ref()) {
        Some(loc) => (loc.file.clone(), Some(loc.line), Some(loc.column)),
        None => match stack_trace.as_deref().and_then(location_from_stack) {
            Some((file, line, column)) => (file, Some(line), Some(column)),
            None => (
                spec.file.clone().unwrap_or_default(),
                spec.line,
                spec.column,
            ),
        },
    };

    let status = test
        .status
        .clone()
        .or_else(|| attempt.and_then(|a| a.status.clone()))
        .unwrap_or_else(|| "failed".to_string());

    let duration_ms = attempt.map(|a| a.duration.max(0.0).round() as u64).unwrap_or(0);

    let artifacts = attempt
        .map(|a| classify_artifacts(a, repo_root))
        .unwrap_or_default();

    let code_context = read_code_context(repo_root, &source_file, line);

    Failure {
        test_name: spec.title.clone(),
        source_file,
        line,
        column,
        status,
        error_message,
        stack_trace,
        duration_ms,
        artifacts,
        code_context,
    }
}

/// Pull `file:line:column` out of the first stack frame that names a source
/// file, for errors that carry a stack but no structured location.
fn location_from_stack(stack: &str) -> Option<(PathBuf, u32, u32)> {
    let re = Regex::new(r"at .*?([^\s():]+\.(?:ts|tsx|js|jsx|mjs)):(\d+):(\d+)").ok()?;
    let caps = re.captures(stack)?;
    let file = PathBuf::from(caps.get(1)?.as_str());
    let line = caps.get(2)?.as_str().parse().ok()?;
    let column = caps.get(3)?.as_str().parse().ok()?;
    Some((file, line, column))
}

/// Bucket attachments by declared content type.
fn classify_artifacts(attempt: &Attempt, repo_root: &Path) -> Artifacts {
    let mut artifacts = Artifacts::default();

    for attachment in &attempt.attachments {
        let content_type = attachment.content_type.as_str();
        if content_type.starts_with("image/") {
            if let Some(path) = &attachment.path {
                artifacts.screenshots.push(path.clone());
            }
        } else if content_type.starts_with("video/") {
            if let Some(path) = &attachment.path {
                artifacts.videos.push(path.clone());
            }
        } else if attachment.name == "trace" || content_type == "application/zip" {
            if let Some(path) = &attachment.path {
                artifacts.traces.push(path.clone());
            }
        } else if attachment.name == "error-context" || content_type == "text/markdown" {
            artifacts.error_context = read_attachment_text(attachment, repo_root);
        }
    }

    artifacts
}

fn read_attachment_text(
    attachment: &crate::report::Attachment,
    repo_root: &Path,
) -> Option<String> {
    if let Some(body) = &attachment.body {
        if let Ok(bytes) = BASE64_STANDARD.decode(body.trim()) {
            return String::from_utf8(bytes).ok();
        }
    }
    let path = attachment.path.as_ref()?;
    fs::read_to_string(resolve_artifact_path(repo_root, path)).ok()
}

fn resolve_artifact_path(repo_root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        repo_root.join(path)
    }
}

/// Encode a screenshot as a `data:` URI for inline use in prompts.
pub fn screenshot_data_uri(repo_root: &Path, path: &Path) -> Option<String> {
    let resolved = resolve_artifact_path(repo_root, path);
    let bytes = fs::read(&resolved).ok()?;
    let mime = match resolved.extension().and_then(|e| e.to_str()) {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "image/png",
    };
    Some(format!("data:{};base64,{}", mime, BASE64_STANDARD.encode(bytes)))
}

fn read_code_context(repo_root: &Path, source_file: &Path, line: Option<u32>) -> Option<String> {
    if source_file.as_os_str().is_empty() {
        return None;
    }
    let content = fs::read_to_string(resolve_artifact_path(repo_root, source_file)).ok()?;
    let line = line.unwrap_or(1);
    numbered_window(&content, line as usize, MAX_CONTEXT_CHARS)
}

/// A numbered window of source lines centered on `line` (1-based), grown to
/// the widest radius that still fits the char budget.
fn numbered_window(content: &str, line: usize, max_chars: usize) -> Option<String> {
    if max_chars == 0 {
        return None;
    }
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return None;
    }

    let target = line.saturating_sub(1).min(lines.len() - 1);
    let max_radius = target.max(lines.len() - 1 - target);

    let render = |start: usize, end: usize| -> String {
        lines[start..=end]
            .iter()
            .enumerate()
            .map(|(i, l)| format!("{:>5} | {}", start + i + 1, l))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let mut best: Option<(usize, usize)> = None;
    let mut lo = 0usize;
    let mut hi = max_radius;
    while lo <= hi {
        let mid = (lo + hi) / 2;
        let start = target.saturating_sub(mid);
        let end = (target + mid).min(lines.len() - 1);
        if render(start, end).chars().count() <= max_chars {
            best = Some((start, end));
            lo = mid + 1;
        } else if mid == 0 {
            break;
        } else {
            hi = mid - 1;
        }
    }

    best.map(|(start, end)| render(start, end))
}
