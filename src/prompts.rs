//! Prompt text for the analysis backends

use crate::context::{screenshot_data_uri, Failure};
use std::path::Path;

pub const ANALYSIS_SYSTEM: &str = r#"You are a senior test engineer diagnosing a failing end-to-end test. Work out why it failed and propose the smallest source change that fixes it.

OUTPUT FORMAT (JSON, one object, nothing else):
{
  "analysis": "What is going wrong, in 2-4 sentences",
  "rootCause": "The single underlying cause",
  "fix": {
    "description": "1-2 sentence summary of the change",
    "changes": [
      {
        "file": "relative/path/to/file.ts",
        "action": "replace",
        "lineStart": 10,
        "lineEnd": 12,
        "oldCode": "exact text currently at those lines",
        "newCode": "replacement text"
      }
    ]
  },
  "confidence": 0.8,
  "affectedFiles": ["relative/path/to/file.ts"],
  "testingRecommendations": ["what to re-run or watch for"]
}

RULES FOR CHANGES:
- action is one of: replace, insert, delete
- lineStart/lineEnd are 1-based and inclusive, referring to the file as it is NOW
- oldCode must be copied exactly from the current file; it is used to verify the location
- insert places newCode before lineStart without consuming existing lines
- delete removes the inclusive line range; omit newCode
- Use repository-relative paths only
- Make the smallest change that fixes the failure; do not reformat or clean up unrelated code

CONFIDENCE:
- 0.9+ only when the failure and fix are unambiguous
- 0.5 when plausible but unverified
- 0.2 or lower when guessing; a low score skips the fix rather than risking the tree"#;

/// Maximum screenshots inlined into one prompt.
const MAX_INLINE_SCREENSHOTS: usize = 2;

/// Compose the user prompt for one failure: error, stack, source window,
/// runner artifacts, and inline screenshots.
pub fn compose_failure_prompt(failure: &Failure, repo_root: &Path) -> String {
    let mut sections = Vec::new();

    sections.push(format!(
        "Failing test: {}\nLocation: {}\nStatus: {}\nDuration: {}ms",
        failure.test_name,
        failure.location_label(),
        failure.status,
        failure.duration_ms
    ));

    sections.push(format!("Error:\n{}", failure.error_message));

    if let Some(stack) = &failure.stack_trace {
        sections.push(format!("Stack trace:\n{}", stack));
    }

    if let Some(context) = &failure.code_context {
        sections.push(format!(
            "Source context ({}):\n```\n{}\n```",
            failure.source_file.display(),
            context
        ));
    }

    if let Some(error_context) = &failure.artifacts.error_context {
        sections.push(format!("Page state at failure:\n{}", error_context));
    }

    if !failure.artifacts.traces.is_empty() {
        let traces: Vec<String> = failure
            .artifacts
            .traces
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        sections.push(format!("Trace files (not inlined): {}", traces.join(", ")));
    }

    for path in failure.artifacts.screenshots.iter().take(MAX_INLINE_SCREENSHOTS) {
        if let Some(uri) = screenshot_data_uri(repo_root, path) {
            sections.push(format!("Screenshot ({}):\n{}", path.display(), uri));
        }
    }

    sections.push(
        "Respond with the JSON object described in your instructions, and nothing else."
            .to_string(),
    );

    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixtures::sample_failure;

    #[test]
    fn test_prompt_carries_error_and_location() {
        let dir = tempfile::tempdir().unwrap();
        let prompt = compose_failure_prompt(&sample_failure(), dir.path());
        assert!(prompt.contains("shows an error on bad password"));
        assert!(prompt.contains("tests/login.spec.ts:14:38"));
        assert!(prompt.contains("toBeVisible"));
    }

    #[test]
    fn test_prompt_inlines_screenshots_as_data_uris() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("shot.png"), [1u8, 2, 3]).unwrap();

        let mut failure = sample_failure();
        failure.artifacts.screenshots.push("shot.png".into());

        let prompt = compose_failure_prompt(&failure, dir.path());
        assert!(prompt.contains("data:image/png;base64,"));
    }

    #[test]
    fn test_prompt_skips_missing_screenshots() {
        let dir = tempfile::tempdir().unwrap();
        let mut failure = sample_failure();
        failure.artifacts.screenshots.push("gone.png".into());

        let prompt = compose_failure_prompt(&failure, dir.path());
        assert!(!prompt.contains("data:image"));
    }
}
