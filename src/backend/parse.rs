//! Backend response recovery
//!
//! Reasoning backends promise one JSON object but routinely wrap it in
//! prose or markdown fencing, and sometimes leave raw newlines inside
//! string values. Recovery is deliberately bounded: locate the first
//! balanced object (or fenced block), and on a parse failure normalize
//! control characters and retry exactly once before giving up.

use super::PartialAnalysis;
use crate::util::truncate;
use anyhow::Result;

/// Strip markdown code fences from a response.
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if trimmed.starts_with("```json") {
        trimmed.strip_prefix("```json").unwrap_or(trimmed)
    } else if trimmed.starts_with("```") {
        trimmed.strip_prefix("```").unwrap_or(trimmed)
    } else {
        trimmed
    };
    let clean = if clean.ends_with("```") {
        clean.strip_suffix("```").unwrap_or(clean)
    } else {
        clean
    };
    clean.trim()
}

/// Find the first balanced `{...}` object, honoring string literals so a
/// brace inside a quoted value cannot end the scan early.
pub(crate) fn extract_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Repair the issues backends actually produce: raw newlines/tabs inside
/// string values, smart quotes, trailing commas.
fn normalize_json(json: &str) -> String {
    let mut fixed = String::with_capacity(json.len());
    let mut in_string = false;
    let mut escaped = false;

    for c in json.chars() {
        if in_string {
            if escaped {
                escaped = false;
                fixed.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    fixed.push(c);
                }
                '"' => {
                    in_string = false;
                    fixed.push(c);
                }
                '\n' => fixed.push_str("\\n"),
                '\t' => fixed.push_str("\\t"),
                '\r' => fixed.push_str("\\r"),
                c if c.is_control() => {}
                c => fixed.push(c),
            }
        } else {
            match c {
                '"' => {
                    in_string = true;
                    fixed.push(c);
                }
                '\u{201C}' | '\u{201D}' => fixed.push('"'),
                c => fixed.push(c),
            }
        }
    }

    // Trailing commas before a closing bracket
    fixed = fixed.replace(",]", "]").replace(",}", "}");
    fixed
}

/// Parse a backend response into a [`PartialAnalysis`].
pub fn parse_analysis(response: &str) -> Result<PartialAnalysis> {
    let clean = strip_markdown_fences(response);
    let json_str = extract_balanced_object(clean).ok_or_else(|| {
        anyhow::anyhow!(
            "No JSON object found in backend response. Preview: {}",
            truncate(clean, 200)
        )
    })?;

    match serde_json::from_str::<PartialAnalysis>(json_str) {
        Ok(parsed) => Ok(parsed),
        Err(initial_error) => {
            let fixed = normalize_json(json_str);
            serde_json::from_str::<PartialAnalysis>(&fixed).map_err(|retry_error| {
                anyhow::anyhow!(
                    "Backend response is not valid JSON after normalization: {} (initial error: {}). Preview: {}",
                    retry_error,
                    initial_error,
                    truncate(json_str, 200)
                )
            })
        }
    }
}
