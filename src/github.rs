//! GitHub pull-request creation
//!
//! The one outward-facing side effect of a green run: open a PR describing
//! the applied fixes. Deliberately narrow — testmend does not push; the
//! current branch is assumed to already exist on the remote. A failure here
//! warns and never changes the run outcome.

use crate::reporting::{OutcomeKind, RemediationReport};
use anyhow::{Context, Result};
use git2::Repository;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const API_TIMEOUT_SECS: u64 = 30;

/// Maximum length for error body content in error messages
const MAX_ERROR_BODY_LEN: usize = 200;

/// The stored GitHub token, if any. Environment only.
pub fn get_stored_token() -> Option<String> {
    std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty())
}

/// Sanitize an API error body to prevent credential leakage.
/// Truncates long responses and redacts potential secrets.
fn sanitize_error_body(body: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "token",
        "secret",
        "password",
        "credential",
        "auth",
        "bearer",
        "ghp_",
        "gho_",
        "ghu_",
        "github_pat_",
    ];

    let truncated = if body.len() > MAX_ERROR_BODY_LEN {
        format!("{}... (truncated)", &body[..MAX_ERROR_BODY_LEN])
    } else {
        body.to_string()
    };

    let lower = truncated.to_lowercase();
    for pattern in SECRET_PATTERNS {
        if lower.contains(pattern) {
            return "(error details redacted - may contain sensitive data)".to_string();
        }
    }

    truncated
}

/// Parse owner/repo from a GitHub remote URL (SSH or HTTPS).
pub fn parse_remote_url(url: &str) -> Option<(String, String)> {
    // SSH format: git@github.com:owner/repo.git
    if let Some(rest) = url.strip_prefix("git@github.com:") {
        let path = rest.trim_end_matches(".git");
        let parts: Vec<&str> = path.splitn(2, '/').collect();
        if parts.len() == 2 {
            return Some((parts[0].to_string(), parts[1].to_string()));
        }
    }

    // HTTPS format: https://github.com/owner/repo.git
    if url.contains("github.com") {
        if let Ok(parsed) = url::Url::parse(url) {
            let path = parsed
                .path()
                .trim_start_matches('/')
                .trim_end_matches(".git");
            let parts: Vec<&str> = path.splitn(2, '/').collect();
            if parts.len() == 2 {
                return Some((parts[0].to_string(), parts[1].to_string()));
            }
        }

        // Fallback: simple string parsing for URLs without scheme
        let path = url
            .split("github.com")
            .nth(1)?
            .trim_start_matches(['/', ':'])
            .trim_end_matches(".git");
        let parts: Vec<&str> = path.splitn(2, '/').collect();
        if parts.len() == 2 {
            return Some((parts[0].to_string(), parts[1].to_string()));
        }
    }

    None
}

/// Get the owner and repo from the repository's remotes.
pub fn get_remote_info(repo_path: &Path) -> Result<(String, String)> {
    let repo = Repository::open(repo_path).context("Failed to open repository")?;

    for remote_name in ["origin", "upstream", "github"] {
        if let Ok(remote) = repo.find_remote(remote_name) {
            if let Some(url) = remote.url() {
                if let Some((owner, repo_name)) = parse_remote_url(url) {
                    return Ok((owner, repo_name));
                }
            }
        }
    }

    if let Ok(remotes) = repo.remotes() {
        for name in remotes.iter().flatten() {
            if let Ok(remote) = repo.find_remote(name) {
                if let Some(url) = remote.url() {
                    if let Some((owner, repo_name)) = parse_remote_url(url) {
                        return Ok((owner, repo_name));
                    }
                }
            }
        }
    }

    Err(anyhow::anyhow!(
        "No GitHub remote found. Make sure you have a remote pointing to github.com"
    ))
}

/// The currently checked-out branch name.
pub fn current_branch(repo_path: &Path) -> Result<String> {
    let repo = Repository::open(repo_path).context("Failed to open repository")?;
    let head = repo.head().context("Failed to read HEAD")?;
    head.shorthand()
        .map(String::from)
        .ok_or_else(|| anyhow::anyhow!("HEAD is not on a branch"))
}

#[derive(Serialize)]
struct CreatePrRequest {
    title: String,
    body: String,
    head: String,
    base: String,
}

#[derive(Deserialize)]
struct CreatePrResponse {
    html_url: String,
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: Option<String>,
}

/// Create a pull request on GitHub. Returns the URL of the created PR.
pub async fn create_pull_request(
    owner: &str,
    repo: &str,
    base: &str,
    head: &str,
    title: &str,
    body: &str,
) -> Result<String> {
    let token = get_stored_token().ok_or_else(|| {
        anyhow::anyhow!("Not authenticated with GitHub. Set GITHUB_TOKEN to enable PR creation.")
    })?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(API_TIMEOUT_SECS))
        .build()
        .context("Failed to create HTTP client")?;

    let url = format!("https://api.github.com/repos/{}/{}/pulls", owner, repo);

    let request = CreatePrRequest {
        title: title.to_string(),
        body: body.to_string(),
        head: head.to_string(),
        base: base.to_string(),
    };

    let resp = client
        .post(&url)
        .header("Accept", "application/vnd.github+json")
        .header("Authorization", format!("Bearer {}", token))
        .header("User-Agent", "testmend")
        .header("X-GitHub-Api-Version", "2022-11-28")
        .json(&request)
        .send()
        .await
        .context("Failed to send PR creation request")?;

    let status = resp.status();
    if status.is_success() {
        let pr: CreatePrResponse = resp.json().await.context("Failed to parse PR response")?;
        Ok(pr.html_url)
    } else {
        let error_body = resp.text().await.unwrap_or_default();

        if let Ok(api_error) = serde_json::from_str::<ApiErrorResponse>(&error_body) {
            let detail = api_error
                .errors
                .first()
                .and_then(|e| e.message.clone())
                .unwrap_or_default();

            let msg = if detail.is_empty() {
                api_error.message
            } else {
                format!("{}: {}", api_error.message, detail)
            };

            return Err(anyhow::anyhow!("GitHub API error: {}", msg));
        }

        let sanitized = sanitize_error_body(&error_body);
        Err(anyhow::anyhow!(
            "GitHub API error ({}): {}",
            status,
            sanitized
        ))
    }
}

/// Open a PR describing this run's applied fixes, against `main`.
pub async fn open_remediation_pr(repo_root: &Path, report: &RemediationReport) -> Result<String> {
    let (owner, repo) = get_remote_info(repo_root)?;
    let head = current_branch(repo_root)?;

    let title = format!(
        "Automated test remediation: {} fix{}",
        report.fixes_applied,
        if report.fixes_applied == 1 { "" } else { "es" }
    );
    let body = pr_body(report);

    create_pull_request(&owner, &repo, "main", &head, &title, &body).await
}

fn pr_body(report: &RemediationReport) -> String {
    let mut lines = vec![
        format!(
            "Automated remediation run `{}`: {} failing test(s), {} fixed, verification green.",
            report.run_id, report.total_failures, report.fixes_applied
        ),
        String::new(),
    ];

    for entry in &report.failures {
        if entry.outcome == OutcomeKind::Fixed {
            lines.push(format!(
                "- **{}** (`{}`, confidence {:.2}): {}",
                entry.test_name,
                entry.source_file.display(),
                entry.confidence,
                entry.detail
            ));
        }
    }

    lines.push(String::new());
    lines.push("Every mutated file was backed up before editing; see the remediation report for the full audit trail.".to_string());
    lines.join("\n")
}
