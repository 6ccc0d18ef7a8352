//! IDE-integrated backend
//!
//! Talks to an editor-resident assistant through the filesystem, with three
//! ordered attempt strategies instead of nested exception handling:
//!
//! 1. invoke an external assistant executable with a request/response file
//!    handshake under a hard timeout;
//! 2. drop the request document into the watched request directory and poll
//!    the deterministic sibling response path;
//! 3. persist the request for fully manual handling and return a deferred
//!    confidence-0 result rather than blocking indefinitely.
//!
//! Each strategy returns either a result or "advance to the next strategy".

use super::{parse, AnalysisBackend, PartialAnalysis};
use crate::config::RemediationConfig;
use crate::context::Failure;
use crate::util::run_command_with_timeout;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

enum Attempt {
    Done(PartialAnalysis),
    Advance,
}

pub struct IdeBackend {
    request_dir: PathBuf,
    assistant_bin: Option<String>,
    /// Budget for each of the first two tiers; both must fit inside one
    /// gateway call timeout, so each gets 2/5 of it.
    tier_timeout: Duration,
    poll_interval: Duration,
}

impl IdeBackend {
    pub fn new(config: &RemediationConfig, repo_root: &Path) -> Self {
        let request_dir = if config.request_dir.is_absolute() {
            config.request_dir.clone()
        } else {
            repo_root.join(&config.request_dir)
        };
        Self {
            request_dir,
            assistant_bin: config.assistant_bin.clone(),
            tier_timeout: config.call_timeout() / 5 * 2,
            poll_interval: config.poll_interval(),
        }
    }

    /// Deterministic request/response sibling paths for one failure.
    fn request_paths(&self, failure: &Failure) -> (PathBuf, PathBuf) {
        let slug = slugify(&failure.test_name);
        (
            self.request_dir.join(format!("{}.request.json", slug)),
            self.request_dir.join(format!("{}.response.json", slug)),
        )
    }

    fn write_request(&self, path: &Path, failure: &Failure, prompt: &str) -> Result<()> {
        fs::create_dir_all(&self.request_dir).with_context(|| {
            format!("Failed to create request directory {}", self.request_dir.display())
        })?;
        let document = json!({
            "test": failure.test_name,
            "location": failure.location_label(),
            "error": failure.error_message,
            "prompt": prompt,
        });
        fs::write(path, serde_json::to_string_pretty(&document)?)
            .with_context(|| format!("Failed to write request document {}", path.display()))?;
        Ok(())
    }

    /// Tier 1: hand the request file to the assistant executable, which is
    /// expected to write the response to the sibling path before exiting.
    async fn try_assistant_exec(&self, request: &Path, response: &Path) -> Attempt {
        let Some(bin) = self.assistant_bin.clone() else {
            return Attempt::Advance;
        };

        let request = request.to_path_buf();
        let response = response.to_path_buf();
        let timeout = self.tier_timeout;

        let response_arg = response.clone();
        let run = tokio::task::spawn_blocking(move || {
            let mut command = Command::new(&bin);
            command.arg(&request).arg(&response_arg);
            run_command_with_timeout(&mut command, timeout)
        })
        .await;

        match run {
            Ok(Ok(result)) if result.success() => {}
            Ok(Ok(result)) if result.timed_out => {
                eprintln!("  Warning: IDE assistant timed out; falling back to watched directory");
                return Attempt::Advance;
            }
            Ok(Ok(result)) => {
                eprintln!(
                    "  Warning: IDE assistant exited with failure; falling back. Output: {}",
                    crate::util::truncate(&result.combined_output(), 200)
                );
                return Attempt::Advance;
            }
            Ok(Err(err)) => {
                eprintln!("  Warning: IDE assistant unavailable ({}); falling back", err);
                return Attempt::Advance;
            }
            Err(join_err) => {
                eprintln!("  Warning: IDE assistant task failed ({}); falling back", join_err);
                return Attempt::Advance;
            }
        }

        match fs::read_to_string(&response) {
            Ok(content) => match parse::parse_analysis(&content) {
                Ok(partial) => Attempt::Done(partial),
                Err(err) => {
                    eprintln!("  Warning: IDE assistant response was unusable: {}", err);
                    Attempt::Advance
                }
            },
            Err(_) => {
                eprintln!("  Warning: IDE assistant produced no response file; falling back");
                Attempt::Advance
            }
        }
    }

    /// Tier 2: the request is already on disk in the watched directory;
    /// wait for something external to produce the sibling response.
    async fn try_watched_directory(&self, response: &Path) -> Attempt {
        match poll_for_file(response, self.tier_timeout, self.poll_interval).await {
            Some(content) => match parse::parse_analysis(&content) {
                Ok(partial) => Attempt::Done(partial),
                Err(err) => {
                    eprintln!("  Warning: watched-directory response was unusable: {}", err);
                    Attempt::Advance
                }
            },
            None => Attempt::Advance,
        }
    }

    /// Tier 3: park the request for a human and defer.
    fn defer(&self, request: &Path, failure: &Failure) -> PartialAnalysis {
        let manual_dir = self.request_dir.join("manual");
        let file_name = request
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "request.json".into());
        let parked = manual_dir.join(file_name);
        if fs::create_dir_all(&manual_dir).is_ok() {
            let _ = fs::rename(request, &parked).or_else(|_| fs::copy(request, &parked).map(|_| ()));
        }
        println!(
            "  Deferred '{}' for manual analysis: {}",
            failure.test_name,
            parked.display()
        );
        PartialAnalysis {
            analysis: Some(format!(
                "Deferred for manual handling; request parked at {}",
                parked.display()
            )),
            confidence: Some(0.0),
            ..Default::default()
        }
    }
}

/// Cancellable wait for a file to appear: bounded by an explicit timeout and
/// poll interval, never an unbounded loop.
pub async fn poll_for_file(path: &Path, timeout: Duration, interval: Duration) -> Option<String> {
    let deadline = Instant::now() + timeout;
    loop {
        if path.exists() {
            if let Ok(content) = fs::read_to_string(path) {
                return Some(content);
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(interval).await;
    }
}

fn slugify(name: &str) -> String {
    let mut slug: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    slug.trim_matches('-').chars().take(64).collect()
}

#[async_trait]
impl AnalysisBackend for IdeBackend {
    fn name(&self) -> &'static str {
        "ide"
    }

    async fn analyze(&self, failure: &Failure, prompt: &str) -> Result<PartialAnalysis> {
        let (request, response) = self.request_paths(failure);
        self.write_request(&request, failure, prompt)?;
        // A stale response from a previous run must not satisfy this one
        let _ = fs::remove_file(&response);

        if let Attempt::Done(partial) = self.try_assistant_exec(&request, &response).await {
            return Ok(partial);
        }
        if let Attempt::Done(partial) = self.try_watched_directory(&response).await {
            return Ok(partial);
        }
        Ok(self.defer(&request, failure))
    }
}
