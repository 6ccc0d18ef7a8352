//! Configuration for a remediation run
//!
//! Settings load from `.testmend/config.json` in the target repository,
//! falling back to the user config directory. CLI flags override both.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which analysis backend answers "why did this test fail and how do I fix it".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Hosted chat-completion API (synchronous request/response)
    #[default]
    Api,
    /// IDE-integrated assistant with file-handshake fallback tiers
    Ide,
    /// Print the prompt and wait for manually pasted JSON
    Interactive,
}

impl BackendKind {
    pub fn label(&self) -> &'static str {
        match self {
            BackendKind::Api => "hosted API",
            BackendKind::Ide => "IDE assistant",
            BackendKind::Interactive => "interactive",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationConfig {
    /// Backend used for failure analysis
    #[serde(default)]
    pub backend: BackendKind,
    /// Model identifier passed to the hosted backend
    #[serde(default = "default_model")]
    pub model: String,
    /// Per-analysis-call timeout in seconds
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Failures analyzed per batch; batches run strictly sequentially
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Minimum confidence for a proposed fix to be applied
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Log every edit but never write to disk
    #[serde(default)]
    pub dry_run: bool,
    /// Copy each file aside before its first mutation
    #[serde(default = "default_true")]
    pub backup_enabled: bool,
    /// Restore all touched files if the re-run still fails
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,
    /// Where remediation reports are written
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,
    /// Open a pull request after a fully green verification run
    #[serde(default)]
    pub create_pr: bool,

    /// Test runner command; defaults to the Playwright CLI when absent
    #[serde(default)]
    pub test_command: Option<String>,
    /// Where the runner writes its JSON report
    #[serde(default = "default_report_path")]
    pub test_report_path: PathBuf,
    /// Hard timeout for one full test-suite run, in seconds
    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,

    /// Directory for IDE-fallback request/response documents
    #[serde(default = "default_request_dir")]
    pub request_dir: PathBuf,
    /// External assistant executable for the IDE backend's first tier
    #[serde(default)]
    pub assistant_bin: Option<String>,
    /// Poll interval while waiting for an externally produced response
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4".to_string()
}

fn default_call_timeout_secs() -> u64 {
    120
}

fn default_batch_size() -> usize {
    3
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_true() -> bool {
    true
}

fn default_report_dir() -> PathBuf {
    PathBuf::from(".testmend/reports")
}

fn default_report_path() -> PathBuf {
    PathBuf::from("test-results/report.json")
}

fn default_test_timeout_secs() -> u64 {
    600
}

fn default_request_dir() -> PathBuf {
    PathBuf::from(".testmend/requests")
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            model: default_model(),
            call_timeout_secs: default_call_timeout_secs(),
            batch_size: default_batch_size(),
            confidence_threshold: default_confidence_threshold(),
            dry_run: false,
            backup_enabled: true,
            rollback_on_failure: true,
            report_dir: default_report_dir(),
            create_pr: false,
            test_command: None,
            test_report_path: default_report_path(),
            test_timeout_secs: default_test_timeout_secs(),
            request_dir: default_request_dir(),
            assistant_bin: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl RemediationConfig {
    /// Load config for a repository, or return defaults.
    ///
    /// Repo-local `.testmend/config.json` wins over the user config
    /// directory. A corrupt file is preserved with a `.corrupt` extension
    /// and defaults are used, so a bad edit never blocks a run.
    pub fn load(repo_root: &Path) -> Self {
        let candidates = [
            Some(repo_root.join(".testmend").join("config.json")),
            user_config_path(),
        ];

        for path in candidates.into_iter().flatten() {
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            match serde_json::from_str(&content) {
                Ok(config) => return config,
                Err(err) => {
                    preserve_corrupt_config(&path, &content);
                    eprintln!(
                        "  Warning: Config file {} was corrupted ({}). A backup was saved and defaults were loaded.",
                        path.display(),
                        err
                    );
                }
            }
        }
        Self::default()
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(50))
    }

    /// Hosted-backend API key. Environment only; never persisted to disk.
    pub fn api_key(&self) -> Option<String> {
        std::env::var("OPENROUTER_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("testmend").join("config.json"))
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}
