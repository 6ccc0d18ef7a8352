use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use testmend::config::{BackendKind, RemediationConfig};
use testmend::orchestrator::Orchestrator;

#[derive(Parser, Debug)]
#[command(
    name = "testmend",
    about = "Automated triage and repair for failing end-to-end test suites",
    version
)]
struct Args {
    /// Path to the repository under test (defaults to current directory)
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Analysis backend
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// Model identifier for the hosted backend
    #[arg(long)]
    model: Option<String>,

    /// Per-analysis-call timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Failing tests analyzed per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Minimum confidence required to apply a proposed fix
    #[arg(long)]
    confidence_threshold: Option<f64>,

    /// Log every edit but write nothing
    #[arg(long)]
    dry_run: bool,

    /// Skip per-file backups (also disables rollback)
    #[arg(long)]
    no_backup: bool,

    /// Keep fixes in place even when verification stays red
    #[arg(long)]
    no_rollback: bool,

    /// Report directory (relative to the repository)
    #[arg(long)]
    report_dir: Option<PathBuf>,

    /// Open a pull request after a green verification run
    #[arg(long)]
    create_pr: bool,

    /// Test runner command, e.g. "npx playwright test"
    #[arg(long)]
    test_command: Option<String>,

    /// Path to the runner's JSON report
    #[arg(long)]
    report: Option<PathBuf>,
}

impl Args {
    fn apply_to(self, config: &mut RemediationConfig) {
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(model) = self.model {
            config.model = model;
        }
        if let Some(timeout) = self.timeout {
            config.call_timeout_secs = timeout;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(threshold) = self.confidence_threshold {
            config.confidence_threshold = threshold.clamp(0.0, 1.0);
        }
        if self.dry_run {
            config.dry_run = true;
        }
        if self.no_backup {
            config.backup_enabled = false;
        }
        if self.no_rollback {
            config.rollback_on_failure = false;
        }
        if let Some(report_dir) = self.report_dir {
            config.report_dir = report_dir;
        }
        if self.create_pr {
            config.create_pr = true;
        }
        if let Some(test_command) = self.test_command {
            config.test_command = Some(test_command);
        }
        if let Some(report) = self.report {
            config.test_report_path = report;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let repo_root = args
        .path
        .canonicalize()
        .with_context(|| format!("Repository path not found: {}", args.path.display()))?;

    let mut config = RemediationConfig::load(&repo_root);
    args.apply_to(&mut config);

    if !config.backup_enabled && config.rollback_on_failure {
        eprintln!("  Warning: backups are disabled, so rollback is unavailable.");
        config.rollback_on_failure = false;
    }

    println!();
    println!(
        "  testmend {} | {} backend | threshold {:.2}{}",
        env!("CARGO_PKG_VERSION"),
        config.backend.label(),
        config.confidence_threshold,
        if config.dry_run { " | dry run" } else { "" }
    );
    println!("  Repository: {}", repo_root.display());
    println!();

    let mut orchestrator = Orchestrator::new(&repo_root, config);
    let (report, outcome) = orchestrator.run().await;

    println!();
    println!("  Outcome: {}", outcome.label());
    println!(
        "  {} failure(s) | {} analyzed | {} fixed | {} patch-failed | {} skipped",
        report.total_failures,
        report.analyzed,
        report.fixes_applied,
        report.fixes_failed,
        report.skipped_low_confidence + report.skipped_no_changes
    );
    if report.rolled_back {
        println!("  All changes were rolled back.");
    }
    println!();

    let code = outcome.exit_code();
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
