//! Interactive backend
//!
//! Last resort when no programmatic backend exists: print the composed
//! prompt to the terminal and block until the operator pastes the analysis
//! JSON. Input is accumulated until it contains one balanced object.

use super::{parse, AnalysisBackend, PartialAnalysis};
use crate::context::Failure;
use anyhow::Result;
use async_trait::async_trait;
use std::io::BufRead;

#[derive(Default)]
pub struct InteractiveBackend;

#[async_trait]
impl AnalysisBackend for InteractiveBackend {
    fn name(&self) -> &'static str {
        "interactive"
    }

    async fn analyze(&self, failure: &Failure, prompt: &str) -> Result<PartialAnalysis> {
        println!();
        println!("  ────────────────────────────────────────────────────────");
        println!("  MANUAL ANALYSIS REQUESTED: {}", failure.test_name);
        println!("  ────────────────────────────────────────────────────────");
        println!();
        println!("{}", prompt);
        println!();
        println!("  Paste the analysis JSON below (finish the object to continue):");

        // Blocking stdin read; the pipeline is idle while a human types.
        let raw = tokio::task::spawn_blocking(read_json_from_stdin).await??;
        parse::parse_analysis(&raw)
    }
}

fn read_json_from_stdin() -> Result<String> {
    let stdin = std::io::stdin();
    let mut accumulated = String::new();

    for line in stdin.lock().lines() {
        let line = line?;
        accumulated.push_str(&line);
        accumulated.push('\n');
        if parse::extract_balanced_object(&accumulated).is_some() {
            return Ok(accumulated);
        }
    }

    if accumulated.trim().is_empty() {
        Err(anyhow::anyhow!("No analysis JSON was provided on stdin"))
    } else {
        Ok(accumulated)
    }
}
