//! Analysis gateway
//!
//! Drives a backend over a set of failures in fixed-size batches. Calls
//! inside a batch run concurrently and the batch is awaited as a whole;
//! batches run strictly sequentially to bound backend load. Every call
//! carries its own timeout, and a failed or expired call degrades only that
//! failure's result to confidence 0 — the batch always completes.

use super::{AnalysisBackend, AnalysisResult, FailureAnalysis};
use crate::config::RemediationConfig;
use crate::context::Failure;
use crate::prompts;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub struct Gateway {
    backend: Arc<dyn AnalysisBackend>,
    batch_size: usize,
    call_timeout: Duration,
    repo_root: PathBuf,
}

impl Gateway {
    pub fn new(
        backend: Arc<dyn AnalysisBackend>,
        config: &RemediationConfig,
        repo_root: &Path,
    ) -> Self {
        Self {
            backend,
            batch_size: config.batch_size.max(1),
            call_timeout: config.call_timeout(),
            repo_root: repo_root.to_path_buf(),
        }
    }

    /// Analyze every failure, returning exactly one explicitly paired
    /// result per input failure, in input order.
    pub async fn analyze_failures(&self, failures: Vec<Failure>) -> Vec<FailureAnalysis> {
        let total = failures.len();
        let batch_count = total.div_ceil(self.batch_size);
        let mut analyses = Vec::with_capacity(total);

        let mut remaining = failures.into_iter();
        for batch_index in 0..batch_count {
            let batch: Vec<Failure> = remaining.by_ref().take(self.batch_size).collect();
            println!(
                "  Analyzing batch {}/{} ({} failure{}) via {}",
                batch_index + 1,
                batch_count,
                batch.len(),
                if batch.len() == 1 { "" } else { "s" },
                self.backend.name()
            );

            let calls: Vec<_> = batch
                .into_iter()
                .map(|failure| self.analyze_one(failure))
                .collect();
            analyses.extend(join_all(calls).await);
        }

        analyses
    }

    async fn analyze_one(&self, failure: Failure) -> FailureAnalysis {
        let prompt = prompts::compose_failure_prompt(&failure, &self.repo_root);

        let result = match tokio::time::timeout(
            self.call_timeout,
            self.backend.analyze(&failure, &prompt),
        )
        .await
        {
            Ok(Ok(partial)) => partial.into_result(&failure),
            Ok(Err(err)) => {
                eprintln!(
                    "  Warning: analysis of '{}' failed: {}",
                    failure.test_name, err
                );
                AnalysisResult::degraded(format!("Analysis failed: {}", err))
            }
            Err(_) => {
                eprintln!(
                    "  Warning: analysis of '{}' timed out after {}s",
                    failure.test_name,
                    self.call_timeout.as_secs()
                );
                AnalysisResult::degraded(format!(
                    "Analysis timed out after {}s",
                    self.call_timeout.as_secs()
                ))
            }
        };

        println!(
            "    {} -> confidence {:.2}",
            failure.test_name, result.confidence
        );
        FailureAnalysis { failure, result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PartialAnalysis;
    use crate::context::fixtures::sample_failure;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted backend that records batch shapes via active-call tracking.
    struct StubBackend {
        active: Mutex<usize>,
        batch_sizes: Mutex<Vec<usize>>,
        fail_for: Option<String>,
        delay: Duration,
    }

    impl StubBackend {
        fn new(delay: Duration) -> Self {
            Self {
                active: Mutex::new(0),
                batch_sizes: Mutex::new(Vec::new()),
                fail_for: None,
                delay,
            }
        }
    }

    #[async_trait]
    impl AnalysisBackend for StubBackend {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn analyze(&self, failure: &Failure, _prompt: &str) -> Result<PartialAnalysis> {
            {
                let mut active = self.active.lock().unwrap();
                let mut sizes = self.batch_sizes.lock().unwrap();
                if *active == 0 {
                    sizes.push(0);
                }
                *active += 1;
                if let Some(last) = sizes.last_mut() {
                    *last += 1;
                }
            }

            tokio::time::sleep(self.delay).await;

            *self.active.lock().unwrap() -= 1;

            if self.fail_for.as_deref() == Some(failure.test_name.as_str()) {
                return Err(anyhow::anyhow!("simulated backend outage"));
            }

            Ok(PartialAnalysis {
                analysis: Some(format!("analysis for {}", failure.test_name)),
                confidence: Some(0.9),
                ..Default::default()
            })
        }
    }

    fn failures(n: usize) -> Vec<Failure> {
        (0..n)
            .map(|i| {
                let mut failure = sample_failure();
                failure.test_name = format!("test-{}", i);
                failure
            })
            .collect()
    }

    fn gateway_with(backend: Arc<dyn AnalysisBackend>, batch_size: usize) -> Gateway {
        let dir = std::env::temp_dir();
        let config = RemediationConfig {
            batch_size,
            call_timeout_secs: 5,
            ..Default::default()
        };
        Gateway::new(backend, &config, &dir)
    }

    #[tokio::test]
    async fn test_seven_failures_make_batches_of_3_3_1() {
        let backend = Arc::new(StubBackend::new(Duration::from_millis(100)));
        let gateway = gateway_with(backend.clone(), 3);

        let analyses = gateway.analyze_failures(failures(7)).await;
        assert_eq!(analyses.len(), 7);
        assert_eq!(*backend.batch_sizes.lock().unwrap(), vec![3, 3, 1]);
    }

    #[tokio::test]
    async fn test_results_pair_with_their_failures() {
        let backend = Arc::new(StubBackend::new(Duration::from_millis(10)));
        let gateway = gateway_with(backend, 3);

        let analyses = gateway.analyze_failures(failures(7)).await;
        for analysis in &analyses {
            assert_eq!(
                analysis.result.analysis,
                format!("analysis for {}", analysis.failure.test_name)
            );
        }
    }

    #[tokio::test]
    async fn test_one_failed_call_degrades_only_that_failure() {
        let mut stub = StubBackend::new(Duration::from_millis(10));
        stub.fail_for = Some("test-1".to_string());
        let gateway = gateway_with(Arc::new(stub), 3);

        let analyses = gateway.analyze_failures(failures(3)).await;
        assert_eq!(analyses.len(), 3);

        let degraded = analyses
            .iter()
            .find(|a| a.failure.test_name == "test-1")
            .unwrap();
        assert_eq!(degraded.result.confidence, 0.0);

        let healthy = analyses
            .iter()
            .filter(|a| a.result.confidence > 0.0)
            .count();
        assert_eq!(healthy, 2);
    }

    #[tokio::test]
    async fn test_call_timeout_degrades_to_confidence_zero() {
        let backend = Arc::new(StubBackend::new(Duration::from_secs(3)));
        let dir = std::env::temp_dir();
        let config = RemediationConfig {
            batch_size: 2,
            call_timeout_secs: 1,
            ..Default::default()
        };
        let gateway = Gateway::new(backend, &config, &dir);

        let analyses = gateway.analyze_failures(failures(2)).await;
        assert!(analyses.iter().all(|a| a.result.confidence == 0.0));
        assert!(analyses[0].result.analysis.contains("timed out"));
    }
}
