//! Hosted-API backend
//!
//! Synchronous request/response against an OpenRouter-style chat-completion
//! endpoint. Rate limits retry with exponential backoff; other failures map
//! to actionable messages and surface as per-call backend errors.

use super::{parse, AnalysisBackend, PartialAnalysis};
use crate::config::RemediationConfig;
use crate::context::Failure;
use crate::prompts::ANALYSIS_SYSTEM;
use crate::util::truncate;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const MAX_COMPLETION_TOKENS: u32 = 4096;

/// Rate limit retry configuration
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_SECS: u64 = 2;
const BACKOFF_MULTIPLIER: u64 = 2;

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    stream: bool,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: String,
}

pub struct HostedApiBackend {
    model: String,
    timeout: Duration,
    api_key: Option<String>,
}

impl HostedApiBackend {
    pub fn new(config: &RemediationConfig) -> Self {
        Self {
            model: config.model.clone(),
            timeout: config.call_timeout(),
            api_key: config.api_key(),
        }
    }

    async fn call(&self, system: &str, user: &str) -> Result<String> {
        let api_key = self.api_key.clone().ok_or_else(|| {
            anyhow::anyhow!("No API key configured. Set OPENROUTER_API_KEY to use the hosted backend.")
        })?;

        let client = reqwest::Client::builder().timeout(self.timeout).build()?;

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            max_tokens: MAX_COMPLETION_TOKENS,
            stream: false,
            response_format: ResponseFormat {
                format_type: "json_object".to_string(),
            },
        };

        let mut retry_count = 0;

        loop {
            let response = client
                .post(API_URL)
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {}", api_key))
                .json(&request)
                .send()
                .await?;

            let status = response.status();
            let text = response.text().await?;

            if status.is_success() {
                let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
                    anyhow::anyhow!("Failed to parse backend response: {}\n{}", e, truncate(&text, 400))
                })?;

                return Ok(parsed
                    .choices
                    .first()
                    .map(|c| c.message.content.clone())
                    .unwrap_or_default());
            }

            if status.as_u16() == 429 && retry_count < MAX_RETRIES {
                retry_count += 1;
                let retry_after = parse_retry_after(&text).unwrap_or_else(|| {
                    INITIAL_BACKOFF_SECS * BACKOFF_MULTIPLIER.pow(retry_count - 1)
                });
                eprintln!(
                    "  Backend rate limited. Retrying in {}s (attempt {}/{})",
                    retry_after, retry_count, MAX_RETRIES
                );
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                continue;
            }

            let error_msg = match status.as_u16() {
                401 => "Invalid API key. Check OPENROUTER_API_KEY.".to_string(),
                429 => format!(
                    "Rate limited by the analysis backend after {} retries. Try again in a few minutes.",
                    retry_count
                ),
                500..=599 => format!(
                    "Analysis backend server error ({}). The service may be temporarily unavailable.",
                    status
                ),
                _ => format!("API error {}: {}", status, truncate(&text, 200)),
            };
            return Err(anyhow::anyhow!("{}", error_msg));
        }
    }
}

/// Extract a retry-after hint from a rate-limit response body, if present.
fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    if let Some(pos) = text_lower.find("retry") {
        let after_retry = &text_lower[pos..];
        for word in after_retry.split_whitespace().skip(1).take(5) {
            if let Ok(secs) = word
                .trim_matches(|c: char| !c.is_numeric())
                .parse::<u64>()
            {
                if secs > 0 && secs < 300 {
                    return Some(secs);
                }
            }
        }
    }
    None
}

#[async_trait]
impl AnalysisBackend for HostedApiBackend {
    fn name(&self) -> &'static str {
        "hosted-api"
    }

    async fn analyze(&self, _failure: &Failure, prompt: &str) -> Result<PartialAnalysis> {
        let content = self.call(ANALYSIS_SYSTEM, prompt).await?;
        parse::parse_analysis(&content)
    }
}
