//! Direct Gemini API client.

use crate::util::truncate;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const GEMINI_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Rate limit retry configuration.
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;
const BACKOFF_MULTIPLIER: u64 = 2;

pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
}

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct PromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
        }
    }

    /// One generateContent call, with exponential backoff on rate limits.
    pub async fn generate(&self, model: &str, prompt: &str) -> Result<String> {
        let url = format!("{GEMINI_URL}/{model}:generateContent");
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
        };

        let mut retry_count = 0;
        loop {
            let response = self
                .http
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&request)
                .send()
                .await?;

            let status = response.status();
            let text = response.text().await?;

            if status.is_success() {
                let parsed: GenerateResponse = serde_json::from_str(&text).map_err(|e| {
                    anyhow!(
                        "failed to parse Gemini response: {e}\n{}",
                        truncate(&text, 400)
                    )
                })?;

                if let Some(reason) = parsed.prompt_feedback.and_then(|f| f.block_reason) {
                    return Err(anyhow!("reply blocked by safety policy: {reason}"));
                }

                let content: String = parsed
                    .candidates
                    .into_iter()
                    .next()
                    .and_then(|c| c.content)
                    .map(|c| c.parts.into_iter().map(|p| p.text).collect())
                    .unwrap_or_default();
                return Ok(content);
            }

            if status.as_u16() == 429 && retry_count < MAX_RETRIES {
                retry_count += 1;
                let backoff = INITIAL_BACKOFF_MS * BACKOFF_MULTIPLIER.pow(retry_count - 1);
                eprintln!(
                    "[lx] Gemini rate limited, retrying in {}s (attempt {retry_count}/{MAX_RETRIES})",
                    backoff / 1000
                );
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                continue;
            }

            return Err(match status.as_u16() {
                404 => anyhow!("model not found ({})", truncate(&text, 200)),
                429 => anyhow!(
                    "quota exhausted after {retry_count} retries: {}",
                    truncate(&text, 200)
                ),
                _ => anyhow!("API error {status}: {}", truncate(&text, 200)),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing_joins_parts() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"a"},{"text":"b"}]}}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        let content: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();
        assert_eq!(content, "ab");
    }

    #[test]
    fn test_block_reason_is_surfaced() {
        let raw = r#"{"candidates":[],"promptFeedback":{"blockReason":"SAFETY"}}"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed.prompt_feedback.and_then(|f| f.block_reason).as_deref(),
            Some("SAFETY")
        );
    }
}
