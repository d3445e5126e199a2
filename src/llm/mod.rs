//! LLM provider adapters.
//!
//! The synthesizer needs exactly one operation, `generate(model, prompt)
//! -> text`. Two providers implement it: the direct Gemini API and a local
//! command invoked with an argv template.

mod command;
mod gemini;

use crate::config::Config;
use anyhow::{bail, Result};
use std::time::Duration;

pub use command::CommandClient;
pub use gemini::GeminiClient;

pub enum LlmClient {
    Gemini(GeminiClient),
    Command(CommandClient),
}

impl LlmClient {
    /// Build the provider named by the configuration. An unset provider
    /// defaults to gemini.
    pub fn new(cfg: &Config) -> Result<Self> {
        if cfg.model.trim().is_empty() {
            bail!("empty model");
        }
        let provider = cfg.provider.trim().to_lowercase();
        let provider = if provider.is_empty() {
            "gemini".to_string()
        } else {
            provider
        };

        match provider.as_str() {
            "gemini" => {
                if cfg.api_key.trim().is_empty() {
                    bail!("empty api_key");
                }
                Ok(Self::Gemini(GeminiClient::new(
                    cfg.api_key.trim().to_string(),
                )))
            }
            "command" => {
                if cfg.bin_path.trim().is_empty() {
                    bail!("empty bin_path (required for the command provider)");
                }
                Ok(Self::Command(CommandClient::new(
                    cfg.bin_path.clone(),
                    cfg.args.clone(),
                )))
            }
            other => bail!("unsupported provider: {other}"),
        }
    }

    /// Generate text under a deadline. A timeout surfaces as a distinct
    /// "timeout reached" error so `diagnose` can categorize it.
    pub async fn generate(&self, model: &str, prompt: &str, timeout: Duration) -> Result<String> {
        match self {
            Self::Gemini(client) => {
                match tokio::time::timeout(timeout, client.generate(model, prompt)).await {
                    Ok(result) => result,
                    Err(_) => bail!("timeout reached ({timeout:?})"),
                }
            }
            Self::Command(client) => client.generate(model, prompt, timeout).await,
        }
    }
}

/// Map a generation failure to a short actionable message. Other targets
/// keep going; this is for the per-target report only.
pub fn diagnose(err: &anyhow::Error) -> String {
    let msg = format!("{err:#}");
    if msg.contains("timeout reached") {
        format!("timeout: the operation exceeded the time limit ({msg})")
    } else if msg.contains("API_KEY_INVALID") || msg.contains("API key not valid") {
        "the API key is incorrect; double-check api_key in lx-config.yaml".to_string()
    } else if msg.contains("quota") || msg.contains("RESOURCE_EXHAUSTED") {
        "the API quota is exhausted; try again later or check your billing".to_string()
    } else if msg.contains("model not found") {
        "the configured model could not be found; verify the model name".to_string()
    } else if msg.to_lowercase().contains("safety") {
        "the reply was blocked by a safety policy; adjust the prompt".to_string()
    } else if msg.contains("connection") || msg.contains("dns") || msg.contains("timed out") {
        "the network connection is unstable; check your internet connection".to_string()
    } else {
        format!("unexpected error: {msg}")
    }
}
