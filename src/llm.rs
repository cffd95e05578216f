use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Opaque text-generation capability: given a prompt, return text.
///
/// Output is untrusted. Callers must pass it through extraction, repair and
/// validation before using it as SQL.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Fails with [`PipelineError::LlmConnectivity`] when the service cannot
    /// be reached, and [`PipelineError::Llm`] for every other failure.
    async fn generate(&self, prompt: &str) -> Result<String>;
}

pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl LlmClient {
    pub fn new(api_key: String) -> Result<Self> {
        Self::from_config(&PipelineConfig {
            api_key: Some(api_key),
            ..PipelineConfig::default()
        })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| PipelineError::Config("ANTHROPIC_API_KEY environment variable not set".to_string()))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Llm(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn call_llm(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": [
                {"role": "user", "content": prompt}
            ]
        });

        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(PipelineError::Llm(format!(
                "LLM API returned {}: {}",
                status, detail
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        let text = response_json["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|block| block["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .filter(|text| !text.is_empty())
            .ok_or_else(|| PipelineError::Llm("No content in LLM response".to_string()))?;

        debug!(model = %self.model, chars = text.len(), "LLM call completed");
        Ok(text)
    }
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.call_llm(prompt).await
    }
}

fn classify_transport_error(error: reqwest::Error) -> PipelineError {
    if error.is_connect() || error.is_timeout() {
        PipelineError::LlmConnectivity(format!(
            "Network error connecting to LLM API: {}",
            error
        ))
    } else {
        PipelineError::Llm(format!("LLM API call failed: {}", error))
    }
}
