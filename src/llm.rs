//! SQL generation through a local language model.
//!
//! [`LlmClient`] is the seam the pipeline depends on; [`OllamaClient`] is
//! the production implementation, calling Ollama's non-streaming
//! `/api/chat` endpoint. Model output is reduced to bare SQL with
//! [`extract_sql`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::guardrails::strip_code_fences;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send one prompt and return the raw completion text.
    async fn generate(&self, prompt: &str) -> Result<String>;
    fn model_name(&self) -> &str;
}

pub struct OllamaClient {
    url: String,
    model: String,
    temperature: f32,
    num_predict: u32,
    system_prompt: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            num_predict: config.num_predict,
            system_prompt: config.system_prompt.clone(),
            client,
        })
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "stream": false,
            "messages": [
                { "role": "system", "content": self.system_prompt },
                { "role": "user", "content": prompt },
            ],
            "options": {
                "temperature": self.temperature,
                "num_predict": self.num_predict,
            },
        });

        let resp = self
            .client
            .post(format!("{}/api/chat", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url,
                    e
                )
            })?;

        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            bail!("Ollama chat API error {}: {}", status, error_text);
        }

        let json: serde_json::Value = resp.json().await?;
        parse_chat_response(&json)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.pointer("/message/content")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Ollama chat response missing message.content"))
}

const SQL_PREFIXES: [&str; 3] = ["SQLQuery:", "SQL:", "Query:"];

/// Reduce a model completion to the SQL it contains: strip code fences
/// and a leading `SQLQuery:` / `SQL:` / `Query:` label.
pub fn extract_sql(text: &str) -> String {
    let mut t = strip_code_fences(text).trim().to_string();
    for prefix in SQL_PREFIXES {
        let matches = t
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix));
        if matches {
            t = t[prefix.len()..].trim().to_string();
        }
    }
    // Labels can also sit inside the fence.
    strip_code_fences(&t).trim().to_string()
}
