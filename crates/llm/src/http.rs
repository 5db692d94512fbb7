//! OpenAI-compatible HTTP client for generation and embeddings.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::{Embedder, GenParams, LlmClient, LlmError, ModelSelector, Usage};

#[derive(Debug, Clone)]
pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    models: fennec_config::ModelRouting,
}

impl HttpLlmClient {
    pub fn new(config: &fennec_config::LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| LlmError::Transient(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: std::env::var(&config.api_key_env).ok(),
            models: config.models.clone(),
        })
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn post_json(
        &self,
        endpoint: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, LlmError> {
        let url = format!("{}{endpoint}", self.base_url);
        let response = self
            .authorized(self.client.post(&url).json(payload))
            .send()
            .await
            .map_err(|e| LlmError::Transient(format!("{url}: {e}")))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Transient(format!("reading body from {url}: {e}")))?;

        if !status.is_success() {
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: body.to_string(),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate(
        &self,
        prompt: &str,
        selector: ModelSelector,
        params: GenParams,
    ) -> Result<(String, Usage), LlmError> {
        let model = selector.resolve(&self.models);
        let payload = json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "stream": false,
        });

        debug!(model, request_type = %params.request_type, "llm generate");
        let body = self.post_json("/chat/completions", &payload).await?;

        let content = body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| LlmError::Schema(format!("response missing choices[0].message.content: {body}")))?
            .to_string();

        let usage = Usage {
            prompt_tokens: body
                .pointer("/usage/prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
            completion_tokens: body
                .pointer("/usage/completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
        };

        Ok((content, usage))
    }
}

#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    inner: HttpLlmClient,
    model: String,
    dimension: usize,
}

impl HttpEmbedder {
    pub fn new(config: &fennec_config::LlmConfig, dimension: usize) -> Result<Self, LlmError> {
        Ok(Self {
            inner: HttpLlmClient::new(config)?,
            model: config.models.embedding.clone(),
            dimension,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let payload = json!({
            "model": self.model,
            "input": text,
        });

        let body = self.inner.post_json("/embeddings", &payload).await?;
        let vector: Vec<f32> = body
            .pointer("/data/0/embedding")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|x| x.as_f64())
                    .map(|x| x as f32)
                    .collect()
            })
            .ok_or_else(|| LlmError::Schema(format!("response missing data[0].embedding: {body}")))?;

        if vector.len() != self.dimension {
            return Err(LlmError::Schema(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            )));
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
