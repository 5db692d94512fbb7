//! Narrow LLM and embedding interfaces consumed by the core.
//!
//! The core never talks to a provider directly; everything goes through
//! [`LlmClient`] and [`Embedder`], so subsystems are testable against the
//! deterministic stubs in [`testutil`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod http;
mod json;
pub mod retry;
pub mod testutil;

pub use http::{HttpEmbedder, HttpLlmClient};
pub use json::extract_json_payload;

/// Routing name resolved to a concrete model from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSelector {
    Utils,
    AntiInjection,
    VideoAnalysis,
    ScheduleGenerator,
    RelationshipTracker,
    CounterAttack,
    Default,
}

impl ModelSelector {
    /// Resolve the selector against the configured routing table.
    pub fn resolve<'a>(&self, models: &'a fennec_config::ModelRouting) -> &'a str {
        match self {
            Self::Utils => &models.utils,
            Self::AntiInjection => &models.anti_injection,
            Self::VideoAnalysis => &models.video_analysis,
            Self::ScheduleGenerator => &models.schedule_generator,
            Self::RelationshipTracker => &models.relationship_tracker,
            Self::CounterAttack => &models.counter_attack,
            Self::Default => &models.default,
        }
    }
}

/// Per-request generation parameters.
#[derive(Debug, Clone)]
pub struct GenParams {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Free-form label recorded in logs and usage accounting, e.g.
    /// `"anti_injection.detect"`.
    pub request_type: String,
}

impl Default for GenParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1024,
            request_type: "default".to_string(),
        }
    }
}

impl GenParams {
    pub fn for_request(request_type: impl Into<String>) -> Self {
        Self {
            request_type: request_type.into(),
            ..Self::default()
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Token accounting returned with every generation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Network timeouts, 5xx, connection failures; retried with backoff.
    #[error("transient llm failure: {0}")]
    Transient(String),
    /// Provider rejected the request; retrying the same payload is pointless.
    #[error("llm api error (status {status}): {message}")]
    Api { status: u16, message: String },
    /// The model answered but not in the shape we asked for.
    #[error("malformed llm response: {0}")]
    Schema(String),
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            Self::Schema(_) => false,
        }
    }
}

/// Text generation against a selected model.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        selector: ModelSelector,
        params: GenParams,
    ) -> Result<(String, Usage), LlmError>;
}

/// Dense text embedding. Must be idempotent for identical inputs.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;

    fn dimension(&self) -> usize;
}

/// Cosine similarity over two equally-sized vectors; 0.0 when either is a
/// zero vector.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
