//! Deterministic stand-ins for [`LlmClient`] and [`Embedder`].
//!
//! Every subsystem that talks to a model must be testable without one; these
//! stubs return prepared rows and hash-derived vectors so assertions stay
//! byte-stable across runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{Embedder, GenParams, LlmClient, LlmError, ModelSelector, Usage};

/// Canned-response client.
///
/// Responses can be queued globally or per `request_type`; per-type queues
/// win. When everything is drained the default response is returned.
#[derive(Default)]
pub struct StubLlm {
    default_response: String,
    queue: Mutex<VecDeque<String>>,
    by_request_type: Mutex<HashMap<String, VecDeque<String>>>,
    calls: Mutex<Vec<(ModelSelector, String, String)>>,
}

impl StubLlm {
    pub fn new(default_response: impl Into<String>) -> Self {
        Self {
            default_response: default_response.into(),
            ..Self::default()
        }
    }

    pub fn push(&self, response: impl Into<String>) -> &Self {
        self.queue.lock().unwrap().push_back(response.into());
        self
    }

    pub fn push_for(&self, request_type: impl Into<String>, response: impl Into<String>) -> &Self {
        self.by_request_type
            .lock()
            .unwrap()
            .entry(request_type.into())
            .or_default()
            .push_back(response.into());
        self
    }

    /// `(selector, request_type, prompt)` per call, in order.
    pub fn calls(&self) -> Vec<(ModelSelector, String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for StubLlm {
    async fn generate(
        &self,
        prompt: &str,
        selector: ModelSelector,
        params: GenParams,
    ) -> Result<(String, Usage), LlmError> {
        self.calls
            .lock()
            .unwrap()
            .push((selector, params.request_type.clone(), prompt.to_string()));

        let typed = self
            .by_request_type
            .lock()
            .unwrap()
            .get_mut(&params.request_type)
            .and_then(VecDeque::pop_front);
        let response = typed
            .or_else(|| self.queue.lock().unwrap().pop_front())
            .unwrap_or_else(|| self.default_response.clone());

        Ok((response, Usage::default()))
    }
}

/// Client that fails every call; used to exercise fail-open and fail-closed
/// paths.
pub struct FailingLlm;

#[async_trait]
impl LlmClient for FailingLlm {
    async fn generate(
        &self,
        _prompt: &str,
        _selector: ModelSelector,
        _params: GenParams,
    ) -> Result<(String, Usage), LlmError> {
        Err(LlmError::Transient("stub llm is configured to fail".into()))
    }
}

/// Bag-of-character-ngrams embedder.
///
/// Texts sharing characters and bigrams land on overlapping dimensions, so
/// cosine similarity loosely tracks lexical overlap, which is enough for
/// retrieval ordering tests while staying fully deterministic.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(768)
    }
}

fn bucket(feature: &str, dimension: usize) -> usize {
    // FNV-1a; stable across platforms, unlike the std hasher.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in feature.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash % dimension as u64) as usize
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let mut vector = vec![0.0f32; self.dimension];
        let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();

        for ch in &chars {
            vector[bucket(&ch.to_string(), self.dimension)] += 1.0;
        }
        for pair in chars.windows(2) {
            let feature: String = pair.iter().collect();
            vector[bucket(&feature, self.dimension)] += 1.0;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
