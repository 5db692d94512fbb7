//! The memory engine facade: build → fuse → store → retrieve → forget.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use fennec_config::MemoryConfig;
use fennec_llm::{Embedder, GenParams, LlmClient, ModelSelector, extract_json_payload};
use fennec_store::WhereFilter;

use crate::builder::{BuildContext, MemoryBuilder};
use crate::chunk::MemoryChunk;
use crate::forgetting::{ForgettingEngine, ForgettingReport};
use crate::fusion::FusionEngine;
use crate::index::IndexQuery;
use crate::query::{MemoryQueryPlanner, QueryPlan};
use crate::storage::{MEMORY_COLLECTION, MemoryStorage};

/// Value score assumed when the assessment reply cannot be parsed.
const NEUTRAL_VALUE_SCORE: f64 = 0.5;

/// Outcome of one `process_conversation` call. The pipeline fails open:
/// `success: false` plus an error string, never a propagated panic into chat.
#[derive(Debug, Clone)]
pub struct ProcessReport {
    pub success: bool,
    pub created_memories: Vec<MemoryChunk>,
    pub memory_count: usize,
    pub processing_time_ms: u64,
    pub status: &'static str,
    pub error: Option<String>,
}

pub struct MemorySystem {
    config: MemoryConfig,
    builder: MemoryBuilder,
    fusion: FusionEngine,
    forgetting: ForgettingEngine,
    storage: MemoryStorage,
    planner: Option<MemoryQueryPlanner>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LlmClient>,
    last_build_times: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemorySystem {
    pub fn new(
        config: MemoryConfig,
        storage: MemoryStorage,
        llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let planner = config
            .enable_query_planner
            .then(|| MemoryQueryPlanner::new(Arc::clone(&llm), config.final_result_limit));

        Self {
            builder: MemoryBuilder::new(config.clone(), Arc::clone(&llm)),
            fusion: FusionEngine::new(&config),
            forgetting: ForgettingEngine::new(&config),
            storage,
            planner,
            embedder,
            llm,
            last_build_times: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn storage(&self) -> &MemoryStorage {
        &self.storage
    }

    /// Build and persist memories from one conversation excerpt.
    pub async fn process_conversation(
        &self,
        text: &str,
        context: &BuildContext,
        timestamp: Option<DateTime<Utc>>,
    ) -> ProcessReport {
        let started = Instant::now();
        let timestamp = timestamp.unwrap_or_else(Utc::now);

        match self.build_inner(text, context, timestamp).await {
            Ok(created) => ProcessReport {
                success: true,
                memory_count: created.len(),
                created_memories: created,
                processing_time_ms: started.elapsed().as_millis() as u64,
                status: "ready",
                error: None,
            },
            Err(err) => {
                warn!(%err, "memory build failed open");
                ProcessReport {
                    success: false,
                    created_memories: Vec::new(),
                    memory_count: 0,
                    processing_time_ms: started.elapsed().as_millis() as u64,
                    status: "error",
                    error: Some(err.to_string()),
                }
            }
        }
    }

    async fn build_inner(
        &self,
        text: &str,
        context: &BuildContext,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<MemoryChunk>> {
        // Throttle per scope: stream beats chat beats user.
        let scope_key = context
            .stream_id
            .clone()
            .or_else(|| context.chat_id.clone())
            .unwrap_or_else(|| context.user_id.clone());

        if !self.claim_build_slot(&scope_key) {
            debug!(scope_key, "memory build throttled");
            return Ok(Vec::new());
        }

        let result = self.build_after_claim(text, context, timestamp).await;
        if result.is_err() {
            // A failed build should not eat the scope's next slot.
            self.last_build_times.lock().unwrap().remove(&scope_key);
        }
        result
    }

    async fn build_after_claim(
        &self,
        text: &str,
        context: &BuildContext,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<MemoryChunk>> {
        // Enriched history from the stream layer supersedes the raw excerpt.
        let text = context.history_text.as_deref().unwrap_or(text);

        let value_score = self.assess_information_value(text, context).await;
        if value_score < self.config.memory_value_threshold {
            info!(value_score, "conversation below memory value threshold");
            return Ok(Vec::new());
        }

        let mut chunks = self.builder.build_memories(text, context, timestamp).await;
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        for chunk in &mut chunks {
            chunk.embedding = self
                .embedder
                .embed(&chunk.display)
                .await
                .context("embedding memory chunk")?;
        }

        // Identical facts already stored make re-processing a no-op.
        chunks.retain(|chunk| !self.storage.has_semantic_duplicate(chunk));
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let existing = self.storage.get_by_user(&context.user_id).await?;
        let fused = self.fusion.fuse(chunks, &existing);
        if fused.is_empty() {
            return Ok(Vec::new());
        }

        self.storage.store_chunks(&fused).await?;
        info!(count = fused.len(), user_id = %context.user_id, "memories stored");
        Ok(fused)
    }

    fn claim_build_slot(&self, scope_key: &str) -> bool {
        let min_interval = chrono::Duration::seconds(self.config.memory_build_interval_secs as i64);
        let mut times = self.last_build_times.lock().unwrap();
        let now = Utc::now();
        if let Some(last) = times.get(scope_key) {
            if now - *last < min_interval {
                return false;
            }
        }
        times.insert(scope_key.to_string(), now);
        true
    }

    async fn assess_information_value(&self, text: &str, context: &BuildContext) -> f64 {
        #[derive(Deserialize)]
        struct Assessment {
            value_score: f64,
        }

        let prompt = format!(
            "请评估以下对话内容的信息价值（0.0-1.0），重点识别个人事实、事件、偏好、观点等。\n\n\
             对话内容：\n{text}\n\n\
             用户ID: {user}\n\n\
             评分指导：0.9-1.0 核心个人信息；0.7-0.8 重要事实/观点/事件；\
             0.5-0.6 一般偏好与日常；0.3-0.4 临时状态；0.0-0.2 寒暄与重复。\n\n\
             请以JSON格式输出：\n\
             {{\"value_score\": 0.0, \"reasoning\": \"...\", \"key_factors\": [], \"detected_types\": []}}",
            user = context.user_id,
        );
        let params = GenParams::for_request("memory.assess")
            .temperature(0.3)
            .max_tokens(300);

        match self.llm.generate(&prompt, ModelSelector::Utils, params).await {
            Ok((response, _)) => extract_json_payload(&response)
                .and_then(|payload| serde_json::from_str::<Assessment>(payload).ok())
                .map(|a| a.value_score.clamp(0.0, 1.0))
                .unwrap_or_else(|| {
                    warn!("value assessment reply unparseable, assuming neutral");
                    NEUTRAL_VALUE_SCORE
                }),
            Err(err) => {
                warn!(%err, "value assessment failed, assuming neutral");
                NEUTRAL_VALUE_SCORE
            }
        }
    }

    /// Multi-stage retrieval: plan → metadata coarse filter → vector fine
    /// filter → rank and record accesses.
    pub async fn retrieve_relevant(
        &self,
        query_text: &str,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MemoryChunk>> {
        let plan = match &self.planner {
            Some(planner) => planner.plan_query(query_text).await,
            None => QueryPlan::identity(query_text, limit),
        };

        // Stage 2: coarse filter, only when the plan constrains anything.
        let (created_after, created_before) = plan.recency.window(Utc::now());
        let index_query = IndexQuery {
            memory_types: plan.memory_types.clone(),
            subjects: plan.subject_includes.clone(),
            keywords: plan.required_keywords.clone(),
            tags: Vec::new(),
            user_id: user_id.map(str::to_string),
            created_after,
            created_before,
            limit: Some(self.config.metadata_filter_limit.max(limit * 2)),
        };

        let candidate_ids = if index_query.has_constraints() {
            let ids = self.storage.index().search_flexible(&index_query);
            if ids.is_empty() {
                debug!("coarse filter produced no candidates, skipping vector search");
                return Ok(Vec::new());
            }
            Some(ids)
        } else {
            None
        };

        // Stage 3: vector fine filter.
        let query_embedding = self
            .embedder
            .embed(&plan.semantic_query)
            .await
            .context("embedding retrieval query")?;

        let mut filter = WhereFilter::new();
        if let Some(user_id) = user_id {
            filter = filter.eq("user_id", user_id);
        }
        if let Some(ids) = &candidate_ids {
            filter = filter.any_of("memory_id", ids.iter().map(|id| json!(id)).collect());
        }
        let filter = (!filter.is_empty()).then_some(filter);

        let matches = self
            .storage
            .vector()
            .query(
                MEMORY_COLLECTION,
                &query_embedding,
                limit.max(self.config.final_result_limit),
                filter.as_ref(),
            )
            .await?;

        let threshold = self.config.vector_similarity_threshold;
        let mut chunks: Vec<MemoryChunk> = matches
            .iter()
            .filter(|m| f64::from(m.similarity) >= threshold)
            .filter_map(|m| MemoryChunk::from_vector_record(&m.record))
            .collect();

        // Stage 4: re-rank; when every score is zero fall back to recency.
        let mut scored: Vec<(f64, MemoryChunk)> = chunks
            .drain(..)
            .map(|chunk| {
                let score = compute_memory_score(query_text, &chunk, &plan.required_keywords);
                (score, chunk)
            })
            .collect();

        if scored.iter().all(|(score, _)| *score == 0.0) {
            scored.sort_by(|a, b| b.1.last_accessed.cmp(&a.1.last_accessed));
        } else {
            scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        }

        let now = Utc::now();
        let top: Vec<MemoryChunk> = scored
            .into_iter()
            .take(limit)
            .map(|(score, mut chunk)| {
                chunk.relevance_score = score;
                chunk.mark_accessed(now);
                self.storage.index().touch(&chunk.memory_id, now);
                chunk
            })
            .collect();

        if let Err(err) = self.storage.index().save() {
            warn!(%err, "failed to persist access bookkeeping");
        }

        debug!(results = top.len(), query = query_text, "memories retrieved");
        Ok(top)
    }

    /// Periodic maintenance: evaluate and delete forgettable memories.
    pub async fn run_forgetting(&self) -> Result<ForgettingReport> {
        if !self.config.enable_memory_forgetting {
            return Ok(ForgettingReport::default());
        }

        let records = self
            .storage
            .vector()
            .get(MEMORY_COLLECTION, None, None)
            .await?;
        let chunks: Vec<MemoryChunk> = records
            .iter()
            .filter_map(MemoryChunk::from_vector_record)
            .collect();

        let report = self.forgetting.evaluate(&chunks, Utc::now());
        let ids = report.all_ids();
        if !ids.is_empty() {
            let removed = self.storage.delete(&ids).await?;
            info!(removed, "forgotten memories deleted");
        }
        Ok(report)
    }
}

/// Final relevance: token Jaccard (70%), keyword overlap (15%), importance
/// bump (≤0.1), confidence bump (≤0.05).
fn compute_memory_score(query_text: &str, chunk: &MemoryChunk, context_keywords: &[String]) -> f64 {
    let query_tokens = tokenize(query_text);
    let memory_tokens = tokenize(&chunk.display);

    let base = if !query_tokens.is_empty() && !memory_tokens.is_empty() {
        let intersection = query_tokens.intersection(&memory_tokens).count() as f64;
        let union = query_tokens.union(&memory_tokens).count() as f64;
        intersection / union
    } else {
        0.0
    };

    let keyword_overlap = if context_keywords.is_empty() {
        0.0
    } else {
        let memory_keywords: std::collections::HashSet<String> =
            chunk.keywords.iter().map(|k| k.to_lowercase()).collect();
        let hits = context_keywords
            .iter()
            .filter(|k| memory_keywords.contains(&k.to_lowercase()))
            .count() as f64;
        hits / context_keywords.len() as f64
    };

    let importance_boost = (f64::from(chunk.importance.value()) - 1.0) / 3.0 * 0.1;
    let confidence_boost = (f64::from(chunk.confidence.value()) - 1.0) / 3.0 * 0.05;

    (base * 0.7 + keyword_overlap * 0.15 + importance_boost + confidence_boost).clamp(0.0, 1.0)
}

/// CJK-aware tokenizer: alphanumeric/han runs longer than one char, plus the
/// individual han characters so short Chinese phrases still overlap.
fn tokenize(text: &str) -> std::collections::HashSet<String> {
    let mut tokens = std::collections::HashSet::new();
    let mut current = String::new();

    for ch in text.to_lowercase().chars() {
        if ch.is_alphanumeric() {
            current.push(ch);
            if is_han(ch) {
                tokens.insert(ch.to_string());
            }
        } else if !current.is_empty() {
            if current.chars().count() > 1 {
                tokens.insert(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
    }
    if current.chars().count() > 1 {
        tokens.insert(current);
    }
    tokens
}

fn is_han(ch: char) -> bool {
    ('\u{4e00}'..='\u{9fa5}').contains(&ch)
}
