//! Embedding-based matching of message content against the bot's
//! personality-derived interest tags.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use fennec_llm::{Embedder, cosine_similarity};

/// Similarity at which a tag counts as matched.
const TAG_MATCH_THRESHOLD: f32 = 0.55;

/// Outcome of matching one message against the tag set.
#[derive(Debug, Clone)]
pub struct InterestMatch {
    /// Highest tag similarity.
    pub overall_score: f64,
    pub matched_tags: Vec<String>,
    pub top_tag: Option<String>,
    /// Mean similarity across matched tags; equals `overall_score` when only
    /// one tag matched.
    pub confidence: f64,
}

struct Tag {
    name: String,
    embedding: Vec<f32>,
}

/// Holds the embedded interest tags. Built once at startup from the persona
/// configuration; scoring falls back to a neutral constant when absent.
pub struct SmartInterestMatcher {
    embedder: Arc<dyn Embedder>,
    tags: Vec<Tag>,
}

impl SmartInterestMatcher {
    /// Embed every tag up front so scoring needs a single embed per message.
    pub async fn build(embedder: Arc<dyn Embedder>, tag_names: &[String]) -> Result<Self> {
        let mut tags = Vec::with_capacity(tag_names.len());
        for name in tag_names {
            let embedding = embedder.embed(name).await?;
            tags.push(Tag {
                name: name.clone(),
                embedding,
            });
        }
        debug!(tags = tags.len(), "interest matcher initialized");
        Ok(Self { embedder, tags })
    }

    pub fn is_initialized(&self) -> bool {
        !self.tags.is_empty()
    }

    /// Match `content` (plus optional pre-extracted keywords) against the tag
    /// set. Keywords sharpen the embedding by being appended to the text.
    pub async fn calculate_interest_match(
        &self,
        content: &str,
        keywords: &[String],
    ) -> Result<Option<InterestMatch>> {
        if self.tags.is_empty() || content.is_empty() {
            return Ok(None);
        }

        let text = if keywords.is_empty() {
            content.to_string()
        } else {
            format!("{content}\n{}", keywords.join(" "))
        };
        let embedding = self.embedder.embed(&text).await?;

        let mut overall = 0.0f32;
        let mut top_tag = None;
        let mut matched = Vec::new();
        let mut matched_sims = Vec::new();

        for tag in &self.tags {
            let sim = cosine_similarity(&embedding, &tag.embedding);
            if sim > overall {
                overall = sim;
                top_tag = Some(tag.name.clone());
            }
            if sim >= TAG_MATCH_THRESHOLD {
                matched.push(tag.name.clone());
                matched_sims.push(sim);
            }
        }

        let confidence = if matched_sims.is_empty() {
            f64::from(overall)
        } else {
            f64::from(matched_sims.iter().sum::<f32>()) / matched_sims.len() as f64
        };

        Ok(Some(InterestMatch {
            overall_score: f64::from(overall),
            matched_tags: matched,
            top_tag,
            confidence,
        }))
    }
}
