//! Multi-signal interest scoring and the reply decision.
//!
//! ```text
//! total = w_match * interest_match + w_rel * relationship + w_mention * mentioned
//! ```
//! The reply gate then compares `total` against a threshold lowered by
//! mentions and by a fairness boost that grows with consecutive silence, so
//! the bot cannot stay quiet forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use fennec_config::AffinityConfig;
use fennec_types::Message;

use crate::matcher::SmartInterestMatcher;
use crate::relationship::RelationshipStore;

/// Score that fairness boosting can never exceed.
const MAX_FAIRNESS_BOOST: f64 = 0.8;

/// Score attributed when the smart matcher is not initialized.
const FALLBACK_MATCH_SCORE: f64 = 0.3;

/// Multiplier applied to the raw match score before the confidence weight.
const MATCH_SCORE_GAIN: f64 = 1.15;

/// Per-message interest breakdown. Ephemeral; valid for one planner cycle.
#[derive(Debug, Clone)]
pub struct InterestScore {
    pub message_id: String,
    pub interest_match_score: f64,
    pub relationship_score: f64,
    pub mentioned_score: f64,
    pub total_score: f64,
}

/// Canonical reply-decision result: one shape at every call site.
#[derive(Debug, Clone, Copy)]
pub struct ReplyDecision {
    pub should_reply: bool,
    pub score: f64,
    pub effective_threshold: f64,
}

pub struct InterestScorer {
    config: AffinityConfig,
    relationships: RelationshipStore,
    matcher: Option<Arc<SmartInterestMatcher>>,
    /// Consecutive unanswered messages, per stream.
    no_reply_counts: Mutex<HashMap<String, u32>>,
}

impl InterestScorer {
    pub fn new(config: AffinityConfig, relationships: RelationshipStore) -> Self {
        Self {
            config,
            relationships,
            matcher: None,
            no_reply_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_matcher(mut self, matcher: Arc<SmartInterestMatcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    /// Score one user message.
    pub async fn score_message(
        &self,
        message: &Message,
        bot_nickname: &str,
        bot_aliases: &[String],
    ) -> InterestScore {
        let keywords = if message.key_words.is_empty() {
            extract_keywords(&message.processed_plain_text)
        } else {
            message.key_words.clone()
        };

        let interest_match = self
            .interest_match_score(&message.processed_plain_text, &keywords)
            .await;
        let relationship = self
            .relationships
            .score(&message.platform, &message.user_id);
        let mentioned = self.mentioned_score(message, bot_nickname, bot_aliases);

        let total = interest_match * self.config.keyword_match_weight
            + relationship * self.config.relationship_weight
            + mentioned * self.config.mention_bot_weight;

        debug!(
            message_id = %message.message_id,
            interest_match,
            relationship,
            mentioned,
            total,
            "interest score"
        );

        InterestScore {
            message_id: message.message_id.clone(),
            interest_match_score: interest_match,
            relationship_score: relationship,
            mentioned_score: mentioned,
            total_score: total,
        }
    }

    async fn interest_match_score(&self, content: &str, keywords: &[String]) -> f64 {
        if content.is_empty() {
            return 0.0;
        }

        let Some(matcher) = self.matcher.as_ref().filter(|m| m.is_initialized()) else {
            return FALLBACK_MATCH_SCORE;
        };

        match matcher.calculate_interest_match(content, keywords).await {
            Ok(Some(result)) => {
                let bonus = (result.matched_tags.len() as f64 * self.config.match_count_bonus)
                    .min(self.config.max_match_bonus);
                (result.overall_score * MATCH_SCORE_GAIN * result.confidence + bonus)
                    .clamp(0.0, 1.0)
            }
            Ok(None) => 0.0,
            Err(err) => {
                warn!(%err, "interest match failed, scoring zero");
                0.0
            }
        }
    }

    fn mentioned_score(&self, message: &Message, bot_nickname: &str, bot_aliases: &[String]) -> f64 {
        let text = &message.processed_plain_text;
        let named = std::iter::once(bot_nickname)
            .chain(bot_aliases.iter().map(String::as_str))
            .filter(|alias| !alias.is_empty())
            .any(|alias| text.contains(alias));

        if message.flags.is_mentioned || named || message.is_private() {
            self.config.mention_bot_interest_score
        } else {
            0.0
        }
    }

    /// Decide whether `score` clears the stream's current effective
    /// threshold. Does not touch the fairness counter; call
    /// [`record_reply_action`](Self::record_reply_action) once the cycle's
    /// outcome is known.
    pub fn decide_reply(&self, stream_id: &str, score: &InterestScore) -> ReplyDecision {
        let mut threshold = self.config.reply_action_interest_threshold;
        if score.mentioned_score >= self.config.mention_bot_adjustment_threshold {
            threshold = self.config.mention_bot_adjustment_threshold;
        }

        let count = self.no_reply_count(stream_id);
        let boost =
            (f64::from(count) * self.config.boost_per_no_reply()).min(MAX_FAIRNESS_BOOST);
        let effective_threshold = threshold - boost;

        let should_reply = score.total_score >= effective_threshold;
        info!(
            stream_id,
            total = score.total_score,
            effective_threshold,
            should_reply,
            "reply decision"
        );

        ReplyDecision {
            should_reply,
            score: score.total_score,
            effective_threshold,
        }
    }

    /// Update the stream's fairness counter after a cycle: replying cools it
    /// down, staying silent heats it up (capped).
    pub fn record_reply_action(&self, stream_id: &str, did_reply: bool) {
        let mut counts = self.no_reply_counts.lock().unwrap();
        let count = counts.entry(stream_id.to_string()).or_insert(0);
        if did_reply {
            *count = count.saturating_sub(self.config.reply_cooldown_reduction);
        } else {
            *count = (*count + 1).min(self.config.max_no_reply_count);
        }
    }

    pub fn no_reply_count(&self, stream_id: &str) -> u32 {
        self.no_reply_counts
            .lock()
            .unwrap()
            .get(stream_id)
            .copied()
            .unwrap_or(0)
    }
}

/// Fallback keyword extraction when the adapter supplied none: alphanumeric
/// and CJK runs, at least two chars, not pure digits, first ten unique.
pub fn extract_keywords(content: &str) -> Vec<String> {
    let mut keywords = Vec::new();
    let mut current = String::new();

    let mut flush = |current: &mut String, keywords: &mut Vec<String>| {
        if current.chars().count() >= 2
            && !current.chars().all(|c| c.is_ascii_digit())
            && !keywords.contains(current)
        {
            keywords.push(current.to_lowercase());
        }
        current.clear();
    };

    for ch in content.chars() {
        if ch.is_alphanumeric() {
            current.push(ch);
        } else {
            flush(&mut current, &mut keywords);
        }
    }
    flush(&mut current, &mut keywords);

    keywords.truncate(10);
    keywords
}
