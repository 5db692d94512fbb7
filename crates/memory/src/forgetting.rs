//! Forgetting: hard retention expiry plus a softer score over importance,
//! access history, and staleness.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

use fennec_config::MemoryConfig;

use crate::chunk::{Importance, MemoryChunk};

/// Soft score at or above which a chunk is forgettable.
const FORGET_SCORE_THRESHOLD: f64 = 0.7;
/// Soft score at or above which a chunk is force-forgettable even when it is
/// important.
const FORCE_FORGET_SCORE_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ForgettingReport {
    pub normal_forgetting: Vec<String>,
    pub force_forgetting: Vec<String>,
    pub expired: Vec<String>,
}

impl ForgettingReport {
    pub fn all_ids(&self) -> Vec<String> {
        self.expired
            .iter()
            .chain(&self.normal_forgetting)
            .chain(&self.force_forgetting)
            .cloned()
            .collect()
    }
}

pub struct ForgettingEngine {
    retention: Duration,
}

impl ForgettingEngine {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            retention: Duration::hours(config.vector_db_retention_hours as i64),
        }
    }

    /// Evaluate candidates. Expired chunks go straight to `expired`; the rest
    /// are scored and split into the normal and force lists.
    pub fn evaluate(&self, chunks: &[MemoryChunk], now: DateTime<Utc>) -> ForgettingReport {
        let mut report = ForgettingReport::default();

        for chunk in chunks {
            if now - chunk.created_at > self.retention {
                report.expired.push(chunk.memory_id.clone());
                continue;
            }

            let score = forget_score(chunk, now, self.retention);
            if score >= FORCE_FORGET_SCORE_THRESHOLD {
                report.force_forgetting.push(chunk.memory_id.clone());
            } else if score >= FORGET_SCORE_THRESHOLD && chunk.importance <= Importance::General {
                report.normal_forgetting.push(chunk.memory_id.clone());
            }
        }

        if !report.expired.is_empty()
            || !report.normal_forgetting.is_empty()
            || !report.force_forgetting.is_empty()
        {
            info!(
                expired = report.expired.len(),
                normal = report.normal_forgetting.len(),
                forced = report.force_forgetting.len(),
                "forgetting evaluation"
            );
        }
        report
    }
}

/// Soft forgettability in [0,1]: low importance, few accesses, and a long
/// time since last access all push the score up.
fn forget_score(chunk: &MemoryChunk, now: DateTime<Utc>, retention: Duration) -> f64 {
    let importance_factor = 1.0 - (f64::from(chunk.importance.value()) - 1.0) / 3.0;

    let access_factor = 1.0 / (1.0 + f64::from(chunk.access_count));

    let idle = (now - chunk.last_accessed).num_seconds().max(0) as f64;
    let staleness_factor = (idle / retention.num_seconds().max(1) as f64).min(1.0);

    importance_factor * 0.4 + access_factor * 0.3 + staleness_factor * 0.3
}
