//! Per-user relationship records, persisted through the KV store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use fennec_store::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipStage {
    Stranger,
    Acquaintance,
    Familiar,
    Friend,
    CloseFriend,
    Bestie,
}

impl RelationshipStage {
    /// Stage boundaries over the [0,1] relationship score.
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s < 0.15 => Self::Stranger,
            s if s < 0.30 => Self::Acquaintance,
            s if s < 0.50 => Self::Familiar,
            s if s < 0.70 => Self::Friend,
            s if s < 0.85 => Self::CloseFriend,
            _ => Self::Bestie,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFactType {
    Birthday,
    Job,
    Location,
    Dream,
    Family,
    Pet,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFact {
    pub fact_type: KeyFactType,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRelationship {
    pub platform: String,
    pub user_id: String,
    pub relationship_score: f64,
    pub relationship_stage: RelationshipStage,
    pub impression_text: String,
    pub user_aliases: Vec<String>,
    pub preference_keywords: Vec<String>,
    pub key_facts: Vec<KeyFact>,
    pub updated_at: DateTime<Utc>,
}

impl UserRelationship {
    pub fn new(platform: impl Into<String>, user_id: impl Into<String>, score: f64) -> Self {
        let score = score.clamp(0.0, 1.0);
        Self {
            platform: platform.into(),
            user_id: user_id.into(),
            relationship_score: score,
            relationship_stage: RelationshipStage::from_score(score),
            impression_text: String::new(),
            user_aliases: Vec::new(),
            preference_keywords: Vec::new(),
            key_facts: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Shift the score by `delta`, clamped to [0,1], and re-derive the stage.
    pub fn adjust_score(&mut self, delta: f64) {
        self.relationship_score = (self.relationship_score + delta).clamp(0.0, 1.0);
        self.relationship_stage = RelationshipStage::from_score(self.relationship_score);
        self.updated_at = Utc::now();
    }
}

/// KV-backed store of [`UserRelationship`] rows.
#[derive(Clone)]
pub struct RelationshipStore {
    kv: KvStore,
    base_score: f64,
}

impl RelationshipStore {
    pub fn new(kv: KvStore, base_score: f64) -> Self {
        Self { kv, base_score }
    }

    fn key(platform: &str, user_id: &str) -> String {
        format!("user_relationship_{platform}_{user_id}")
    }

    pub fn get(&self, platform: &str, user_id: &str) -> Option<UserRelationship> {
        self.kv
            .get(&Self::key(platform, user_id))
            .ok()
            .flatten()
    }

    /// The score used by interest scoring; unknown users get the configured
    /// base score.
    pub fn score(&self, platform: &str, user_id: &str) -> f64 {
        self.get(platform, user_id)
            .map(|r| r.relationship_score.min(1.0))
            .unwrap_or(self.base_score)
    }

    pub fn upsert(&self, relationship: &UserRelationship) -> anyhow::Result<()> {
        let key = Self::key(&relationship.platform, &relationship.user_id);
        self.kv.set(&key, relationship)?;
        debug!(
            user_id = %relationship.user_id,
            score = relationship.relationship_score,
            stage = ?relationship.relationship_stage,
            "relationship upserted"
        );
        Ok(())
    }

    /// Apply a delta to a user's score, creating the record on first contact.
    pub fn adjust(&self, platform: &str, user_id: &str, delta: f64) -> anyhow::Result<UserRelationship> {
        let mut relationship = self
            .get(platform, user_id)
            .unwrap_or_else(|| UserRelationship::new(platform, user_id, self.base_score));
        relationship.adjust_score(delta);
        self.upsert(&relationship)?;
        Ok(relationship)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, RelationshipStore) {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path().join("kv.redb")).unwrap();
        (dir, RelationshipStore::new(kv, 0.3))
    }

    #[test]
    fn stages_cover_the_whole_range() {
        assert_eq!(RelationshipStage::from_score(0.0), RelationshipStage::Stranger);
        assert_eq!(RelationshipStage::from_score(0.2), RelationshipStage::Acquaintance);
        assert_eq!(RelationshipStage::from_score(0.4), RelationshipStage::Familiar);
        assert_eq!(RelationshipStage::from_score(0.6), RelationshipStage::Friend);
        assert_eq!(RelationshipStage::from_score(0.8), RelationshipStage::CloseFriend);
        assert_eq!(RelationshipStage::from_score(1.0), RelationshipStage::Bestie);
    }

    #[test]
    fn unknown_user_gets_base_score() {
        let (_dir, store) = store();
        assert_eq!(store.score("qq", "nobody"), 0.3);
    }

    #[test]
    fn adjust_creates_then_moves_score_and_stage() {
        let (_dir, store) = store();
        let updated = store.adjust("qq", "u1", 0.25).unwrap();
        assert!((updated.relationship_score - 0.55).abs() < 1e-9);
        assert_eq!(updated.relationship_stage, RelationshipStage::Friend);

        // Clamped at 1.0.
        let updated = store.adjust("qq", "u1", 5.0).unwrap();
        assert_eq!(updated.relationship_score, 1.0);
        assert_eq!(updated.relationship_stage, RelationshipStage::Bestie);
    }
}
