//! The long-term memory unit: a subject–predicate–object fact with
//! classification, scoring, and access bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use fennec_store::VectorRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    PersonalFact,
    Event,
    Preference,
    Opinion,
    Relationship,
    Emotion,
    Knowledge,
    Skill,
    Goal,
    Experience,
    Contextual,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PersonalFact => "personal_fact",
            Self::Event => "event",
            Self::Preference => "preference",
            Self::Opinion => "opinion",
            Self::Relationship => "relationship",
            Self::Emotion => "emotion",
            Self::Knowledge => "knowledge",
            Self::Skill => "skill",
            Self::Goal => "goal",
            Self::Experience => "experience",
            Self::Contextual => "contextual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "personal_fact" => Some(Self::PersonalFact),
            "event" => Some(Self::Event),
            "preference" => Some(Self::Preference),
            "opinion" => Some(Self::Opinion),
            "relationship" => Some(Self::Relationship),
            "emotion" => Some(Self::Emotion),
            "knowledge" => Some(Self::Knowledge),
            "skill" => Some(Self::Skill),
            "goal" => Some(Self::Goal),
            "experience" => Some(Self::Experience),
            "contextual" => Some(Self::Contextual),
            _ => None,
        }
    }

    /// Tags auto-attached to every chunk of this type.
    pub fn auto_tags(&self) -> &'static [&'static str] {
        match self {
            Self::PersonalFact => &["个人信息", "基本资料"],
            Self::Event => &["事件", "日程"],
            Self::Preference => &["偏好", "喜好"],
            Self::Opinion => &["观点", "态度"],
            Self::Relationship => &["关系", "社交"],
            Self::Emotion => &["情感", "情绪"],
            Self::Knowledge => &["知识", "信息"],
            Self::Skill => &["技能", "能力"],
            Self::Goal => &["目标", "计划"],
            Self::Experience => &["经验", "经历"],
            Self::Contextual => &[],
        }
    }
}

/// Importance level, 1..=4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Low = 1,
    General = 2,
    High = 3,
    Critical = 4,
}

impl Importance {
    pub fn value(&self) -> u8 {
        *self as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::General => "general",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Low),
            2 => Some(Self::General),
            3 => Some(Self::High),
            4 => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Confidence level, 1..=4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low = 1,
    Medium = 2,
    High = 3,
    Verified = 4,
}

impl Confidence {
    pub fn value(&self) -> u8 {
        *self as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Verified => "verified",
        }
    }

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Low),
            2 => Some(Self::Medium),
            3 => Some(Self::High),
            4 => Some(Self::Verified),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryChunk {
    pub memory_id: String,
    pub user_id: String,
    pub chat_id: Option<String>,

    pub subject: String,
    pub predicate: String,
    pub object: String,
    /// Human-readable rendering stored as the vector document.
    pub display: String,
    pub keywords: Vec<String>,
    pub tags: Vec<String>,
    pub categories: Vec<String>,

    pub memory_type: MemoryType,
    pub importance: Importance,
    pub confidence: Confidence,

    pub relevance_score: f64,
    pub access_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,

    #[serde(default)]
    pub embedding: Vec<f32>,
    pub source_context: Option<String>,
    /// Deterministic hash of the normalized triple; identical facts collide
    /// here, which is what makes re-building idempotent.
    pub semantic_hash: String,
}

impl MemoryChunk {
    pub fn new(
        user_id: impl Into<String>,
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
        memory_type: MemoryType,
        created_at: DateTime<Utc>,
    ) -> Self {
        let user_id = user_id.into();
        let subject = subject.into();
        let predicate = predicate.into();
        let object = object.into();
        let display = format!("{subject} {predicate} {object}");
        let semantic_hash = semantic_hash(&subject, &predicate, &object);

        Self {
            memory_id: Uuid::new_v4().to_string(),
            user_id,
            chat_id: None,
            subject,
            predicate,
            object,
            display,
            keywords: Vec::new(),
            tags: Vec::new(),
            categories: Vec::new(),
            memory_type,
            importance: Importance::General,
            confidence: Confidence::Medium,
            relevance_score: 0.0,
            access_count: 0,
            created_at,
            last_accessed: created_at,
            embedding: Vec::new(),
            source_context: None,
            semantic_hash,
        }
    }

    pub fn with_importance(mut self, importance: Importance) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_confidence(mut self, confidence: Confidence) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_chat_id(mut self, chat_id: Option<String>) -> Self {
        self.chat_id = chat_id;
        self
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    /// Structural validity per the storage contract: non-empty subject and
    /// predicate, display length within bounds, never low confidence.
    pub fn is_valid(&self, min_len: usize, max_len: usize) -> bool {
        let len = self.display.chars().count();
        !self.subject.trim().is_empty()
            && !self.predicate.trim().is_empty()
            && len >= min_len
            && len <= max_len
            && self.confidence > Confidence::Low
    }

    pub fn mark_accessed(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_accessed = now;
    }

    /// Flatten into the vector-store row shape (collection
    /// `unified_memory_v2`).
    pub fn to_vector_record(&self) -> VectorRecord {
        let mut metadata = serde_json::Map::new();
        metadata.insert("memory_id".into(), json!(self.memory_id));
        metadata.insert("user_id".into(), json!(self.user_id));
        metadata.insert("memory_type".into(), json!(self.memory_type.as_str()));
        metadata.insert("importance".into(), json!(self.importance.name()));
        metadata.insert("confidence".into(), json!(self.confidence.name()));
        metadata.insert("created_at".into(), json!(self.created_at.timestamp()));
        metadata.insert("last_accessed".into(), json!(self.last_accessed.timestamp()));
        metadata.insert("access_count".into(), json!(self.access_count));
        metadata.insert("subjects".into(), json!(json!([self.subject]).to_string()));
        metadata.insert("keywords".into(), json!(json!(self.keywords).to_string()));
        metadata.insert("tags".into(), json!(json!(self.tags).to_string()));
        metadata.insert("categories".into(), json!(json!(self.categories).to_string()));
        metadata.insert("relevance_score".into(), json!(self.relevance_score));
        metadata.insert("predicate".into(), json!(self.predicate));
        metadata.insert("object".into(), json!(self.object));
        metadata.insert("source_context".into(), json!(self.source_context));

        VectorRecord {
            id: self.memory_id.clone(),
            embedding: self.embedding.clone(),
            metadata,
            document: self.display.clone(),
        }
    }

    /// Rebuild a chunk from a stored vector row. Returns `None` when required
    /// metadata is missing or malformed.
    pub fn from_vector_record(record: &VectorRecord) -> Option<Self> {
        let meta = &record.metadata;
        let get_str = |key: &str| meta.get(key).and_then(|v| v.as_str());

        let memory_type = MemoryType::parse(get_str("memory_type")?)?;
        let importance = match get_str("importance")? {
            "low" => Importance::Low,
            "general" => Importance::General,
            "high" => Importance::High,
            "critical" => Importance::Critical,
            _ => return None,
        };
        let confidence = match get_str("confidence")? {
            "low" => Confidence::Low,
            "medium" => Confidence::Medium,
            "high" => Confidence::High,
            "verified" => Confidence::Verified,
            _ => return None,
        };

        let parse_list = |key: &str| -> Vec<String> {
            get_str(key)
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default()
        };

        let subject = parse_list("subjects").into_iter().next().unwrap_or_default();
        let predicate = get_str("predicate").unwrap_or_default().to_string();
        let object = get_str("object").unwrap_or_default().to_string();
        let created_at = timestamp(meta.get("created_at"))?;
        let last_accessed = timestamp(meta.get("last_accessed")).unwrap_or(created_at);
        let semantic_hash = semantic_hash(&subject, &predicate, &object);

        Some(Self {
            memory_id: record.id.clone(),
            user_id: get_str("user_id")?.to_string(),
            chat_id: None,
            display: record.document.clone(),
            keywords: parse_list("keywords"),
            tags: parse_list("tags"),
            categories: parse_list("categories"),
            memory_type,
            importance,
            confidence,
            relevance_score: meta
                .get("relevance_score")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0),
            access_count: meta
                .get("access_count")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
            created_at,
            last_accessed,
            embedding: record.embedding.clone(),
            source_context: get_str("source_context").map(str::to_string),
            semantic_hash,
            subject,
            predicate,
            object,
        })
    }
}

fn timestamp(value: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    let secs = value?.as_i64()?;
    DateTime::from_timestamp(secs, 0)
}

/// SHA-256 of the normalized triple: lowercased, whitespace-collapsed.
pub fn semantic_hash(subject: &str, predicate: &str, object: &str) -> String {
    let normalize = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalize(subject));
    hasher.update("|");
    hasher.update(normalize(predicate));
    hasher.update("|");
    hasher.update(normalize(object));
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk() -> MemoryChunk {
        MemoryChunk::new(
            "u3",
            "u3",
            "has_birthday",
            "11月23日",
            MemoryType::PersonalFact,
            Utc::now(),
        )
        .with_importance(Importance::High)
        .with_confidence(Confidence::High)
        .with_keywords(vec!["生日".into()])
    }

    #[test]
    fn semantic_hash_normalizes_whitespace_and_case() {
        assert_eq!(
            semantic_hash("User", "Likes  ", "Coffee"),
            semantic_hash("user", "likes", "coffee")
        );
        assert_ne!(
            semantic_hash("user", "likes", "coffee"),
            semantic_hash("user", "likes", "tea")
        );
    }

    #[test]
    fn vector_record_round_trip_preserves_identity_fields() {
        let mut original = chunk();
        original.add_tag("个人信息");
        original.embedding = vec![0.1, 0.2];
        original.access_count = 3;

        let record = original.to_vector_record();
        let restored = MemoryChunk::from_vector_record(&record).unwrap();

        assert_eq!(restored.memory_id, original.memory_id);
        assert_eq!(restored.user_id, original.user_id);
        assert_eq!(restored.memory_type, original.memory_type);
        assert_eq!(restored.subject, original.subject);
        assert_eq!(restored.keywords, original.keywords);
        assert_eq!(restored.importance, original.importance);
        assert_eq!(restored.confidence, original.confidence);
        assert_eq!(
            restored.created_at.timestamp(),
            original.created_at.timestamp()
        );
        assert_eq!(restored.access_count, 3);
    }

    #[test]
    fn validation_enforces_the_contract() {
        let good = chunk();
        assert!(good.is_valid(5, 500));

        let mut empty_subject = chunk();
        empty_subject.subject = "  ".into();
        assert!(!empty_subject.is_valid(5, 500));

        let mut low_confidence = chunk();
        low_confidence.confidence = Confidence::Low;
        assert!(!low_confidence.is_valid(5, 500));

        let short = chunk();
        assert!(!short.is_valid(100, 500));
    }

    #[test]
    fn four_level_enums_map_values() {
        assert_eq!(Importance::Critical.value(), 4);
        assert_eq!(Importance::from_value(1), Some(Importance::Low));
        assert_eq!(Importance::from_value(9), None);
        assert_eq!(Confidence::Verified.name(), "verified");
        assert!(Confidence::High > Confidence::Low);
    }
}
