//! On-disk JSON metadata index with in-memory inverted sets.
//!
//! The vector store holds embeddings; this sidecar lets retrieval narrow
//! candidates cheaply before any vector query. Persisted via atomic
//! temp-file replace and rebuilt into inverted maps on load.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chunk::MemoryChunk;

const INDEX_VERSION: u32 = 2;

/// Preview length stored alongside each entry.
const PREVIEW_CHARS: usize = 100;

/// Score a candidate must reach in flexible search (out of 4 dimensions).
const FLEXIBLE_MIN_SCORE: f64 = 2.0;

/// Weight of the object-contains-subject heuristic ("主宾关联"). Useful but
/// noisy; tune down if coarse filtering lets too much through.
const OBJECT_SUBJECT_LINK_SCORE: f64 = 0.8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub memory_id: String,
    pub user_id: String,
    pub memory_type: String,
    pub subjects: Vec<String>,
    pub objects: Vec<String>,
    pub keywords: Vec<String>,
    pub tags: Vec<String>,
    pub importance: u8,
    pub confidence: u8,
    pub created_at: i64,
    pub access_count: u32,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub content_preview: Option<String>,
    #[serde(default)]
    pub last_accessed: Option<i64>,
}

impl IndexEntry {
    pub fn from_chunk(chunk: &MemoryChunk) -> Self {
        Self {
            memory_id: chunk.memory_id.clone(),
            user_id: chunk.user_id.clone(),
            memory_type: chunk.memory_type.as_str().to_string(),
            subjects: vec![chunk.subject.clone()],
            objects: vec![chunk.object.clone()],
            keywords: chunk.keywords.clone(),
            tags: chunk.tags.clone(),
            importance: chunk.importance.value(),
            confidence: chunk.confidence.value(),
            created_at: chunk.created_at.timestamp(),
            access_count: chunk.access_count,
            chat_id: chunk.chat_id.clone(),
            content_preview: Some(chunk.display.chars().take(PREVIEW_CHARS).collect()),
            last_accessed: Some(chunk.last_accessed.timestamp()),
        }
    }
}

/// On-disk layout of the index file.
#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    count: usize,
    last_updated: DateTime<Utc>,
    entries: Vec<IndexEntry>,
}

/// Query shape for the coarse filter.
#[derive(Debug, Clone, Default)]
pub struct IndexQuery {
    pub memory_types: Vec<String>,
    pub subjects: Vec<String>,
    pub keywords: Vec<String>,
    pub tags: Vec<String>,
    pub user_id: Option<String>,
    pub created_after: Option<i64>,
    pub created_before: Option<i64>,
    pub limit: Option<usize>,
}

impl IndexQuery {
    /// A query with no dimension to score on cannot drive the coarse filter.
    pub fn has_constraints(&self) -> bool {
        !self.memory_types.is_empty()
            || !self.subjects.is_empty()
            || self.created_after.is_some()
            || self.created_before.is_some()
    }
}

#[derive(Default)]
struct Inverted {
    by_type: HashMap<String, HashSet<String>>,
    by_subject: HashMap<String, HashSet<String>>,
    by_keyword: HashMap<String, HashSet<String>>,
    by_tag: HashMap<String, HashSet<String>>,
}

struct Inner {
    entries: HashMap<String, IndexEntry>,
    inverted: Inverted,
    dirty: bool,
}

pub struct MetadataIndex {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl MetadataIndex {
    /// Load the index from `path`, or start empty when the file is missing.
    /// The inverted maps are always rebuilt from the entry list.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = HashMap::new();

        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading metadata index {}", path.display()))?;
            match serde_json::from_str::<IndexFile>(&raw) {
                Ok(file) => {
                    for entry in file.entries {
                        entries.insert(entry.memory_id.clone(), entry);
                    }
                    info!(count = entries.len(), path = %path.display(), "metadata index loaded");
                }
                Err(err) => {
                    // A corrupt sidecar is rebuildable from the vector store;
                    // do not take the process down over it.
                    warn!(%err, path = %path.display(), "metadata index corrupt, starting empty");
                }
            }
        }

        let mut inverted = Inverted::default();
        for entry in entries.values() {
            index_entry(&mut inverted, entry);
        }

        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                entries,
                inverted,
                dirty: false,
            }),
        })
    }

    pub fn add_or_update(&self, entry: IndexEntry) {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.contains_key(&entry.memory_id) {
            remove_from_inverted(&mut inner.inverted, &entry.memory_id);
        }
        index_entry(&mut inner.inverted, &entry);
        inner.entries.insert(entry.memory_id.clone(), entry);
        inner.dirty = true;
    }

    pub fn batch_add_or_update(&self, entries: Vec<IndexEntry>) {
        let mut inner = self.inner.lock().unwrap();
        for entry in entries {
            if inner.entries.contains_key(&entry.memory_id) {
                remove_from_inverted(&mut inner.inverted, &entry.memory_id);
            }
            index_entry(&mut inner.inverted, &entry);
            inner.entries.insert(entry.memory_id.clone(), entry);
        }
        inner.dirty = true;
    }

    pub fn remove(&self, memory_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        remove_from_inverted(&mut inner.inverted, memory_id);
        let existed = inner.entries.remove(memory_id).is_some();
        inner.dirty |= existed;
        existed
    }

    pub fn get(&self, memory_id: &str) -> Option<IndexEntry> {
        self.inner.lock().unwrap().entries.get(memory_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record an access on a retrieved memory without rewriting the chunk.
    pub fn touch(&self, memory_id: &str, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(memory_id) {
            entry.access_count += 1;
            entry.last_accessed = Some(now.timestamp());
            inner.dirty = true;
        }
    }

    /// Flexible coarse filter: score candidates over four dimensions (type,
    /// subject, object-subject link, time range) and keep those at or above
    /// [`FLEXIBLE_MIN_SCORE`], best first.
    pub fn search_flexible(&self, query: &IndexQuery) -> Vec<String> {
        let inner = self.inner.lock().unwrap();

        let mut scored: Vec<(f64, i64, String)> = inner
            .entries
            .values()
            .filter(|entry| {
                query
                    .user_id
                    .as_ref()
                    .is_none_or(|user| &entry.user_id == user)
            })
            .filter_map(|entry| {
                let score = flexible_score(entry, query);
                (score >= FLEXIBLE_MIN_SCORE)
                    .then(|| (score, entry.created_at, entry.memory_id.clone()))
            })
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(b.1.cmp(&a.1)));
        let mut ids: Vec<String> = scored.into_iter().map(|(_, _, id)| id).collect();
        if let Some(limit) = query.limit {
            ids.truncate(limit);
        }
        debug!(candidates = ids.len(), "flexible metadata search");
        ids
    }

    /// Strict filter: every specified dimension must match exactly
    /// (`$in` semantics over lists).
    pub fn search_strict(&self, query: &IndexQuery) -> Vec<String> {
        let inner = self.inner.lock().unwrap();

        let mut ids: Vec<(i64, String)> = inner
            .entries
            .values()
            .filter(|e| query.user_id.as_ref().is_none_or(|u| &e.user_id == u))
            .filter(|e| {
                query.memory_types.is_empty() || query.memory_types.contains(&e.memory_type)
            })
            .filter(|e| {
                query.subjects.is_empty()
                    || e.subjects.iter().any(|s| query.subjects.contains(s))
            })
            .filter(|e| {
                query.keywords.is_empty()
                    || e.keywords.iter().any(|k| query.keywords.contains(k))
            })
            .filter(|e| query.tags.is_empty() || e.tags.iter().any(|t| query.tags.contains(t)))
            .filter(|e| query.created_after.is_none_or(|t| e.created_at >= t))
            .filter(|e| query.created_before.is_none_or(|t| e.created_at <= t))
            .map(|e| (e.created_at, e.memory_id.clone()))
            .collect();

        ids.sort_by(|a, b| b.0.cmp(&a.0));
        let mut ids: Vec<String> = ids.into_iter().map(|(_, id)| id).collect();
        if let Some(limit) = query.limit {
            ids.truncate(limit);
        }
        ids
    }

    /// All entries created before `cutoff` (unix seconds).
    pub fn created_before(&self, cutoff: i64) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .values()
            .filter(|e| e.created_at < cutoff)
            .map(|e| e.memory_id.clone())
            .collect()
    }

    pub fn all_entries(&self) -> Vec<IndexEntry> {
        self.inner.lock().unwrap().entries.values().cloned().collect()
    }

    /// Persist to disk via temp-file-then-rename; a crash mid-write leaves
    /// the previous file intact.
    pub fn save(&self) -> Result<()> {
        let snapshot = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.dirty {
                return Ok(());
            }
            inner.dirty = false;
            IndexFile {
                version: INDEX_VERSION,
                count: inner.entries.len(),
                last_updated: Utc::now(),
                entries: inner.entries.values().cloned().collect(),
            }
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let rendered = serde_json::to_vec(&snapshot)?;

        std::fs::write(&tmp_path, &rendered)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        if let Err(err) = std::fs::rename(&tmp_path, &self.path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(err).with_context(|| format!("replacing {}", self.path.display()));
        }
        debug!(count = snapshot.count, path = %self.path.display(), "metadata index saved");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn flexible_score(entry: &IndexEntry, query: &IndexQuery) -> f64 {
    let mut score = 0.0;

    // 1. Memory type: exact 1.0, partial (substring either way) 0.5.
    if !query.memory_types.is_empty() {
        let entry_type = entry.memory_type.to_lowercase();
        for wanted in &query.memory_types {
            let wanted = wanted.to_lowercase();
            if wanted == entry_type {
                score += 1.0;
                break;
            }
            if wanted.contains(&entry_type) || entry_type.contains(&wanted) {
                score += 0.5;
                break;
            }
        }
    }

    // 2. Subject: exact 1.0, substring 0.6.
    if !query.subjects.is_empty() {
        let mut subject_score: f64 = 0.0;
        'outer: for wanted in &query.subjects {
            let wanted = wanted.trim().to_lowercase();
            for subject in &entry.subjects {
                let subject = subject.trim().to_lowercase();
                if wanted == subject {
                    subject_score = 1.0;
                    break 'outer;
                }
                if wanted.contains(&subject) || subject.contains(&wanted) {
                    subject_score = subject_score.max(0.6);
                }
            }
        }
        score += subject_score;
    }

    // 3. Object-subject link: the object text overlaps a queried subject.
    if !query.subjects.is_empty() {
        'link: for object in &entry.objects {
            let object = object.trim().to_lowercase();
            if object.is_empty() {
                continue;
            }
            for wanted in &query.subjects {
                let wanted = wanted.trim().to_lowercase();
                if object.contains(&wanted) || wanted.contains(&object) {
                    score += OBJECT_SUBJECT_LINK_SCORE;
                    break 'link;
                }
            }
        }
    }

    // 4. Time range: in-range 1.0.
    if query.created_after.is_some() || query.created_before.is_some() {
        let after_ok = query.created_after.is_none_or(|t| entry.created_at >= t);
        let before_ok = query.created_before.is_none_or(|t| entry.created_at <= t);
        if after_ok && before_ok {
            score += 1.0;
        }
    }

    score
}

fn index_entry(inverted: &mut Inverted, entry: &IndexEntry) {
    let id = &entry.memory_id;
    inverted
        .by_type
        .entry(entry.memory_type.clone())
        .or_default()
        .insert(id.clone());
    for subject in &entry.subjects {
        inverted
            .by_subject
            .entry(subject.to_lowercase())
            .or_default()
            .insert(id.clone());
    }
    for keyword in &entry.keywords {
        inverted
            .by_keyword
            .entry(keyword.to_lowercase())
            .or_default()
            .insert(id.clone());
    }
    for tag in &entry.tags {
        inverted
            .by_tag
            .entry(tag.to_lowercase())
            .or_default()
            .insert(id.clone());
    }
}

fn remove_from_inverted(inverted: &mut Inverted, memory_id: &str) {
    for map in [
        &mut inverted.by_type,
        &mut inverted.by_subject,
        &mut inverted.by_keyword,
        &mut inverted.by_tag,
    ] {
        map.retain(|_, ids| {
            ids.remove(memory_id);
            !ids.is_empty()
        });
    }
}
