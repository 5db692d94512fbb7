//! Per-conversation state: the three message queues, processing flags,
//! interruption counters, and the bounded decision trail.
//!
//! A message lives in exactly one of {cache, unread, history} at any time.
//! Mutation happens only under the stream's lock, owned by the scheduler's
//! tick task.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use fennec_store::KvStore;
use fennec_types::{DecisionRecord, Message, StreamId};

/// Decision trail length cap.
const DECISION_HISTORY_CAP: usize = 50;

/// Interruption chance decay by prior interruption count; the configured
/// minimum is added on top and acts as the floor for later counts.
const INTERRUPT_DECAY: &[f64] = &[0.7, 0.25, 0.05];

/// Which queue a message currently sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSlot {
    Cache,
    Unread,
    History,
}

/// The slice of context state that survives restarts
/// (`hfc_context_state_<stream_id>`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextState {
    pub interruption_count: u32,
    pub last_interruption_time: Option<DateTime<Utc>>,
    pub last_reset_date: Option<chrono::NaiveDate>,
}

pub struct StreamContext {
    stream_id: StreamId,
    cache: VecDeque<Message>,
    unread: Vec<Message>,
    history: VecDeque<Message>,

    pub is_active: bool,
    is_chatter_processing: bool,
    is_cache_enabled: bool,

    state: ContextState,
    decision_history: VecDeque<DecisionRecord>,

    max_context_size: usize,
    kv: Option<KvStore>,
}

impl StreamContext {
    pub fn new(stream_id: StreamId, max_context_size: usize, kv: Option<KvStore>) -> Self {
        let state = kv
            .as_ref()
            .and_then(|kv| kv.get::<ContextState>(&Self::state_key(&stream_id)).ok().flatten())
            .unwrap_or_default();

        Self {
            stream_id,
            cache: VecDeque::new(),
            unread: Vec::new(),
            history: VecDeque::new(),
            is_active: true,
            is_chatter_processing: false,
            is_cache_enabled: true,
            state,
            decision_history: VecDeque::new(),
            max_context_size: max_context_size.max(1),
            kv,
        }
    }

    fn state_key(stream_id: &StreamId) -> String {
        format!("hfc_context_state_{stream_id}")
    }

    fn persist_state(&self) {
        if let Some(kv) = &self.kv {
            if let Err(err) = kv.set(&Self::state_key(&self.stream_id), &self.state) {
                warn!(%err, stream_id = %self.stream_id, "failed to persist context state");
            }
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn is_chatter_processing(&self) -> bool {
        self.is_chatter_processing
    }

    pub fn set_chatter_processing(&mut self, processing: bool) {
        self.is_chatter_processing = processing;
    }

    pub fn set_cache_enabled(&mut self, enabled: bool) {
        self.is_cache_enabled = enabled;
    }

    /// Ingest one message. While a chatter cycle is running (and caching is
    /// on) messages park in `cache`; otherwise the cache flushes first and
    /// the message appends to `unread`. Returns false for duplicates.
    pub fn add_message(&mut self, message: Message, force_direct: bool) -> bool {
        if self.locate(&message.message_id).is_some() {
            warn!(
                stream_id = %self.stream_id,
                message_id = %message.message_id,
                "duplicate message id, dropping"
            );
            return false;
        }

        if self.is_cache_enabled && self.is_chatter_processing && !force_direct {
            self.cache.push_back(message);
        } else {
            self.flush_cache();
            self.unread.push(message);
        }
        true
    }

    /// Move every cached message into `unread`, preserving arrival order.
    pub fn flush_cache(&mut self) -> usize {
        let flushed = self.cache.len();
        while let Some(message) = self.cache.pop_front() {
            self.unread.push(message);
        }
        if flushed > 0 {
            debug!(stream_id = %self.stream_id, flushed, "cache flushed into unread");
        }
        flushed
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Move one message from `unread` to `history`, evicting the oldest
    /// history entries beyond the size cap. Unknown ids are a no-op.
    pub fn mark_read(&mut self, message_id: &str) {
        let Some(idx) = self.unread.iter().position(|m| m.message_id == message_id) else {
            return;
        };
        let message = self.unread.remove(idx);
        self.history.push_back(message);
        while self.history.len() > self.max_context_size {
            self.history.pop_front();
        }
    }

    /// Append a bot-generated turn straight into history (it was never
    /// unread).
    pub fn push_bot_turn(&mut self, message: Message) {
        self.history.push_back(message);
        while self.history.len() > self.max_context_size {
            self.history.pop_front();
        }
    }

    /// Latest `limit` messages sorted by time ascending, optionally
    /// including unread.
    pub fn get_messages(&self, limit: usize, include_unread: bool) -> Vec<Message> {
        let mut messages: Vec<Message> = self.history.iter().cloned().collect();
        if include_unread {
            messages.extend(self.unread.iter().cloned());
        }
        messages.sort_by_key(|m| m.time);
        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
        messages
    }

    pub fn unread_snapshot(&self) -> Vec<Message> {
        self.unread.clone()
    }

    pub fn unread_len(&self) -> usize {
        self.unread.len()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Apply post-hoc metadata to a message wherever it currently lives.
    pub fn update_message<F: FnOnce(&mut Message)>(&mut self, message_id: &str, apply: F) -> bool {
        let found = self
            .unread
            .iter_mut()
            .chain(self.history.iter_mut())
            .chain(self.cache.iter_mut())
            .find(|m| m.message_id == message_id);
        match found {
            Some(message) => {
                apply(message);
                true
            }
            None => false,
        }
    }

    /// Which queue holds `message_id`, if any.
    pub fn locate(&self, message_id: &str) -> Option<QueueSlot> {
        if self.cache.iter().any(|m| m.message_id == message_id) {
            Some(QueueSlot::Cache)
        } else if self.unread.iter().any(|m| m.message_id == message_id) {
            Some(QueueSlot::Unread)
        } else if self.history.iter().any(|m| m.message_id == message_id) {
            Some(QueueSlot::History)
        } else {
            None
        }
    }

    pub fn record_decision(&mut self, thought: impl Into<String>, action: impl Into<String>) {
        self.decision_history
            .push_back(DecisionRecord::new(thought, action));
        while self.decision_history.len() > DECISION_HISTORY_CAP {
            self.decision_history.pop_front();
        }
    }

    pub fn decisions(&self) -> impl Iterator<Item = &DecisionRecord> {
        self.decision_history.iter()
    }

    pub fn interruption_count(&self) -> u32 {
        self.state.interruption_count
    }

    pub fn increment_interruption_count(&mut self) {
        self.state.interruption_count += 1;
        self.state.last_interruption_time = Some(Utc::now());
        self.persist_state();
    }

    pub fn reset_interruption_count(&mut self) {
        self.state.interruption_count = 0;
        self.persist_state();
    }

    /// Daily counter reset; called from the scheduler's housekeeping.
    pub fn reset_daily(&mut self, today: chrono::NaiveDate) {
        if self.state.last_reset_date != Some(today) {
            self.state.interruption_count = 0;
            self.state.last_reset_date = Some(today);
            self.persist_state();
        }
    }

    /// Chance that a newly arrived message interrupts the running cycle.
    pub fn interruption_probability(&self, max_limit: u32, min_prob: f64) -> f64 {
        interruption_probability(self.state.interruption_count, max_limit, min_prob)
    }
}

/// Steeply decaying interruption curve with a floor at `min_prob` and a hard
/// zero at the limit: counts 0..3 give ~{0.8, 0.35, 0.15, min} with the
/// default floor of 0.1.
pub fn interruption_probability(count: u32, max_limit: u32, min_prob: f64) -> f64 {
    if count >= max_limit {
        return 0.0;
    }
    let decay = INTERRUPT_DECAY.get(count as usize).copied().unwrap_or(0.0);
    (decay + min_prob).max(min_prob)
}

#[cfg(test)]
mod tests {
    use fennec_types::StreamKey;

    use super::*;

    fn context() -> StreamContext {
        StreamContext::new(StreamKey::group("qq", "g1").stream_id(), 3, None)
    }

    fn message(id: &str, at: i64) -> Message {
        Message::new(id, "qq", "u1", "hello").at_unix(at)
    }

    #[test]
    fn messages_live_in_exactly_one_queue() {
        let mut ctx = context();

        ctx.add_message(message("m1", 1), false);
        assert_eq!(ctx.locate("m1"), Some(QueueSlot::Unread));

        ctx.set_chatter_processing(true);
        ctx.add_message(message("m2", 2), false);
        assert_eq!(ctx.locate("m2"), Some(QueueSlot::Cache));

        // force_direct bypasses the cache even mid-processing, and flushes
        // the cache first, so m2 moves to unread.
        ctx.add_message(message("m3", 3), true);
        assert_eq!(ctx.locate("m3"), Some(QueueSlot::Unread));
        assert_eq!(ctx.locate("m2"), Some(QueueSlot::Unread));

        ctx.mark_read("m1");
        assert_eq!(ctx.locate("m1"), Some(QueueSlot::History));

        // Exactly one queue at every point above; duplicates rejected.
        assert!(!ctx.add_message(message("m1", 9), false));
    }

    #[test]
    fn history_is_bounded() {
        let mut ctx = context();
        for i in 0..10 {
            let id = format!("m{i}");
            ctx.add_message(message(&id, i), false);
            ctx.mark_read(&id);
        }
        assert_eq!(ctx.history_len(), 3);
        // Oldest evicted silently.
        assert_eq!(ctx.locate("m0"), None);
        assert_eq!(ctx.locate("m9"), Some(QueueSlot::History));
    }

    #[test]
    fn mark_read_on_unknown_id_is_a_noop() {
        let mut ctx = context();
        ctx.mark_read("ghost");
        assert_eq!(ctx.history_len(), 0);
    }

    #[test]
    fn get_messages_sorts_by_time_and_limits() {
        let mut ctx = context();
        ctx.add_message(message("m2", 20), false);
        ctx.add_message(message("m1", 10), false);
        ctx.mark_read("m1");

        let all = ctx.get_messages(10, true);
        assert_eq!(
            all.iter().map(|m| m.message_id.as_str()).collect::<Vec<_>>(),
            vec!["m1", "m2"]
        );

        let history_only = ctx.get_messages(10, false);
        assert_eq!(history_only.len(), 1);

        let limited = ctx.get_messages(1, true);
        assert_eq!(limited[0].message_id, "m2");
    }

    #[test]
    fn decision_history_is_capped() {
        let mut ctx = context();
        for i in 0..80 {
            ctx.record_decision(format!("thought {i}"), "no_reply");
        }
        assert_eq!(ctx.decisions().count(), DECISION_HISTORY_CAP);
        // Oldest entries dropped silently.
        assert!(ctx.decisions().next().unwrap().thought.contains("30"));
    }

    #[test]
    fn interruption_curve_matches_documented_distribution() {
        assert!((interruption_probability(0, 5, 0.1) - 0.8).abs() < 1e-9);
        assert!((interruption_probability(1, 5, 0.1) - 0.35).abs() < 1e-9);
        assert!((interruption_probability(2, 5, 0.1) - 0.15).abs() < 1e-9);
        assert!((interruption_probability(3, 5, 0.1) - 0.1).abs() < 1e-9);
        assert!((interruption_probability(4, 5, 0.1) - 0.1).abs() < 1e-9);
        assert_eq!(interruption_probability(5, 5, 0.1), 0.0);
        assert_eq!(interruption_probability(9, 5, 0.1), 0.0);
    }

    #[test]
    fn interruption_distribution_over_many_trials() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        for (count, expected) in [(0u32, 0.8f64), (1, 0.35), (2, 0.15), (3, 0.1), (4, 0.1)] {
            let p = interruption_probability(count, 5, 0.1);
            let trials = 10_000;
            let hits = (0..trials)
                .filter(|_| rng.gen_range(0.0..1.0) < p)
                .count() as f64;
            let observed = hits / f64::from(trials);
            assert!(
                (observed - expected).abs() < 0.02,
                "count {count}: observed {observed}, expected {expected}"
            );
        }
    }

    #[test]
    fn context_state_persists() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path().join("kv.redb")).unwrap();
        let stream_id = StreamKey::group("qq", "g1").stream_id();

        {
            let mut ctx = StreamContext::new(stream_id.clone(), 40, Some(kv.clone()));
            ctx.increment_interruption_count();
            ctx.increment_interruption_count();
        }
        let ctx = StreamContext::new(stream_id, 40, Some(kv));
        assert_eq!(ctx.interruption_count(), 2);
    }
}
