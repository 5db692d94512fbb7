//! Per-process pipeline counters, periodically persisted.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::warn;

use fennec_store::KvStore;

const STATS_KEY: &str = "anti_injection_stats";

#[derive(Debug, Default)]
pub struct GuardStats {
    pub total_messages: AtomicU64,
    pub detected_injections: AtomicU64,
    pub blocked_messages: AtomicU64,
    pub shielded_messages: AtomicU64,
    pub counter_attacks: AtomicU64,
    pub error_count: AtomicU64,
    pub total_processing_micros: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardStatsSnapshot {
    pub total_messages: u64,
    pub detected_injections: u64,
    pub blocked_messages: u64,
    pub shielded_messages: u64,
    pub counter_attacks: u64,
    pub error_count: u64,
    pub total_processing_micros: u64,
}

impl GuardStats {
    pub fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_processing_micros(&self, micros: u64) {
        self.total_processing_micros
            .fetch_add(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GuardStatsSnapshot {
        GuardStatsSnapshot {
            total_messages: self.total_messages.load(Ordering::Relaxed),
            detected_injections: self.detected_injections.load(Ordering::Relaxed),
            blocked_messages: self.blocked_messages.load(Ordering::Relaxed),
            shielded_messages: self.shielded_messages.load(Ordering::Relaxed),
            counter_attacks: self.counter_attacks.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            total_processing_micros: self.total_processing_micros.load(Ordering::Relaxed),
        }
    }

    pub fn persist(&self, kv: &KvStore) {
        if let Err(err) = kv.set(STATS_KEY, &self.snapshot()) {
            warn!(%err, "failed to persist guard stats");
        }
    }

    pub fn restore(&self, kv: &KvStore) {
        let Ok(Some(snapshot)) = kv.get::<GuardStatsSnapshot>(STATS_KEY) else {
            return;
        };
        self.total_messages
            .store(snapshot.total_messages, Ordering::Relaxed);
        self.detected_injections
            .store(snapshot.detected_injections, Ordering::Relaxed);
        self.blocked_messages
            .store(snapshot.blocked_messages, Ordering::Relaxed);
        self.shielded_messages
            .store(snapshot.shielded_messages, Ordering::Relaxed);
        self.counter_attacks
            .store(snapshot.counter_attacks, Ordering::Relaxed);
        self.error_count.store(snapshot.error_count, Ordering::Relaxed);
        self.total_processing_micros
            .store(snapshot.total_processing_micros, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path().join("kv.redb")).unwrap();

        let stats = GuardStats::default();
        stats.bump(&stats.total_messages);
        stats.bump(&stats.detected_injections);
        stats.add_processing_micros(1500);
        stats.persist(&kv);

        let restored = GuardStats::default();
        restored.restore(&kv);
        let snap = restored.snapshot();
        assert_eq!(snap.total_messages, 1);
        assert_eq!(snap.detected_injections, 1);
        assert_eq!(snap.total_processing_micros, 1500);
    }
}
