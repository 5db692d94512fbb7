//! Violation accounting and auto-ban windows, persisted in the KV store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use fennec_store::KvStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanRecord {
    pub platform: String,
    pub user_id: String,
    pub violation_num: u32,
    pub reason: String,
    /// Start of the ban window once the threshold is crossed; before that,
    /// the time of the first violation.
    pub created_at: DateTime<Utc>,
}

impl BanRecord {
    /// Banned iff the threshold is met and the window has not elapsed.
    pub fn is_banned(&self, now: DateTime<Utc>, threshold: u32, duration_hours: u64) -> bool {
        self.violation_num >= threshold
            && now - self.created_at < Duration::hours(duration_hours as i64)
    }
}

#[derive(Clone)]
pub struct BanStore {
    kv: KvStore,
    threshold: u32,
    duration_hours: u64,
}

impl BanStore {
    pub fn new(kv: KvStore, threshold: u32, duration_hours: u64) -> Self {
        Self {
            kv,
            threshold,
            duration_hours,
        }
    }

    fn key(platform: &str, user_id: &str) -> String {
        format!("ban_record_{platform}_{user_id}")
    }

    pub fn get(&self, platform: &str, user_id: &str) -> Option<BanRecord> {
        self.kv.get(&Self::key(platform, user_id)).ok().flatten()
    }

    /// Check whether the user is currently banned. Expired bans reset the
    /// violation count so the user starts clean.
    pub fn check(&self, platform: &str, user_id: &str, now: DateTime<Utc>) -> Option<BanRecord> {
        let mut record = self.get(platform, user_id)?;
        if record.is_banned(now, self.threshold, self.duration_hours) {
            return Some(record);
        }

        if record.violation_num >= self.threshold {
            // Window elapsed: reset and persist.
            info!(platform, user_id, "ban expired, resetting violations");
            record.violation_num = 0;
            record.created_at = now;
            if let Err(err) = self.kv.set(&Self::key(platform, user_id), &record) {
                warn!(%err, "failed to persist ban reset");
            }
        }
        None
    }

    /// Record one violation. The ban window starts the moment the count
    /// first reaches the threshold, not at the first violation.
    pub fn record_violation(
        &self,
        platform: &str,
        user_id: &str,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> BanRecord {
        let mut record = self.get(platform, user_id).unwrap_or_else(|| BanRecord {
            platform: platform.to_string(),
            user_id: user_id.to_string(),
            violation_num: 0,
            reason: String::new(),
            created_at: now,
        });

        record.violation_num += 1;
        record.reason = reason.into();
        if record.violation_num == self.threshold {
            record.created_at = now;
            warn!(
                platform,
                user_id,
                violations = record.violation_num,
                "violation threshold reached, ban window started"
            );
        }

        if let Err(err) = self.kv.set(&Self::key(platform, user_id), &record) {
            warn!(%err, "failed to persist violation record");
        }
        record
    }

    pub fn remaining_hours(&self, record: &BanRecord, now: DateTime<Utc>) -> i64 {
        let elapsed = now - record.created_at;
        (Duration::hours(self.duration_hours as i64) - elapsed)
            .num_hours()
            .max(0)
    }
}
