//! Wake-up pressure accumulation, anger, decay, and insomnia odds.

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, info, warn};

use fennec_config::SleepConfig;
use fennec_store::KvStore;

use crate::state::{SleepState, WakeUpStateRecord};

pub const GLOBAL_WAKEUP_KEY: &str = "global_wakeup_manager_state";

/// Sleep pressure drifts up this much per decay tick while awake...
const PRESSURE_RISE_PER_TICK: f64 = 0.5;
/// ...and drains this much per tick while asleep.
const PRESSURE_DRAIN_PER_TICK: f64 = 1.0;

pub struct WakeUpManager {
    config: SleepConfig,
    kv: KvStore,
    storage_key: String,
    state: WakeUpStateRecord,
}

impl WakeUpManager {
    /// The process-wide manager persisted under [`GLOBAL_WAKEUP_KEY`].
    pub fn global(config: SleepConfig, kv: KvStore) -> Self {
        Self::with_key(config, kv, GLOBAL_WAKEUP_KEY)
    }

    /// A per-stream manager (`wakeup_manager_state_<stream_id>`).
    pub fn for_stream(config: SleepConfig, kv: KvStore, stream_id: &str) -> Self {
        Self::with_key(config, kv, &format!("wakeup_manager_state_{stream_id}"))
    }

    fn with_key(config: SleepConfig, kv: KvStore, key: &str) -> Self {
        let state = kv
            .get::<WakeUpStateRecord>(key)
            .ok()
            .flatten()
            .unwrap_or_default();
        Self {
            config,
            kv,
            storage_key: key.to_string(),
            state,
        }
    }

    fn save(&self) {
        if let Err(err) = self.kv.set(&self.storage_key, &self.state) {
            warn!(%err, key = %self.storage_key, "failed to persist wakeup state");
        }
    }

    pub fn wakeup_value(&self) -> f64 {
        self.state.wakeup_value
    }

    pub fn sleep_pressure(&self) -> f64 {
        self.state.sleep_pressure
    }

    pub fn set_sleep_pressure(&mut self, pressure: f64) {
        self.state.sleep_pressure = pressure.clamp(0.0, 100.0);
        self.save();
    }

    /// Accumulate wake-up pressure from one message. Only counts while the
    /// bot is actually SLEEPING (not insomniac): private messages always,
    /// group messages only when the bot is mentioned.
    ///
    /// Returns true when the threshold was crossed; the caller must then
    /// force the sleep manager into WOKEN_UP and notify the mood system.
    pub fn add_wakeup_value(
        &mut self,
        sleep_state: SleepState,
        is_private_chat: bool,
        is_mentioned: bool,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.config.enable {
            return false;
        }
        if sleep_state != SleepState::Sleeping {
            return false;
        }

        let increment = if is_private_chat {
            self.config.private_message_increment
        } else if is_mentioned {
            self.config.group_mention_increment
        } else {
            return false;
        };

        self.state.wakeup_value += increment;
        debug!(
            value = self.state.wakeup_value,
            threshold = self.config.wakeup_threshold,
            "wakeup value accumulated"
        );

        if self.state.wakeup_value >= self.config.wakeup_threshold {
            self.trigger_wakeup(now);
            return true;
        }
        self.save();
        false
    }

    fn trigger_wakeup(&mut self, now: DateTime<Utc>) {
        self.state.is_angry = true;
        self.state.angry_start_time = now.timestamp();
        self.state.wakeup_value = 0.0;
        self.save();
        info!("wakeup threshold crossed, bot is angry");
    }

    /// One decay tick: wakeup value decays toward zero, expired anger is
    /// cleared, sleep pressure drifts with the sleep state.
    pub fn decay_tick(&mut self, now: DateTime<Utc>, is_sleeping: bool) {
        let mut dirty = false;

        if self.state.is_angry
            && now.timestamp() - self.state.angry_start_time
                >= self.config.angry_duration_secs as i64
        {
            self.state.is_angry = false;
            self.state.angry_start_time = 0;
            info!("anger expired");
            dirty = true;
        }

        if self.state.wakeup_value > 0.0 {
            self.state.wakeup_value =
                (self.state.wakeup_value - self.config.decay_rate).max(0.0);
            dirty = true;
        }

        let drift = if is_sleeping {
            -PRESSURE_DRAIN_PER_TICK
        } else {
            PRESSURE_RISE_PER_TICK
        };
        let new_pressure = (self.state.sleep_pressure + drift).clamp(0.0, 100.0);
        if (new_pressure - self.state.sleep_pressure).abs() > f64::EPSILON {
            self.state.sleep_pressure = new_pressure;
            dirty = true;
        }

        if dirty {
            self.save();
        }
    }

    /// Lazily clears expired anger.
    pub fn is_in_angry_state(&mut self, now: DateTime<Utc>) -> bool {
        if self.state.is_angry
            && now.timestamp() - self.state.angry_start_time
                >= self.config.angry_duration_secs as i64
        {
            self.state.is_angry = false;
            self.state.angry_start_time = 0;
            self.save();
        }
        self.state.is_angry
    }

    pub fn angry_prompt_addition(&mut self, now: DateTime<Utc>) -> Option<String> {
        self.is_in_angry_state(now)
            .then(|| self.config.angry_prompt.clone())
    }

    /// Roll for insomnia at the sleep manager's scheduled check. Deep sleep
    /// (pressure at or above the deep-sleep ceiling) never produces
    /// insomnia; low pressure uses the higher chance.
    pub fn check_for_insomnia(&self) -> bool {
        if !self.config.enable_insomnia_system {
            return false;
        }
        if self.state.sleep_pressure >= self.config.deep_sleep_threshold {
            return false;
        }

        let chance = if self.state.sleep_pressure < self.config.sleep_pressure_threshold {
            self.config.insomnia_chance_low_pressure
        } else {
            self.config.insomnia_chance_normal_pressure
        };
        rand::thread_rng().gen_bool(chance.clamp(0.0, 1.0))
    }

    pub fn status(&self) -> WakeUpStateRecord {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(config: SleepConfig) -> (tempfile::TempDir, WakeUpManager) {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path().join("kv.redb")).unwrap();
        (dir, WakeUpManager::global(config, kv))
    }

    fn config() -> SleepConfig {
        SleepConfig {
            enable: true,
            wakeup_threshold: 5.0,
            private_message_increment: 1.0,
            group_mention_increment: 0.5,
            decay_rate: 0.5,
            angry_duration_secs: 600,
            ..Default::default()
        }
    }

    #[test]
    fn five_private_messages_trigger_anger_exactly_at_threshold() {
        let (_dir, mut manager) = manager(config());
        let now = Utc::now();

        for i in 0..4 {
            let crossed =
                manager.add_wakeup_value(SleepState::Sleeping, true, false, now);
            assert!(!crossed, "message {i} should not cross yet");
        }
        let crossed = manager.add_wakeup_value(SleepState::Sleeping, true, false, now);
        assert!(crossed);

        // Anger set, value reset; triggers only once.
        assert!(manager.is_in_angry_state(now));
        assert_eq!(manager.wakeup_value(), 0.0);
    }

    #[test]
    fn accumulation_only_while_sleeping() {
        let (_dir, mut manager) = manager(config());
        let now = Utc::now();

        assert!(!manager.add_wakeup_value(SleepState::Awake, true, false, now));
        assert!(!manager.add_wakeup_value(SleepState::Insomnia, true, false, now));
        assert_eq!(manager.wakeup_value(), 0.0);

        // Group messages need a mention.
        assert!(!manager.add_wakeup_value(SleepState::Sleeping, false, false, now));
        assert_eq!(manager.wakeup_value(), 0.0);
        manager.add_wakeup_value(SleepState::Sleeping, false, true, now);
        assert_eq!(manager.wakeup_value(), 0.5);
    }

    #[test]
    fn decay_floors_at_zero_and_clears_anger() {
        let (_dir, mut manager) = manager(config());
        let now = Utc::now();

        manager.add_wakeup_value(SleepState::Sleeping, true, false, now);
        manager.decay_tick(now, true);
        assert_eq!(manager.wakeup_value(), 0.5);
        for _ in 0..10 {
            manager.decay_tick(now, true);
        }
        assert_eq!(manager.wakeup_value(), 0.0);

        // Drive to anger, then expire it.
        for _ in 0..5 {
            manager.add_wakeup_value(SleepState::Sleeping, true, false, now);
        }
        assert!(manager.is_in_angry_state(now));
        let later = now + chrono::Duration::seconds(601);
        assert!(!manager.is_in_angry_state(later));
    }

    #[test]
    fn insomnia_rolls_respect_pressure_tiers() {
        let mut certain = config();
        certain.enable_insomnia_system = true;
        certain.insomnia_chance_low_pressure = 1.0;
        certain.insomnia_chance_normal_pressure = 1.0;
        certain.sleep_pressure_threshold = 50.0;
        certain.deep_sleep_threshold = 85.0;

        let (_dir, mut manager) = manager(certain);

        manager.set_sleep_pressure(30.0);
        assert!(manager.check_for_insomnia());

        // Deep sleep never rolls insomnia even at chance 1.0.
        manager.set_sleep_pressure(90.0);
        assert!(!manager.check_for_insomnia());
    }

    #[test]
    fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path().join("kv.redb")).unwrap();
        {
            let mut manager = WakeUpManager::global(config(), kv.clone());
            manager.add_wakeup_value(SleepState::Sleeping, true, false, Utc::now());
        }
        let manager = WakeUpManager::global(config(), kv);
        assert_eq!(manager.wakeup_value(), 1.0);
    }
}
