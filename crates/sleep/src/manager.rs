//! The sleep-cycle state machine.
//!
//! Driven by a periodic tick; transitions persist immediately so a restart
//! resumes mid-cycle. Being forced awake goes through
//! [`SleepManager::force_woken_up`], which the wake-up manager's threshold
//! crossing triggers.

use chrono::{Duration, NaiveDateTime};
use rand::Rng;
use tracing::{debug, info, warn};

use fennec_config::SleepConfig;
use fennec_store::KvStore;

use crate::state::{SleepState, SleepStateRecord};
use crate::wakeup::WakeUpManager;
use crate::window::SleepWindow;

pub const SLEEP_STATE_KEY: &str = "schedule_sleep_state";

/// Observable transitions surfaced to the runtime (notifications, mood).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SleepEvent {
    /// Entered the pre-sleep buffer; send the pre-sleep notification if
    /// configured.
    PreparingSleep,
    FellAsleep,
    WokeNaturally,
    EnteredInsomnia,
    InsomniaEnded,
}

pub struct SleepManager {
    config: SleepConfig,
    kv: KvStore,
    window: SleepWindow,
    record: SleepStateRecord,
}

impl SleepManager {
    pub fn new(config: SleepConfig, kv: KvStore, window: SleepWindow) -> Self {
        let record = kv
            .get::<SleepStateRecord>(SLEEP_STATE_KEY)
            .ok()
            .flatten()
            .unwrap_or_default();
        Self {
            config,
            kv,
            window,
            record,
        }
    }

    pub fn current_state(&self) -> SleepState {
        self.record.current_state
    }

    pub fn is_sleeping(&self) -> bool {
        self.record.current_state == SleepState::Sleeping
    }

    fn save(&self) {
        if let Err(err) = self.kv.set(SLEEP_STATE_KEY, &self.record) {
            warn!(%err, "failed to persist sleep state");
        }
    }

    fn transition(&mut self, to: SleepState) {
        if self.record.current_state != to {
            info!(from = ?self.record.current_state, ?to, "sleep state transition");
            self.record.current_state = to;
        }
        self.save();
    }

    /// External wake-up from the wake-up manager's anger threshold.
    pub fn force_woken_up(&mut self, now: NaiveDateTime) {
        if matches!(
            self.record.current_state,
            SleepState::PreparingSleep | SleepState::Sleeping | SleepState::Insomnia
        ) {
            self.record.sleep_buffer_end_time = None;
            self.record.insomnia_check_time = None;
            self.record.insomnia_end_time = None;
            self.record.re_sleep_attempt_time =
                Some(now + Duration::minutes(self.config.re_sleep_delay_minutes as i64));
            self.transition(SleepState::WokenUp);
        }
    }

    /// One tick of the state machine.
    pub fn update(&mut self, now: NaiveDateTime, wakeup: &mut WakeUpManager) -> Vec<SleepEvent> {
        let mut events = Vec::new();

        if !self.config.enable {
            if self.record.current_state != SleepState::Awake {
                self.transition(SleepState::Awake);
            }
            return events;
        }

        // Daily reset.
        let today = now.date();
        if self.record.last_sleep_check_date != Some(today) {
            debug!(%today, "new day, resetting sleep bookkeeping");
            self.record.total_delayed_minutes_today = 0;
            self.record.last_sleep_check_date = Some(today);
            self.save();
        }

        let in_window = self.window.is_in_sleep_window(today, now.time());

        match self.record.current_state {
            SleepState::Awake => {
                if in_window {
                    events.extend(self.begin_sleep_descent(now, wakeup));
                }
            }

            SleepState::PreparingSleep => {
                if !in_window {
                    self.record.sleep_buffer_end_time = None;
                    self.transition(SleepState::Awake);
                } else if self
                    .record
                    .sleep_buffer_end_time
                    .is_some_and(|end| now >= end)
                {
                    self.record.sleep_buffer_end_time = None;
                    self.record.insomnia_check_time = Some(
                        now + Duration::minutes(
                            self.config.insomnia_trigger_delay_minutes as i64,
                        ),
                    );
                    self.transition(SleepState::Sleeping);
                    events.push(SleepEvent::FellAsleep);
                }
            }

            SleepState::Sleeping => {
                if !in_window {
                    self.record.insomnia_check_time = None;
                    self.transition(SleepState::Awake);
                    events.push(SleepEvent::WokeNaturally);
                } else if self
                    .record
                    .insomnia_check_time
                    .is_some_and(|at| now >= at)
                {
                    self.record.insomnia_check_time = None;
                    if wakeup.check_for_insomnia() {
                        self.record.insomnia_end_time = Some(
                            now + Duration::minutes(self.config.insomnia_duration_minutes as i64),
                        );
                        self.transition(SleepState::Insomnia);
                        events.push(SleepEvent::EnteredInsomnia);
                    } else {
                        self.save();
                    }
                }
            }

            SleepState::Insomnia => {
                if !in_window {
                    self.record.insomnia_end_time = None;
                    self.transition(SleepState::Awake);
                    events.push(SleepEvent::WokeNaturally);
                } else if self.record.insomnia_end_time.is_some_and(|end| now >= end) {
                    self.record.insomnia_end_time = None;
                    self.transition(SleepState::Sleeping);
                    events.push(SleepEvent::InsomniaEnded);
                }
            }

            SleepState::WokenUp => {
                if !in_window {
                    self.record.re_sleep_attempt_time = None;
                    self.transition(SleepState::Awake);
                } else if self
                    .record
                    .re_sleep_attempt_time
                    .is_some_and(|at| now >= at)
                {
                    // Re-sleep only once pressure has built back up;
                    // otherwise stay awake a while longer.
                    if wakeup.sleep_pressure() >= self.config.sleep_pressure_threshold {
                        let buffer_secs = rand::thread_rng().gen_range(3 * 60..=8 * 60);
                        self.record.re_sleep_attempt_time = None;
                        self.record.sleep_buffer_end_time =
                            Some(now + Duration::seconds(buffer_secs));
                        self.transition(SleepState::PreparingSleep);
                        events.push(SleepEvent::PreparingSleep);
                    } else {
                        self.record.re_sleep_attempt_time = Some(
                            now + Duration::minutes(self.config.re_sleep_delay_minutes as i64),
                        );
                        self.save();
                    }
                }
            }
        }

        events
    }

    /// AWAKE → PREPARING_SLEEP, optionally delayed by flexible sleep when
    /// pressure is still low.
    fn begin_sleep_descent(
        &mut self,
        now: NaiveDateTime,
        wakeup: &mut WakeUpManager,
    ) -> Vec<SleepEvent> {
        let mut rng = rand::thread_rng();
        let pressure = wakeup.sleep_pressure();
        let threshold = self.config.flexible_sleep_pressure_threshold;
        let budget_left = self
            .config
            .max_sleep_delay_minutes
            .saturating_sub(self.record.total_delayed_minutes_today);

        let buffer = if self.config.enable_flexible_sleep && pressure <= threshold && budget_left > 0
        {
            // Low pressure delays sleep proportionally to how far below the
            // threshold it sits, clamped by the remaining daily budget.
            let pressure_diff = ((threshold - pressure) / threshold.max(1.0)).clamp(0.0, 1.0);
            let delay_minutes =
                ((pressure_diff * f64::from(self.config.max_sleep_delay_minutes)) as u32)
                    .min(budget_left)
                    .max(1);
            self.record.total_delayed_minutes_today += delay_minutes;

            let jittered = f64::from(delay_minutes) * rng.gen_range(0.8..=1.2);
            Duration::seconds((jittered * 60.0) as i64)
        } else {
            Duration::seconds(rng.gen_range(60..=120))
        };

        info!(buffer_secs = buffer.num_seconds(), pressure, "entering pre-sleep buffer");
        self.record.sleep_buffer_end_time = Some(now + buffer);
        self.transition(SleepState::PreparingSleep);
        vec![SleepEvent::PreparingSleep]
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveDateTime};

    use super::*;
    use crate::window::SleepWindow;

    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn config() -> SleepConfig {
        SleepConfig {
            enable: true,
            enable_flexible_sleep: false,
            enable_insomnia_system: false,
            sleep_by_schedule: false,
            fixed_sleep_time: "23:00".to_string(),
            fixed_wake_up_time: "07:00".to_string(),
            sleep_time_offset_minutes: 0,
            wake_up_time_offset_minutes: 0,
            wakeup_threshold: 5.0,
            private_message_increment: 1.0,
            sleep_pressure_threshold: 50.0,
            re_sleep_delay_minutes: 10,
            ..Default::default()
        }
    }

    fn setup(config: SleepConfig) -> (tempfile::TempDir, SleepManager, WakeUpManager) {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path().join("kv.redb")).unwrap();
        let window = SleepWindow::new(config.clone(), None);
        let manager = SleepManager::new(config.clone(), kv.clone(), window);
        let wakeup = WakeUpManager::global(config, kv);
        (dir, manager, wakeup)
    }

    #[test]
    fn full_night_cycle() {
        let (_dir, mut manager, mut wakeup) = setup(config());

        // Daytime: stays awake.
        assert!(manager.update(at(10, 12, 0), &mut wakeup).is_empty());
        assert_eq!(manager.current_state(), SleepState::Awake);

        // Window entry: pre-sleep buffer of 1-2 minutes.
        let events = manager.update(at(10, 23, 0), &mut wakeup);
        assert_eq!(events, vec![SleepEvent::PreparingSleep]);
        assert_eq!(manager.current_state(), SleepState::PreparingSleep);

        // Buffer elapsed by 23:05.
        let events = manager.update(at(10, 23, 5), &mut wakeup);
        assert_eq!(events, vec![SleepEvent::FellAsleep]);
        assert!(manager.is_sleeping());

        // Stays asleep through the night, wakes when the window ends.
        assert!(manager.update(at(11, 3, 0), &mut wakeup).is_empty());
        let events = manager.update(at(11, 7, 30), &mut wakeup);
        assert_eq!(events, vec![SleepEvent::WokeNaturally]);
        assert_eq!(manager.current_state(), SleepState::Awake);
    }

    #[test]
    fn forced_wakeup_then_re_sleep_when_pressure_is_high() {
        let (_dir, mut manager, mut wakeup) = setup(config());

        manager.update(at(10, 23, 0), &mut wakeup);
        manager.update(at(10, 23, 5), &mut wakeup);
        assert!(manager.is_sleeping());

        manager.force_woken_up(at(10, 23, 30));
        assert_eq!(manager.current_state(), SleepState::WokenUp);

        // Before the re-sleep delay nothing happens.
        assert!(manager.update(at(10, 23, 35), &mut wakeup).is_empty());
        assert_eq!(manager.current_state(), SleepState::WokenUp);

        // After the delay with pressure above threshold: back to preparing.
        wakeup.set_sleep_pressure(80.0);
        let events = manager.update(at(10, 23, 41), &mut wakeup);
        assert_eq!(events, vec![SleepEvent::PreparingSleep]);

        // And the shortened buffer leads back into sleep.
        let events = manager.update(at(10, 23, 55), &mut wakeup);
        assert_eq!(events, vec![SleepEvent::FellAsleep]);
    }

    #[test]
    fn low_pressure_extends_the_re_sleep_delay() {
        let (_dir, mut manager, mut wakeup) = setup(config());

        manager.update(at(10, 23, 0), &mut wakeup);
        manager.update(at(10, 23, 5), &mut wakeup);
        manager.force_woken_up(at(10, 23, 30));

        wakeup.set_sleep_pressure(10.0);
        assert!(manager.update(at(10, 23, 41), &mut wakeup).is_empty());
        assert_eq!(manager.current_state(), SleepState::WokenUp);
    }

    #[test]
    fn insomnia_check_can_enter_and_exit_insomnia() {
        let mut config = config();
        config.enable_insomnia_system = true;
        config.insomnia_chance_low_pressure = 1.0;
        config.insomnia_chance_normal_pressure = 1.0;
        config.insomnia_trigger_delay_minutes = 20;
        config.insomnia_duration_minutes = 30;
        config.deep_sleep_threshold = 85.0;
        let (_dir, mut manager, mut wakeup) = setup(config);

        wakeup.set_sleep_pressure(30.0);
        manager.update(at(10, 23, 0), &mut wakeup);
        manager.update(at(10, 23, 5), &mut wakeup);
        assert!(manager.is_sleeping());

        // Insomnia check fires 20 minutes after falling asleep.
        let events = manager.update(at(10, 23, 26), &mut wakeup);
        assert_eq!(events, vec![SleepEvent::EnteredInsomnia]);
        assert_eq!(manager.current_state(), SleepState::Insomnia);

        // Insomnia runs its configured course, then back to sleeping.
        let events = manager.update(at(10, 23, 57), &mut wakeup);
        assert_eq!(events, vec![SleepEvent::InsomniaEnded]);
        assert!(manager.is_sleeping());
    }

    #[test]
    fn deep_sleep_never_gets_insomnia() {
        let mut config = config();
        config.enable_insomnia_system = true;
        config.insomnia_chance_low_pressure = 1.0;
        config.insomnia_chance_normal_pressure = 1.0;
        config.deep_sleep_threshold = 85.0;
        let (_dir, mut manager, mut wakeup) = setup(config);

        wakeup.set_sleep_pressure(95.0);
        manager.update(at(10, 23, 0), &mut wakeup);
        manager.update(at(10, 23, 5), &mut wakeup);
        let events = manager.update(at(10, 23, 30), &mut wakeup);
        assert!(events.is_empty());
        assert!(manager.is_sleeping());
    }

    #[test]
    fn flexible_sleep_consumes_the_daily_delay_budget() {
        let mut config = config();
        config.enable_flexible_sleep = true;
        config.flexible_sleep_pressure_threshold = 60.0;
        config.max_sleep_delay_minutes = 60;
        let (_dir, mut manager, mut wakeup) = setup(config);

        wakeup.set_sleep_pressure(0.0);
        manager.update(at(10, 23, 0), &mut wakeup);
        assert_eq!(manager.current_state(), SleepState::PreparingSleep);
        // Pressure at zero means the full budget is spent in one delay.
        assert_eq!(manager.record.total_delayed_minutes_today, 60);
    }

    #[test]
    fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path().join("kv.redb")).unwrap();
        {
            let window = SleepWindow::new(config(), None);
            let mut manager = SleepManager::new(config(), kv.clone(), window);
            let mut wakeup = WakeUpManager::global(config(), kv.clone());
            manager.update(at(10, 23, 0), &mut wakeup);
            manager.update(at(10, 23, 5), &mut wakeup);
            assert!(manager.is_sleeping());
        }
        let window = SleepWindow::new(config(), None);
        let manager = SleepManager::new(config(), kv, window);
        assert!(manager.is_sleeping());
    }
}
