use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepState {
    Awake,
    PreparingSleep,
    Sleeping,
    Insomnia,
    WokenUp,
}

/// Persisted sleep-manager state (KV key `schedule_sleep_state`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepStateRecord {
    pub current_state: SleepState,
    pub sleep_buffer_end_time: Option<NaiveDateTime>,
    pub re_sleep_attempt_time: Option<NaiveDateTime>,
    pub insomnia_check_time: Option<NaiveDateTime>,
    pub insomnia_end_time: Option<NaiveDateTime>,
    pub total_delayed_minutes_today: u32,
    pub last_sleep_check_date: Option<NaiveDate>,
}

impl Default for SleepStateRecord {
    fn default() -> Self {
        Self {
            current_state: SleepState::Awake,
            sleep_buffer_end_time: None,
            re_sleep_attempt_time: None,
            insomnia_check_time: None,
            insomnia_end_time: None,
            total_delayed_minutes_today: 0,
            last_sleep_check_date: None,
        }
    }
}

/// Persisted wake-up-manager state (KV key `global_wakeup_manager_state` or
/// `wakeup_manager_state_<stream_id>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeUpStateRecord {
    pub wakeup_value: f64,
    pub is_angry: bool,
    /// Unix seconds; zero when not angry.
    pub angry_start_time: i64,
    pub sleep_pressure: f64,
}

impl Default for WakeUpStateRecord {
    fn default() -> Self {
        Self {
            wakeup_value: 0.0,
            is_angry: false,
            angry_start_time: 0,
            sleep_pressure: 50.0,
        }
    }
}
