//! Where tonight's sleep window comes from: either the daily schedule or a
//! fixed clock range with per-date random jitter.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{Duration, NaiveDate, NaiveTime};
use rand::Rng;
use tracing::warn;

use fennec_config::{SleepConfig, parse_hhmm};

/// Activity names that count as sleep in a schedule.
const SLEEP_KEYWORDS: &[&str] = &["休眠", "睡觉", "梦乡"];

/// One entry of a generated daily schedule.
#[derive(Debug, Clone)]
pub struct ScheduleActivity {
    pub activity: String,
    /// `HH:MM-HH:MM`; may cross midnight.
    pub time_range: String,
}

/// Provider of the day's activities; the schedule generator lives outside
/// the core.
pub trait ScheduleSource: Send + Sync {
    fn today_activities(&self, date: NaiveDate) -> Vec<ScheduleActivity>;
}

/// Resolves "are we inside the theoretical sleep window right now".
pub struct SleepWindow {
    config: SleepConfig,
    schedule: Option<Box<dyn ScheduleSource>>,
    /// Per-date random minute offsets for the fixed window, generated once.
    offsets: Mutex<HashMap<NaiveDate, (i64, i64)>>,
}

impl SleepWindow {
    pub fn new(config: SleepConfig, schedule: Option<Box<dyn ScheduleSource>>) -> Self {
        Self {
            config,
            schedule,
            offsets: Mutex::new(HashMap::new()),
        }
    }

    /// Name of the sleep activity covering `time`, if any.
    pub fn current_sleep_activity(&self, date: NaiveDate, time: NaiveTime) -> Option<String> {
        if self.config.sleep_by_schedule {
            if let Some(schedule) = &self.schedule {
                return schedule
                    .today_activities(date)
                    .into_iter()
                    .filter(|entry| SLEEP_KEYWORDS.iter().any(|k| entry.activity.contains(k)))
                    .find(|entry| range_contains(&entry.time_range, time))
                    .map(|entry| entry.activity);
            }
            // Configured for schedule mode but no source wired: fall through
            // to the fixed window rather than never sleeping.
        }

        let (start, end) = self.fixed_window(date)?;
        in_window(start, end, time).then(|| "休眠".to_string())
    }

    pub fn is_in_sleep_window(&self, date: NaiveDate, time: NaiveTime) -> bool {
        self.current_sleep_activity(date, time).is_some()
    }

    fn fixed_window(&self, date: NaiveDate) -> Option<(NaiveTime, NaiveTime)> {
        let (sleep_h, sleep_m) = parse_hhmm(&self.config.fixed_sleep_time)?;
        let (wake_h, wake_m) = parse_hhmm(&self.config.fixed_wake_up_time)?;
        let base_start = NaiveTime::from_hms_opt(sleep_h, sleep_m, 0)?;
        let base_end = NaiveTime::from_hms_opt(wake_h, wake_m, 0)?;

        let (sleep_offset, wake_offset) = *self
            .offsets
            .lock()
            .unwrap()
            .entry(date)
            .or_insert_with(|| {
                let mut rng = rand::thread_rng();
                let mut jitter = |max: u32| {
                    let max = i64::from(max);
                    if max == 0 { 0 } else { rng.gen_range(-max..=max) }
                };
                (
                    jitter(self.config.sleep_time_offset_minutes),
                    jitter(self.config.wake_up_time_offset_minutes),
                )
            });

        Some((
            base_start + Duration::minutes(sleep_offset),
            base_end + Duration::minutes(wake_offset),
        ))
    }
}

/// Window membership with midnight crossing.
fn in_window(start: NaiveTime, end: NaiveTime, time: NaiveTime) -> bool {
    if start <= end {
        start <= time && time < end
    } else {
        time >= start || time < end
    }
}

fn range_contains(range: &str, time: NaiveTime) -> bool {
    let Some((start_raw, end_raw)) = range.split_once('-') else {
        warn!(range, "unparseable schedule time range");
        return false;
    };
    let parse = |raw: &str| {
        parse_hhmm(raw.trim()).and_then(|(h, m)| NaiveTime::from_hms_opt(h, m, 0))
    };
    match (parse(start_raw), parse(end_raw)) {
        (Some(start), Some(end)) => in_window(start, end, time),
        _ => {
            warn!(range, "unparseable schedule time range");
            false
        }
    }
}
