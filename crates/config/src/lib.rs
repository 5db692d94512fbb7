use std::fs;
use std::path::Path;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

mod watch;

pub use watch::ConfigWatcher;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub nickname: String,
    pub alias_names: Vec<String>,
    pub platform: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            nickname: "Fennec".to_string(),
            alias_names: Vec::new(),
            platform: "qq".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub max_context_size: usize,
    pub context_ttl_secs: u64,
    pub mentioned_bot_inevitable_reply: bool,
    pub at_bot_inevitable_reply: bool,
    pub proactive_thinking_interval_secs: u64,
    pub delta_sigma: f64,
    pub enable_proactive_thinking: bool,
    pub proactive_thinking_in_group: bool,
    pub proactive_thinking_in_private: bool,
    /// Wall-clock budget for one planner cycle, in seconds.
    pub thinking_timeout_secs: u64,
    pub notice_trigger_chat: bool,
    /// Hard cap on interruption rolls per processing run.
    pub interruption_max_limit: u32,
    /// Floor probability for an interruption roll.
    pub interruption_min_probability: f64,
    /// Cached messages beyond this count are merged into `unread` and an
    /// interruption check fires.
    pub cache_overflow_size: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_context_size: 40,
            context_ttl_secs: 12 * 3600,
            mentioned_bot_inevitable_reply: false,
            at_bot_inevitable_reply: false,
            proactive_thinking_interval_secs: 1800,
            delta_sigma: 120.0,
            enable_proactive_thinking: false,
            proactive_thinking_in_group: false,
            proactive_thinking_in_private: false,
            thinking_timeout_secs: 120,
            notice_trigger_chat: false,
            interruption_max_limit: 5,
            interruption_min_probability: 0.1,
            cache_overflow_size: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AffinityConfig {
    pub keyword_match_weight: f64,
    pub relationship_weight: f64,
    pub mention_bot_weight: f64,
    pub reply_action_interest_threshold: f64,
    pub mention_bot_adjustment_threshold: f64,
    pub non_reply_action_interest_threshold: f64,
    pub mention_bot_interest_score: f64,
    pub base_relationship_score: f64,
    pub max_no_reply_count: u32,
    pub no_reply_threshold_adjustment: f64,
    pub reply_cooldown_reduction: u32,
    pub match_count_bonus: f64,
    pub max_match_bonus: f64,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            keyword_match_weight: 0.5,
            relationship_weight: 0.3,
            mention_bot_weight: 0.2,
            reply_action_interest_threshold: 0.4,
            mention_bot_adjustment_threshold: 0.2,
            non_reply_action_interest_threshold: 0.25,
            mention_bot_interest_score: 0.3,
            base_relationship_score: 0.3,
            max_no_reply_count: 10,
            no_reply_threshold_adjustment: 0.3,
            reply_cooldown_reduction: 2,
            match_count_bonus: 0.05,
            max_match_bonus: 0.2,
        }
    }
}

impl AffinityConfig {
    /// Threshold reduction applied per consecutive unanswered message.
    ///
    /// `validate()` guarantees `max_no_reply_count >= 1`.
    pub fn boost_per_no_reply(&self) -> f64 {
        self.no_reply_threshold_adjustment / self.max_no_reply_count as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    Strict,
    Lenient,
    Auto,
    CounterAttack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiInjectionConfig {
    pub enabled: bool,
    pub process_mode: ProcessMode,
    /// Exact `platform:user_id` pairs that bypass detection.
    pub whitelist: Vec<String>,
    pub auto_ban_enabled: bool,
    pub auto_ban_violation_threshold: u32,
    pub auto_ban_duration_hours: u64,
    pub enabled_rules: bool,
    pub enabled_llm: bool,
    pub llm_detection_enabled: bool,
    pub llm_detection_threshold: f64,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub max_message_length: usize,
}

impl Default for AntiInjectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            process_mode: ProcessMode::Lenient,
            whitelist: Vec::new(),
            auto_ban_enabled: true,
            auto_ban_violation_threshold: 3,
            auto_ban_duration_hours: 24,
            enabled_rules: true,
            enabled_llm: false,
            llm_detection_enabled: false,
            llm_detection_threshold: 0.7,
            cache_enabled: true,
            cache_ttl_secs: 300,
            max_message_length: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub vector_dimension: usize,
    pub vector_similarity_threshold: f64,
    pub metadata_filter_limit: usize,
    pub final_result_limit: usize,
    pub memory_value_threshold: f64,
    pub min_memory_length: usize,
    pub max_memory_length: usize,
    /// Minimum seconds between two builds for the same scope.
    pub memory_build_interval_secs: u64,
    pub fusion_similarity_threshold: f64,
    pub deduplication_window_hours: u64,
    pub enable_memory_forgetting: bool,
    pub vector_db_retention_hours: u64,
    pub vector_db_enable_caching: bool,
    pub auto_cleanup_interval_secs: u64,
    pub enable_query_planner: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            vector_dimension: 768,
            vector_similarity_threshold: 0.5,
            metadata_filter_limit: 40,
            final_result_limit: 10,
            memory_value_threshold: 0.3,
            min_memory_length: 5,
            max_memory_length: 500,
            memory_build_interval_secs: 60,
            fusion_similarity_threshold: 0.85,
            deduplication_window_hours: 24,
            enable_memory_forgetting: true,
            vector_db_retention_hours: 24 * 30,
            vector_db_enable_caching: true,
            auto_cleanup_interval_secs: 3600,
            enable_query_planner: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SleepConfig {
    pub enable: bool,
    pub wakeup_threshold: f64,
    pub private_message_increment: f64,
    pub group_mention_increment: f64,
    pub decay_rate: f64,
    pub decay_interval_secs: u64,
    pub angry_duration_secs: u64,
    pub angry_prompt: String,
    pub enable_flexible_sleep: bool,
    pub flexible_sleep_pressure_threshold: f64,
    pub max_sleep_delay_minutes: u32,
    pub enable_insomnia_system: bool,
    pub sleep_pressure_threshold: f64,
    pub deep_sleep_threshold: f64,
    pub insomnia_chance_low_pressure: f64,
    pub insomnia_chance_normal_pressure: f64,
    pub insomnia_trigger_delay_minutes: u32,
    pub insomnia_duration_minutes: u32,
    pub re_sleep_delay_minutes: u32,
    /// When true the sleep window comes from the daily schedule; otherwise
    /// from the fixed HH:MM range below.
    pub sleep_by_schedule: bool,
    pub fixed_sleep_time: String,
    pub fixed_wake_up_time: String,
    pub sleep_time_offset_minutes: u32,
    pub wake_up_time_offset_minutes: u32,
    pub enable_pre_sleep_notification: bool,
    pub pre_sleep_prompt: String,
    pub pre_sleep_notification_groups: Vec<String>,
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self {
            enable: false,
            wakeup_threshold: 5.0,
            private_message_increment: 1.0,
            group_mention_increment: 0.5,
            decay_rate: 0.5,
            decay_interval_secs: 60,
            angry_duration_secs: 600,
            angry_prompt: "你刚被消息吵醒，语气很不耐烦。".to_string(),
            enable_flexible_sleep: true,
            flexible_sleep_pressure_threshold: 60.0,
            max_sleep_delay_minutes: 60,
            enable_insomnia_system: true,
            sleep_pressure_threshold: 50.0,
            deep_sleep_threshold: 85.0,
            insomnia_chance_low_pressure: 0.4,
            insomnia_chance_normal_pressure: 0.1,
            insomnia_trigger_delay_minutes: 20,
            insomnia_duration_minutes: 30,
            re_sleep_delay_minutes: 10,
            sleep_by_schedule: false,
            fixed_sleep_time: "23:00".to_string(),
            fixed_wake_up_time: "07:00".to_string(),
            sleep_time_offset_minutes: 20,
            wake_up_time_offset_minutes: 20,
            enable_pre_sleep_notification: false,
            pre_sleep_prompt: String::new(),
            pre_sleep_notification_groups: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub enable_database_cache: bool,
    pub cache_l1_max_size: usize,
    pub cache_l1_ttl_secs: u64,
    pub cache_l2_max_size: usize,
    pub cache_l2_ttl_secs: u64,
    pub cache_max_memory_mb: usize,
    pub cache_max_item_size_mb: usize,
    pub cache_cleanup_interval_secs: u64,
    /// Message batcher commits when this many rows are pending...
    pub batch_commit_size: usize,
    /// ...or when this many seconds have elapsed since the last commit.
    pub batch_commit_interval_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enable_database_cache: true,
            cache_l1_max_size: 256,
            cache_l1_ttl_secs: 60,
            cache_l2_max_size: 2048,
            cache_l2_ttl_secs: 900,
            cache_max_memory_mb: 128,
            cache_max_item_size_mb: 4,
            cache_cleanup_interval_secs: 120,
            batch_commit_size: 50,
            batch_commit_interval_secs: 5,
        }
    }
}

/// Model names resolved from the routing selectors used across the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelRouting {
    pub default: String,
    pub utils: String,
    pub anti_injection: String,
    pub schedule_generator: String,
    pub relationship_tracker: String,
    pub counter_attack: String,
    pub video_analysis: String,
    pub embedding: String,
}

impl Default for ModelRouting {
    fn default() -> Self {
        let default_model = "qwen2.5-14b-instruct".to_string();
        Self {
            utils: default_model.clone(),
            anti_injection: default_model.clone(),
            schedule_generator: default_model.clone(),
            relationship_tracker: default_model.clone(),
            counter_attack: default_model.clone(),
            video_analysis: default_model.clone(),
            embedding: "text-embedding-v3".to_string(),
            default: default_model,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub models: ModelRouting,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            api_key_env: "FENNEC_API_KEY".to_string(),
            request_timeout_secs: 60,
            max_retries: 3,
            models: ModelRouting::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub chat: ChatConfig,
    pub affinity_flow: AffinityConfig,
    pub anti_prompt_injection: AntiInjectionConfig,
    pub memory: MemoryConfig,
    pub sleep_system: SleepConfig,
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.affinity_flow.max_no_reply_count == 0 {
            bail!("affinity_flow.max_no_reply_count must be >= 1 (the fairness boost divides by it)");
        }
        if self.memory.vector_dimension == 0 {
            bail!("memory.vector_dimension must be > 0");
        }
        if self.memory.min_memory_length >= self.memory.max_memory_length {
            bail!(
                "memory.min_memory_length ({}) must be below max_memory_length ({})",
                self.memory.min_memory_length,
                self.memory.max_memory_length
            );
        }
        for (field, value) in [
            ("fixed_sleep_time", &self.sleep_system.fixed_sleep_time),
            ("fixed_wake_up_time", &self.sleep_system.fixed_wake_up_time),
        ] {
            if parse_hhmm(value).is_none() {
                bail!("sleep_system.{field} is not a valid HH:MM time: {value:?}");
            }
        }
        Ok(())
    }
}

/// Parse a `HH:MM` clock string into (hour, minute).
pub fn parse_hhmm(value: &str) -> Option<(u32, u32)> {
    let (h, m) = value.split_once(':')?;
    let hour: u32 = h.trim().parse().ok()?;
    let minute: u32 = m.trim().parse().ok()?;
    (hour < 24 && minute < 60).then_some((hour, minute))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_max_no_reply_count_is_rejected() {
        let mut config = AppConfig::default();
        config.affinity_flow.max_no_reply_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_sleep_time_is_rejected() {
        let mut config = AppConfig::default();
        config.sleep_system.fixed_sleep_time = "25:70".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fennec.toml");

        let mut config = AppConfig::default();
        config.bot.nickname = "麦麦".to_string();
        config.affinity_flow.reply_action_interest_threshold = 0.55;
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.bot.nickname, "麦麦");
        assert_eq!(loaded.affinity_flow.reply_action_interest_threshold, 0.55);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let loaded = AppConfig::load_from("/nonexistent/fennec.toml").unwrap();
        assert_eq!(loaded.chat.max_context_size, 40);
    }

    #[test]
    fn boost_per_no_reply_derivation() {
        let affinity = AffinityConfig {
            no_reply_threshold_adjustment: 0.3,
            max_no_reply_count: 10,
            ..Default::default()
        };
        assert!((affinity.boost_per_no_reply() - 0.03).abs() < 1e-9);
    }

    #[test]
    fn parse_hhmm_accepts_and_rejects() {
        assert_eq!(parse_hhmm("23:00"), Some((23, 0)));
        assert_eq!(parse_hhmm("7:5"), Some((7, 5)));
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("oops"), None);
    }
}
