use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Structured reference to the message a user is replying to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyRef {
    pub message_id: String,
    pub user_id: String,
    pub user_nickname: String,
}

/// Classification flags set by the adapter at ingest time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageFlags {
    pub is_mentioned: bool,
    pub is_emoji: bool,
    pub is_picid: bool,
    pub is_notify: bool,
    pub is_command: bool,
}

/// Adapter-supplied extras that ride along with a message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdditionalConfig {
    pub is_notice: bool,
    pub is_public_notice: bool,
    pub structured_data: Option<serde_json::Value>,
}

/// One atomic event in a conversation.
///
/// Created on ingest; the derived fields (`interest_value`, `should_reply`,
/// `should_act`, `actions`, `key_words`) are filled in later and mutated only
/// by the owning stream context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub time: DateTime<Utc>,
    pub platform: String,
    pub user_id: String,
    pub user_nickname: String,
    pub group_id: Option<String>,
    pub processed_plain_text: String,
    pub display_message: String,
    #[serde(default)]
    pub reply_to: Option<ReplyRef>,
    #[serde(default)]
    pub flags: MessageFlags,
    #[serde(default)]
    pub notice_type: Option<String>,
    #[serde(default)]
    pub additional: AdditionalConfig,

    // Derived fields, filled during planning.
    #[serde(default)]
    pub interest_value: f64,
    #[serde(default)]
    pub should_reply: bool,
    #[serde(default)]
    pub should_act: bool,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub key_words: Vec<String>,
}

impl Message {
    pub fn new(
        message_id: impl Into<String>,
        platform: impl Into<String>,
        user_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let text = text.into();
        Self {
            message_id: message_id.into(),
            time: Utc::now(),
            platform: platform.into(),
            user_id: user_id.into(),
            user_nickname: String::new(),
            group_id: None,
            display_message: text.clone(),
            processed_plain_text: text,
            reply_to: None,
            flags: MessageFlags::default(),
            notice_type: None,
            additional: AdditionalConfig::default(),
            interest_value: 0.0,
            should_reply: false,
            should_act: false,
            actions: Vec::new(),
            key_words: Vec::new(),
        }
    }

    pub fn at_unix(mut self, secs: i64) -> Self {
        self.time = Utc
            .timestamp_opt(secs, 0)
            .single()
            .unwrap_or_else(Utc::now);
        self
    }

    pub fn in_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn from_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.user_nickname = nickname.into();
        self
    }

    pub fn mentioned(mut self) -> Self {
        self.flags.is_mentioned = true;
        self
    }

    /// Synthetic bot-turn message persisted back into history after a reply
    /// is sent.
    pub fn bot_turn(
        message_id: impl Into<String>,
        platform: impl Into<String>,
        bot_id: impl Into<String>,
        bot_nickname: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(message_id, platform, bot_id, text);
        msg.user_nickname = bot_nickname.into();
        msg
    }

    pub fn is_private(&self) -> bool {
        self.group_id.is_none()
    }

    /// Notices arrive either flagged by the adapter or via additional config.
    pub fn is_notice(&self) -> bool {
        self.flags.is_notify || self.additional.is_notice
    }

    pub fn unix_time(&self) -> i64 {
        self.time.timestamp()
    }
}
