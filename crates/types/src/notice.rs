use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stream::StreamId;

/// Visibility of an out-of-band notice event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeScope {
    /// Fanned out to every stream.
    Public,
    /// Visible only to the originating stream.
    Stream,
}

/// Out-of-band event (poke, reaction, mute/unmute) that may or may not
/// trigger chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    pub notice_type: String,
    pub scope: NoticeScope,
    /// Originating stream; `None` only for public notices raised without a
    /// source conversation.
    pub stream_id: Option<StreamId>,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl Notice {
    pub fn new(
        notice_type: impl Into<String>,
        scope: NoticeScope,
        stream_id: Option<StreamId>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            notice_type: notice_type.into(),
            scope,
            stream_id,
            payload,
            received_at: Utc::now(),
        }
    }

    /// Whether the notice should be surfaced to `stream`.
    pub fn visible_to(&self, stream: &StreamId) -> bool {
        match self.scope {
            NoticeScope::Public => true,
            NoticeScope::Stream => self.stream_id.as_ref() == Some(stream),
        }
    }
}
