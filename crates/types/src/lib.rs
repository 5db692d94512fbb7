//! Shared value types for the fennec core: chat messages, stream identity,
//! notices, and decision records.

mod message;
mod notice;
mod stream;

pub use message::{AdditionalConfig, Message, MessageFlags, ReplyRef};
pub use notice::{Notice, NoticeScope};
pub use stream::{StreamId, StreamKey};

use serde::{Deserialize, Serialize};

/// One entry in a stream's bounded decision trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub thought: String,
    pub action: String,
    pub decided_at: chrono::DateTime<chrono::Utc>,
}

impl DecisionRecord {
    pub fn new(thought: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            thought: thought.into(),
            action: action.into(),
            decided_at: chrono::Utc::now(),
        }
    }
}
