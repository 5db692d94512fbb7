//! Action planning: Generate → Filter → Execute.
//!
//! A plan starts from the registered actions and the stream snapshot, is
//! gated on the unread messages' best interest score, filtered down to
//! concrete decisions by the LLM, then executed in order. Any failure
//! downgrades the whole cycle to `no_action`: the messages stay unread and
//! the next tick retries.

mod action;
mod executor;
mod plan;

pub use action::{
    ActionContext, ActionHandler, ActionOutcome, ActionRegistry, ActionSpec, EmojiAction,
    NoActionAction, NoReplyAction, ReplyAction,
};
pub use executor::{EventSink, ExecutedAction, Executor};
pub use plan::{PlanMode, PlanResult, PlannedAction, Planner, PlannerInput};

pub const ACTION_REPLY: &str = "reply";
pub const ACTION_NO_REPLY: &str = "no_reply";
pub const ACTION_NO_ACTION: &str = "no_action";
pub const ACTION_EMOJI: &str = "emoji";

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("action filter failed: {0}")]
    Filter(String),
    #[error("action `{0}` is not registered")]
    UnknownAction(String),
    #[error("action `{name}` failed: {source}")]
    Execution {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}
