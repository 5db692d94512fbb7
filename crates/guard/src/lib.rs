//! Anti-injection pipeline.
//!
//! Layered defense in a fixed order: feature gate, ban check, whitelist,
//! command skip list, reply-only filter, then the rule + LLM detector.
//! A detected injection never reaches the planner.

mod ban;
mod detector;
mod pipeline;
mod shield;
mod stats;

pub use ban::{BanRecord, BanStore};
pub use detector::{DetectionMethod, DetectionResult, Detector};
pub use pipeline::{AntiInjector, ProcessOutcome};
pub use shield::MessageShield;
pub use stats::GuardStats;

use serde::{Deserialize, Serialize};

/// Final verdict for one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessResult {
    Allowed,
    Shielded,
    BlockedInjection,
    BlockedBan,
    CounterAttack,
}
