//! Interest scoring and per-user affinity.
//!
//! Decides, for each inbound message, how much the bot wants to respond:
//! a weighted blend of interest-tag matching, the sender's relationship
//! score, and whether the bot was addressed directly.

mod matcher;
mod relationship;
mod scorer;

pub use matcher::{InterestMatch, SmartInterestMatcher};
pub use relationship::{
    KeyFact, KeyFactType, RelationshipStage, RelationshipStore, UserRelationship,
};
pub use scorer::{InterestScore, InterestScorer, ReplyDecision};
