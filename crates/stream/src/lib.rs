//! Stream-level message management: per-conversation contexts, the global
//! router, the tick scheduler, and batched persistence.

mod batcher;
mod bus;
mod context;
mod manager;
mod notice;
mod scheduler;

pub use batcher::{BatcherConfig, MessageBatcher, MessageWriter};
pub use bus::{MessageSink, testutil};
pub use context::{ContextState, QueueSlot, StreamContext, interruption_probability};
pub use manager::{IngestOutcome, ManagerStats, MessageManager};
pub use notice::NoticeManager;
pub use scheduler::{ChatterDeps, SchedulerDispatcher};
