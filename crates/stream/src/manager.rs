//! The global message router: owns every stream context, runs the ingest
//! protocol, and feeds the scheduler.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{Local, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use fennec_config::AppConfig;
use fennec_guard::{AntiInjector, ProcessResult};
use fennec_planner::EventSink;
use fennec_sleep::{SleepManager, WakeUpManager};
use fennec_store::KvStore;
use fennec_types::{Message, Notice, NoticeScope, StreamId, StreamKey};

use crate::batcher::MessageBatcher;
use crate::bus::MessageSink;
use crate::context::StreamContext;
use crate::notice::NoticeManager;
use crate::scheduler::SchedulerDispatcher;

/// Adapter prefix marking sticker/emoji messages; these never enter chat.
const EMOJI_PREFIX: &str = "[表情包";

/// What happened to one ingested message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    RejectedEmoji,
    NoticeRouted,
    Blocked(ProcessResult),
    CounterAttacked,
    /// Accepted into the queue but processing is suppressed by sleep.
    SuppressedSleeping,
    Duplicate,
}

#[derive(Debug, Default)]
pub struct ManagerStats {
    pub ingested: AtomicU64,
    pub rejected_emoji: AtomicU64,
    pub notices: AtomicU64,
    pub blocked: AtomicU64,
    pub suppressed_sleeping: AtomicU64,
}

pub struct MessageManager {
    config: AppConfig,
    contexts: DashMap<StreamId, Arc<Mutex<StreamContext>>>,
    scheduler: Arc<SchedulerDispatcher>,
    guard: Arc<AntiInjector>,
    notices: Arc<NoticeManager>,
    sleep: Arc<std::sync::Mutex<SleepManager>>,
    wakeup: Arc<std::sync::Mutex<WakeUpManager>>,
    sink: Arc<dyn MessageSink>,
    batcher: Arc<MessageBatcher>,
    kv: KvStore,
    stats: ManagerStats,
    events: Option<Arc<dyn EventSink>>,
}

impl MessageManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        scheduler: Arc<SchedulerDispatcher>,
        guard: Arc<AntiInjector>,
        sleep: Arc<std::sync::Mutex<SleepManager>>,
        wakeup: Arc<std::sync::Mutex<WakeUpManager>>,
        sink: Arc<dyn MessageSink>,
        batcher: Arc<MessageBatcher>,
        kv: KvStore,
        events: Option<Arc<dyn EventSink>>,
    ) -> Self {
        Self {
            config,
            contexts: DashMap::new(),
            scheduler,
            guard,
            notices: Arc::new(NoticeManager::new()),
            sleep,
            wakeup,
            sink,
            batcher,
            kv,
            stats: ManagerStats::default(),
            events,
        }
    }

    pub fn notices(&self) -> &Arc<NoticeManager> {
        &self.notices
    }

    pub fn stats(&self) -> &ManagerStats {
        &self.stats
    }

    /// Resolve (or lazily create) the context for a stream.
    pub fn context(&self, key: &StreamKey) -> Arc<Mutex<StreamContext>> {
        let stream_id = key.stream_id();
        self.contexts
            .entry(stream_id.clone())
            .or_insert_with(|| {
                debug!(stream_id = %stream_id, "stream context created");
                Arc::new(Mutex::new(StreamContext::new(
                    stream_id.clone(),
                    self.config.chat.max_context_size,
                    Some(self.kv.clone()),
                )))
            })
            .clone()
    }

    pub fn context_by_id(&self, stream_id: &StreamId) -> Option<Arc<Mutex<StreamContext>>> {
        self.contexts.get(stream_id).map(|e| e.value().clone())
    }

    /// The ingest protocol (§ the one entry point adapters call).
    pub async fn add_message(&self, key: &StreamKey, mut message: Message) -> IngestOutcome {
        self.stats.ingested.fetch_add(1, Ordering::Relaxed);
        let stream_id = key.stream_id();

        // 1. Sticker messages never trigger chat.
        if message.processed_plain_text.starts_with(EMOJI_PREFIX) {
            self.stats.rejected_emoji.fetch_add(1, Ordering::Relaxed);
            return IngestOutcome::RejectedEmoji;
        }

        // 2. Notices route to the notice manager; they only fall through to
        //    chat when configured to.
        if message.is_notice() {
            self.stats.notices.fetch_add(1, Ordering::Relaxed);
            let scope = if message.additional.is_public_notice {
                NoticeScope::Public
            } else {
                NoticeScope::Stream
            };
            self.notices.route(Notice::new(
                message
                    .notice_type
                    .clone()
                    .unwrap_or_else(|| "notice".to_string()),
                scope,
                Some(stream_id.clone()),
                json!({"message_id": message.message_id, "user_id": message.user_id}),
            ));
            if !self.config.chat.notice_trigger_chat {
                return IngestOutcome::NoticeRouted;
            }
        }

        // 3. Security pipeline. Detected injections never reach the planner.
        let outcome = self.guard.process_message(&message).await;
        match outcome.result {
            ProcessResult::Allowed => {}
            ProcessResult::Shielded => {
                if let Some(shielded) = outcome.modified_content {
                    message.processed_plain_text = shielded;
                }
            }
            ProcessResult::CounterAttack => {
                if let Some(retort) = outcome.modified_content {
                    if let Err(err) = self.sink.send_message(&stream_id, &retort, None).await {
                        warn!(%err, "failed to send counter-attack retort");
                    }
                }
                return IngestOutcome::CounterAttacked;
            }
            ProcessResult::BlockedInjection | ProcessResult::BlockedBan => {
                self.stats.blocked.fetch_add(1, Ordering::Relaxed);
                info!(
                    stream_id = %stream_id,
                    result = ?outcome.result,
                    "message blocked: {}",
                    outcome.explanation
                );
                return IngestOutcome::Blocked(outcome.result);
            }
        }

        // 4. Into the stream's queues.
        let context = self.context(key);
        let accepted = {
            let mut ctx = context.lock().await;
            ctx.add_message(message.clone(), false)
        };
        if !accepted {
            return IngestOutcome::Duplicate;
        }
        self.batcher.enqueue(message.clone());

        // 5. Sleep gate: while sleeping the message only feeds wake-up
        //    pressure; no tick is scheduled.
        let sleeping = self.sleep.lock().unwrap().is_sleeping();
        if sleeping {
            self.stats
                .suppressed_sleeping
                .fetch_add(1, Ordering::Relaxed);
            let crossed = self.wakeup.lock().unwrap().add_wakeup_value(
                fennec_sleep::SleepState::Sleeping,
                message.is_private(),
                message.flags.is_mentioned,
                Utc::now(),
            );
            if crossed {
                self.sleep
                    .lock()
                    .unwrap()
                    .force_woken_up(Local::now().naive_local());
                if let Some(events) = &self.events {
                    events.emit(
                        "WAKEUP_ANGRY",
                        json!({"stream_id": stream_id.as_str(), "user_id": message.user_id}),
                    );
                }
                info!(stream_id = %stream_id, "bot forced awake and angry");
            }
            return IngestOutcome::SuppressedSleeping;
        }

        // 6. Wake the dispatcher.
        self.scheduler.on_message_received(&stream_id, context).await;
        IngestOutcome::Accepted
    }

    /// Post-hoc metadata update from outer layers.
    pub async fn update_message(
        &self,
        stream_id: &StreamId,
        message_id: &str,
        interest_value: Option<f64>,
        actions: Option<Vec<String>>,
        should_reply: Option<bool>,
    ) -> bool {
        let Some(context) = self.context_by_id(stream_id) else {
            return false;
        };
        let mut ctx = context.lock().await;
        ctx.update_message(message_id, |message| {
            if let Some(value) = interest_value {
                message.interest_value = value;
            }
            if let Some(actions) = actions {
                message.actions = actions;
            }
            if let Some(should_reply) = should_reply {
                message.should_reply = should_reply;
            }
        })
    }

    pub fn active_stream_count(&self) -> usize {
        self.contexts.len()
    }
}
