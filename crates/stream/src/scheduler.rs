//! Per-stream tick scheduling.
//!
//! One cooperative task per stream consumes a small tick channel; many
//! streams run in parallel. A tick plans and executes one chatter cycle
//! under the per-cycle deadline; failures leave the queues untouched so the
//! next tick retries, and repeatedly failing streams are quarantined for a
//! cool-down instead of spinning.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fennec_config::{BotConfig, ChatConfig};
use fennec_planner::{
    ACTION_REPLY, ActionContext, Executor, PlanMode, Planner, PlannerInput,
};
use fennec_types::{Message, StreamId};

use crate::batcher::MessageBatcher;
use crate::bus::MessageSink;
use crate::context::StreamContext;

/// Consecutive failures before a stream is quarantined.
const QUARANTINE_AFTER_FAILURES: u32 = 3;
/// How long a quarantined stream sits out.
const QUARANTINE_COOLDOWN: Duration = Duration::from_secs(60);
/// Tick channel depth; a full channel already has work queued.
const TICK_CHANNEL_DEPTH: usize = 4;

static BOT_TURN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Everything a chatter cycle needs, shared across streams.
pub struct ChatterDeps {
    pub planner: Planner,
    pub executor: Executor,
    pub sink: Arc<dyn MessageSink>,
    pub batcher: Arc<MessageBatcher>,
    pub chat: ChatConfig,
    pub bot: BotConfig,
    /// Per-stream reply-format capability; absent means capable.
    pub reply_capable: DashMap<StreamId, bool>,
}

impl ChatterDeps {
    pub fn new(
        planner: Planner,
        executor: Executor,
        sink: Arc<dyn MessageSink>,
        batcher: Arc<MessageBatcher>,
        chat: ChatConfig,
        bot: BotConfig,
    ) -> Self {
        Self {
            planner,
            executor,
            sink,
            batcher,
            chat,
            bot,
            reply_capable: DashMap::new(),
        }
    }

    /// Declare whether a stream's channel can carry formatted replies.
    pub fn set_reply_capable(&self, stream_id: StreamId, capable: bool) {
        self.reply_capable.insert(stream_id, capable);
    }

    fn supports_reply(&self, stream_id: &StreamId) -> bool {
        self.reply_capable
            .get(stream_id)
            .map(|entry| *entry.value())
            .unwrap_or(true)
    }
}

struct StreamWorker {
    tick_tx: mpsc::Sender<()>,
    interrupt: Arc<AtomicBool>,
    fail_count: Arc<AtomicU32>,
    quarantined_until: Arc<std::sync::Mutex<Option<std::time::Instant>>>,
    handle: JoinHandle<()>,
}

pub struct SchedulerDispatcher {
    deps: Arc<ChatterDeps>,
    workers: DashMap<StreamId, Arc<StreamWorker>>,
}

impl SchedulerDispatcher {
    pub fn new(deps: Arc<ChatterDeps>) -> Self {
        Self {
            deps,
            workers: DashMap::new(),
        }
    }

    /// A message arrived: create or poke the stream's worker. May roll an
    /// interruption against a cycle already in flight, and merges an
    /// overflowing cache back into `unread`.
    pub async fn on_message_received(
        &self,
        stream_id: &StreamId,
        context: Arc<Mutex<StreamContext>>,
    ) {
        let worker = self.ensure_worker(stream_id, Arc::clone(&context));

        {
            let mut ctx = context.lock().await;

            // Backpressure: an overgrown cache folds into unread and forces
            // an interruption check so the running tick can abort early.
            if ctx.cache_len() > self.deps.chat.cache_overflow_size {
                warn!(stream_id = %stream_id, cached = ctx.cache_len(), "cache overflow, merging into unread");
                ctx.flush_cache();
                worker.interrupt.store(true, Ordering::SeqCst);
            }

            if ctx.is_chatter_processing() {
                let p = ctx.interruption_probability(
                    self.deps.chat.interruption_max_limit,
                    self.deps.chat.interruption_min_probability,
                );
                if rand::thread_rng().gen_range(0.0..1.0) < p {
                    info!(stream_id = %stream_id, probability = p, "interruption roll succeeded");
                    ctx.increment_interruption_count();
                    worker.interrupt.store(true, Ordering::SeqCst);
                }
            }
        }

        // A full channel means a tick is already pending; that is enough.
        let _ = worker.tick_tx.try_send(());
    }

    /// Request a tick without a triggering message (proactive paths).
    pub fn request_tick(&self, stream_id: &StreamId, context: Arc<Mutex<StreamContext>>) {
        let worker = self.ensure_worker(stream_id, context);
        let _ = worker.tick_tx.try_send(());
    }

    fn ensure_worker(
        &self,
        stream_id: &StreamId,
        context: Arc<Mutex<StreamContext>>,
    ) -> Arc<StreamWorker> {
        if let Some(worker) = self.workers.get(stream_id) {
            return Arc::clone(worker.value());
        }

        let (tick_tx, tick_rx) = mpsc::channel(TICK_CHANNEL_DEPTH);
        let interrupt = Arc::new(AtomicBool::new(false));
        let fail_count = Arc::new(AtomicU32::new(0));
        let quarantined_until = Arc::new(std::sync::Mutex::new(None));

        let handle = tokio::spawn(worker_loop(
            Arc::clone(&self.deps),
            stream_id.clone(),
            context,
            tick_rx,
            Arc::clone(&interrupt),
            Arc::clone(&fail_count),
            Arc::clone(&quarantined_until),
        ));

        let worker = Arc::new(StreamWorker {
            tick_tx,
            interrupt,
            fail_count,
            quarantined_until,
            handle,
        });
        self.workers.insert(stream_id.clone(), Arc::clone(&worker));
        debug!(stream_id = %stream_id, "stream worker spawned");
        worker
    }

    pub fn active_streams(&self) -> usize {
        self.workers.len()
    }

    /// Stop every worker; ticks in flight are cancelled at their next
    /// suspension point by dropping the channel.
    pub fn shutdown(&self) {
        for entry in self.workers.iter() {
            entry.value().handle.abort();
        }
        self.workers.clear();
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    deps: Arc<ChatterDeps>,
    stream_id: StreamId,
    context: Arc<Mutex<StreamContext>>,
    mut tick_rx: mpsc::Receiver<()>,
    interrupt: Arc<AtomicBool>,
    fail_count: Arc<AtomicU32>,
    quarantined_until: Arc<std::sync::Mutex<Option<std::time::Instant>>>,
) {
    let budget = Duration::from_secs(deps.chat.thinking_timeout_secs.max(1));

    while tick_rx.recv().await.is_some() {
        // Quarantined streams skip work until the cooldown lapses.
        {
            let mut until = quarantined_until.lock().unwrap();
            match *until {
                Some(t) if std::time::Instant::now() < t => {
                    debug!(stream_id = %stream_id, "stream quarantined, skipping tick");
                    continue;
                }
                Some(_) => *until = None,
                None => {}
            }
        }

        interrupt.store(false, Ordering::SeqCst);
        let result = tokio::time::timeout(
            budget,
            process_cycle(&deps, &stream_id, &context, &interrupt),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                fail_count.store(0, Ordering::SeqCst);
            }
            Ok(Err(err)) => {
                error!(stream_id = %stream_id, %err, "chatter cycle failed, downgrading to no_action");
                rollback_cycle(&context).await;
                note_failure(&stream_id, &fail_count, &quarantined_until);
            }
            Err(_) => {
                warn!(stream_id = %stream_id, budget_secs = budget.as_secs(), "chatter cycle timed out");
                rollback_cycle(&context).await;
                note_failure(&stream_id, &fail_count, &quarantined_until);
            }
        }
    }
}

fn note_failure(
    stream_id: &StreamId,
    fail_count: &AtomicU32,
    quarantined_until: &std::sync::Mutex<Option<std::time::Instant>>,
) {
    let failures = fail_count.fetch_add(1, Ordering::SeqCst) + 1;
    if failures >= QUARANTINE_AFTER_FAILURES {
        warn!(stream_id = %stream_id, failures, "stream quarantined");
        *quarantined_until.lock().unwrap() =
            Some(std::time::Instant::now() + QUARANTINE_COOLDOWN);
        fail_count.store(0, Ordering::SeqCst);
    }
}

/// Leave the context consistent after a failed or cancelled cycle: flags
/// cleared, cache flushed, `unread` untouched so the next tick retries.
async fn rollback_cycle(context: &Arc<Mutex<StreamContext>>) {
    let mut ctx = context.lock().await;
    ctx.set_chatter_processing(false);
    ctx.flush_cache();
}

/// One full chatter cycle over a stream's unread messages.
async fn process_cycle(
    deps: &Arc<ChatterDeps>,
    stream_id: &StreamId,
    context: &Arc<Mutex<StreamContext>>,
    interrupt: &AtomicBool,
) -> anyhow::Result<()> {
    // Snapshot under the lock, then think without it so ingest stays cheap.
    let (unread, recent) = {
        let mut ctx = context.lock().await;
        ctx.reset_daily(chrono::Local::now().date_naive());
        if ctx.unread_len() == 0 {
            ctx.flush_cache();
            return Ok(());
        }
        ctx.set_chatter_processing(true);
        (
            ctx.unread_snapshot(),
            ctx.get_messages(deps.chat.max_context_size, true),
        )
    };

    let input = PlannerInput {
        stream_id: stream_id.to_string(),
        mode: PlanMode::Normal,
        unread: unread.clone(),
        bot_nickname: deps.bot.nickname.clone(),
        bot_aliases: deps.bot.alias_names.clone(),
        supports_reply: deps.supports_reply(stream_id),
        executed_actions: Vec::new(),
    };

    let plan = deps.planner.plan(&input).await?;

    if interrupt.swap(false, Ordering::SeqCst) {
        info!(stream_id = %stream_id, "cycle interrupted after planning, aborting");
        rollback_cycle(context).await;
        return Ok(());
    }

    let executed = if plan.is_no_action() {
        Vec::new()
    } else {
        let action_ctx = ActionContext {
            stream_id: stream_id.to_string(),
            messages: recent,
            target_message_id: plan
                .decisions
                .iter()
                .find_map(|d| d.action_message.clone()),
            bot_nickname: deps.bot.nickname.clone(),
            prompt_additions: Vec::new(),
        };
        deps.executor
            .execute(&action_ctx, &plan.decisions)
            .await
            .map_err(|err| anyhow::anyhow!(err))?
    };

    if interrupt.swap(false, Ordering::SeqCst) {
        info!(stream_id = %stream_id, "cycle interrupted before send, aborting");
        rollback_cycle(context).await;
        return Ok(());
    }

    // Send replies and remember whether we actually spoke.
    let mut did_reply = false;
    let mut bot_turns = Vec::new();
    for item in &executed {
        if item.action.action_type != ACTION_REPLY {
            continue;
        }
        let Some(text) = item.outcome.reply_text.as_deref() else {
            continue;
        };

        let upstream_id = deps
            .sink
            .send_message(stream_id, text, item.action.action_message.as_deref())
            .await?;
        did_reply = true;

        let local_id = format!(
            "bot-{}-{}",
            Utc::now().timestamp_millis(),
            BOT_TURN_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let turn = Message::bot_turn(
            &local_id,
            &deps.bot.platform,
            "bot",
            &deps.bot.nickname,
            text,
        );
        deps.batcher.enqueue(turn.clone());
        deps.batcher.enqueue_id_update(local_id, upstream_id);
        bot_turns.push(turn);
    }

    deps.planner
        .scorer()
        .record_reply_action(stream_id.as_str(), did_reply);

    // Commit: metadata onto messages, bot turns into history, snapshot
    // marked read, flags cleared, cache flushed.
    {
        let mut ctx = context.lock().await;

        for message in &unread {
            if let Some(score) = plan.scores.get(&message.message_id) {
                let should_reply = plan
                    .reply_decision
                    .as_ref()
                    .is_some_and(|d| d.should_reply);
                let interest = score.total_score;
                ctx.update_message(&message.message_id, |m| {
                    m.interest_value = interest;
                    m.should_reply = should_reply;
                });
            }
            for item in &executed {
                if item.action.action_message.as_deref() == Some(message.message_id.as_str()) {
                    let action = item.action.action_type.clone();
                    ctx.update_message(&message.message_id, |m| {
                        m.should_act = true;
                        m.actions.push(action);
                    });
                }
            }
        }

        // The bot's reply lands in history before the user messages it
        // answered, preserving the ordering guarantee for later reads.
        for turn in bot_turns {
            ctx.push_bot_turn(turn);
        }
        for message in &unread {
            ctx.mark_read(&message.message_id);
            deps.batcher.enqueue(message.clone());
        }

        for decision in &plan.decisions {
            ctx.record_decision(decision.reasoning.clone(), decision.action_type.clone());
        }

        ctx.set_chatter_processing(false);
        ctx.flush_cache();
    }

    Ok(())
}
