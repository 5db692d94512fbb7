//! Composition root: wires every subsystem together and runs the periodic
//! jobs (sleep ticks, wake-up decay, memory forgetting, stats persistence).
//!
//! External collaborators (the LLM client, embedder, vector store, message
//! sink, message writer, and schedule source) are injected; everything else
//! is built here from configuration.

mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use fennec_affinity::{InterestScorer, RelationshipStore, SmartInterestMatcher};
use fennec_config::AppConfig;
use fennec_guard::{AntiInjector, BanStore};
use fennec_llm::{Embedder, LlmClient};
use fennec_memory::{MemorySystem, MemoryStorage, MetadataIndex};
use fennec_planner::{ActionRegistry, EventSink, Executor, Planner};
use fennec_sleep::{ScheduleSource, SleepManager, SleepWindow, WakeUpManager};
use fennec_store::{KvStore, TieredCache, TieredCacheConfig, VectorStore};
use fennec_stream::{
    BatcherConfig, ChatterDeps, MessageBatcher, MessageManager, MessageWriter,
    SchedulerDispatcher,
};

pub use telemetry::init_tracing;

/// External services the runtime cannot construct itself.
pub struct Collaborators {
    pub llm: Arc<dyn LlmClient>,
    pub embedder: Arc<dyn Embedder>,
    pub vector_store: Arc<dyn VectorStore>,
    pub sink: Arc<dyn fennec_stream::MessageSink>,
    pub writer: Arc<dyn MessageWriter>,
    pub schedule: Option<Box<dyn ScheduleSource>>,
    pub events: Option<Arc<dyn EventSink>>,
}

pub struct Runtime {
    config: AppConfig,
    pub manager: Arc<MessageManager>,
    pub memory: Arc<MemorySystem>,
    pub guard: Arc<AntiInjector>,
    pub sleep: Arc<std::sync::Mutex<SleepManager>>,
    pub wakeup: Arc<std::sync::Mutex<WakeUpManager>>,
    pub cache: Arc<TieredCache>,
    scheduler: Arc<SchedulerDispatcher>,
    llm: Arc<dyn LlmClient>,
    sink: Arc<dyn fennec_stream::MessageSink>,
    kv: KvStore,
    jobs: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Build the full core from configuration plus injected collaborators.
    pub async fn build(
        config: AppConfig,
        data_dir: impl AsRef<std::path::Path>,
        collaborators: Collaborators,
        interest_tags: &[String],
    ) -> Result<Self> {
        config.validate()?;
        let data_dir = data_dir.as_ref();

        let kv = KvStore::open(data_dir.join("fennec_state.redb"))
            .context("opening KV store")?;

        // Affinity.
        let relationships = RelationshipStore::new(
            kv.clone(),
            config.affinity_flow.base_relationship_score,
        );
        let mut scorer = InterestScorer::new(config.affinity_flow.clone(), relationships);
        if !interest_tags.is_empty() {
            match SmartInterestMatcher::build(Arc::clone(&collaborators.embedder), interest_tags)
                .await
            {
                Ok(matcher) => scorer = scorer.with_matcher(Arc::new(matcher)),
                // Degrades to the neutral fallback score.
                Err(err) => warn!(%err, "interest matcher init failed"),
            }
        }
        let scorer = Arc::new(scorer);

        // Planning.
        let registry = Arc::new(ActionRegistry::with_builtins(Arc::clone(&collaborators.llm)));
        let planner = Planner::new(
            config.affinity_flow.clone(),
            Arc::clone(&collaborators.llm),
            Arc::clone(&scorer),
            Arc::clone(&registry),
        );
        let executor = Executor::new(registry, collaborators.events.clone());

        // Persistence.
        let batcher = Arc::new(MessageBatcher::spawn(
            Arc::clone(&collaborators.writer),
            BatcherConfig {
                commit_batch_size: config.database.batch_commit_size,
                commit_interval: Duration::from_secs(config.database.batch_commit_interval_secs),
                ..BatcherConfig::default()
            },
        ));
        let cache = Arc::new(TieredCache::new(TieredCacheConfig {
            l1_max_entries: config.database.cache_l1_max_size,
            l1_ttl: Duration::from_secs(config.database.cache_l1_ttl_secs),
            l2_max_entries: config.database.cache_l2_max_size,
            l2_ttl: Duration::from_secs(config.database.cache_l2_ttl_secs),
            max_memory_bytes: config.database.cache_max_memory_mb * 1024 * 1024,
            max_item_bytes: config.database.cache_max_item_size_mb * 1024 * 1024,
        }));

        // Memory engine.
        let index = MetadataIndex::open(data_dir.join("memory_metadata_index.json"))
            .context("opening metadata index")?;
        let storage = MemoryStorage::new(
            Arc::clone(&collaborators.vector_store),
            Arc::new(index),
        );
        let memory = Arc::new(MemorySystem::new(
            config.memory.clone(),
            storage,
            Arc::clone(&collaborators.llm),
            Arc::clone(&collaborators.embedder),
        ));

        // Security.
        let bans = BanStore::new(
            kv.clone(),
            config.anti_prompt_injection.auto_ban_violation_threshold,
            config.anti_prompt_injection.auto_ban_duration_hours,
        );
        let guard = Arc::new(AntiInjector::new(
            config.anti_prompt_injection.clone(),
            bans,
            config
                .anti_prompt_injection
                .llm_detection_enabled
                .then(|| Arc::clone(&collaborators.llm)),
            config.bot.nickname.clone(),
        ));
        guard.stats().restore(&kv);

        // Sleep system.
        let window = SleepWindow::new(config.sleep_system.clone(), collaborators.schedule);
        let sleep = Arc::new(std::sync::Mutex::new(SleepManager::new(
            config.sleep_system.clone(),
            kv.clone(),
            window,
        )));
        let wakeup = Arc::new(std::sync::Mutex::new(WakeUpManager::global(
            config.sleep_system.clone(),
            kv.clone(),
        )));

        // Stream layer.
        let deps = Arc::new(ChatterDeps::new(
            planner,
            executor,
            Arc::clone(&collaborators.sink),
            Arc::clone(&batcher),
            config.chat.clone(),
            config.bot.clone(),
        ));
        let scheduler = Arc::new(SchedulerDispatcher::new(deps));
        let manager = Arc::new(MessageManager::new(
            config.clone(),
            Arc::clone(&scheduler),
            Arc::clone(&guard),
            Arc::clone(&sleep),
            Arc::clone(&wakeup),
            Arc::clone(&collaborators.sink),
            batcher,
            kv.clone(),
            collaborators.events,
        ));

        info!("fennec core assembled");
        Ok(Self {
            config,
            manager,
            memory,
            guard,
            sleep,
            wakeup,
            cache,
            scheduler,
            llm: collaborators.llm,
            sink: collaborators.sink,
            kv,
            jobs: Vec::new(),
        })
    }

    /// Watch a config file; `on_reload` receives each successfully re-parsed
    /// [`AppConfig`]. Keep the returned watcher alive.
    pub fn watch_config(
        path: impl AsRef<std::path::Path>,
        on_reload: impl Fn(AppConfig) + Send + 'static,
    ) -> Result<fennec_config::ConfigWatcher> {
        fennec_config::ConfigWatcher::spawn(path, on_reload)
    }

    /// Spawn the periodic jobs. Call once after `build`.
    pub fn start_background_jobs(&mut self) {
        // Sleep state machine tick (plus the pre-sleep notification hook).
        {
            let sleep = Arc::clone(&self.sleep);
            let wakeup = Arc::clone(&self.wakeup);
            let llm = Arc::clone(&self.llm);
            let sink = Arc::clone(&self.sink);
            let sleep_config = self.config.sleep_system.clone();
            self.jobs.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(30));
                loop {
                    interval.tick().await;
                    let events = {
                        let now = chrono::Local::now().naive_local();
                        let mut wakeup = wakeup.lock().unwrap();
                        sleep.lock().unwrap().update(now, &mut wakeup)
                    };
                    for event in events {
                        if event == fennec_sleep::SleepEvent::PreparingSleep
                            && sleep_config.enable_pre_sleep_notification
                        {
                            send_pre_sleep_notifications(&sleep_config, &llm, &sink).await;
                        }
                    }
                }
            }));
        }

        // Wake-up decay.
        {
            let sleep = Arc::clone(&self.sleep);
            let wakeup = Arc::clone(&self.wakeup);
            let decay_interval = self.config.sleep_system.decay_interval_secs.max(1);
            self.jobs.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(decay_interval));
                loop {
                    interval.tick().await;
                    let sleeping = sleep.lock().unwrap().is_sleeping();
                    wakeup.lock().unwrap().decay_tick(chrono::Utc::now(), sleeping);
                }
            }));
        }

        // Memory forgetting.
        if self.config.memory.enable_memory_forgetting {
            let memory = Arc::clone(&self.memory);
            let cleanup_interval = self.config.memory.auto_cleanup_interval_secs.max(60);
            self.jobs.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(cleanup_interval));
                loop {
                    interval.tick().await;
                    if let Err(err) = memory.run_forgetting().await {
                        warn!(%err, "forgetting pass failed");
                    }
                }
            }));
        }

        // Cache sweeper + guard stats persistence.
        {
            let cache = Arc::clone(&self.cache);
            let guard = Arc::clone(&self.guard);
            let kv = self.kv.clone();
            let sweep_interval = self.config.database.cache_cleanup_interval_secs.max(10);
            self.jobs.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval));
                loop {
                    interval.tick().await;
                    let removed = cache.evict_expired();
                    if removed > 0 {
                        info!(removed, "cache entries expired");
                    }
                    guard.stats().persist(&kv);
                }
            }));
        }

        info!(jobs = self.jobs.len(), "background jobs started");
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    /// Stop background jobs and stream workers. In-flight ticks are
    /// cancelled at their next suspension point.
    pub fn shutdown(&mut self) {
        for job in self.jobs.drain(..) {
            job.abort();
        }
        self.scheduler.shutdown();
        self.guard.stats().persist(&self.kv);
        info!("fennec core stopped");
    }
}

/// Generate and fan out the configured pre-sleep message.
async fn send_pre_sleep_notifications(
    config: &fennec_config::SleepConfig,
    llm: &Arc<dyn LlmClient>,
    sink: &Arc<dyn fennec_stream::MessageSink>,
) {
    if config.pre_sleep_notification_groups.is_empty() || config.pre_sleep_prompt.is_empty() {
        return;
    }

    let params = fennec_llm::GenParams::for_request("schedule.pre_sleep_notification")
        .max_tokens(200);
    let text = match llm
        .generate(
            &config.pre_sleep_prompt,
            fennec_llm::ModelSelector::ScheduleGenerator,
            params,
        )
        .await
    {
        Ok((text, _)) if !text.trim().is_empty() => text.trim().to_string(),
        Ok(_) => return,
        Err(err) => {
            warn!(%err, "pre-sleep notification generation failed");
            return;
        }
    };

    for group in &config.pre_sleep_notification_groups {
        let Some((platform, raw_id)) = group.split_once(':') else {
            warn!(group, "invalid pre-sleep group, expected platform:id");
            continue;
        };
        let stream_id = fennec_types::StreamKey::group(platform, raw_id).stream_id();
        if let Err(err) = sink.send_message(&stream_id, &text, None).await {
            warn!(%err, group, "pre-sleep notification send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use fennec_llm::testutil::{HashEmbedder, StubLlm};
    use fennec_store::MemoryVectorStore;
    use fennec_stream::testutil::RecordingSink;
    use fennec_types::Message;

    use super::*;

    struct NullWriter;

    #[async_trait::async_trait]
    impl MessageWriter for NullWriter {
        async fn write_messages(&self, _batch: Vec<Message>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn update_ids(&self, _updates: Vec<(String, String)>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn runtime_assembles_and_ingests() {
        let dir = tempfile::tempdir().unwrap();
        let collaborators = Collaborators {
            llm: Arc::new(StubLlm::new("[]")),
            embedder: Arc::new(HashEmbedder::new(64)),
            vector_store: Arc::new(MemoryVectorStore::new()),
            sink: Arc::new(RecordingSink::default()),
            writer: Arc::new(NullWriter),
            schedule: None,
            events: None,
        };

        let mut runtime = Runtime::build(
            AppConfig::default(),
            dir.path(),
            collaborators,
            &["编程".to_string()],
        )
        .await
        .unwrap();
        runtime.start_background_jobs();

        let key = fennec_types::StreamKey::group("qq", "g1");
        let outcome = runtime
            .manager
            .add_message(&key, Message::new("m1", "qq", "u1", "你好呀"))
            .await;
        assert!(matches!(
            outcome,
            fennec_stream::IngestOutcome::Accepted | fennec_stream::IngestOutcome::Blocked(_)
        ));

        runtime.shutdown();
    }
}
