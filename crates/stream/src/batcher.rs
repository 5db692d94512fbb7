//! Batched persistence: a two-stage buffered writer for messages and a
//! smaller one for late message-id updates.
//!
//! Stage one is the unbounded prepare queue (senders never block); stage two
//! is the commit buffer, flushed when it reaches the configured size or when
//! the commit interval elapses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use fennec_types::Message;

/// Storage backend for persisted messages; the real database lives outside
/// the core.
#[async_trait]
pub trait MessageWriter: Send + Sync {
    async fn write_messages(&self, batch: Vec<Message>) -> anyhow::Result<()>;

    /// Apply upstream-id corrections `(old_id, new_id)` reported by the
    /// adapter after a send.
    async fn update_ids(&self, updates: Vec<(String, String)>) -> anyhow::Result<()>;
}

enum Job {
    Store(Message),
    UpdateId { old_id: String, new_id: String },
    Flush,
}

#[derive(Debug, Clone, Copy)]
pub struct BatcherConfig {
    pub commit_batch_size: usize,
    pub commit_interval: Duration,
    /// Id updates flush at a smaller batch size.
    pub id_batch_size: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            commit_batch_size: 50,
            commit_interval: Duration::from_secs(5),
            id_batch_size: 10,
        }
    }
}

pub struct MessageBatcher {
    tx: mpsc::UnboundedSender<Job>,
    worker: JoinHandle<()>,
}

impl MessageBatcher {
    pub fn spawn(writer: Arc<dyn MessageWriter>, config: BatcherConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(writer, config, rx));
        Self { tx, worker }
    }

    /// Stage a message for persistence. Never blocks.
    pub fn enqueue(&self, message: Message) {
        let _ = self.tx.send(Job::Store(message));
    }

    /// Stage a late id correction.
    pub fn enqueue_id_update(&self, old_id: impl Into<String>, new_id: impl Into<String>) {
        let _ = self.tx.send(Job::UpdateId {
            old_id: old_id.into(),
            new_id: new_id.into(),
        });
    }

    /// Force both buffers out to the writer.
    pub fn request_flush(&self) {
        let _ = self.tx.send(Job::Flush);
    }

    /// Flush and stop the worker.
    pub async fn shutdown(self) {
        let Self { tx, worker } = self;
        drop(tx);
        if let Err(err) = worker.await {
            warn!(%err, "message batcher worker panicked");
        }
    }
}

async fn run_worker(
    writer: Arc<dyn MessageWriter>,
    config: BatcherConfig,
    mut rx: mpsc::UnboundedReceiver<Job>,
) {
    let mut messages: Vec<Message> = Vec::new();
    let mut id_updates: Vec<(String, String)> = Vec::new();
    let mut interval = tokio::time::interval(config.commit_interval.max(Duration::from_millis(50)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            job = rx.recv() => {
                match job {
                    Some(Job::Store(message)) => {
                        messages.push(message);
                        if messages.len() >= config.commit_batch_size {
                            commit_messages(&writer, &mut messages).await;
                        }
                    }
                    Some(Job::UpdateId { old_id, new_id }) => {
                        id_updates.push((old_id, new_id));
                        if id_updates.len() >= config.id_batch_size {
                            commit_ids(&writer, &mut id_updates).await;
                        }
                    }
                    Some(Job::Flush) => {
                        commit_messages(&writer, &mut messages).await;
                        commit_ids(&writer, &mut id_updates).await;
                    }
                    None => break,
                }
            }
            _ = interval.tick() => {
                commit_messages(&writer, &mut messages).await;
                commit_ids(&writer, &mut id_updates).await;
            }
        }
    }

    // Channel closed: final drain.
    commit_messages(&writer, &mut messages).await;
    commit_ids(&writer, &mut id_updates).await;
    debug!("message batcher drained and stopped");
}

async fn commit_messages(writer: &Arc<dyn MessageWriter>, buffer: &mut Vec<Message>) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    let count = batch.len();
    if let Err(err) = writer.write_messages(batch).await {
        // Rows are lost on writer failure; the writer is expected to do its
        // own retries for transient faults.
        warn!(%err, count, "message batch write failed");
    } else {
        debug!(count, "message batch committed");
    }
}

async fn commit_ids(writer: &Arc<dyn MessageWriter>, buffer: &mut Vec<(String, String)>) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    let count = batch.len();
    if let Err(err) = writer.update_ids(batch).await {
        warn!(%err, count, "id update batch failed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingWriter {
        batches: Mutex<Vec<Vec<Message>>>,
        id_updates: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessageWriter for RecordingWriter {
        async fn write_messages(&self, batch: Vec<Message>) -> anyhow::Result<()> {
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }

        async fn update_ids(&self, updates: Vec<(String, String)>) -> anyhow::Result<()> {
            self.id_updates.lock().unwrap().extend(updates);
            Ok(())
        }
    }

    fn message(id: &str) -> Message {
        Message::new(id, "qq", "u1", "hi")
    }

    #[tokio::test]
    async fn commits_on_batch_size() {
        let writer = Arc::new(RecordingWriter::default());
        let batcher = MessageBatcher::spawn(
            writer.clone(),
            BatcherConfig {
                commit_batch_size: 3,
                commit_interval: Duration::from_secs(3600),
                id_batch_size: 10,
            },
        );

        for i in 0..3 {
            batcher.enqueue(message(&format!("m{i}")));
        }
        batcher.shutdown().await;

        let batches = writer.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn commits_on_interval() {
        let writer = Arc::new(RecordingWriter::default());
        let batcher = MessageBatcher::spawn(
            writer.clone(),
            BatcherConfig {
                commit_batch_size: 1000,
                commit_interval: Duration::from_millis(200),
                id_batch_size: 10,
            },
        );

        batcher.enqueue(message("m1"));
        tokio::time::sleep(Duration::from_millis(450)).await;

        assert_eq!(writer.batches.lock().unwrap().len(), 1);
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_everything() {
        let writer = Arc::new(RecordingWriter::default());
        let batcher = MessageBatcher::spawn(
            writer.clone(),
            BatcherConfig {
                commit_batch_size: 1000,
                commit_interval: Duration::from_secs(3600),
                id_batch_size: 1000,
            },
        );

        batcher.enqueue(message("m1"));
        batcher.enqueue_id_update("m1", "srv-1");
        batcher.shutdown().await;

        assert_eq!(writer.batches.lock().unwrap().len(), 1);
        assert_eq!(
            writer.id_updates.lock().unwrap().as_slice(),
            &[("m1".to_string(), "srv-1".to_string())]
        );
    }
}
