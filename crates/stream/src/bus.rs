//! Outbound seams: the adapter-facing message sink.

use async_trait::async_trait;

use fennec_types::StreamId;

/// Sends text back to the platform. Implemented by the adapter layer; the
/// returned id is the upstream message id, which may differ from the local
/// one (see the id-update batcher).
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send_message(
        &self,
        stream_id: &StreamId,
        text: &str,
        reply_to: Option<&str>,
    ) -> anyhow::Result<String>;
}

/// Test double: records every send and returns sequential upstream ids.
pub mod testutil {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    #[derive(Default)]
    pub struct RecordingSink {
        pub sent: Mutex<Vec<(StreamId, String, Option<String>)>>,
        counter: AtomicU64,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn send_message(
            &self,
            stream_id: &StreamId,
            text: &str,
            reply_to: Option<&str>,
        ) -> anyhow::Result<String> {
            self.sent.lock().unwrap().push((
                stream_id.clone(),
                text.to_string(),
                reply_to.map(str::to_string),
            ));
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("srv-{n}"))
        }
    }
}
