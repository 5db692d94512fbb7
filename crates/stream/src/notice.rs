//! Out-of-band notice routing: public notices fan out to every stream,
//! stream-scoped ones stay home.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tracing::debug;

use fennec_types::{Notice, NoticeScope, StreamId};

/// Retained notices per scope bucket.
const NOTICE_QUEUE_CAP: usize = 100;

#[derive(Default)]
pub struct NoticeManager {
    public: Mutex<VecDeque<Notice>>,
    per_stream: Mutex<HashMap<StreamId, VecDeque<Notice>>>,
}

impl NoticeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, notice: Notice) {
        debug!(notice_type = %notice.notice_type, scope = ?notice.scope, "notice routed");
        match notice.scope {
            NoticeScope::Public => push_bounded(&mut self.public.lock().unwrap(), notice),
            NoticeScope::Stream => {
                let Some(stream_id) = notice.stream_id.clone() else {
                    // A stream-scoped notice without an origin has nowhere
                    // to go.
                    return;
                };
                let mut map = self.per_stream.lock().unwrap();
                push_bounded(map.entry(stream_id).or_default(), notice);
            }
        }
    }

    /// Every notice visible to `stream`: all public ones plus its own.
    pub fn visible_to(&self, stream: &StreamId) -> Vec<Notice> {
        let mut notices: Vec<Notice> = self.public.lock().unwrap().iter().cloned().collect();
        if let Some(own) = self.per_stream.lock().unwrap().get(stream) {
            notices.extend(own.iter().cloned());
        }
        notices.sort_by_key(|n| n.received_at);
        notices
    }

    pub fn public_len(&self) -> usize {
        self.public.lock().unwrap().len()
    }
}

fn push_bounded(queue: &mut VecDeque<Notice>, notice: Notice) {
    queue.push_back(notice);
    while queue.len() > NOTICE_QUEUE_CAP {
        queue.pop_front();
    }
}
