//! Bounded backlog of room-visible messages.
//!
//! [`History`] keeps the most recent messages in a FIFO ring. When full,
//! each new message evicts the oldest. An optional log sink receives one
//! UTC-timestamped line per recorded message.

use std::collections::VecDeque;
use std::io::Write;

use parking_lot::RwLock;

use crate::message::Message;

/// Default number of messages replayed to a joining user.
pub const DEFAULT_HISTORY_LEN: usize = 20;

/// Byte sink receiving the chat log.
pub type LogSink = Box<dyn Write + Send + Sync>;

struct Inner {
    entries: VecDeque<Message>,
    sink: Option<LogSink>,
}

/// Fixed-capacity message ring with an optional log sink.
pub struct History {
    inner: RwLock<Inner>,
    capacity: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LEN)
    }
}

impl History {
    /// Creates an empty history holding at most `capacity` messages.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: VecDeque::with_capacity(capacity),
                sink: None,
            }),
            capacity,
        }
    }

    /// Maximum number of retained messages.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records `msg`, evicting the oldest entry when full, and writes it to
    /// the log sink if one is attached.
    ///
    /// A failing sink is reported and otherwise ignored.
    pub fn add(&self, msg: Message) {
        let mut inner = self.inner.write();
        if let Some(sink) = inner.sink.as_mut() {
            let line = format!(
                "[{}] {}\n",
                msg.timestamp().format("%Y-%m-%d %H:%M:%S UTC"),
                msg.render_plain()
            );
            if let Err(e) = sink.write_all(line.as_bytes()).and_then(|()| sink.flush()) {
                tracing::warn!(error = %e, "failed to write chat log");
            }
        }
        if self.capacity == 0 {
            return;
        }
        if inner.entries.len() == self.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(msg);
    }

    /// The most recent `min(n, len)` messages, oldest first.
    pub fn get(&self, n: usize) -> Vec<Message> {
        let inner = self.inner.read();
        let len = inner.entries.len();
        let start = len - n.min(len);
        inner.entries.range(start..).cloned().collect()
    }

    /// Number of retained messages.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attaches (or with `None`, detaches) the log sink.
    pub fn set_output(&self, sink: Option<LogSink>) {
        self.inner.write().sink = sink;
    }
}
