use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use hearth_process::{LogCategory, LogEntry};
use tokio::sync::{broadcast, mpsc};

use crate::log_classifier::Classification;
use crate::process_manager_support::unix_ms_now;

pub const LOG_CAPACITY: usize = 1000;

#[derive(Debug)]
struct BufferState {
    next_seq: u64,
    capacity: usize,
    entries: VecDeque<LogEntry>,
}

/// Bounded replay store plus live fan-out.
///
/// Appends and subscriptions share one lock, so a subscriber's replay and its
/// live receiver meet exactly at the append order.
#[derive(Debug)]
pub struct LogBuffer {
    state: Mutex<BufferState>,
    tx: broadcast::Sender<LogEntry>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }
}

impl LogBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            state: Mutex::new(BufferState {
                next_seq: 1,
                capacity,
                entries: VecDeque::with_capacity(capacity),
            }),
            tx,
        }
    }

    pub fn append(
        &self,
        category: LogCategory,
        message: impl Into<String>,
        raw: impl Into<String>,
    ) -> LogEntry {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = LogEntry {
            seq: state.next_seq,
            timestamp_unix_ms: unix_ms_now(),
            category,
            message: message.into(),
            raw: raw.into(),
        };
        state.next_seq = state.next_seq.saturating_add(1);
        state.entries.push_back(entry.clone());
        while state.entries.len() > state.capacity {
            state.entries.pop_front();
        }
        // No receivers is fine.
        let _ = self.tx.send(entry.clone());
        entry
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.entries.iter().cloned().collect()
    }

    /// Retained entries with `seq > after`, in order.
    pub fn entries_after(&self, after: u64) -> Vec<LogEntry> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .entries
            .iter()
            .filter(|e| e.seq > after)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time replay plus every entry appended after it.
    pub fn subscribe(self: &Arc<Self>) -> LogSubscription {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let replay: Vec<LogEntry> = state.entries.iter().cloned().collect();
        let live = self.tx.subscribe();
        let last_seq = state.next_seq.saturating_sub(1);
        drop(state);

        LogSubscription {
            replay,
            live,
            buffer: self.clone(),
            last_seq,
            pending: VecDeque::new(),
        }
    }
}

pub struct LogSubscription {
    replay: Vec<LogEntry>,
    live: broadcast::Receiver<LogEntry>,
    buffer: Arc<LogBuffer>,
    last_seq: u64,
    pending: VecDeque<LogEntry>,
}

impl LogSubscription {
    /// Entries present when the subscription was taken.
    pub fn replay(&self) -> &[LogEntry] {
        &self.replay
    }

    pub fn take_replay(&mut self) -> Vec<LogEntry> {
        std::mem::take(&mut self.replay)
    }

    /// Next live entry; `None` once the buffer is gone.
    pub async fn recv(&mut self) -> Option<LogEntry> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                self.last_seq = entry.seq;
                return Some(entry);
            }

            match self.live.recv().await {
                Ok(entry) => {
                    if entry.seq > self.last_seq {
                        self.last_seq = entry.seq;
                        return Some(entry);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    let missed = self.buffer.entries_after(self.last_seq);
                    let lost = missed
                        .first()
                        .map(|e| e.seq.saturating_sub(self.last_seq + 1))
                        .unwrap_or(0);
                    if lost > 0 {
                        tracing::warn!(lost, "log subscriber fell behind the replay window");
                    } else {
                        tracing::debug!(skipped, "log subscriber resynced from buffer");
                    }
                    self.pending.extend(missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Where the orchestrator writes log entries: the replay buffer plus an
/// optional on-disk mirror.
#[derive(Clone, Debug)]
pub struct LogSink {
    buffer: Arc<LogBuffer>,
    file_tx: Option<mpsc::UnboundedSender<String>>,
}

impl LogSink {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self {
            buffer,
            file_tx: None,
        }
    }

    pub fn with_file_mirror(mut self, tx: mpsc::UnboundedSender<String>) -> Self {
        self.file_tx = Some(tx);
        self
    }

    pub fn buffer(&self) -> &Arc<LogBuffer> {
        &self.buffer
    }

    pub fn emit(&self, category: LogCategory, message: impl Into<String>) -> LogEntry {
        let message = message.into();
        self.push(category, message.clone(), message)
    }

    pub fn emit_classified(&self, class: Classification, raw: &str) -> LogEntry {
        self.push(class.category, class.message, raw.to_string())
    }

    pub fn info(&self, message: impl Into<String>) -> LogEntry {
        self.emit(LogCategory::Info, message)
    }

    pub fn warn(&self, message: impl Into<String>) -> LogEntry {
        self.emit(LogCategory::Warn, message)
    }

    pub fn error(&self, message: impl Into<String>) -> LogEntry {
        self.emit(LogCategory::Error, message)
    }

    pub fn success(&self, message: impl Into<String>) -> LogEntry {
        self.emit(LogCategory::Success, message)
    }

    fn push(&self, category: LogCategory, message: String, raw: String) -> LogEntry {
        let entry = self.buffer.append(category, message, raw);
        if let Some(tx) = &self.file_tx {
            let _ = tx.send(format!("[{}] {}", entry.category, entry.raw));
        }
        entry
    }
}
