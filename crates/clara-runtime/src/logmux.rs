//! Tagged, subscribable log fan-out.
//!
//! Every subprocess line and every notable proxy event lands here as a
//! `LogEntry` tagged with its source (a model id, or `proxy` for the
//! multiplexer itself). A bounded ring keeps recent history for replay;
//! live subscribers ride a broadcast channel. Slow subscribers lag and
//! skip ahead instead of blocking producers.

use std::collections::VecDeque;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Maximum number of log lines kept for replay.
pub const LOG_RETENTION_LINES: usize = 5000;

/// Broadcast channel capacity for live subscribers.
const BROADCAST_CAPACITY: usize = 1024;

/// Source tag for the multiplexer's own lines.
pub const PROXY_SOURCE: &str = "proxy";

/// Severity attached to a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A single tagged log line.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// Monotonic position in the mux. Later lines have larger cursors.
    pub cursor: u64,
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// Model id, or [`PROXY_SOURCE`].
    pub source: String,
    pub level: LogLevel,
    pub text: String,
}

/// Ring-buffered log multiplexer with broadcast fan-out.
pub struct LogMux {
    ring: RwLock<VecDeque<LogEntry>>,
    tx: broadcast::Sender<LogEntry>,
    next_cursor: AtomicU64,
}

impl LogMux {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            ring: RwLock::new(VecDeque::with_capacity(LOG_RETENTION_LINES)),
            tx,
            next_cursor: AtomicU64::new(1),
        }
    }

    /// Append a line, dropping the oldest retained line when full.
    pub fn append(&self, source: &str, level: LogLevel, text: impl Into<String>) {
        let entry = LogEntry {
            cursor: self.next_cursor.fetch_add(1, Ordering::Relaxed),
            timestamp_ms: now_ms(),
            source: source.to_string(),
            level,
            text: text.into(),
        };

        // Push and broadcast under the same lock so a concurrent
        // subscribe_from() sees every entry exactly once.
        let mut ring = self.ring.write().unwrap();
        if ring.len() >= LOG_RETENTION_LINES {
            ring.pop_front();
        }
        ring.push_back(entry.clone());
        let _ = self.tx.send(entry);
    }

    /// Retained lines after `after_cursor`, optionally filtered by source.
    #[must_use]
    pub fn history(&self, source: Option<&str>, after_cursor: u64) -> Vec<LogEntry> {
        let ring = self.ring.read().unwrap();
        ring.iter()
            .filter(|e| e.cursor > after_cursor)
            .filter(|e| source.is_none_or(|s| e.source == s))
            .cloned()
            .collect()
    }

    /// Live subscription without replay.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }

    /// Replay retained lines after `after_cursor`, then follow live.
    ///
    /// The receiver is armed before the snapshot is taken, so a line is
    /// either in the returned history or delivered on the receiver, never
    /// lost between the two. Consumers resuming from a cursor should skip
    /// received entries with `cursor <=` the last replayed cursor.
    #[must_use]
    pub fn subscribe_from(&self, after_cursor: u64) -> (Vec<LogEntry>, broadcast::Receiver<LogEntry>) {
        let ring = self.ring.read().unwrap();
        let rx = self.tx.subscribe();
        let history = ring
            .iter()
            .filter(|e| e.cursor > after_cursor)
            .cloned()
            .collect();
        (history, rx)
    }
}

impl Default for LogMux {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursors_are_monotonic() {
        let mux = LogMux::new();
        mux.append("m1", LogLevel::Info, "a");
        mux.append("m2", LogLevel::Info, "b");
        mux.append(PROXY_SOURCE, LogLevel::Warn, "c");

        let all = mux.history(None, 0);
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].cursor < w[1].cursor));
    }

    #[test]
    fn history_filters_by_source_and_cursor() {
        let mux = LogMux::new();
        mux.append("m1", LogLevel::Info, "one");
        mux.append("m2", LogLevel::Info, "two");
        mux.append("m1", LogLevel::Info, "three");

        let m1 = mux.history(Some("m1"), 0);
        assert_eq!(m1.len(), 2);

        let later = mux.history(Some("m1"), m1[0].cursor);
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].text, "three");
    }

    #[test]
    fn ring_drops_oldest() {
        let mux = LogMux::new();
        for i in 0..(LOG_RETENTION_LINES + 10) {
            mux.append("m", LogLevel::Info, format!("line {i}"));
        }
        let all = mux.history(None, 0);
        assert_eq!(all.len(), LOG_RETENTION_LINES);
        assert_eq!(all[0].text, "line 10");
    }

    #[tokio::test]
    async fn subscribers_receive_appends() {
        let mux = LogMux::new();
        mux.append("m", LogLevel::Info, "before");

        let (history, mut rx) = mux.subscribe_from(0);
        assert_eq!(history.len(), 1);

        mux.append("m", LogLevel::Info, "after");
        let live = rx.recv().await.unwrap();
        assert_eq!(live.text, "after");
        assert!(live.cursor > history[0].cursor);
    }
}
