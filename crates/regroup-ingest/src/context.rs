//! Per-run counters
//!
//! One [`RunContext`] is created per ingestion run and shared by reference
//! with every stage of it. Counters are atomics so worker tasks can bump them
//! without locking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;
use tracing::info;

/// Default number of events between progress log lines
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 100_000;

#[derive(Debug)]
pub struct RunContext {
    topic: String,
    started: Instant,
    progress_interval: u64,
    sequence: AtomicU64,
    rows_read: AtomicU64,
    rows_staged: AtomicU64,
    groups_emitted: AtomicU64,
    messages_published: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub rows_read: u64,
    pub rows_staged: u64,
    pub groups_emitted: u64,
    pub messages_published: u64,
    pub elapsed_ms: u64,
}

impl RunContext {
    pub fn new(topic: impl Into<String>) -> Self {
        Self::with_progress_interval(topic, DEFAULT_PROGRESS_INTERVAL)
    }

    /// An interval of 0 disables progress logging
    pub fn with_progress_interval(topic: impl Into<String>, progress_interval: u64) -> Self {
        Self {
            topic: topic.into(),
            started: Instant::now(),
            progress_interval,
            sequence: AtomicU64::new(0),
            rows_read: AtomicU64::new(0),
            rows_staged: AtomicU64::new(0),
            groups_emitted: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next value of the run's monotonic sequence, starting at 1
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_row_read(&self) -> u64 {
        self.rows_read.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_row_staged(&self) -> u64 {
        let n = self.rows_staged.fetch_add(1, Ordering::Relaxed) + 1;
        self.maybe_log("rows staged", n);
        n
    }

    pub fn record_group(&self) -> u64 {
        let n = self.groups_emitted.fetch_add(1, Ordering::Relaxed) + 1;
        self.maybe_log("groups emitted", n);
        n
    }

    pub fn record_published(&self, count: u64) -> u64 {
        let before = self.messages_published.fetch_add(count, Ordering::Relaxed);
        let after = before + count;
        if self.progress_interval > 0 && after / self.progress_interval > before / self.progress_interval {
            self.log_progress("messages published", after);
        }
        after
    }

    pub fn stats(&self) -> RunStats {
        RunStats {
            rows_read: self.rows_read.load(Ordering::Relaxed),
            rows_staged: self.rows_staged.load(Ordering::Relaxed),
            groups_emitted: self.groups_emitted.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    fn maybe_log(&self, what: &str, n: u64) {
        if self.progress_interval > 0 && n % self.progress_interval == 0 {
            self.log_progress(what, n);
        }
    }

    fn log_progress(&self, what: &str, n: u64) {
        info!(
            topic = %self.topic,
            count = n,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Progress: {}",
            what
        );
    }
}
