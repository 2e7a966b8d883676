//! Metrics - `metrics` ファサード経由の計測
//!
//! Every series carries an `outbox` label.
//!
//! - `outbox.items.fetched` / `outbox.items.processed` / `outbox.items.retried`: counters
//! - `outbox.batches.full`: fetches that returned a full batch
//! - `outbox.ticks.failed`: ticks rolled back on a repository error
//! - `outbox.handler.duration_seconds`: histogram, `handler` = `single` | `batch`
//! - `outbox.process.duration_seconds` / `outbox.sleep.duration_seconds`: histograms
//!
//! Handles are registered once, when the outbox is built, against the recorder
//! installed at that point. Without a recorder they do nothing.

use std::time::Duration;

use metrics::{Counter, Histogram, counter, histogram};

pub const ITEMS_FETCHED: &str = "outbox.items.fetched";
pub const ITEMS_PROCESSED: &str = "outbox.items.processed";
pub const ITEMS_RETRIED: &str = "outbox.items.retried";
pub const FULL_BATCHES: &str = "outbox.batches.full";
pub const FAILED_TICKS: &str = "outbox.ticks.failed";
pub const HANDLER_DURATION: &str = "outbox.handler.duration_seconds";
pub const PROCESS_DURATION: &str = "outbox.process.duration_seconds";
pub const SLEEP_DURATION: &str = "outbox.sleep.duration_seconds";

/// Metric handles of one outbox, shared by its worker and scheduler loop.
pub struct OutboxMetrics {
    outbox: String,
    fetched: Counter,
    processed: Counter,
    retried: Counter,
    full_batches: Counter,
    failed_ticks: Counter,
    handler: Histogram,
    batch_handler: Histogram,
    process: Histogram,
    sleep: Histogram,
}

impl OutboxMetrics {
    pub fn new(outbox: impl Into<String>) -> Self {
        let outbox = outbox.into();
        let label = || outbox.clone();
        Self {
            fetched: counter!(ITEMS_FETCHED, "outbox" => label()),
            processed: counter!(ITEMS_PROCESSED, "outbox" => label()),
            retried: counter!(ITEMS_RETRIED, "outbox" => label()),
            full_batches: counter!(FULL_BATCHES, "outbox" => label()),
            failed_ticks: counter!(FAILED_TICKS, "outbox" => label()),
            handler: histogram!(HANDLER_DURATION, "outbox" => label(), "handler" => "single"),
            batch_handler: histogram!(HANDLER_DURATION, "outbox" => label(), "handler" => "batch"),
            process: histogram!(PROCESS_DURATION, "outbox" => label()),
            sleep: histogram!(SLEEP_DURATION, "outbox" => label()),
            outbox,
        }
    }

    pub fn outbox(&self) -> &str {
        &self.outbox
    }

    /// A fetch that returned `count` rows out of `limit`.
    pub fn record_fetched(&self, count: usize, limit: usize) {
        self.fetched.increment(count as u64);
        if count > 0 && count >= limit {
            self.full_batches.increment(1);
        }
    }

    /// A committed save.
    pub fn record_saved(&self, processed: usize, retried: usize) {
        self.processed.increment(processed as u64);
        self.retried.increment(retried as u64);
    }

    pub fn record_failed_tick(&self) {
        self.failed_ticks.increment(1);
    }

    pub fn record_handler(&self, elapsed: Duration) {
        self.handler.record(elapsed.as_secs_f64());
    }

    pub fn record_batch_handler(&self, elapsed: Duration) {
        self.batch_handler.record(elapsed.as_secs_f64());
    }

    pub fn record_process(&self, elapsed: Duration) {
        self.process.record(elapsed.as_secs_f64());
    }

    pub fn record_sleep(&self, elapsed: Duration) {
        self.sleep.record(elapsed.as_secs_f64());
    }
}
