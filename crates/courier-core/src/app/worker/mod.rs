//! Workers - 1 tick 分の取得・処理・保存
//!
//! Every strategy runs the same tick:
//!
//! 1. open a repository (one transaction) with the strategy's lock discipline
//! 2. `lock_and_fetch(limit)`; an empty batch ends the tick
//! 3. hand the items to the handler and sort them into processed / retried
//! 4. `save(processed, retried)` once, which commits
//!
//! The strategies differ only in step 3. Any error in steps 2 or 4 ends the
//! tick as `Failed`, and cancellation ends it as `Cancelled`; in both cases the
//! repository is dropped without `save`, which rolls the transaction back.

mod batch_competing;
mod batch_strict;
mod competing;
mod strict;

pub use self::batch_competing::BatchCompetingWorker;
pub use self::batch_strict::BatchStrictOrderingWorker;
pub use self::competing::CompetingWorker;
pub use self::strict::StrictOrderingWorker;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::metrics::OutboxMetrics;
use super::options::{OutboxOptions, WorkerType};
use super::retry::RetryDelayComputer;
use crate::domain::{ItemFeatures, OutboxItem, OutboxResult, TickReport, TickStatus};
use crate::ports::{Clock, RepositoryMode, RepositoryProvider};

/// One worker tick.
#[async_trait]
pub trait OutboxWorker<T: OutboxItem>: Send + Sync {
    fn worker_type(&self) -> WorkerType;

    /// Never fails: errors are logged and reported in the `TickReport`.
    async fn process(&self, options: &OutboxOptions, cancel: &CancellationToken) -> TickReport;
}

/// What a strategy decided for a fetched batch.
pub(crate) struct Decision<T> {
    pub processed: Vec<T>,
    pub retried: Vec<T>,
}

impl<T> Decision<T> {
    pub fn nothing() -> Self {
        Self {
            processed: Vec::new(),
            retried: Vec::new(),
        }
    }
}

/// Step 3 of a tick.
#[async_trait]
pub(crate) trait Decide<T: OutboxItem>: Send + Sync {
    async fn decide(
        &self,
        items: Vec<T>,
        options: &OutboxOptions,
        cancel: &CancellationToken,
    ) -> Decision<T>;
}

/// Result of trying to reschedule a failed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reschedule {
    /// Status fields were stamped; the item goes to `retried`.
    Scheduled,
    /// Retry is switched off; the row stays as it is.
    Disabled,
    /// The item type has no status fields; processing must stop here.
    Unsupported,
}

/// Everything a worker needs apart from its handler.
pub struct WorkerContext<T: OutboxItem> {
    pub outbox: String,
    pub features: ItemFeatures,
    pub provider: Arc<dyn RepositoryProvider<T>>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<OutboxMetrics>,
    pub delay: RetryDelayComputer,
}

impl<T: OutboxItem> Clone for WorkerContext<T> {
    fn clone(&self) -> Self {
        Self {
            outbox: self.outbox.clone(),
            features: self.features,
            provider: Arc::clone(&self.provider),
            clock: Arc::clone(&self.clock),
            metrics: Arc::clone(&self.metrics),
            delay: self.delay,
        }
    }
}

impl<T: OutboxItem> WorkerContext<T> {
    pub fn new(
        outbox: impl Into<String>,
        provider: Arc<dyn RepositoryProvider<T>>,
        clock: Arc<dyn Clock>,
        metrics: Arc<OutboxMetrics>,
    ) -> Self {
        Self {
            outbox: outbox.into(),
            features: ItemFeatures::of::<T>(),
            provider,
            clock,
            metrics,
            delay: RetryDelayComputer::new(),
        }
    }

    pub fn with_delay(mut self, delay: RetryDelayComputer) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) async fn run_tick(
        &self,
        worker_type: WorkerType,
        strategy: &dyn Decide<T>,
        options: &OutboxOptions,
        cancel: &CancellationToken,
    ) -> TickReport {
        let mode = RepositoryMode::new(worker_type.lock_discipline(), options.partitions.enabled);
        let mut repository = self.provider.open(mode);
        let limit = options.outbox_items_limit;

        let tick = async {
            let items = repository.lock_and_fetch(limit).await?;
            self.metrics.record_fetched(items.len(), limit);
            if items.is_empty() {
                return OutboxResult::Ok(TickReport::empty());
            }
            let fetched = items.len();
            debug!(outbox = %self.outbox, fetched, "outbox items locked");

            let decision = strategy.decide(items, options, cancel).await;
            let (processed, retried) = (decision.processed.len(), decision.retried.len());
            repository.save(&decision.processed, &decision.retried).await?;
            self.metrics.record_saved(processed, retried);

            info!(outbox = %self.outbox, fetched, processed, retried, "outbox tick committed");
            Ok(TickReport::completed(fetched, processed, retried))
        };

        let report = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(outbox = %self.outbox, "outbox tick cancelled, rolling back");
                TickReport::ended(TickStatus::Cancelled, 0)
            }
            result = tick => match result {
                Ok(report) => report,
                Err(err) => {
                    error!(outbox = %self.outbox, error = %err, "outbox tick failed, rolling back");
                    self.metrics.record_failed_tick();
                    TickReport::ended(TickStatus::Failed, 0)
                }
            },
        };
        // repository is dropped here; without a successful save that is a rollback
        drop(repository);
        report
    }

    /// Stamps retry bookkeeping on a failed item.
    pub(crate) fn reschedule(&self, item: &mut T, options: &OutboxOptions) -> Reschedule {
        let settings = &options.retry;
        let now = self.clock.now();
        let Some(fields) = item.status_mut() else {
            return Reschedule::Unsupported;
        };
        if !settings.is_enabled {
            return Reschedule::Disabled;
        }

        let attempt = fields.retry_count.unwrap_or(0).saturating_add(1);
        let delay = self.delay.next_delay(settings, attempt);
        let delay = ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::MAX);
        // past chrono's range the item is parked at the far end, never "due now"
        let retry_after = now
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let retry_count = fields.schedule_retry(retry_after);

        if settings.log_on_retry {
            info!(
                outbox = %self.outbox,
                item_id = %item.id(),
                retry_count,
                %retry_after,
                "outbox item scheduled for retrying"
            );
        }
        Reschedule::Scheduled
    }

    pub(crate) fn mark_completed(&self, item: &mut T) {
        if let Some(fields) = item.status_mut() {
            fields.mark_completed();
        }
    }
}

/// Runs an item handler and folds an `Err` into `Retry`.
pub(crate) async fn handle_one<T: OutboxItem>(
    ctx: &WorkerContext<T>,
    handler: &dyn crate::ports::ItemHandler<T>,
    item: &T,
    options: &OutboxOptions,
    cancel: &CancellationToken,
) -> crate::domain::HandleResult {
    let started = Instant::now();
    let result = handler.handle(item, options, cancel).await;
    ctx.metrics.record_handler(started.elapsed());
    match result {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::warn!(
                outbox = %ctx.outbox,
                item_id = %item.id(),
                error = %err,
                "outbox item handler failed"
            );
            crate::domain::HandleResult::Retry
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Handlers and helpers shared by the worker tests.

    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::app::metrics::capture::{Captured, capture};
    use crate::domain::item::fixtures::Message;
    use crate::domain::{BatchResult, HandleResult, HandlerError, ItemId};
    use crate::impls::InMemoryOutbox;
    use crate::ports::{BatchHandler, ItemHandler, ManualClock};

    /// Records every id it sees, in order.
    #[derive(Clone, Default)]
    pub struct Recorder(pub Arc<Mutex<Vec<ItemId>>>);

    impl Recorder {
        pub fn push(&self, id: ItemId) {
            self.0.lock().unwrap().push(id);
        }

        pub fn seen(&self) -> Vec<ItemId> {
            self.0.lock().unwrap().clone()
        }

        pub fn assert_unique(&self) {
            let seen = self.seen();
            let unique: HashSet<_> = seen.iter().collect();
            assert_eq!(unique.len(), seen.len(), "an item was handled twice");
        }
    }

    /// Answers from a fixed verdict per payload; unknown payloads succeed.
    /// `"boom"` makes the handler return an error.
    pub struct ScriptedHandler {
        pub recorder: Recorder,
    }

    #[async_trait]
    impl ItemHandler<Message> for ScriptedHandler {
        async fn handle(
            &self,
            item: &Message,
            _options: &OutboxOptions,
            _cancel: &CancellationToken,
        ) -> Result<HandleResult, HandlerError> {
            self.recorder.push(item.id);
            tokio::task::yield_now().await;
            match item.payload.as_str() {
                "retry" => Ok(HandleResult::Retry),
                "skip" => Ok(HandleResult::Skip),
                "boom" => Err("handler exploded".into()),
                _ => Ok(HandleResult::Ok),
            }
        }
    }

    pub fn scripted(recorder: &Recorder) -> impl Fn() -> ScriptedHandler + Send + Sync + use<> {
        let recorder = recorder.clone();
        move || ScriptedHandler {
            recorder: recorder.clone(),
        }
    }

    /// Batch handler answering per payload like `ScriptedHandler`.
    /// A batch whose first item says `"boom"` fails as a whole; an item
    /// saying `"missing"` is left out of the outcome map.
    pub struct ScriptedBatchHandler {
        pub recorder: Recorder,
    }

    #[async_trait]
    impl BatchHandler<Message> for ScriptedBatchHandler {
        async fn handle(
            &self,
            items: &[Message],
            _options: &OutboxOptions,
            _cancel: &CancellationToken,
        ) -> Result<BatchResult, HandlerError> {
            for item in items {
                self.recorder.push(item.id);
            }
            tokio::task::yield_now().await;
            if items.first().is_some_and(|i| i.payload == "boom") {
                return Err("batch exploded".into());
            }
            if items.iter().all(|i| i.payload == "ok") {
                return Ok(BatchResult::fully_processed());
            }
            let outcomes: HashMap<_, _> = items
                .iter()
                .filter(|i| i.payload != "missing")
                .map(|i| {
                    let outcome = match i.payload.as_str() {
                        "retry" | "boom" => HandleResult::Retry,
                        "skip" => HandleResult::Skip,
                        _ => HandleResult::Ok,
                    };
                    (i.id, outcome)
                })
                .collect();
            Ok(BatchResult::partially(outcomes))
        }
    }

    pub fn scripted_batch(
        recorder: &Recorder,
    ) -> impl Fn() -> ScriptedBatchHandler + Send + Sync + use<> {
        let recorder = recorder.clone();
        move || ScriptedBatchHandler {
            recorder: recorder.clone(),
        }
    }

    pub fn start() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    /// A table on a manual clock plus a matching worker context.
    pub fn fixture() -> (InMemoryOutbox<Message>, ManualClock, WorkerContext<Message>) {
        let (table, clock, ctx, _captured) = measured_fixture();
        (table, clock, ctx)
    }

    /// `fixture` whose metrics can be read back.
    pub fn measured_fixture() -> (
        InMemoryOutbox<Message>,
        ManualClock,
        WorkerContext<Message>,
        Captured,
    ) {
        let clock = ManualClock::new(start());
        let table = InMemoryOutbox::with_clock(Arc::new(clock.clone()));
        let (metrics, captured) = capture(|| OutboxMetrics::new("orders"));
        let ctx = WorkerContext::new(
            "orders",
            Arc::new(table.clone()),
            Arc::new(clock.clone()),
            Arc::new(metrics),
        )
        .with_delay(RetryDelayComputer::without_jitter());
        (table, clock, ctx, captured)
    }

    /// Seeds `payloads` in id order and returns their ids.
    pub fn seed(table: &InMemoryOutbox<Message>, payloads: &[&str]) -> Vec<ItemId> {
        payloads
            .iter()
            .enumerate()
            .map(|(i, payload)| {
                let item = Message::new(i as u64, payload);
                let id = item.id;
                table.insert(item);
                id
            })
            .collect()
    }

    pub fn options(limit: usize) -> OutboxOptions {
        OutboxOptions {
            outbox_items_limit: limit,
            ..OutboxOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::app::options::DelayPolicy;
    use crate::domain::OutboxItemStatus;
    use crate::domain::item::fixtures::Message;

    #[test]
    fn reschedule_uses_next_attempt_number() {
        let (_table, clock, ctx) = fixture();
        let mut options = options(10);
        options.retry.delay_policy = crate::app::options::DelayPolicy::Linear;
        let mut item = Message::new(1, "x");

        assert_eq!(ctx.reschedule(&mut item, &options), Reschedule::Scheduled);
        assert_eq!(item.fields.retry_count, Some(1));
        assert_eq!(
            item.fields.retry_after,
            Some(clock.now() + ChronoDuration::seconds(3))
        );

        assert_eq!(ctx.reschedule(&mut item, &options), Reschedule::Scheduled);
        assert_eq!(item.fields.retry_count, Some(2));
        assert_eq!(
            item.fields.retry_after,
            Some(clock.now() + ChronoDuration::seconds(6))
        );
        assert_eq!(item.fields.status, OutboxItemStatus::Retry);
    }

    #[test]
    fn reschedule_leaves_item_alone_when_disabled() {
        let (_table, _clock, ctx) = fixture();
        let mut options = options(10);
        options.retry.is_enabled = false;
        let mut item = Message::new(1, "x");
        let before = item.clone();

        assert_eq!(ctx.reschedule(&mut item, &options), Reschedule::Disabled);
        assert_eq!(item, before);
    }

    #[test]
    fn reschedule_parks_out_of_range_delays_at_the_far_end() {
        let (_table, clock, ctx) = fixture();
        let mut options = options(10);
        options.retry.delay_policy = DelayPolicy::Constant;
        options.retry.retry_delay = std::time::Duration::from_millis(u64::MAX);
        let mut item = Message::new(1, "x");

        assert_eq!(ctx.reschedule(&mut item, &options), Reschedule::Scheduled);
        assert_eq!(item.fields.retry_after, Some(DateTime::<Utc>::MAX_UTC));
        assert!(!item.fields.is_due(clock.now()));
    }
}
