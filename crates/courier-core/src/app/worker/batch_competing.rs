//! Batch competing worker: `SKIP LOCKED`, one handler call per batch.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Decide, Decision, OutboxWorker, Reschedule, WorkerContext};
use crate::app::options::{OutboxOptions, WorkerType};
use crate::domain::{BatchResult, HandleResult, OutboxItem, TickReport};
use crate::ports::BatchHandlerFactory;

pub struct BatchCompetingWorker<T: OutboxItem> {
    ctx: WorkerContext<T>,
    handlers: Arc<dyn BatchHandlerFactory<T>>,
}

impl<T: OutboxItem> BatchCompetingWorker<T> {
    pub fn new(ctx: WorkerContext<T>, handlers: Arc<dyn BatchHandlerFactory<T>>) -> Self {
        Self { ctx, handlers }
    }
}

#[async_trait]
impl<T: OutboxItem> Decide<T> for BatchCompetingWorker<T> {
    async fn decide(
        &self,
        items: Vec<T>,
        options: &OutboxOptions,
        cancel: &CancellationToken,
    ) -> Decision<T> {
        let handler = self.handlers.create();
        let started = Instant::now();
        let result = handler.handle(&items, options, cancel).await;
        self.ctx.metrics.record_batch_handler(started.elapsed());

        // handler error: every item of the batch failed
        let result: Option<BatchResult> = match result {
            Ok(result) => Some(result),
            Err(err) => {
                warn!(
                    outbox = %self.ctx.outbox,
                    batch = items.len(),
                    error = %err,
                    "batch handler failed"
                );
                None
            }
        };

        let mut decision = Decision::nothing();
        for mut item in items {
            let outcome = match &result {
                Some(result) => match result.outcome(&item.id()) {
                    Some(outcome) => outcome,
                    None => {
                        debug!(
                            outbox = %self.ctx.outbox,
                            item_id = %item.id(),
                            "no outcome reported, leaving item as is"
                        );
                        continue;
                    }
                },
                None => HandleResult::Retry,
            };

            if outcome.is_success() {
                self.ctx.mark_completed(&mut item);
                decision.processed.push(item);
                continue;
            }
            match self.ctx.reschedule(&mut item, options) {
                Reschedule::Scheduled => decision.retried.push(item),
                Reschedule::Disabled => {}
                Reschedule::Unsupported => break,
            }
        }
        decision
    }
}

#[async_trait]
impl<T: OutboxItem> OutboxWorker<T> for BatchCompetingWorker<T> {
    fn worker_type(&self) -> WorkerType {
        WorkerType::BatchCompeting
    }

    async fn process(&self, options: &OutboxOptions, cancel: &CancellationToken) -> TickReport {
        self.ctx
            .run_tick(WorkerType::BatchCompeting, self, options, cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::metrics::FULL_BATCHES;
    use crate::app::worker::testing::*;
    use crate::domain::item::fixtures::Message;
    use crate::domain::OutboxItemStatus;

    fn worker(ctx: &WorkerContext<Message>, recorder: &Recorder) -> BatchCompetingWorker<Message> {
        BatchCompetingWorker::new(ctx.clone(), Arc::new(scripted_batch(recorder)))
    }

    #[tokio::test]
    async fn fully_processed_batch_is_removed() {
        let (table, _clock, ctx, captured) = measured_fixture();
        seed(&table, &["ok", "ok", "ok", "ok"]);

        let report = worker(&ctx, &Recorder::default())
            .process(&options(3), &CancellationToken::new())
            .await;

        assert_eq!(report, TickReport::completed(3, 3, 0));
        assert_eq!(table.len(), 1);
        let readings = captured.read();
        assert_eq!(readings.counter(FULL_BATCHES), 1);
        assert_eq!(readings.samples("outbox.handler.duration_seconds{handler=batch}"), 1);
    }

    #[tokio::test]
    async fn every_item_is_resolved_independently() {
        let (table, _clock, ctx) = fixture();
        let ids = seed(&table, &["ok", "retry", "skip", "retry", "ok"]);

        let report = worker(&ctx, &Recorder::default())
            .process(&options(10), &CancellationToken::new())
            .await;

        assert_eq!(report, TickReport::completed(5, 3, 2));
        let remaining: Vec<_> = table.snapshot().iter().map(|m| m.id).collect();
        assert_eq!(remaining, [ids[1], ids[3]]);
        assert!(
            table
                .snapshot()
                .iter()
                .all(|m| m.fields.status == OutboxItemStatus::Retry)
        );
    }

    #[tokio::test]
    async fn items_missing_from_the_outcome_map_are_left_alone() {
        let (table, _clock, ctx) = fixture();
        let ids = seed(&table, &["ok", "missing", "retry"]);

        let report = worker(&ctx, &Recorder::default())
            .process(&options(10), &CancellationToken::new())
            .await;

        assert_eq!(report, TickReport::completed(3, 1, 1));
        let missing = table.get(&ids[1]).unwrap();
        assert_eq!(missing.fields.status, OutboxItemStatus::Ready);
        assert_eq!(table.get(&ids[2]).unwrap().fields.retry_count, Some(1));
    }

    #[tokio::test]
    async fn handler_error_reschedules_the_whole_batch() {
        let (table, _clock, ctx) = fixture();
        seed(&table, &["boom", "ok"]);

        let report = worker(&ctx, &Recorder::default())
            .process(&options(10), &CancellationToken::new())
            .await;

        assert_eq!(report, TickReport::completed(2, 0, 2));
        assert!(table.snapshot().iter().all(|m| m.fields.retry_count == Some(1)));
    }

    #[tokio::test]
    async fn concurrent_batches_are_disjoint() {
        let (table, _clock, ctx) = fixture();
        let (workers, limit, rest) = (3, 4, 2);
        seed(&table, &vec!["ok"; workers * limit + rest]);
        let recorder = Recorder::default();

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..workers {
            let worker = worker(&ctx, &recorder);
            set.spawn(async move {
                worker
                    .process(&options(limit), &CancellationToken::new())
                    .await
            });
        }
        let mut processed = 0;
        while let Some(report) = set.join_next().await {
            processed += report.unwrap().processed;
        }

        assert_eq!(processed, workers * limit);
        assert_eq!(table.len(), rest);
        recorder.assert_unique();
    }
}
