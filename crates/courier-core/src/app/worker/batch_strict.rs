//! Batch strict-ordering worker: `NOWAIT`, one handler call per batch,
//! commit the prefix of successes in fetched order.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Decide, Decision, OutboxWorker, WorkerContext};
use crate::app::options::{OutboxOptions, WorkerType};
use crate::domain::{OutboxItem, TickReport};
use crate::ports::BatchHandlerFactory;

pub struct BatchStrictOrderingWorker<T: OutboxItem> {
    ctx: WorkerContext<T>,
    handlers: Arc<dyn BatchHandlerFactory<T>>,
}

impl<T: OutboxItem> BatchStrictOrderingWorker<T> {
    pub fn new(ctx: WorkerContext<T>, handlers: Arc<dyn BatchHandlerFactory<T>>) -> Self {
        Self { ctx, handlers }
    }
}

#[async_trait]
impl<T: OutboxItem> Decide<T> for BatchStrictOrderingWorker<T> {
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

        let result = match result {
            Ok(result) => result,
            Err(err) => {
                warn!(
                    outbox = %self.ctx.outbox,
                    batch = items.len(),
                    error = %err,
                    "batch handler failed"
                );
                return Decision::nothing();
            }
        };

        let mut decision = Decision::nothing();
        for mut item in items {
            // a missing outcome counts as a failure
            let succeeded = result.outcome(&item.id()).is_some_and(|o| o.is_success());
            if !succeeded {
                info!(
                    outbox = %self.ctx.outbox,
                    item_id = %item.id(),
                    committed = decision.processed.len(),
                    "stopping at first failure to keep ordering"
                );
                break;
            }
            self.ctx.mark_completed(&mut item);
            decision.processed.push(item);
        }
        decision
    }
}

#[async_trait]
impl<T: OutboxItem> OutboxWorker<T> for BatchStrictOrderingWorker<T> {
    fn worker_type(&self) -> WorkerType {
        WorkerType::BatchStrictOrdering
    }

    async fn process(&self, options: &OutboxOptions, cancel: &CancellationToken) -> TickReport {
        self.ctx
            .run_tick(WorkerType::BatchStrictOrdering, self, options, cancel)
            .await
    }
}
