//! Competing worker: `SKIP LOCKED`, one handler call per item.
//!
//! Several instances drain the same table in parallel. A failed item is
//! rescheduled and the scan goes on; an item type without status fields
//! cannot be rescheduled, so the scan stops there and keeps what it has.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{Decide, Decision, OutboxWorker, Reschedule, WorkerContext, handle_one};
use crate::app::options::{OutboxOptions, WorkerType};
use crate::domain::{OutboxItem, TickReport};
use crate::ports::ItemHandlerFactory;

pub struct CompetingWorker<T: OutboxItem> {
    ctx: WorkerContext<T>,
    handlers: Arc<dyn ItemHandlerFactory<T>>,
}

impl<T: OutboxItem> CompetingWorker<T> {
    pub fn new(ctx: WorkerContext<T>, handlers: Arc<dyn ItemHandlerFactory<T>>) -> Self {
        Self { ctx, handlers }
    }
}

#[async_trait]
impl<T: OutboxItem> Decide<T> for CompetingWorker<T> {
    async fn decide(
        &self,
        items: Vec<T>,
        options: &OutboxOptions,
        cancel: &CancellationToken,
    ) -> Decision<T> {
        let mut decision = Decision::nothing();
        for mut item in items {
            let handler = self.handlers.create();
            let outcome = handle_one(&self.ctx, handler.as_ref(), &item, options, cancel).await;

            if outcome.is_success() {
                self.ctx.mark_completed(&mut item);
                decision.processed.push(item);
                continue;
            }
            match self.ctx.reschedule(&mut item, options) {
                Reschedule::Scheduled => decision.retried.push(item),
                Reschedule::Disabled => {}
                Reschedule::Unsupported => {
                    warn!(
                        outbox = %self.ctx.outbox,
                        item_id = %item.id(),
                        "item type cannot be rescheduled, stopping this tick"
                    );
                    break;
                }
            }
        }
        decision
    }
}

#[async_trait]
impl<T: OutboxItem> OutboxWorker<T> for CompetingWorker<T> {
    fn worker_type(&self) -> WorkerType {
        WorkerType::Competing
    }

    async fn process(&self, options: &OutboxOptions, cancel: &CancellationToken) -> TickReport {
        self.ctx
            .run_tick(WorkerType::Competing, self, options, cancel)
            .await
    }
}
