//! Strict-ordering worker: `NOWAIT`, one handler call per item, stop at the
//! first failure.
//!
//! At most one instance owns the head of the table at a time; the others see
//! an empty batch. Only the prefix before the first failure is committed, so
//! the failing item is first in line again next tick.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{Decide, Decision, OutboxWorker, WorkerContext, handle_one};
use crate::app::options::{OutboxOptions, WorkerType};
use crate::domain::{OutboxItem, TickReport};
use crate::ports::ItemHandlerFactory;

pub struct StrictOrderingWorker<T: OutboxItem> {
    ctx: WorkerContext<T>,
    handlers: Arc<dyn ItemHandlerFactory<T>>,
}

impl<T: OutboxItem> StrictOrderingWorker<T> {
    pub fn new(ctx: WorkerContext<T>, handlers: Arc<dyn ItemHandlerFactory<T>>) -> Self {
        Self { ctx, handlers }
    }
}

#[async_trait]
impl<T: OutboxItem> Decide<T> for StrictOrderingWorker<T> {
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
            if !outcome.is_success() {
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
impl<T: OutboxItem> OutboxWorker<T> for StrictOrderingWorker<T> {
    fn worker_type(&self) -> WorkerType {
        WorkerType::StrictOrdering
    }

    async fn process(&self, options: &OutboxOptions, cancel: &CancellationToken) -> TickReport {
        self.ctx
            .run_tick(WorkerType::StrictOrdering, self, options, cancel)
            .await
    }
}
