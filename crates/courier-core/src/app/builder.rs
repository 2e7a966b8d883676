//! OutboxBuilder - アウトボックスの構築とワイヤリング
//!
//! # 方針
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - worker 種別は enum で選ぶ（文字列キーの lookup はしない）

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::metrics::OutboxMetrics;
use super::options::{OutboxOptions, WorkerType};
use super::partitions::PartitionManager;
use super::retry::RetryDelayComputer;
use super::worker::{
    BatchCompetingWorker, BatchStrictOrderingWorker, CompetingWorker, OutboxWorker,
    StrictOrderingWorker, WorkerContext,
};
use crate::domain::{ItemFeatures, OutboxError, OutboxItem, OutboxResult, TickReport};
use crate::ports::{
    BatchHandlerFactory, Clock, HandlerKind, ItemHandlerFactory, PartitionStore,
    RepositoryProvider, SystemClock,
};

/// OutboxBuilder は 1 つのアウトボックスを構築
///
/// # 使用例
/// ```ignore
/// let outbox = OutboxBuilder::<OrderEvent>::new("orders")
///     .options(options)
///     .repository(Arc::new(PgRepositoryProvider::new(pool, mapping)))
///     .item_handler(|| PublishHandler::new(producer.clone()))
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// `build()` rejects every combination that could only fail later:
/// - invalid option values
/// - a competing worker, or partitioning, on an item type without status fields
/// - a handler kind that does not match the worker type
/// - partitioning without a partition store
pub struct OutboxBuilder<T: OutboxItem> {
    name: String,
    options: OutboxOptions,
    provider: Option<Arc<dyn RepositoryProvider<T>>>,
    handler: Option<HandlerKind<T>>,
    partition_store: Option<Arc<dyn PartitionStore>>,
    clock: Arc<dyn Clock>,
    delay: RetryDelayComputer,
}

impl<T: OutboxItem> OutboxBuilder<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: OutboxOptions::default(),
            provider: None,
            handler: None,
            partition_store: None,
            clock: Arc::new(SystemClock),
            delay: RetryDelayComputer::new(),
        }
    }

    pub fn options(mut self, options: OutboxOptions) -> Self {
        self.options = options;
        self
    }

    pub fn repository(mut self, provider: Arc<dyn RepositoryProvider<T>>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Handler for `Competing` / `StrictOrdering`; called with a fresh instance per item.
    pub fn item_handler(mut self, factory: impl ItemHandlerFactory<T> + 'static) -> Self {
        self.handler = Some(HandlerKind::item(factory));
        self
    }

    /// Handler for the batch worker types; called with a fresh instance per batch.
    pub fn batch_handler(mut self, factory: impl BatchHandlerFactory<T> + 'static) -> Self {
        self.handler = Some(HandlerKind::batch(factory));
        self
    }

    pub fn partition_store(mut self, store: Arc<dyn PartitionStore>) -> Self {
        self.partition_store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn delay_computer(mut self, delay: RetryDelayComputer) -> Self {
        self.delay = delay;
        self
    }

    pub fn build(self) -> OutboxResult<OutboxRegistration<T>> {
        let features = ItemFeatures::of::<T>();
        self.options.validate(&self.name)?;
        check_features(&self.name, &self.options, features)?;

        let Some(provider) = self.provider else {
            return Err(invalid(&self.name, "no repository configured"));
        };
        let Some(handler) = self.handler else {
            return Err(OutboxError::MissingHandler {
                outbox: self.name,
                expected: expected_handler(self.options.worker_type),
            });
        };

        let partitions = if self.options.partitions.enabled {
            let Some(store) = self.partition_store else {
                return Err(invalid(
                    &self.name,
                    "partitioning is enabled but no partition store is configured",
                ));
            };
            Some(Arc::new(PartitionManager::new(
                self.name.clone(),
                store,
                Arc::clone(&self.clock),
            )))
        } else {
            None
        };

        let metrics = Arc::new(OutboxMetrics::new(self.name.clone()));
        let ctx = WorkerContext::new(
            self.name.clone(),
            provider,
            self.clock,
            Arc::clone(&metrics),
        )
        .with_delay(self.delay);
        let worker = create_worker(&self.name, self.options.worker_type, ctx, handler)?;

        let (tx, _rx) = watch::channel(self.options);
        Ok(OutboxRegistration {
            options: OptionsHandle {
                outbox: self.name.clone(),
                tx: Arc::new(tx),
            },
            name: self.name,
            worker,
            metrics,
            partitions,
        })
    }
}

fn invalid(outbox: &str, reason: &str) -> OutboxError {
    OutboxError::InvalidConfiguration {
        outbox: outbox.to_string(),
        reason: reason.to_string(),
    }
}

fn expected_handler(worker_type: WorkerType) -> &'static str {
    if worker_type.is_batch() { "batch" } else { "item" }
}

fn check_features(
    outbox: &str,
    options: &OutboxOptions,
    features: ItemFeatures,
) -> OutboxResult<()> {
    if features.status {
        return Ok(());
    }
    if options.worker_type.requires_status() || options.partitions.enabled {
        return Err(OutboxError::StatusNotSupported(outbox.to_string()));
    }
    Ok(())
}

/// Worker factory keyed by `WorkerType`.
pub fn create_worker<T: OutboxItem>(
    outbox: &str,
    worker_type: WorkerType,
    ctx: WorkerContext<T>,
    handler: HandlerKind<T>,
) -> OutboxResult<Arc<dyn OutboxWorker<T>>> {
    let worker: Arc<dyn OutboxWorker<T>> = match (worker_type, handler) {
        (WorkerType::Competing, HandlerKind::Item(h)) => Arc::new(CompetingWorker::new(ctx, h)),
        (WorkerType::StrictOrdering, HandlerKind::Item(h)) => {
            Arc::new(StrictOrderingWorker::new(ctx, h))
        }
        (WorkerType::BatchCompeting, HandlerKind::Batch(h)) => {
            Arc::new(BatchCompetingWorker::new(ctx, h))
        }
        (WorkerType::BatchStrictOrdering, HandlerKind::Batch(h)) => {
            Arc::new(BatchStrictOrderingWorker::new(ctx, h))
        }
        (worker_type, _) => {
            return Err(OutboxError::MissingHandler {
                outbox: outbox.to_string(),
                expected: expected_handler(worker_type),
            });
        }
    };
    Ok(worker)
}

/// Live view of an outbox's options.
///
/// Clones share the same channel. `update` validates before publishing, so
/// readers only ever see options that passed `validate`.
#[derive(Clone)]
pub struct OptionsHandle {
    outbox: String,
    tx: Arc<watch::Sender<OutboxOptions>>,
}

impl OptionsHandle {
    pub fn current(&self) -> OutboxOptions {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<OutboxOptions> {
        self.tx.subscribe()
    }

    /// Replaces the options.
    ///
    /// The worker type and the partitioning switch are fixed at build time.
    pub fn update(&self, options: OutboxOptions) -> OutboxResult<()> {
        options.validate(&self.outbox)?;
        let current = self.tx.borrow();
        if options.worker_type != current.worker_type {
            return Err(invalid(&self.outbox, "worker_type cannot change at runtime"));
        }
        if options.partitions.enabled != current.partitions.enabled {
            return Err(invalid(&self.outbox, "partitions.enabled cannot change at runtime"));
        }
        drop(current);
        self.tx.send_replace(options);
        Ok(())
    }

    /// Edits a copy of the current options and publishes it through `update`.
    pub fn modify(&self, edit: impl FnOnce(&mut OutboxOptions)) -> OutboxResult<()> {
        let mut options = self.current();
        edit(&mut options);
        self.update(options)
    }
}

/// A built outbox: worker, live options, metrics and optional partition manager.
pub struct OutboxRegistration<T: OutboxItem> {
    name: String,
    worker: Arc<dyn OutboxWorker<T>>,
    options: OptionsHandle,
    metrics: Arc<OutboxMetrics>,
    partitions: Option<Arc<PartitionManager>>,
}

impl<T: OutboxItem> OutboxRegistration<T> {
    pub fn worker(&self) -> &Arc<dyn OutboxWorker<T>> {
        &self.worker
    }
}

/// Type-erased view the scheduler works with.
#[async_trait]
pub trait ScheduledOutbox: Send + Sync {
    fn name(&self) -> &str;
    fn options(&self) -> OptionsHandle;
    fn metrics(&self) -> Arc<OutboxMetrics>;
    fn partition_manager(&self) -> Option<Arc<PartitionManager>>;

    /// One worker tick with the current options.
    async fn process_once(&self, cancel: &CancellationToken) -> TickReport;
}

#[async_trait]
impl<T: OutboxItem> ScheduledOutbox for OutboxRegistration<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> OptionsHandle {
        self.options.clone()
    }

    fn metrics(&self) -> Arc<OutboxMetrics> {
        Arc::clone(&self.metrics)
    }

    fn partition_manager(&self) -> Option<Arc<PartitionManager>> {
        self.partitions.clone()
    }

    async fn process_once(&self, cancel: &CancellationToken) -> TickReport {
        let options = self.options.current();
        self.worker.process(&options, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::metrics::ITEMS_PROCESSED;
    use crate::app::metrics::capture::capture;
    use crate::app::worker::testing::{Recorder, scripted, scripted_batch};
    use crate::domain::item::fixtures::{Message, Plain};
    use crate::domain::{HandleResult, HandlerError, TickStatus};
    use crate::impls::{InMemoryOutbox, InMemoryPartitionStore};
    use crate::ports::ItemHandler;
    use std::time::Duration;

    fn with_type(worker_type: WorkerType) -> OutboxOptions {
        OutboxOptions {
            worker_type,
            ..OutboxOptions::default()
        }
    }

    #[test]
    fn build_success_selects_the_worker_type() {
        let recorder = Recorder::default();
        for worker_type in WorkerType::ALL {
            let builder = OutboxBuilder::<Message>::new("orders")
                .options(with_type(worker_type))
                .repository(Arc::new(InMemoryOutbox::new()));
            let builder = if worker_type.is_batch() {
                builder.batch_handler(scripted_batch(&recorder))
            } else {
                builder.item_handler(scripted(&recorder))
            };

            let outbox = builder.build().unwrap();
            assert_eq!(outbox.worker().worker_type(), worker_type);
        }
    }

    #[test]
    fn build_rejects_mismatched_handler() {
        let result = OutboxBuilder::<Message>::new("orders")
            .options(with_type(WorkerType::BatchCompeting))
            .repository(Arc::new(InMemoryOutbox::new()))
            .item_handler(scripted(&Recorder::default()))
            .build();

        assert!(matches!(
            result,
            Err(OutboxError::MissingHandler { expected: "batch", .. })
        ));
    }

    #[test]
    fn build_rejects_missing_handler_and_repository() {
        let no_handler = OutboxBuilder::<Message>::new("orders")
            .repository(Arc::new(InMemoryOutbox::new()))
            .build();
        assert!(matches!(
            no_handler,
            Err(OutboxError::MissingHandler { expected: "item", .. })
        ));

        let no_repository = OutboxBuilder::<Message>::new("orders")
            .item_handler(scripted(&Recorder::default()))
            .build();
        assert!(matches!(no_repository, Err(OutboxError::InvalidConfiguration { .. })));
    }

    struct Noop;

    #[async_trait]
    impl ItemHandler<Plain> for Noop {
        async fn handle(
            &self,
            _item: &Plain,
            _options: &OutboxOptions,
            _cancel: &CancellationToken,
        ) -> Result<HandleResult, HandlerError> {
            Ok(HandleResult::Ok)
        }
    }

    #[test]
    fn competing_requires_status_capability() {
        let result = OutboxBuilder::<Plain>::new("plain")
            .repository(Arc::new(InMemoryOutbox::new()))
            .item_handler(|| Noop)
            .build();
        assert!(matches!(result, Err(OutboxError::StatusNotSupported(name)) if name == "plain"));

        let strict = OutboxBuilder::<Plain>::new("plain")
            .options(with_type(WorkerType::StrictOrdering))
            .repository(Arc::new(InMemoryOutbox::new()))
            .item_handler(|| Noop)
            .build();
        assert!(strict.is_ok());
    }

    #[test]
    fn partitioning_requires_status_and_store() {
        let mut options = with_type(WorkerType::StrictOrdering);
        options.partitions.enabled = true;

        let plain = OutboxBuilder::<Plain>::new("plain")
            .options(options.clone())
            .repository(Arc::new(InMemoryOutbox::new()))
            .item_handler(|| Noop)
            .build();
        assert!(matches!(plain, Err(OutboxError::StatusNotSupported(_))));

        let without_store = OutboxBuilder::<Message>::new("orders")
            .options(options.clone())
            .repository(Arc::new(InMemoryOutbox::new()))
            .item_handler(scripted(&Recorder::default()))
            .build();
        assert!(matches!(without_store, Err(OutboxError::InvalidConfiguration { .. })));

        let outbox = OutboxBuilder::<Message>::new("orders")
            .options(options)
            .repository(Arc::new(InMemoryOutbox::new()))
            .item_handler(scripted(&Recorder::default()))
            .partition_store(Arc::new(InMemoryPartitionStore::new("outbox")))
            .build()
            .unwrap();
        assert!(outbox.partition_manager().is_some());
    }

    #[test]
    fn options_update_validates_and_publishes() {
        let outbox = OutboxBuilder::<Message>::new("orders")
            .repository(Arc::new(InMemoryOutbox::new()))
            .item_handler(scripted(&Recorder::default()))
            .build()
            .unwrap();
        let handle = outbox.options();
        let mut rx = handle.subscribe();

        handle
            .modify(|o| o.worker_delay = Duration::from_millis(10))
            .unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().worker_delay, Duration::from_millis(10));

        assert!(handle.modify(|o| o.outbox_items_limit = 0).is_err());
        assert!(
            handle
                .modify(|o| o.worker_type = WorkerType::StrictOrdering)
                .is_err()
        );
        assert_eq!(handle.current().outbox_items_limit, 100);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn process_once_uses_current_options() {
        let table = InMemoryOutbox::new();
        table.insert_many((0..5).map(|i| Message::new(i, "ok")));
        let (outbox, captured) = capture(|| {
            OutboxBuilder::<Message>::new("orders")
                .repository(Arc::new(table.clone()))
                .item_handler(scripted(&Recorder::default()))
                .build()
                .unwrap()
        });

        outbox.options().modify(|o| o.outbox_items_limit = 2).unwrap();
        let report = outbox.process_once(&CancellationToken::new()).await;

        assert_eq!(report.status, TickStatus::Completed);
        assert_eq!(report.processed, 2);
        assert_eq!(table.len(), 3);
        assert_eq!(captured.read().counter(ITEMS_PROCESSED), 2);
    }
}
