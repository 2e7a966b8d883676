//! `courier demo` - in-memory アウトボックスでスケジューラを動かす

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::app::{OutboxBuilder, OutboxOptions, OutboxScheduler, ScheduledOutbox};
use courier_core::domain::{
    BatchResult, HandleResult, HandlerError, ItemId, OutboxItem, StatusFields,
};
use courier_core::impls::InMemoryOutbox;
use courier_core::ports::{BatchHandler, IdGenerator, ItemHandler, SystemClock, UlidGenerator};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Demo row: status + priority tracking.
#[derive(Debug, Clone)]
pub struct DemoMessage {
    pub id: ItemId,
    pub seq: u64,
    pub priority: i32,
    pub fields: StatusFields,
}

impl OutboxItem for DemoMessage {
    const HAS_STATUS: bool = true;
    const HAS_PRIORITY: bool = true;

    fn id(&self) -> ItemId {
        self.id
    }

    fn status(&self) -> Option<&StatusFields> {
        Some(&self.fields)
    }

    fn status_mut(&mut self) -> Option<&mut StatusFields> {
        Some(&mut self.fields)
    }

    fn priority(&self) -> Option<i32> {
        Some(self.priority)
    }
}

/// Fails every `fail_every`-th item once, then lets it through.
#[derive(Clone)]
struct FlakyOnce {
    fail_every: u64,
    failed: Arc<Mutex<HashSet<ItemId>>>,
}

impl FlakyOnce {
    fn new(fail_every: u64) -> Self {
        Self {
            fail_every,
            failed: Arc::default(),
        }
    }

    fn outcome(&self, item: &DemoMessage) -> HandleResult {
        if self.fail_every == 0 || item.seq % self.fail_every != 0 {
            return HandleResult::Ok;
        }
        let mut failed = self.failed.lock().unwrap_or_else(PoisonError::into_inner);
        if failed.insert(item.id) {
            HandleResult::Retry
        } else {
            HandleResult::Ok
        }
    }
}

struct PrintingHandler(FlakyOnce);

#[async_trait]
impl ItemHandler<DemoMessage> for PrintingHandler {
    async fn handle(
        &self,
        item: &DemoMessage,
        _options: &OutboxOptions,
        _cancel: &CancellationToken,
    ) -> Result<HandleResult, HandlerError> {
        let outcome = self.0.outcome(item);
        println!(
            "item seq={} priority={} attempt={} -> {:?}",
            item.seq,
            item.priority,
            item.fields.retry_count.unwrap_or(0) + 1,
            outcome
        );
        Ok(outcome)
    }
}

struct PrintingBatchHandler(FlakyOnce);

#[async_trait]
impl BatchHandler<DemoMessage> for PrintingBatchHandler {
    async fn handle(
        &self,
        items: &[DemoMessage],
        _options: &OutboxOptions,
        _cancel: &CancellationToken,
    ) -> Result<BatchResult, HandlerError> {
        let outcomes: HashMap<ItemId, HandleResult> = items
            .iter()
            .map(|item| (item.id, self.0.outcome(item)))
            .collect();
        let failed = outcomes.values().filter(|o| !o.is_success()).count();
        println!("batch of {} items, {} failed", items.len(), failed);
        Ok(BatchResult::partially(outcomes))
    }
}

pub struct DemoArgs {
    pub options: OutboxOptions,
    pub items: u64,
    pub fail_every: u64,
    pub run_for: Duration,
}

pub async fn run(args: DemoArgs) -> Result<(), Box<dyn std::error::Error>> {
    let table = InMemoryOutbox::<DemoMessage>::new();
    let ids = UlidGenerator::new(SystemClock);
    table.insert_many((0..args.items).map(|seq| DemoMessage {
        id: ids.generate_item_id(),
        seq,
        priority: i32::try_from(seq % 3).unwrap_or(0),
        fields: StatusFields::ready(),
    }));

    // handles are registered at build time, so the recorder goes in first
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .map_err(|_| "a metrics recorder is already installed")?;

    let flaky = FlakyOnce::new(args.fail_every);
    let builder = OutboxBuilder::<DemoMessage>::new("demo")
        .options(args.options.clone())
        .repository(Arc::new(table.clone()));
    let builder = if args.options.worker_type.is_batch() {
        builder.batch_handler(move || PrintingBatchHandler(flaky.clone()))
    } else {
        builder.item_handler(move || PrintingHandler(flaky.clone()))
    };
    let outbox: Arc<dyn ScheduledOutbox> = Arc::new(builder.build()?);

    info!(
        worker_type = %args.options.worker_type,
        items = args.items,
        "demo started"
    );
    let scheduler = OutboxScheduler::start(vec![Arc::clone(&outbox)]);
    tokio::select! {
        _ = tokio::time::sleep(args.run_for) => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    scheduler.shutdown_and_join().await;

    info!(remaining = table.len(), "demo finished");
    println!("{}", serde_json::to_string_pretty(&metrics_json(&snapshotter))?);
    Ok(())
}

/// Counters as totals, histograms as sample count and mean, keyed by series.
fn metrics_json(snapshotter: &Snapshotter) -> Value {
    let mut series = Map::new();
    for (key, _unit, _description, value) in snapshotter.snapshot().into_vec() {
        let key = key.key();
        let labels: Vec<String> = key
            .labels()
            .map(|label| format!("{}={}", label.key(), label.value()))
            .collect();
        let name = format!("{}{{{}}}", key.name(), labels.join(","));
        let value = match value {
            DebugValue::Counter(total) => json!(total),
            DebugValue::Gauge(gauge) => json!(gauge.0),
            DebugValue::Histogram(samples) => {
                let sum: f64 = samples.iter().map(|sample| sample.0).sum();
                let mean = if samples.is_empty() {
                    0.0
                } else {
                    sum / samples.len() as f64
                };
                json!({ "count": samples.len(), "mean_seconds": mean })
            }
        };
        series.insert(name, value);
    }
    Value::Object(series)
}
