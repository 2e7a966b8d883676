//! OutboxScheduler - アウトボックスごとの定期実行ループ
//!
//! Per outbox:
//! - a worker loop: wait `worker_delay`, then run one tick if the worker is enabled
//! - a partition loop (partitioning enabled only): create, retire, wait
//!   `precreate_partition_period`
//!
//! Loops read the live options every iteration. They only end on cancellation,
//! except the partition loop, which also ends on a misconfigured table.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::builder::ScheduledOutbox;
use super::partitions::PartitionManager;
use crate::domain::TickStatus;

/// Smallest period a worker loop will wait between ticks.
const MIN_WORKER_DELAY: Duration = Duration::from_millis(1);

/// Scheduler handle.
/// - `request_shutdown` cancels every loop and every in-flight tick
/// - `shutdown_and_join` で全ループの終了を待てる
pub struct OutboxScheduler {
    cancel: CancellationToken,
    joins: Vec<JoinHandle<()>>,
}

impl OutboxScheduler {
    /// Spawns the loops of every outbox.
    pub fn start(outboxes: Vec<Arc<dyn ScheduledOutbox>>) -> Self {
        Self::start_with_token(outboxes, CancellationToken::new())
    }

    /// Like `start`, cancelled together with `parent`.
    pub fn start_with_token(
        outboxes: Vec<Arc<dyn ScheduledOutbox>>,
        parent: CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let mut joins = Vec::with_capacity(outboxes.len() * 2);

        for outbox in outboxes {
            if let Some(manager) = outbox.partition_manager() {
                let o = Arc::clone(&outbox);
                let token = cancel.clone();
                joins.push(tokio::spawn(async move {
                    partition_loop(o, manager, token).await;
                }));
            }
            let token = cancel.clone();
            joins.push(tokio::spawn(async move {
                worker_loop(outbox, token).await;
            }));
        }

        Self { cancel, joins }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Number of loops still running.
    pub fn running_loops(&self) -> usize {
        self.joins.iter().filter(|j| !j.is_finished()).count()
    }

    pub fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    /// Shutdown and wait for all loops.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                error!(error = %err, "outbox loop panicked");
            }
        }
    }
}

fn worker_interval(delay: Duration) -> tokio::time::Interval {
    let period = delay.max(MIN_WORKER_DELAY);
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn worker_loop(outbox: Arc<dyn ScheduledOutbox>, cancel: CancellationToken) {
    let name = outbox.name().to_string();
    let metrics = outbox.metrics();
    let mut rx = outbox.options().subscribe();
    let mut delay = rx.borrow_and_update().worker_delay;
    let mut interval = worker_interval(delay);
    info!(outbox = %name, ?delay, "outbox worker loop started");

    loop {
        let sleep_started = Instant::now();
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let new_delay = rx.borrow_and_update().worker_delay;
                if new_delay != delay {
                    debug!(outbox = %name, ?new_delay, "worker delay changed");
                    delay = new_delay;
                    interval = worker_interval(delay);
                }
                continue;
            }
            _ = interval.tick() => {}
        }
        metrics.record_sleep(sleep_started.elapsed());

        let enabled = rx.borrow().is_worker_enabled;
        if !enabled {
            debug!(outbox = %name, "outbox worker disabled, skipping tick");
            continue;
        }

        let started = Instant::now();
        let report = outbox.process_once(&cancel).await;
        metrics.record_process(started.elapsed());
        if report.status == TickStatus::Cancelled {
            break;
        }
    }
    info!(outbox = %name, "outbox worker loop stopped");
}

async fn partition_loop(
    outbox: Arc<dyn ScheduledOutbox>,
    manager: Arc<PartitionManager>,
    cancel: CancellationToken,
) {
    let handle = outbox.options();
    loop {
        let settings = handle.current().partitions;
        let maintenance = async {
            manager.create_upcoming_partitions(&settings).await?;
            manager.retire_old_partitions(&settings).await
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = maintenance => result,
        };
        match result {
            Ok(dropped) => {
                debug!(outbox = %manager.outbox(), dropped, "partition maintenance done")
            }
            Err(err) if err.is_misconfiguration() => {
                error!(outbox = %manager.outbox(), error = %err, "stopping partition maintenance");
                break;
            }
            Err(err) => warn!(
                outbox = %manager.outbox(),
                error = %err,
                "partition maintenance failed, retrying next period"
            ),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(settings.precreate_partition_period) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::builder::OutboxBuilder;
    use crate::app::metrics::capture::{Captured, capture};
    use crate::app::metrics::{ITEMS_PROCESSED, PROCESS_DURATION, SLEEP_DURATION};
    use crate::app::options::{OutboxOptions, WorkerType};
    use crate::app::worker::testing::{Recorder, scripted};
    use crate::domain::item::fixtures::Message;
    use crate::impls::{InMemoryOutbox, InMemoryPartitionStore};
    use crate::ports::ManualClock;
    use chrono::{TimeZone, Utc};

    fn outbox(
        table: &InMemoryOutbox<Message>,
        options: OutboxOptions,
    ) -> Arc<dyn ScheduledOutbox> {
        Arc::new(
            OutboxBuilder::<Message>::new("orders")
                .options(options)
                .repository(Arc::new(table.clone()))
                .item_handler(scripted(&Recorder::default()))
                .build()
                .unwrap(),
        )
    }

    fn measured(
        table: &InMemoryOutbox<Message>,
        options: OutboxOptions,
    ) -> (Arc<dyn ScheduledOutbox>, Captured) {
        capture(|| outbox(table, options))
    }

    fn seeded(n: u64) -> InMemoryOutbox<Message> {
        let table = InMemoryOutbox::new();
        table.insert_many((0..n).map(|i| Message::new(i, "ok")));
        table
    }

    fn options(delay_ms: u64, limit: usize) -> OutboxOptions {
        OutboxOptions {
            worker_delay: Duration::from_millis(delay_ms),
            outbox_items_limit: limit,
            ..OutboxOptions::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn worker_loop_ticks_every_delay() {
        let table = seeded(5);
        let (outbox, captured) = measured(&table, options(1000, 2));
        let scheduler = OutboxScheduler::start(vec![Arc::clone(&outbox)]);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(table.len(), 3);

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert!(table.is_empty());

        scheduler.shutdown_and_join().await;
        let readings = captured.read();
        assert_eq!(readings.samples(PROCESS_DURATION), 3);
        assert_eq!(readings.samples(SLEEP_DURATION), 3);
        assert_eq!(readings.counter(ITEMS_PROCESSED), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_worker_does_not_process() {
        let table = seeded(2);
        let mut opts = options(1000, 10);
        opts.is_worker_enabled = false;
        let (outbox, captured) = measured(&table, opts);
        let scheduler = OutboxScheduler::start(vec![Arc::clone(&outbox)]);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(table.len(), 2);
        assert_eq!(captured.read().samples(SLEEP_DURATION), 3);

        outbox.options().modify(|o| o.is_worker_enabled = true).unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(table.is_empty());

        scheduler.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn delay_change_takes_effect_immediately() {
        let table = seeded(1);
        let outbox = outbox(&table, options(3_600_000, 10));
        let scheduler = OutboxScheduler::start(vec![Arc::clone(&outbox)]);

        tokio::time::sleep(Duration::from_millis(10)).await;
        outbox
            .options()
            .modify(|o| o.worker_delay = Duration::from_millis(100))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(table.is_empty());
        scheduler.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_every_loop() {
        let table = seeded(0);
        let scheduler = OutboxScheduler::start(vec![outbox(&table, options(1000, 10))]);
        assert_eq!(scheduler.joins.len(), 1);

        let token = scheduler.cancellation_token();
        scheduler.shutdown_and_join().await;
        assert!(token.is_cancelled());
    }

    fn partitioned(store: Arc<InMemoryPartitionStore>) -> Arc<dyn ScheduledOutbox> {
        let mut opts = options(1000, 10);
        opts.worker_type = WorkerType::StrictOrdering;
        opts.partitions.enabled = true;
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 8, 17, 12, 0, 0).unwrap());
        Arc::new(
            OutboxBuilder::<Message>::new("orders")
                .options(opts)
                .repository(Arc::new(InMemoryOutbox::new()))
                .item_handler(scripted(&Recorder::default()))
                .partition_store(store)
                .clock(Arc::new(clock))
                .build()
                .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn partition_loop_creates_upcoming_partitions() {
        let store = Arc::new(InMemoryPartitionStore::new("outbox"));
        let scheduler = OutboxScheduler::start(vec![partitioned(Arc::clone(&store))]);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.partition_names().len(), 7);
        assert_eq!(scheduler.running_loops(), 2);

        scheduler.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn misconfigured_table_stops_only_the_partition_loop() {
        let store = Arc::new(InMemoryPartitionStore::unpartitioned("outbox"));
        let scheduler = OutboxScheduler::start(vec![partitioned(store)]);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.running_loops(), 1);

        scheduler.shutdown_and_join().await;
    }
}
