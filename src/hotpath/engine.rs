//! Hot-Path Engine
//!
//! Consumer-group member on the trades topic. One task per assigned
//! partition pulls records in order, applies them to the in-memory
//! position store, resolves a mark through the waterfall's fast path,
//! and publishes throttled P&L snapshots to the side cache through the
//! publish breaker.
//!
//! The position apply is infallible and happens exactly once per
//! delivered record; only the snapshot publish is retried, which is safe
//! because publishing the same key twice is idempotent downstream. An
//! OPEN publish breaker skips silently: the position already holds the
//! truth and the next throttled publish carries it.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    breaker::{BreakerError, CircuitBreaker},
    config::HotPathConfig,
    dlq::DlqRouter,
    hotpath::{marks::PriceWaterfall, positions::PositionStore},
    models::{DlqReason, MarkSource, PnlSnapshot, TradeEnvelope},
    transport::cache::SideCache,
    transport::log::{LogError, MemoryLog, PartitionConsumer, StoredRecord},
};

#[derive(Debug, Default)]
pub struct HotStats {
    pub records: AtomicU64,
    pub decode_failures: AtomicU64,
    pub validation_failures: AtomicU64,
    pub processed: AtomicU64,
    pub publish_retries: AtomicU64,
    pub process_failures: AtomicU64,
    pub snapshots_published: AtomicU64,
    pub publish_skipped_throttle: AtomicU64,
    pub publish_skipped_breaker: AtomicU64,
    pub commits: AtomicU64,
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct HotPathEngine {
    tasks: Vec<JoinHandle<()>>,
    pub stats: Arc<HotStats>,
}

impl HotPathEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        config: HotPathConfig,
        log: &Arc<MemoryLog>,
        topic: &str,
        max_poll_records: usize,
        positions: Arc<PositionStore>,
        marks: Arc<PriceWaterfall>,
        cache: Arc<dyn SideCache>,
        publish_breaker: Arc<CircuitBreaker>,
        dlq: Arc<DlqRouter>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, LogError> {
        let consumers = log.subscribe(&config.group, topic)?;
        let stats = Arc::new(HotStats::default());
        let origin = Instant::now();

        let tasks = consumers
            .into_iter()
            .map(|consumer| {
                let worker = PartitionWorker {
                    consumer,
                    config: config.clone(),
                    max_poll_records,
                    positions: positions.clone(),
                    marks: marks.clone(),
                    cache: cache.clone(),
                    publish_breaker: publish_breaker.clone(),
                    dlq: dlq.clone(),
                    stats: stats.clone(),
                    origin,
                    last_publish: HashMap::new(),
                    pending_offset: None,
                    since_commit: 0,
                    last_commit: Instant::now(),
                };
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect();

        info!(group = %config.group, topic = %topic, "hot_path_started");
        Ok(Self { tasks, stats })
    }

    /// Wait for every partition task to finish (after shutdown fires).
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

// =============================================================================
// PARTITION WORKER
// =============================================================================

struct PartitionWorker {
    consumer: PartitionConsumer,
    config: HotPathConfig,
    max_poll_records: usize,
    positions: Arc<PositionStore>,
    marks: Arc<PriceWaterfall>,
    cache: Arc<dyn SideCache>,
    publish_breaker: Arc<CircuitBreaker>,
    dlq: Arc<DlqRouter>,
    stats: Arc<HotStats>,
    origin: Instant,
    /// Per-key publish throttle clock. Keys are partition-local because
    /// the symbol routes every execution of a key to this partition.
    last_publish: HashMap<(String, String), Instant>,
    pending_offset: Option<u64>,
    since_commit: usize,
    last_commit: Instant,
}

impl PartitionWorker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut commit_tick = tokio::time::interval(self.config.commit_interval);
        commit_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                batch = self.consumer.poll(self.max_poll_records) => {
                    for record in batch {
                        self.handle(record).await;
                        self.maybe_commit(false);
                    }
                }
                _ = commit_tick.tick() => {
                    self.maybe_commit(false);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Outstanding offsets commit before exit.
        self.maybe_commit(true);
        debug!(
            partition = self.consumer.partition(),
            committed = self.consumer.committed(),
            "hot_partition_stopped"
        );
    }

    async fn handle(&mut self, record: StoredRecord) {
        self.stats.records.fetch_add(1, Ordering::Relaxed);

        let envelope = match crate::codec::decode(&record.record.payload) {
            Ok((envelope, _schema_id)) => envelope,
            Err(e) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                let mut diag = HashMap::new();
                diag.insert("error".to_string(), e.to_string());
                self.dlq
                    .route_record(DlqReason::DeserializationError, &record, 0, diag);
                self.mark_processed(record.offset);
                return;
            }
        };

        if envelope.trader_id.is_empty() || envelope.symbol.is_empty() {
            self.stats
                .validation_failures
                .fetch_add(1, Ordering::Relaxed);
            let mut diag = HashMap::new();
            diag.insert(
                "missing_field".to_string(),
                if envelope.trader_id.is_empty() {
                    "trader_id"
                } else {
                    "symbol"
                }
                .to_string(),
            );
            diag.insert("exec_id".to_string(), envelope.exec_id.clone());
            self.dlq
                .route_record(DlqReason::ValidationError, &record, 0, diag);
            self.mark_processed(record.offset);
            return;
        }

        self.process(&envelope, &record).await;
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        self.mark_processed(record.offset);
    }

    async fn process(&mut self, envelope: &TradeEnvelope, record: &StoredRecord) {
        // 1. Position apply: in-memory, never fails, exactly once.
        let tick = self.origin.elapsed().as_nanos() as u64;
        self.positions.apply_trade(envelope, tick);

        // 2. LTP side channel. A zero price would poison the waterfall.
        if envelope.price_mantissa > 0 {
            self.marks
                .set_price(&envelope.symbol, MarkSource::Ltp, envelope.price_mantissa);
        }

        // 3. Mark from the local cache only; the hot path never waits on
        // the side cache.
        let (mark_price, mark_source) = self.marks.get_mark_fast(&envelope.symbol);
        let position = match self.positions.set_mark(
            &envelope.trader_id,
            &envelope.symbol,
            mark_price,
            mark_source,
        ) {
            Some(p) => p,
            None => return, // apply_trade above guarantees presence
        };

        // 4. Snapshot, throttled per key.
        let key = (envelope.trader_id.clone(), envelope.symbol.clone());
        if let Some(last) = self.last_publish.get(&key) {
            if last.elapsed() < self.config.publish_throttle {
                self.stats
                    .publish_skipped_throttle
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let snapshot = PnlSnapshot {
            trader_id: position.trader_id.clone(),
            symbol: position.symbol.clone(),
            net_quantity: position.net_quantity,
            realized_pnl_mantissa: position.realized_pnl_mantissa,
            unrealized_pnl_mantissa: position.unrealized_pnl_mantissa(),
            mark_price_mantissa: position.mark_price_mantissa,
            mark_source: position.mark_source,
            trade_count: position.trade_count,
            snapshot_ts: chrono::Utc::now().timestamp_millis(),
        };
        let payload = match serde_json::to_string(&snapshot) {
            Ok(p) => p,
            Err(e) => {
                self.stats.process_failures.fetch_add(1, Ordering::Relaxed);
                let mut diag = HashMap::new();
                diag.insert("error".to_string(), e.to_string());
                self.dlq
                    .route_record(DlqReason::ProcessingError, record, 0, diag);
                return;
            }
        };

        // 5. Publish through the breaker. Retried because a duplicate
        // snapshot publish for one key is idempotent downstream; an OPEN
        // breaker skips silently.
        let mut attempt: u32 = 0;
        loop {
            let result = self.publish(&snapshot, &payload).await;
            match result {
                Ok(()) => {
                    self.stats
                        .snapshots_published
                        .fetch_add(1, Ordering::Relaxed);
                    self.last_publish.insert(key, Instant::now());
                    return;
                }
                Err(BreakerError::Open { .. }) => {
                    self.stats
                        .publish_skipped_breaker
                        .fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(BreakerError::Inner(e)) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        self.stats.process_failures.fetch_add(1, Ordering::Relaxed);
                        let mut diag = HashMap::new();
                        diag.insert("error".to_string(), e.to_string());
                        diag.insert("stage".to_string(), "snapshot_publish".to_string());
                        self.dlq.route_record(
                            DlqReason::ProcessingError,
                            record,
                            attempt - 1,
                            diag,
                        );
                        warn!(
                            trader = %snapshot.trader_id,
                            symbol = %snapshot.symbol,
                            error = %e,
                            "snapshot_publish_exhausted"
                        );
                        return;
                    }
                    self.stats.publish_retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(self.config.backoff_unit * attempt).await;
                }
            }
        }
    }

    async fn publish(
        &self,
        snapshot: &PnlSnapshot,
        payload: &str,
    ) -> Result<(), BreakerError<crate::transport::cache::CacheError>> {
        let cache = self.cache.clone();
        let scalar_key = format!("pnl:{}:{}", snapshot.trader_id, snapshot.symbol);
        let channel = snapshot.channel();
        self.publish_breaker
            .call(|| {
                let cache = cache.clone();
                let scalar_key = scalar_key.clone();
                let channel = channel.clone();
                let payload = payload.to_string();
                async move {
                    cache.put(&scalar_key, payload.clone()).await?;
                    cache.publish(&channel, payload).await?;
                    Ok(())
                }
            })
            .await
    }

    fn mark_processed(&mut self, offset: u64) {
        self.pending_offset = Some(offset);
        self.since_commit += 1;
    }

    fn maybe_commit(&mut self, force: bool) {
        let Some(offset) = self.pending_offset else {
            return;
        };
        let due = force
            || self.since_commit >= self.config.commit_batch
            || self.last_commit.elapsed() >= self.config.commit_interval;
        if !due {
            return;
        }
        self.consumer.commit(offset);
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        self.pending_offset = None;
        self.since_commit = 0;
        self.last_commit = Instant::now();
    }
}

// =============================================================================
// TESTS
// =============================================================================
