//! Cold-Path Engine
//!
//! Correctness-sensitive consumer group on the trades topic. Each
//! partition task decodes, validates on `exec_id`, enriches through the
//! reference cache (with retry), buffers, and bulk-inserts into the
//! trade store. The consumer offset commits only after a successful
//! flush, so a crash between flushes redelivers and the idempotent
//! upsert collapses the replay into the existing rows.
//!
//! A failed flush keeps the buffer; the next trigger retries the same
//! rows, which is safe for the same reason redelivery is.

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
    coldpath::{refdata::RefDataCache, trade_store::TradeStore},
    config::ColdPathConfig,
    dlq::DlqRouter,
    models::{DlqReason, EnrichedTrade},
    transport::log::{LogError, MemoryLog, PartitionConsumer, StoredRecord},
};

#[derive(Debug, Default)]
pub struct ColdStats {
    pub records: AtomicU64,
    pub decode_failures: AtomicU64,
    pub validation_failures: AtomicU64,
    pub enriched: AtomicU64,
    pub enrich_retries: AtomicU64,
    pub enrich_failures: AtomicU64,
    pub rows_inserted: AtomicU64,
    pub duplicates: AtomicU64,
    pub flushes: AtomicU64,
    pub flush_failures: AtomicU64,
    pub commits: AtomicU64,
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct ColdPathEngine {
    tasks: Vec<JoinHandle<()>>,
    pub stats: Arc<ColdStats>,
}

impl ColdPathEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        config: ColdPathConfig,
        log: &Arc<MemoryLog>,
        topic: &str,
        max_poll_records: usize,
        refdata: Arc<RefDataCache>,
        store: Arc<TradeStore>,
        dlq: Arc<DlqRouter>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, LogError> {
        let consumers = log.subscribe(&config.group, topic)?;
        let stats = Arc::new(ColdStats::default());

        let tasks = consumers
            .into_iter()
            .map(|consumer| {
                let worker = PartitionWorker {
                    consumer,
                    config: config.clone(),
                    max_poll_records,
                    refdata: refdata.clone(),
                    store: store.clone(),
                    dlq: dlq.clone(),
                    stats: stats.clone(),
                    buffer: Vec::new(),
                    highwater: None,
                    last_flush: Instant::now(),
                };
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect();

        info!(group = %config.group, topic = %topic, "cold_path_started");
        Ok(Self { tasks, stats })
    }

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
    config: ColdPathConfig,
    max_poll_records: usize,
    refdata: Arc<RefDataCache>,
    store: Arc<TradeStore>,
    dlq: Arc<DlqRouter>,
    stats: Arc<ColdStats>,
    buffer: Vec<EnrichedTrade>,
    /// Offset of the last handled record (buffered or dead-lettered);
    /// commits never pass an unflushed buffer.
    highwater: Option<u64>,
    last_flush: Instant,
}

impl PartitionWorker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut flush_tick = tokio::time::interval(self.config.flush_interval);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                batch = self.consumer.poll(self.max_poll_records) => {
                    for record in batch {
                        self.handle(record).await;
                        if self.buffer.len() >= self.config.bulk_batch_size {
                            self.flush();
                        }
                    }
                    // Only dead-letters since the last flush: nothing
                    // pending, safe to commit straight away.
                    if self.buffer.is_empty() {
                        self.commit_highwater();
                    }
                }
                _ = flush_tick.tick() => {
                    if !self.buffer.is_empty()
                        && self.last_flush.elapsed() >= self.config.flush_interval
                    {
                        self.flush();
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Cancellation: flush in-flight rows, then commit.
        if !self.buffer.is_empty() {
            self.flush();
        } else {
            self.commit_highwater();
        }
        debug!(
            partition = self.consumer.partition(),
            committed = self.consumer.committed(),
            "cold_partition_stopped"
        );
    }

    async fn handle(&mut self, record: StoredRecord) {
        self.stats.records.fetch_add(1, Ordering::Relaxed);

        let envelope = match crate::codec::decode(&record.record.payload) {
            Ok((envelope, _)) => envelope,
            Err(e) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                let mut diag = HashMap::new();
                diag.insert("error".to_string(), e.to_string());
                self.dlq
                    .route_record(DlqReason::DeserializationError, &record, 0, diag);
                self.highwater = Some(record.offset);
                return;
            }
        };

        if envelope.exec_id.is_empty() {
            self.stats
                .validation_failures
                .fetch_add(1, Ordering::Relaxed);
            let mut diag = HashMap::new();
            diag.insert("missing_field".to_string(), "exec_id".to_string());
            diag.insert("symbol".to_string(), envelope.symbol.clone());
            self.dlq
                .route_record(DlqReason::ValidationError, &record, 0, diag);
            self.highwater = Some(record.offset);
            return;
        }

        // Enrichment with retry. Misses are nulls; only source failures
        // land here, and after exhaustion the record is dead-lettered.
        let mut attempt: u32 = 0;
        let enriched = loop {
            match self.refdata.enrich(&envelope).await {
                Ok(enriched) => break Some(enriched),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        self.stats.enrich_failures.fetch_add(1, Ordering::Relaxed);
                        let reason = if e.is_timeout() {
                            DlqReason::TimeoutError
                        } else {
                            DlqReason::ProcessingError
                        };
                        let mut diag = HashMap::new();
                        diag.insert("error".to_string(), e.to_string());
                        diag.insert("exec_id".to_string(), envelope.exec_id.clone());
                        self.dlq.route_record(reason, &record, attempt - 1, diag);
                        break None;
                    }
                    self.stats.enrich_retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(self.config.backoff_unit * attempt).await;
                }
            }
        };

        self.highwater = Some(record.offset);
        if let Some(enriched) = enriched {
            self.stats.enriched.fetch_add(1, Ordering::Relaxed);
            self.buffer.push(enriched);
        }
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        match self.store.insert_batch(&self.buffer) {
            Ok(outcome) => {
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .rows_inserted
                    .fetch_add(outcome.inserted as u64, Ordering::Relaxed);
                self.stats
                    .duplicates
                    .fetch_add(outcome.duplicates as u64, Ordering::Relaxed);
                debug!(
                    partition = self.consumer.partition(),
                    rows = outcome.inserted,
                    duplicates = outcome.duplicates,
                    mode = ?outcome.mode,
                    "cold_flush"
                );
                self.buffer.clear();
                self.last_flush = Instant::now();
                self.commit_highwater();
            }
            Err(e) => {
                // Keep the buffer; the next trigger retries. Offsets stay
                // put so a crash redelivers instead of losing rows.
                self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                self.last_flush = Instant::now();
                warn!(
                    partition = self.consumer.partition(),
                    rows = self.buffer.len(),
                    error = %e,
                    "cold_flush_failed"
                );
            }
        }
    }

    fn commit_highwater(&mut self) {
        if let Some(offset) = self.highwater.take() {
            self.consumer.commit(offset);
            self.stats.commits.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_body;
    use crate::coldpath::refdata::{
        RefDataError, RefDataSource, SecurityInfo, StaticRefData, StrategyInfo, TraderInfo,
    };
    use crate::models::{Side, TradeEnvelope};
    use crate::transport::log::Record;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn envelope(exec: &str, symbol: &str) -> TradeEnvelope {
        TradeEnvelope {
            exec_id: exec.into(),
            order_id: String::new(),
            client_order_id: String::new(),
            symbol: symbol.into(),
            side: Side::Buy,
            quantity: 10,
            price_mantissa: 15_000_000_000,
            trader_id: "T1".into(),
            account: String::new(),
            strategy_code: "VWAP".into(),
            exchange: String::new(),
            receive_timestamp: 0,
            gateway_timestamp: 0,
            exec_timestamp: 0,
            raw_frame: Vec::new(),
            gateway_id: "gw".into(),
        }
    }

    fn record(exec: &str, symbol: &str) -> Record {
        Record::new(symbol, encode_body(&envelope(exec, symbol)).unwrap())
    }

    fn test_config() -> ColdPathConfig {
        ColdPathConfig {
            bulk_batch_size: 4,
            flush_interval: Duration::from_millis(50),
            max_retries: 2,
            backoff_unit: Duration::from_millis(5),
            ..ColdPathConfig::default()
        }
    }

    struct Fixture {
        log: Arc<MemoryLog>,
        store: Arc<TradeStore>,
        engine: ColdPathEngine,
        dlq: Arc<DlqRouter>,
        shutdown_tx: watch::Sender<bool>,
    }

    fn fixture_with_source(config: ColdPathConfig, source: Arc<dyn RefDataSource>) -> Fixture {
        let log = MemoryLog::new();
        log.create_topic("trades.raw", 2);
        log.create_topic("trades.dlq", 1);
        let store = Arc::new(TradeStore::in_memory().unwrap());
        let refdata = RefDataCache::new(source);
        let dlq = DlqRouter::spawn(log.producer(), "trades.dlq");
        let (shutdown_tx, shutdown) = watch::channel(false);
        let engine = ColdPathEngine::spawn(
            config,
            &log,
            "trades.raw",
            500,
            refdata,
            store.clone(),
            dlq.clone(),
            shutdown,
        )
        .unwrap();
        Fixture {
            log,
            store,
            engine,
            dlq,
            shutdown_tx,
        }
    }

    fn fixture(config: ColdPathConfig) -> Fixture {
        fixture_with_source(
            config,
            Arc::new(StaticRefData::new().with_trader("T1", "Ada", "ADAL").with_security(
                "AAPL",
                "037833100",
                "2046251",
                "US0378331005",
                "Apple Inc",
                "XNAS",
            )),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(120)).await;
    }

    #[tokio::test]
    async fn size_triggered_flush_persists_and_commits() {
        let f = fixture(test_config());
        let producer = f.log.producer();
        for i in 0..4 {
            producer
                .send("trades.raw", record(&format!("E{i}"), "AAPL"))
                .unwrap();
        }
        settle().await;

        assert_eq!(f.store.count().unwrap(), 4);
        assert_eq!(f.log.group_lag("audit-cold", "trades.raw"), 0);
        let row = f.store.get("E0").unwrap().unwrap();
        assert_eq!(row.trader_name.as_deref(), Some("Ada"));
        assert_eq!(row.mic.as_deref(), Some("XNAS"));
    }

    #[tokio::test]
    async fn time_triggered_flush_handles_partial_batch() {
        let f = fixture(test_config());
        f.log.producer().send("trades.raw", record("E1", "AAPL")).unwrap();
        settle().await;
        assert_eq!(f.store.count().unwrap(), 1);
        assert_eq!(f.engine.stats.flushes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn redelivery_yields_single_row() {
        let f = fixture(test_config());
        let producer = f.log.producer();
        // Same exec id delivered twice (crash-before-commit replay).
        producer.send("trades.raw", record("E5", "AAPL")).unwrap();
        producer.send("trades.raw", record("E5", "AAPL")).unwrap();
        settle().await;

        assert_eq!(f.store.count().unwrap(), 1);
        assert!(f.log.read_topic("trades.dlq").is_empty());
        assert_eq!(f.log.group_lag("audit-cold", "trades.raw"), 0);
    }

    #[tokio::test]
    async fn missing_exec_id_goes_to_dlq_and_commits() {
        let f = fixture(test_config());
        f.log
            .producer()
            .send("trades.raw", record("", "AAPL"))
            .unwrap();
        settle().await;
        f.dlq.flush().await;

        assert_eq!(f.store.count().unwrap(), 0);
        let dlq_records = f.log.read_topic("trades.dlq");
        assert_eq!(dlq_records.len(), 1);
        assert_eq!(dlq_records[0].record.headers["reason"], "VALIDATION_ERROR");
        assert_eq!(f.log.group_lag("audit-cold", "trades.raw"), 0);
    }

    struct FlakySource {
        inner: StaticRefData,
        failing: AtomicBool,
    }

    #[async_trait]
    impl RefDataSource for FlakySource {
        async fn trader(&self, id: &str) -> Result<Option<TraderInfo>, RefDataError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(RefDataError::Timeout("injected".into()));
            }
            self.inner.trader(id).await
        }
        async fn strategy(&self, code: &str) -> Result<Option<StrategyInfo>, RefDataError> {
            self.inner.strategy(code).await
        }
        async fn security(&self, symbol: &str) -> Result<Option<SecurityInfo>, RefDataError> {
            self.inner.security(symbol).await
        }
    }

    #[tokio::test]
    async fn enrichment_timeout_dead_letters_after_retries() {
        let source = Arc::new(FlakySource {
            inner: StaticRefData::new(),
            failing: AtomicBool::new(true),
        });
        let f = fixture_with_source(test_config(), source);
        f.log.producer().send("trades.raw", record("E1", "AAPL")).unwrap();
        settle().await;
        f.dlq.flush().await;

        assert_eq!(f.store.count().unwrap(), 0);
        let dlq_records = f.log.read_topic("trades.dlq");
        assert_eq!(dlq_records.len(), 1);
        assert_eq!(dlq_records[0].record.headers["reason"], "TIMEOUT_ERROR");
        assert_eq!(dlq_records[0].record.headers["retry_count"], "2");
        assert_eq!(f.engine.stats.enrich_retries.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn shutdown_flushes_and_commits() {
        let f = fixture(ColdPathConfig {
            bulk_batch_size: 1000,
            flush_interval: Duration::from_secs(60),
            ..test_config()
        });
        let producer = f.log.producer();
        for i in 0..3 {
            producer
                .send("trades.raw", record(&format!("E{i}"), "AAPL"))
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        // Nothing flushed yet: batch and interval are both far away.
        assert_eq!(f.store.count().unwrap(), 0);

        f.shutdown_tx.send(true).unwrap();
        f.engine.join().await;
        assert_eq!(f.store.count().unwrap(), 3);
        assert_eq!(f.log.group_lag("audit-cold", "trades.raw"), 0);
    }
}
