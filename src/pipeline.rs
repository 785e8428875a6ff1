//! Pipeline Assembly
//!
//! Builds the whole system from a config and the external capability
//! handles: topics, codec, breakers, DLQ, archival sink, ingestion, hot
//! path, cold path. Owns the process-wide shutdown channel and the
//! bounded shutdown sequence. Engines never reach for ambient state;
//! everything they share arrives here by handle.

use std::sync::{atomic::Ordering, Arc};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    breaker::{BreakerState, CircuitBreaker},
    codec::{registry::SchemaRegistry, TradeCodec},
    coldpath::{refdata::RefDataSource, ColdPathEngine, RefDataCache, TradeStore},
    config::Config,
    dlq::DlqRouter,
    hotpath::{HotPathEngine, PositionStore, PriceWaterfall},
    ingest::{ArchiveSink, IngestEngine},
    transport::{cache::SideCache, log::MemoryLog, object_store::ObjectStore},
};

/// The three breaker flavors, shared across engines.
pub struct Breakers {
    pub publish: Arc<CircuitBreaker>,
    pub query: Arc<CircuitBreaker>,
    pub storage: Arc<CircuitBreaker>,
}

pub struct Pipeline {
    pub config: Config,
    pub log: Arc<MemoryLog>,
    pub positions: Arc<PositionStore>,
    pub marks: Arc<PriceWaterfall>,
    pub trade_store: Arc<TradeStore>,
    pub dlq: Arc<DlqRouter>,
    pub ingest: IngestEngine,
    pub archive: Arc<ArchiveSink>,
    pub breakers: Breakers,
    hot: HotPathEngine,
    cold: ColdPathEngine,
    shutdown_tx: watch::Sender<bool>,
}

impl Pipeline {
    pub fn start(
        config: Config,
        cache: Arc<dyn SideCache>,
        object_store: Arc<dyn ObjectStore>,
        trade_store: Arc<TradeStore>,
        registry: Arc<dyn SchemaRegistry>,
        refdata_source: Arc<dyn RefDataSource>,
    ) -> Result<Self> {
        let log = MemoryLog::new();
        log.create_topic(&config.log.trades_topic, config.log.trades_partitions);
        log.create_topic(&config.log.dlq_topic, 1);

        let breakers = Breakers {
            publish: Arc::new(CircuitBreaker::new(
                "publish",
                config.hot.publish_breaker.clone(),
            )),
            query: Arc::new(CircuitBreaker::new("query", config.hot.query_breaker.clone())),
            storage: Arc::new(CircuitBreaker::new(
                "storage",
                config.archive.storage_breaker.clone(),
            )),
        };

        let codec = Arc::new(TradeCodec::new(config.codec.clone(), registry));
        let dlq = DlqRouter::spawn(log.producer(), config.log.dlq_topic.clone());
        let positions = Arc::new(PositionStore::new());
        let marks = PriceWaterfall::new(
            cache.clone(),
            breakers.publish.clone(),
            breakers.query.clone(),
            config.hot.cache_expiry,
        );
        let refdata = RefDataCache::new(refdata_source);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let archive = Arc::new(ArchiveSink::spawn(
            config.ingest.clone(),
            object_store,
            breakers.storage.clone(),
        ));
        let ingest = IngestEngine::spawn(
            config.ingest.clone(),
            config.log.trades_topic.clone(),
            codec,
            log.producer(),
            archive.clone(),
            shutdown_rx.clone(),
        );
        let hot = HotPathEngine::spawn(
            config.hot.clone(),
            &log,
            &config.log.trades_topic,
            config.log.max_poll_records,
            positions.clone(),
            marks.clone(),
            cache,
            breakers.publish.clone(),
            dlq.clone(),
            shutdown_rx.clone(),
        )
        .context("start hot path")?;
        let cold = ColdPathEngine::spawn(
            config.cold.clone(),
            &log,
            &config.log.trades_topic,
            config.log.max_poll_records,
            refdata,
            trade_store.clone(),
            dlq.clone(),
            shutdown_rx,
        )
        .context("start cold path")?;

        info!(
            trades_topic = %config.log.trades_topic,
            partitions = config.log.trades_partitions,
            "pipeline_started"
        );

        Ok(Self {
            config,
            log,
            positions,
            marks,
            trade_store,
            dlq,
            ingest,
            archive,
            breakers,
            hot,
            cold,
            shutdown_tx,
        })
    }

    pub fn hot_stats(&self) -> &crate::hotpath::HotStats {
        &self.hot.stats
    }

    pub fn cold_stats(&self) -> &crate::coldpath::ColdStats {
        &self.cold.stats
    }

    /// One structured line an operator can alert off. DLQ depth first,
    /// consumer lag second.
    pub fn log_summary(&self) {
        info!(
            dlq_total = self.dlq.stats.total(),
            hot_lag = self
                .log
                .group_lag(&self.config.hot.group, &self.config.log.trades_topic),
            cold_lag = self
                .log
                .group_lag(&self.config.cold.group, &self.config.log.trades_topic),
            frames_in = self.ingest.stats.frames_in.load(Ordering::Relaxed),
            published = self.ingest.stats.published.load(Ordering::Relaxed),
            hot_processed = self.hot.stats.processed.load(Ordering::Relaxed),
            cold_rows = self.cold.stats.rows_inserted.load(Ordering::Relaxed),
            archive_evicted = self.archive.evicted(),
            publish_breaker = %breaker_state(&self.breakers.publish),
            "pipeline_summary"
        );
    }

    /// Cascade cancellation and drain every engine. Each engine stops
    /// pulling, flushes in-flight work, and commits outstanding offsets;
    /// the whole sequence is bounded by the configured timeout.
    pub async fn shutdown(self) -> Result<()> {
        let timeout = self.config.shutdown_timeout;
        let _ = self.shutdown_tx.send(true);

        let drain = async {
            // Inlet first, so everything accepted is in the log and teed.
            self.ingest.close().await;
            self.hot.join().await;
            self.cold.join().await;
            // Archive last: it outlives its feeder.
            self.archive.close().await;
            self.dlq.flush().await;
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(()) => {
                info!("pipeline_stopped");
                Ok(())
            }
            Err(_) => {
                warn!(timeout_s = timeout.as_secs(), "pipeline_shutdown_timed_out");
                Ok(())
            }
        }
    }
}

fn breaker_state(breaker: &CircuitBreaker) -> BreakerState {
    breaker.state()
}
