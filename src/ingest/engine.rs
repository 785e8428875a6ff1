//! Ingestion Engine
//!
//! Pulls raw frames off the bounded inlet queue and, per frame:
//! validates the checksum trailer (drop + counter on mismatch), tees the
//! raw bytes to the archival sink without blocking, scans out the
//! partition key and envelope fields, and publishes the encoded
//! canonical envelope to the trades topic keyed by symbol.
//!
//! A frame that passes the checksum is never dropped here: a malformed
//! body still gets archived and published so the consuming engines can
//! route it to the DLQ with full context. Log delivery errors are
//! recorded, not surfaced; the object store holds the raw for replay.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::{
    codec::TradeCodec,
    config::IngestConfig,
    ingest::archive::{ArchiveSink, ArchivedFrame},
    ingest::frame,
    queue::{self, OverflowPolicy, QueueSender, SendError},
    transport::log::{Producer, Record},
};

/// One inbound frame from the gateway wire.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub bytes: Vec<u8>,
    /// Monotonic nanoseconds at socket receive.
    pub receive_ts_ns: u64,
}

#[derive(Debug, Default)]
pub struct IngestStats {
    pub frames_in: AtomicU64,
    pub checksum_failures: AtomicU64,
    pub published: AtomicU64,
    pub publish_errors: AtomicU64,
    pub encode_errors: AtomicU64,
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct IngestEngine {
    inlet: QueueSender<RawFrame>,
    pub stats: Arc<IngestStats>,
    task: JoinHandle<()>,
    start: Instant,
}

impl IngestEngine {
    pub fn spawn(
        config: IngestConfig,
        topic: String,
        codec: Arc<TradeCodec>,
        producer: Producer,
        archive: Arc<ArchiveSink>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (inlet, rx) = queue::bounded(config.buffer_size, OverflowPolicy::Wait);
        let stats = Arc::new(IngestStats::default());

        let worker = Worker {
            rx,
            topic,
            codec,
            producer,
            archive,
            stats: stats.clone(),
            gateway_id: config.gateway_id,
        };
        let task = tokio::spawn(worker.run(shutdown));

        Self {
            inlet,
            stats,
            task,
            start: Instant::now(),
        }
    }

    /// Submit one frame, awaiting queue space. This is the backpressure
    /// boundary: upstream sees slowdown before any data loss.
    pub async fn submit(&self, bytes: Vec<u8>) -> Result<(), SendError> {
        self.inlet
            .send(RawFrame {
                bytes,
                receive_ts_ns: self.start.elapsed().as_nanos() as u64,
            })
            .await
    }

    /// Non-suspending submit for callers that own their own retry.
    pub fn try_submit(&self, bytes: Vec<u8>) -> bool {
        self.inlet
            .try_send(RawFrame {
                bytes,
                receive_ts_ns: self.start.elapsed().as_nanos() as u64,
            })
            .is_ok()
    }

    pub fn queue_depth(&self) -> usize {
        self.inlet.len()
    }

    /// Stop the inlet and wait for the worker to drain.
    pub async fn close(self) {
        self.inlet.close();
        let _ = self.task.await;
    }
}

struct Worker {
    rx: crate::queue::QueueReceiver<RawFrame>,
    topic: String,
    codec: Arc<TradeCodec>,
    producer: Producer,
    archive: Arc<ArchiveSink>,
    stats: Arc<IngestStats>,
    gateway_id: String,
}

impl Worker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                item = self.rx.recv() => {
                    match item {
                        Some(raw) => self.process(raw).await,
                        None => break,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Drain the inlet tail so accepted frames are not silently lost.
        while let Some(raw) = self.rx.try_recv() {
            self.process(raw).await;
        }
        info!(
            published = self.stats.published.load(Ordering::Relaxed),
            checksum_failures = self.stats.checksum_failures.load(Ordering::Relaxed),
            "ingest_engine_stopped"
        );
    }

    async fn process(&self, raw: RawFrame) {
        self.stats.frames_in.fetch_add(1, Ordering::Relaxed);

        let body = match frame::verify(&raw.bytes) {
            Ok(body) => body,
            Err(e) => {
                // Terminal for the record: no archive, no log.
                self.stats.checksum_failures.fetch_add(1, Ordering::Relaxed);
                trace!(error = %e, "frame_dropped_checksum");
                return;
            }
        };

        let gateway_timestamp = chrono::Utc::now().timestamp_millis();
        self.archive.offer(ArchivedFrame {
            receive_ts_ms: gateway_timestamp,
            bytes: raw.bytes.clone(),
        });

        let fields = frame::scan(body);
        let symbol = fields.symbol.clone();
        let envelope = fields.into_envelope(
            raw.bytes,
            raw.receive_ts_ns,
            gateway_timestamp,
            self.gateway_id.clone(),
        );

        let payload = match self.codec.encode(&self.topic, &envelope).await {
            Ok(p) => p,
            Err(e) => {
                self.stats.encode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, exec_id = %envelope.exec_id, "envelope_encode_failed");
                return;
            }
        };

        match self.producer.send(&self.topic, Record::new(symbol, payload)) {
            Ok((partition, offset)) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                trace!(partition, offset, exec_id = %envelope.exec_id, "envelope_published");
            }
            Err(e) => {
                // Recorded, not surfaced: replay is possible from the
                // archive.
                self.stats.publish_errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "envelope_publish_failed");
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
