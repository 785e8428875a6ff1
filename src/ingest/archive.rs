//! Archival Sink
//!
//! Append-only batching uploader of raw frames to the object store.
//! Frames arrive over a DropOldest queue (losing the tail of an outage
//! beats stalling ingestion), accumulate into time/size-bounded batches,
//! and upload through the storage-flavor circuit breaker. A batch that
//! meets an OPEN breaker is discarded with a counter.
//!
//! Batch body framing, repeated per frame:
//!
//! ```text
//! [receive_ts_ms: i64 BE][len: i32 BE][frame bytes]
//! ```
//!
//! Object keys: `YYYY-MM-DD/HH/MM-SS-mmm_<host>_<n>.bin` with `<n>` a
//! process-lifetime sequence.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    breaker::{BreakerError, CircuitBreaker},
    config::IngestConfig,
    queue::{self, OverflowPolicy, QueueSender},
    transport::object_store::ObjectStore,
};

/// One frame queued for archival.
#[derive(Debug, Clone)]
pub struct ArchivedFrame {
    /// Epoch milliseconds at gateway receive.
    pub receive_ts_ms: i64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct ArchiveStats {
    pub frames_in: AtomicU64,
    pub batches_uploaded: AtomicU64,
    pub frames_uploaded: AtomicU64,
    pub bytes_uploaded: AtomicU64,
    pub batches_dropped: AtomicU64,
    pub upload_errors: AtomicU64,
}

/// Serialize a batch into the framed concatenation.
pub fn serialize_batch(batch: &[ArchivedFrame]) -> Vec<u8> {
    let total: usize = batch.iter().map(|f| 12 + f.bytes.len()).sum();
    let mut out = Vec::with_capacity(total);
    for frame in batch {
        out.extend_from_slice(&frame.receive_ts_ms.to_be_bytes());
        out.extend_from_slice(&(frame.bytes.len() as i32).to_be_bytes());
        out.extend_from_slice(&frame.bytes);
    }
    out
}

/// Parse a batch body back into frames. Replay tooling and tests.
pub fn deserialize_batch(mut body: &[u8]) -> Option<Vec<ArchivedFrame>> {
    let mut out = Vec::new();
    while !body.is_empty() {
        if body.len() < 12 {
            return None;
        }
        let receive_ts_ms = i64::from_be_bytes(body[..8].try_into().unwrap());
        let len = i32::from_be_bytes(body[8..12].try_into().unwrap());
        if len < 0 || body.len() < 12 + len as usize {
            return None;
        }
        out.push(ArchivedFrame {
            receive_ts_ms,
            bytes: body[12..12 + len as usize].to_vec(),
        });
        body = &body[12 + len as usize..];
    }
    Some(out)
}

// =============================================================================
// SINK
// =============================================================================

pub struct ArchiveSink {
    tx: QueueSender<ArchivedFrame>,
    pub stats: Arc<ArchiveStats>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ArchiveSink {
    /// The worker's lifetime is owned by the queue: it exits when the
    /// sink is closed and the queue has drained, so a feeder that is
    /// still flushing its own tail can keep teeing frames in.
    pub fn spawn(
        config: IngestConfig,
        store: Arc<dyn ObjectStore>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        let (tx, rx) = queue::bounded(config.archive_buffer, OverflowPolicy::DropOldest);
        let stats = Arc::new(ArchiveStats::default());

        let worker = Worker {
            rx,
            store,
            breaker,
            stats: stats.clone(),
            batch_size: config.archive_batch_size,
            flush_interval: config.archive_flush,
            host: config.host,
            seq: 0,
        };
        let task = Mutex::new(Some(tokio::spawn(worker.run())));

        Self { tx, stats, task }
    }

    /// Tee a frame in. Never blocks; under pressure the oldest queued
    /// frame is evicted.
    pub fn offer(&self, frame: ArchivedFrame) {
        self.stats.frames_in.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.try_send(frame);
    }

    /// Frames evicted from the queue under pressure.
    pub fn evicted(&self) -> u64 {
        self.tx.dropped()
    }

    /// Stop accepting input and wait for the final flush. Idempotent.
    pub async fn close(&self) {
        self.tx.close();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

struct Worker {
    rx: crate::queue::QueueReceiver<ArchivedFrame>,
    store: Arc<dyn ObjectStore>,
    breaker: Arc<CircuitBreaker>,
    stats: Arc<ArchiveStats>,
    batch_size: usize,
    flush_interval: Duration,
    host: String,
    seq: u64,
}

impl Worker {
    async fn run(mut self) {
        let mut batch: Vec<ArchivedFrame> = Vec::with_capacity(self.batch_size);
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                item = self.rx.recv() => {
                    match item {
                        Some(frame) => {
                            batch.push(frame);
                            if batch.len() >= self.batch_size {
                                self.flush(&mut batch).await;
                            }
                        }
                        None => break, // closed and drained
                    }
                }
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
            }
        }

        // Final flush of the partial batch.
        if !batch.is_empty() {
            self.flush(&mut batch).await;
        }
        info!(
            uploaded = self.stats.batches_uploaded.load(Ordering::Relaxed),
            dropped = self.stats.batches_dropped.load(Ordering::Relaxed),
            "archive_sink_stopped"
        );
    }

    async fn flush(&mut self, batch: &mut Vec<ArchivedFrame>) {
        let frames = std::mem::take(batch);
        let key = self.next_key();
        let body = serialize_batch(&frames);

        let store = self.store.clone();
        let result = self
            .breaker
            .call(|| {
                let body = &body;
                let key = &key;
                let store = store.clone();
                async move { store.put(key, body).await }
            })
            .await;

        match result {
            Ok(()) => {
                self.stats.batches_uploaded.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .frames_uploaded
                    .fetch_add(frames.len() as u64, Ordering::Relaxed);
                self.stats
                    .bytes_uploaded
                    .fetch_add(body.len() as u64, Ordering::Relaxed);
                debug!(key = %key, frames = frames.len(), "archive_batch_uploaded");
            }
            Err(BreakerError::Open { retry_after }) => {
                // Raw archival loss during an object-store outage is the
                // accepted trade against stalling ingestion.
                self.stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    frames = frames.len(),
                    retry_ms = retry_after.as_millis() as u64,
                    "archive_batch_discarded_circuit_open"
                );
            }
            Err(BreakerError::Inner(e)) => {
                self.stats.upload_errors.fetch_add(1, Ordering::Relaxed);
                self.stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, key = %key, "archive_upload_failed");
            }
        }
    }

    fn next_key(&mut self) -> String {
        let now = chrono::Utc::now();
        let n = self.seq;
        self.seq += 1;
        format!(
            "{}/{}_{}_{}.bin",
            now.format("%Y-%m-%d/%H"),
            now.format("%M-%S-%3f"),
            self.host,
            n
        )
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::transport::object_store::MemoryObjectStore;

    fn test_config() -> IngestConfig {
        IngestConfig {
            archive_buffer: 16,
            archive_batch_size: 4,
            archive_flush: Duration::from_millis(50),
            host: "testhost".into(),
            ..IngestConfig::default()
        }
    }

    fn storage_breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "storage",
            BreakerConfig {
                failure_threshold: 5,
                failure_window: Duration::from_secs(60),
                open_duration: Duration::from_secs(30),
                success_threshold_half_open: 2,
            },
        ))
    }

    fn frame(n: u8) -> ArchivedFrame {
        ArchivedFrame {
            receive_ts_ms: 1_700_000_000_000 + n as i64,
            bytes: vec![n; 3],
        }
    }

    #[test]
    fn batch_framing_roundtrip() {
        let frames = vec![frame(1), frame(2), frame(3)];
        let body = serialize_batch(&frames);
        assert_eq!(body.len(), 3 * (12 + 3));
        let parsed = deserialize_batch(&body).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].receive_ts_ms, frames[0].receive_ts_ms);
        assert_eq!(parsed[2].bytes, vec![3; 3]);

        assert!(deserialize_batch(&body[..5]).is_none());
    }

    #[tokio::test]
    async fn uploads_full_batch() {
        let store = Arc::new(MemoryObjectStore::new());
        let sink = ArchiveSink::spawn(test_config(), store.clone(), storage_breaker());

        for i in 0..4 {
            sink.offer(frame(i));
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.len(), 1);
        let key = &store.keys()[0];
        assert!(key.ends_with("_testhost_0.bin"), "key = {key}");
        let frames = deserialize_batch(&store.get(key).unwrap()).unwrap();
        assert_eq!(frames.len(), 4);
        sink.close().await;
    }

    #[tokio::test]
    async fn interval_flushes_partial_batch() {
        let store = Arc::new(MemoryObjectStore::new());
        let sink = ArchiveSink::spawn(test_config(), store.clone(), storage_breaker());

        sink.offer(frame(9));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.len(), 1);
        sink.close().await;
    }

    #[tokio::test]
    async fn open_breaker_discards_batch() {
        let store = Arc::new(MemoryObjectStore::new());
        let breaker = storage_breaker();
        breaker.trip();
        let sink = ArchiveSink::spawn(test_config(), store.clone(), breaker);

        for i in 0..4 {
            sink.offer(frame(i));
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.len(), 0);
        assert_eq!(sink.stats.batches_dropped.load(Ordering::Relaxed), 1);
        sink.close().await;
    }

    #[tokio::test]
    async fn close_flushes_tail() {
        let store = Arc::new(MemoryObjectStore::new());
        let sink = ArchiveSink::spawn(test_config(), store.clone(), storage_breaker());

        sink.offer(frame(1));
        sink.offer(frame(2));
        sink.close().await;
        assert_eq!(store.len(), 1);
    }
}
