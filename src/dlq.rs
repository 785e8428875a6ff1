//! Dead-Letter Queue Router
//!
//! Classifies un-processable records and publishes them to the DLQ topic
//! with a diagnostic envelope. Publishing is best-effort and never blocks
//! the calling engine: envelopes go over a bounded channel to a single
//! background worker; when the channel is full the envelope is counted as
//! lost instead of applying backpressure to the hot path.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    models::{DlqEnvelope, DlqReason},
    transport::log::{Producer, Record, StoredRecord},
};

const CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// STATS
// =============================================================================

#[derive(Debug, Default)]
pub struct DlqStats {
    /// Indexed by [`DlqReason::index`].
    pub by_reason: [AtomicU64; 5],
    pub published: AtomicU64,
    pub lost: AtomicU64,
    pub publish_errors: AtomicU64,
    in_flight: AtomicU64,
}

impl DlqStats {
    pub fn reason_count(&self, reason: DlqReason) -> u64 {
        self.by_reason[reason.index()].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        DlqReason::ALL
            .iter()
            .map(|r| self.reason_count(*r))
            .sum()
    }
}

// =============================================================================
// ROUTER
// =============================================================================

pub struct DlqRouter {
    tx: mpsc::Sender<DlqEnvelope>,
    topic: String,
    pub stats: Arc<DlqStats>,
}

impl DlqRouter {
    /// Spawn the router worker. The worker owns the receiving half and
    /// exits when every handle to the router has been dropped.
    pub fn spawn(producer: Producer, topic: impl Into<String>) -> Arc<Self> {
        let topic = topic.into();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let stats = Arc::new(DlqStats::default());

        tokio::spawn(worker(rx, producer, topic.clone(), stats.clone()));

        Arc::new(Self { tx, topic, stats })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Route a failed in-log record. Non-blocking.
    pub fn route_record(
        &self,
        reason: DlqReason,
        source: &StoredRecord,
        retry_count: u32,
        diagnostics: HashMap<String, String>,
    ) {
        self.publish(DlqEnvelope {
            original_payload: source.record.payload.clone(),
            reason,
            original_topic: source.topic.clone(),
            original_partition: source.partition,
            original_offset: source.offset,
            retry_count,
            first_failure_timestamp: chrono::Utc::now().timestamp_millis(),
            diagnostics,
        });
    }

    /// Route an arbitrary payload that never made it into the log.
    pub fn route_bytes(
        &self,
        reason: DlqReason,
        payload: Vec<u8>,
        origin: &str,
        diagnostics: HashMap<String, String>,
    ) {
        self.publish(DlqEnvelope {
            original_payload: payload,
            reason,
            original_topic: origin.to_string(),
            original_partition: 0,
            original_offset: 0,
            retry_count: 0,
            first_failure_timestamp: chrono::Utc::now().timestamp_millis(),
            diagnostics,
        });
    }

    /// Enqueue for the background worker; counts the reason either way.
    pub fn publish(&self, envelope: DlqEnvelope) {
        self.stats.by_reason[envelope.reason.index()].fetch_add(1, Ordering::Relaxed);
        self.stats.in_flight.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.tx.try_send(envelope) {
            self.stats.in_flight.fetch_sub(1, Ordering::Relaxed);
            self.stats.lost.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "dlq_envelope_lost");
        }
    }

    /// Wait until every enqueued envelope has been handed to the log.
    /// Shutdown and test aid; the data path never calls this.
    pub async fn flush(&self) {
        while self.stats.in_flight.load(Ordering::Relaxed) > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

async fn worker(
    mut rx: mpsc::Receiver<DlqEnvelope>,
    producer: Producer,
    topic: String,
    stats: Arc<DlqStats>,
) {
    while let Some(envelope) = rx.recv().await {
        let key = format!(
            "{}-{}",
            envelope.original_topic, envelope.original_partition
        );
        let headers = envelope.headers();
        let record = Record::new(key, envelope.original_payload.clone()).with_headers(headers);
        match producer.send(&topic, record) {
            Ok((partition, offset)) => {
                stats.published.fetch_add(1, Ordering::Relaxed);
                debug!(
                    reason = %envelope.reason,
                    partition,
                    offset,
                    origin = %envelope.original_topic,
                    "dlq_published"
                );
            }
            Err(e) => {
                stats.publish_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, reason = %envelope.reason, "dlq_publish_failed");
            }
        }
        stats.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

// =============================================================================
// TESTS
// =============================================================================
