//! Partitioned Durable Log
//!
//! In-process implementation of the append-only log the pipelines hang
//! off: named topics, a fixed partition count, producer-side keyed
//! emission, consumer groups with exclusive whole-topic assignment, and
//! offset commits decoupled from delivery.
//!
//! Records are kept in per-partition append-only vectors. Per-partition
//! ordering is inherent; nothing is ever removed, so redelivery after a
//! crash is a matter of re-reading from the committed offset.

use std::{
    collections::HashMap,
    hash::{Hash, Hasher},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

// =============================================================================
// RECORDS
// =============================================================================

/// One produced record before placement.
#[derive(Debug, Clone)]
pub struct Record {
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    /// Epoch milliseconds at append.
    pub timestamp_ms: i64,
}

impl Record {
    pub fn new(key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            payload,
            headers: HashMap::new(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// A record as seen by a consumer, with its placement.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub record: Arc<Record>,
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    UnknownTopic(String),
    GroupAlreadySubscribed { group: String, topic: String },
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownTopic(t) => write!(f, "unknown topic: {t}"),
            Self::GroupAlreadySubscribed { group, topic } => {
                write!(f, "group {group} already subscribed to {topic}")
            }
        }
    }
}

impl std::error::Error for LogError {}

// =============================================================================
// TOPIC / PARTITION
// =============================================================================

struct Partition {
    records: RwLock<Vec<Arc<Record>>>,
    appended: Notify,
}

struct Topic {
    name: String,
    partitions: Vec<Partition>,
}

impl Topic {
    fn partition_for_key(&self, key: &str) -> u32 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as u32
    }
}

// =============================================================================
// MEMORY LOG
// =============================================================================

type GroupKey = (String, String); // (group, topic)

#[derive(Default)]
struct GroupState {
    /// Next offset to deliver, per partition (committed position).
    committed: HashMap<u32, u64>,
    subscribed: bool,
}

pub struct MemoryLog {
    /// Shared with every producer handle.
    topics: Arc<RwLock<HashMap<String, Arc<Topic>>>>,
    groups: Mutex<HashMap<GroupKey, Arc<Mutex<GroupState>>>>,
}

impl MemoryLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            groups: Mutex::new(HashMap::new()),
        })
    }

    /// Idempotent topic creation with a fixed partition count.
    pub fn create_topic(&self, name: &str, partitions: u32) {
        let mut topics = self.topics.write();
        topics.entry(name.to_string()).or_insert_with(|| {
            Arc::new(Topic {
                name: name.to_string(),
                partitions: (0..partitions.max(1))
                    .map(|_| Partition {
                        records: RwLock::new(Vec::new()),
                        appended: Notify::new(),
                    })
                    .collect(),
            })
        });
    }

    pub fn partition_count(&self, topic: &str) -> Option<u32> {
        self.topics
            .read()
            .get(topic)
            .map(|t| t.partitions.len() as u32)
    }

    pub fn producer(&self) -> Producer {
        Producer {
            topics: self.topics.clone(),
        }
    }

    /// Join `group` on `topic`, taking exclusive assignment of every
    /// partition. Returns one consumer per partition; delivery starts at
    /// the committed position (earliest when none).
    pub fn subscribe(
        &self,
        group: &str,
        topic: &str,
    ) -> Result<Vec<PartitionConsumer>, LogError> {
        let topic_arc = self
            .topics
            .read()
            .get(topic)
            .cloned()
            .ok_or_else(|| LogError::UnknownTopic(topic.to_string()))?;

        let state = {
            let mut groups = self.groups.lock();
            groups
                .entry((group.to_string(), topic.to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(GroupState::default())))
                .clone()
        };

        {
            let mut s = state.lock();
            if s.subscribed {
                return Err(LogError::GroupAlreadySubscribed {
                    group: group.to_string(),
                    topic: topic.to_string(),
                });
            }
            s.subscribed = true;
        }

        Ok((0..topic_arc.partitions.len() as u32)
            .map(|partition| {
                let position = state.lock().committed.get(&partition).copied().unwrap_or(0);
                PartitionConsumer {
                    topic: topic_arc.clone(),
                    partition,
                    group: state.clone(),
                    position,
                }
            })
            .collect())
    }

    /// Release a group's assignment so a restarted engine can resubscribe.
    pub fn unsubscribe(&self, group: &str, topic: &str) {
        if let Some(state) = self
            .groups
            .lock()
            .get(&(group.to_string(), topic.to_string()))
        {
            state.lock().subscribed = false;
        }
    }

    /// Total records behind the committed position, summed over
    /// partitions. The primary backpressure observable.
    pub fn group_lag(&self, group: &str, topic: &str) -> u64 {
        let Some(topic_arc) = self.topics.read().get(topic).cloned() else {
            return 0;
        };
        let Some(state) = self
            .groups
            .lock()
            .get(&(group.to_string(), topic.to_string()))
            .cloned()
        else {
            return end_offsets(&topic_arc).iter().sum();
        };
        let committed = state.lock().committed.clone();
        end_offsets(&topic_arc)
            .iter()
            .enumerate()
            .map(|(p, &end)| end.saturating_sub(committed.get(&(p as u32)).copied().unwrap_or(0)))
            .sum()
    }

    /// Snapshot of every record in one partition. Test and replay aid.
    pub fn read_partition(&self, topic: &str, partition: u32) -> Vec<StoredRecord> {
        let Some(topic_arc) = self.topics.read().get(topic).cloned() else {
            return Vec::new();
        };
        let Some(p) = topic_arc.partitions.get(partition as usize) else {
            return Vec::new();
        };
        let result = p
            .records
            .read()
            .iter()
            .enumerate()
            .map(|(offset, record)| StoredRecord {
                topic: topic.to_string(),
                partition,
                offset: offset as u64,
                record: record.clone(),
            })
            .collect();
        result
    }

    /// Every record in a topic across partitions, in partition order.
    pub fn read_topic(&self, topic: &str) -> Vec<StoredRecord> {
        let count = self.partition_count(topic).unwrap_or(0);
        (0..count)
            .flat_map(|p| self.read_partition(topic, p))
            .collect()
    }
}

fn end_offsets(topic: &Topic) -> Vec<u64> {
    topic
        .partitions
        .iter()
        .map(|p| p.records.read().len() as u64)
        .collect()
}

// =============================================================================
// PRODUCER
// =============================================================================

/// Thread-safe handle for keyed emission. Clone freely; appends go
/// straight to the partition vector.
#[derive(Clone)]
pub struct Producer {
    topics: Arc<RwLock<HashMap<String, Arc<Topic>>>>,
}

impl Producer {
    /// Append one record, routed by key hash. Returns its placement.
    pub fn send(&self, topic: &str, record: Record) -> Result<(u32, u64), LogError> {
        let topic_arc = self
            .topics
            .read()
            .get(topic)
            .cloned()
            .ok_or_else(|| LogError::UnknownTopic(topic.to_string()))?;

        let partition = topic_arc.partition_for_key(&record.key);
        let p = &topic_arc.partitions[partition as usize];
        let offset = {
            let mut records = p.records.write();
            records.push(Arc::new(record));
            records.len() as u64 - 1
        };
        p.appended.notify_waiters();
        Ok((partition, offset))
    }
}

// =============================================================================
// PARTITION CONSUMER
// =============================================================================

/// One group's exclusive reader of one partition. Delivery position and
/// committed position are independent: `poll` advances delivery,
/// `commit` advances the group's durable position.
pub struct PartitionConsumer {
    topic: Arc<Topic>,
    partition: u32,
    group: Arc<Mutex<GroupState>>,
    position: u64,
}

impl PartitionConsumer {
    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn topic_name(&self) -> &str {
        &self.topic.name
    }

    /// Fetch up to `max` records past the delivery position, suspending
    /// until at least one is available.
    pub async fn poll(&mut self, max: usize) -> Vec<StoredRecord> {
        loop {
            if let Some(batch) = self.fetch(max) {
                return batch;
            }
            let p = &self.topic.partitions[self.partition as usize];
            let mut notified = std::pin::pin!(p.appended.notified());
            // Register interest before re-checking, so an append between
            // the empty fetch and the await cannot be lost.
            notified.as_mut().enable();
            if p.records.read().len() as u64 > self.position {
                continue;
            }
            notified.await;
        }
    }

    /// Non-suspending fetch; `None` when nothing is past the position.
    pub fn fetch(&mut self, max: usize) -> Option<Vec<StoredRecord>> {
        let p = &self.topic.partitions[self.partition as usize];
        let records = p.records.read();
        if (records.len() as u64) <= self.position {
            return None;
        }
        let start = self.position as usize;
        let end = records.len().min(start + max.max(1));
        let batch: Vec<StoredRecord> = records[start..end]
            .iter()
            .enumerate()
            .map(|(i, record)| StoredRecord {
                topic: self.topic.name.clone(),
                partition: self.partition,
                offset: (start + i) as u64,
                record: record.clone(),
            })
            .collect();
        self.position = end as u64;
        Some(batch)
    }

    /// Commit `offset` as processed: the group's position moves to
    /// `offset + 1`. Decoupled from delivery entirely.
    pub fn commit(&self, offset: u64) {
        let mut g = self.group.lock();
        let entry = g.committed.entry(self.partition).or_insert(0);
        *entry = (*entry).max(offset + 1);
    }

    /// The group's committed position for this partition.
    pub fn committed(&self) -> u64 {
        self.group
            .lock()
            .committed
            .get(&self.partition)
            .copied()
            .unwrap_or(0)
    }

    /// Rewind delivery to the committed position (crash simulation /
    /// redelivery).
    pub fn seek_to_committed(&mut self) {
        self.position = self.committed();
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, n: u8) -> Record {
        Record::new(key, vec![n])
    }

    #[tokio::test]
    async fn keyed_records_land_on_one_partition_in_order() {
        let log = MemoryLog::new();
        log.create_topic("t", 12);
        let producer = log.producer();

        let mut seen = None;
        for i in 0..10 {
            let (p, o) = producer.send("t", record("AAPL", i)).unwrap();
            assert_eq!(o, i as u64);
            match seen {
                None => seen = Some(p),
                Some(prev) => assert_eq!(prev, p),
            }
        }
    }

    #[tokio::test]
    async fn poll_delivers_in_order_and_commit_persists() {
        let log = MemoryLog::new();
        log.create_topic("t", 1);
        let producer = log.producer();
        for i in 0..5 {
            producer.send("t", record("k", i)).unwrap();
        }

        let mut consumers = log.subscribe("g", "t").unwrap();
        let c = &mut consumers[0];
        let batch = c.poll(3).await;
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].record.payload, vec![0]);
        c.commit(batch.last().unwrap().offset);
        assert_eq!(c.committed(), 3);

        let batch = c.poll(10).await;
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn resubscribe_resumes_from_committed() {
        let log = MemoryLog::new();
        log.create_topic("t", 1);
        let producer = log.producer();
        for i in 0..4 {
            producer.send("t", record("k", i)).unwrap();
        }

        {
            let mut consumers = log.subscribe("g", "t").unwrap();
            let c = &mut consumers[0];
            let batch = c.poll(2).await;
            c.commit(batch.last().unwrap().offset);
        }
        log.unsubscribe("g", "t");

        let mut consumers = log.subscribe("g", "t").unwrap();
        let batch = consumers[0].poll(10).await;
        assert_eq!(batch[0].offset, 2);
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn double_subscribe_is_rejected() {
        let log = MemoryLog::new();
        log.create_topic("t", 2);
        let _c = log.subscribe("g", "t").unwrap();
        assert!(matches!(
            log.subscribe("g", "t"),
            Err(LogError::GroupAlreadySubscribed { .. })
        ));
        // Independent group joins fine.
        assert!(log.subscribe("g2", "t").is_ok());
    }

    #[tokio::test]
    async fn lag_tracks_committed_position() {
        let log = MemoryLog::new();
        log.create_topic("t", 1);
        let producer = log.producer();
        for i in 0..6 {
            producer.send("t", record("k", i)).unwrap();
        }
        let mut consumers = log.subscribe("g", "t").unwrap();
        assert_eq!(log.group_lag("g", "t"), 6);
        let batch = consumers[0].poll(4).await;
        consumers[0].commit(batch.last().unwrap().offset);
        assert_eq!(log.group_lag("g", "t"), 2);
    }

    #[tokio::test]
    async fn poll_wakes_on_append() {
        let log = MemoryLog::new();
        log.create_topic("t", 1);
        let mut consumers = log.subscribe("g", "t").unwrap();
        let mut c = consumers.pop().unwrap();

        let producer = log.producer();
        let waiter = tokio::spawn(async move { c.poll(1).await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        producer.send("t", record("k", 7)).unwrap();

        let batch = waiter.await.unwrap();
        assert_eq!(batch[0].record.payload, vec![7]);
    }

    #[tokio::test]
    async fn seek_to_committed_redelivers() {
        let log = MemoryLog::new();
        log.create_topic("t", 1);
        let producer = log.producer();
        for i in 0..3 {
            producer.send("t", record("k", i)).unwrap();
        }
        let mut consumers = log.subscribe("g", "t").unwrap();
        let c = &mut consumers[0];
        let _ = c.poll(3).await;
        // Nothing committed; a crash replays everything.
        c.seek_to_committed();
        let batch = c.poll(3).await;
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].offset, 0);
    }
}
