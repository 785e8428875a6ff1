//! Side Cache
//!
//! Low-latency cache the hot path publishes into: per-key scalars,
//! per-key hash fields, pub/sub channels and a liveness probe. Every
//! call is fallible; the engines wrap them in circuit breakers and
//! treat failures as degraded-mode signals, never as fatal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    Unavailable(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "cache unavailable: {msg}"),
        }
    }
}

impl std::error::Error for CacheError {}

/// One pub/sub delivery. Subscribers receive every channel and filter;
/// channel fan-out at this scale does not justify per-channel senders.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

#[async_trait]
pub trait SideCache: Send + Sync {
    async fn put(&self, key: &str, value: String) -> Result<(), CacheError>;
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn hset(&self, key: &str, field: &str, value: String) -> Result<(), CacheError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CacheError>;
    /// Publish to a channel, returning the number of active receivers.
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, CacheError>;
    async fn ping(&self) -> Result<(), CacheError>;
    /// Subscribe to the pub/sub stream.
    fn subscribe(&self) -> broadcast::Receiver<PubSubMessage>;
}

// =============================================================================
// IN-MEMORY IMPLEMENTATION
// =============================================================================

/// Process-local cache. `set_available(false)` makes every operation
/// fail, which is how outage drills and the breaker test-benches
/// exercise the degraded paths.
pub struct MemoryCache {
    scalars: RwLock<HashMap<String, String>>,
    hashes: RwLock<HashMap<String, HashMap<String, String>>>,
    pubsub: broadcast::Sender<PubSubMessage>,
    available: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        let (pubsub, _) = broadcast::channel(4096);
        Self {
            scalars: RwLock::new(HashMap::new()),
            hashes: RwLock::new(HashMap::new()),
            pubsub,
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable("injected outage".into()))
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SideCache for MemoryCache {
    async fn put(&self, key: &str, value: String) -> Result<(), CacheError> {
        self.check()?;
        self.scalars.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        Ok(self.scalars.read().get(key).cloned())
    }

    async fn hset(&self, key: &str, field: &str, value: String) -> Result<(), CacheError> {
        self.check()?;
        self.hashes
            .write()
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        Ok(self
            .hashes
            .read()
            .get(key)
            .and_then(|h| h.get(field).cloned()))
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<usize, CacheError> {
        self.check()?;
        let receivers = self
            .pubsub
            .send(PubSubMessage {
                channel: channel.to_string(),
                payload,
            })
            .unwrap_or(0);
        Ok(receivers)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.check()
    }

    fn subscribe(&self) -> broadcast::Receiver<PubSubMessage> {
        self.pubsub.subscribe()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scalar_and_hash_roundtrip() {
        let cache = MemoryCache::new();
        cache.put("mark:AAPL", "150".into()).await.unwrap();
        assert_eq!(cache.get("mark:AAPL").await.unwrap(), Some("150".into()));
        assert_eq!(cache.get("mark:MSFT").await.unwrap(), None);

        cache
            .hset("position:T1", "AAPL", "100".into())
            .await
            .unwrap();
        assert_eq!(
            cache.hget("position:T1", "AAPL").await.unwrap(),
            Some("100".into())
        );
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let cache = MemoryCache::new();
        let mut rx = cache.subscribe();
        cache
            .publish("pnl-updates:T1", "{\"x\":1}".into())
            .await
            .unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "pnl-updates:T1");
        assert_eq!(msg.payload, "{\"x\":1}");
    }

    #[tokio::test]
    async fn outage_fails_every_operation() {
        let cache = MemoryCache::new();
        cache.set_available(false);
        assert!(cache.ping().await.is_err());
        assert!(cache.put("k", "v".into()).await.is_err());
        assert!(cache.get("k").await.is_err());
        assert!(cache.publish("c", "p".into()).await.is_err());

        cache.set_available(true);
        assert!(cache.ping().await.is_ok());
    }
}
