//! Price Cache & Waterfall
//!
//! Per-symbol mark resolver layered over a local freshness cache and the
//! side cache. Sources rank OFFICIAL > LTP > MID > STALE; a lower-ranked
//! write never displaces a higher-ranked value that is still fresh.
//!
//! Fast reads never leave the process. The slow read refreshes from the
//! side cache through the query breaker and degrades to the stale local
//! value (tagged STALE) when the side cache is dark.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::{
    breaker::{BreakerError, CircuitBreaker},
    models::MarkSource,
    transport::cache::SideCache,
};

#[derive(Debug, Clone, Copy)]
struct MarkEntry {
    price_mantissa: i64,
    source: MarkSource,
    cached_at: Instant,
}

#[derive(Debug, Default)]
pub struct MarkStats {
    pub local_hits: AtomicU64,
    pub side_refreshes: AtomicU64,
    pub stale_fallbacks: AtomicU64,
    pub priority_rejects: AtomicU64,
    pub side_write_failures: AtomicU64,
}

// =============================================================================
// WATERFALL
// =============================================================================

pub struct PriceWaterfall {
    local: RwLock<HashMap<String, MarkEntry>>,
    side: Arc<dyn SideCache>,
    publish_breaker: Arc<CircuitBreaker>,
    query_breaker: Arc<CircuitBreaker>,
    expiry: Duration,
    pub stats: Arc<MarkStats>,
}

impl PriceWaterfall {
    pub fn new(
        side: Arc<dyn SideCache>,
        publish_breaker: Arc<CircuitBreaker>,
        query_breaker: Arc<CircuitBreaker>,
        expiry: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            local: RwLock::new(HashMap::new()),
            side,
            publish_breaker,
            query_breaker,
            expiry,
            stats: Arc::new(MarkStats::default()),
        })
    }

    fn side_key(symbol: &str) -> String {
        format!("mark:{symbol}")
    }

    /// Local-cache-only resolution. Never suspends, never touches the
    /// side cache; absent symbols come back `(0, UNKNOWN)`.
    pub fn get_mark_fast(&self, symbol: &str) -> (i64, MarkSource) {
        match self.local.read().get(symbol) {
            Some(entry) => {
                self.stats.local_hits.fetch_add(1, Ordering::Relaxed);
                (entry.price_mantissa, entry.source)
            }
            None => (0, MarkSource::Unknown),
        }
    }

    /// Freshness-checked resolution: a fresh local entry wins; otherwise
    /// refresh from the side cache through the query breaker; on failure
    /// fall back to the stale local value tagged STALE.
    pub async fn get_mark(&self, symbol: &str) -> (i64, MarkSource) {
        let stale = {
            let local = self.local.read();
            match local.get(symbol) {
                Some(entry) if entry.cached_at.elapsed() < self.expiry => {
                    self.stats.local_hits.fetch_add(1, Ordering::Relaxed);
                    return (entry.price_mantissa, entry.source);
                }
                Some(entry) => Some((entry.price_mantissa, entry.source)),
                None => None,
            }
        };

        let key = Self::side_key(symbol);
        let side = self.side.clone();
        let fetched = self
            .query_breaker
            .call(|| {
                let side = side.clone();
                let key = key.clone();
                async move { side.get(&key).await }
            })
            .await;

        match fetched {
            Ok(Some(value)) => {
                if let Some((price, source)) = parse_side_value(&value) {
                    self.stats.side_refreshes.fetch_add(1, Ordering::Relaxed);
                    self.local.write().insert(
                        symbol.to_string(),
                        MarkEntry {
                            price_mantissa: price,
                            source,
                            cached_at: Instant::now(),
                        },
                    );
                    return (price, source);
                }
                self.stale_or_unknown(stale)
            }
            Ok(None) => self.stale_or_unknown(stale),
            Err(e) => {
                if !e.is_open() {
                    debug!(symbol = %symbol, error = %e, "mark_side_read_failed");
                }
                self.stale_or_unknown(stale)
            }
        }
    }

    fn stale_or_unknown(&self, stale: Option<(i64, MarkSource)>) -> (i64, MarkSource) {
        match stale {
            Some((price, _)) => {
                self.stats.stale_fallbacks.fetch_add(1, Ordering::Relaxed);
                (price, MarkSource::Stale)
            }
            None => (0, MarkSource::Unknown),
        }
    }

    /// Write a mark. The local cache updates immediately (subject to the
    /// priority rule); the side cache write is fire-and-forget through
    /// the publish breaker. Local writes always succeed.
    pub fn set_price(&self, symbol: &str, source: MarkSource, price_mantissa: i64) {
        {
            let mut local = self.local.write();
            match local.get(symbol) {
                Some(existing)
                    if existing.source.priority() > source.priority()
                        && existing.cached_at.elapsed() < self.expiry =>
                {
                    // A fresh higher-priority mark stands.
                    self.stats.priority_rejects.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        symbol = %symbol,
                        kept = %existing.source,
                        rejected = %source,
                        "mark_write_rejected_priority"
                    );
                    return;
                }
                _ => {
                    local.insert(
                        symbol.to_string(),
                        MarkEntry {
                            price_mantissa,
                            source,
                            cached_at: Instant::now(),
                        },
                    );
                }
            }
        }

        let side = self.side.clone();
        let breaker = self.publish_breaker.clone();
        let stats = self.stats.clone();
        let key = Self::side_key(symbol);
        let value = format_side_value(price_mantissa, source);
        tokio::spawn(async move {
            let result = breaker
                .call(|| {
                    let side = side.clone();
                    let key = key.clone();
                    let value = value.clone();
                    async move { side.put(&key, value).await }
                })
                .await;
            if result.is_err() {
                stats.side_write_failures.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    /// Number of locally cached symbols.
    pub fn len(&self) -> usize {
        self.local.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn format_side_value(price_mantissa: i64, source: MarkSource) -> String {
    format!("{price_mantissa}:{source}")
}

fn parse_side_value(value: &str) -> Option<(i64, MarkSource)> {
    let (price, source) = value.split_once(':')?;
    let price = price.parse().ok()?;
    let source = match source {
        "OFFICIAL" => MarkSource::Official,
        "LTP" => MarkSource::Ltp,
        "MID" => MarkSource::Mid,
        "STALE" => MarkSource::Stale,
        _ => MarkSource::Unknown,
    };
    Some((price, source))
}

// =============================================================================
// TESTS
// =============================================================================
