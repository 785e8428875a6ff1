//! Reference Data
//!
//! Read-only lookups joining trades with trader, strategy and security
//! descriptors. Lookups are heavily cached (positive and negative) so a
//! day's enrichment touches the source once per distinct key. A miss is
//! data, not an error: enrichment fills nulls and the insert proceeds.
//! Only a source failure (unreachable, timed out) surfaces as an error,
//! and the engine retries those.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::models::{EnrichedTrade, TradeEnvelope};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraderInfo {
    pub name: String,
    pub mpid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyInfo {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityInfo {
    pub cusip: String,
    pub sedol: String,
    pub isin: String,
    pub name: String,
    pub mic: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefDataError {
    Unavailable(String),
    Timeout(String),
}

impl RefDataError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl std::fmt::Display for RefDataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "reference data unavailable: {msg}"),
            Self::Timeout(msg) => write!(f, "reference data timeout: {msg}"),
        }
    }
}

impl std::error::Error for RefDataError {}

#[async_trait]
pub trait RefDataSource: Send + Sync {
    async fn trader(&self, trader_id: &str) -> Result<Option<TraderInfo>, RefDataError>;
    async fn strategy(&self, code: &str) -> Result<Option<StrategyInfo>, RefDataError>;
    async fn security(&self, symbol: &str) -> Result<Option<SecurityInfo>, RefDataError>;
}

// =============================================================================
// STATIC SOURCE
// =============================================================================

/// Fixture-backed source loaded at startup. Never fails.
#[derive(Default)]
pub struct StaticRefData {
    traders: HashMap<String, TraderInfo>,
    strategies: HashMap<String, StrategyInfo>,
    securities: HashMap<String, SecurityInfo>,
}

impl StaticRefData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trader(mut self, id: &str, name: &str, mpid: &str) -> Self {
        self.traders.insert(
            id.to_string(),
            TraderInfo {
                name: name.to_string(),
                mpid: mpid.to_string(),
            },
        );
        self
    }

    pub fn with_strategy(mut self, code: &str, name: &str) -> Self {
        self.strategies.insert(
            code.to_string(),
            StrategyInfo {
                name: name.to_string(),
            },
        );
        self
    }

    pub fn with_security(
        mut self,
        symbol: &str,
        cusip: &str,
        sedol: &str,
        isin: &str,
        name: &str,
        mic: &str,
    ) -> Self {
        self.securities.insert(
            symbol.to_string(),
            SecurityInfo {
                cusip: cusip.to_string(),
                sedol: sedol.to_string(),
                isin: isin.to_string(),
                name: name.to_string(),
                mic: mic.to_string(),
            },
        );
        self
    }
}

#[async_trait]
impl RefDataSource for StaticRefData {
    async fn trader(&self, trader_id: &str) -> Result<Option<TraderInfo>, RefDataError> {
        Ok(self.traders.get(trader_id).cloned())
    }

    async fn strategy(&self, code: &str) -> Result<Option<StrategyInfo>, RefDataError> {
        Ok(self.strategies.get(code).cloned())
    }

    async fn security(&self, symbol: &str) -> Result<Option<SecurityInfo>, RefDataError> {
        Ok(self.securities.get(symbol).cloned())
    }
}

// =============================================================================
// READ-THROUGH CACHE
// =============================================================================

/// Caches hits and misses per key so redelivered bursts stay off the
/// source.
pub struct RefDataCache {
    source: Arc<dyn RefDataSource>,
    traders: RwLock<HashMap<String, Option<TraderInfo>>>,
    strategies: RwLock<HashMap<String, Option<StrategyInfo>>>,
    securities: RwLock<HashMap<String, Option<SecurityInfo>>>,
}

impl RefDataCache {
    pub fn new(source: Arc<dyn RefDataSource>) -> Arc<Self> {
        Arc::new(Self {
            source,
            traders: RwLock::new(HashMap::new()),
            strategies: RwLock::new(HashMap::new()),
            securities: RwLock::new(HashMap::new()),
        })
    }

    /// Join the envelope with whatever reference data exists. Missing
    /// keys produce null fields; a source failure is the only error.
    pub async fn enrich(&self, envelope: &TradeEnvelope) -> Result<EnrichedTrade, RefDataError> {
        let trader = self.trader(&envelope.trader_id).await?;
        let strategy = self.strategy(&envelope.strategy_code).await?;
        let security = self.security(&envelope.symbol).await?;

        Ok(EnrichedTrade {
            envelope: envelope.clone(),
            trader_name: trader.as_ref().map(|t| t.name.clone()),
            trader_mpid: trader.map(|t| t.mpid),
            strategy_name: strategy.map(|s| s.name),
            cusip: security.as_ref().map(|s| s.cusip.clone()),
            sedol: security.as_ref().map(|s| s.sedol.clone()),
            isin: security.as_ref().map(|s| s.isin.clone()),
            security_name: security.as_ref().map(|s| s.name.clone()),
            mic: security.map(|s| s.mic),
            enrichment_timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    async fn trader(&self, id: &str) -> Result<Option<TraderInfo>, RefDataError> {
        if id.is_empty() {
            return Ok(None);
        }
        if let Some(cached) = self.traders.read().get(id) {
            return Ok(cached.clone());
        }
        let fetched = self.source.trader(id).await?;
        self.traders.write().insert(id.to_string(), fetched.clone());
        Ok(fetched)
    }

    async fn strategy(&self, code: &str) -> Result<Option<StrategyInfo>, RefDataError> {
        if code.is_empty() {
            return Ok(None);
        }
        if let Some(cached) = self.strategies.read().get(code) {
            return Ok(cached.clone());
        }
        let fetched = self.source.strategy(code).await?;
        self.strategies
            .write()
            .insert(code.to_string(), fetched.clone());
        Ok(fetched)
    }

    async fn security(&self, symbol: &str) -> Result<Option<SecurityInfo>, RefDataError> {
        if symbol.is_empty() {
            return Ok(None);
        }
        if let Some(cached) = self.securities.read().get(symbol) {
            return Ok(cached.clone());
        }
        let fetched = self.source.security(symbol).await?;
        self.securities
            .write()
            .insert(symbol.to_string(), fetched.clone());
        Ok(fetched)
    }
}

// =============================================================================
// TESTS
// =============================================================================
