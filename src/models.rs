//! Canonical Data Model
//!
//! The trade envelope is the single in-log record shape shared by every
//! engine. It is immutable once emitted and carries the original wire
//! frame so any record can be replayed from the log alone.
//!
//! All prices are integer mantissas at 1e-8 (price_exponent = -8). No
//! binary floats anywhere in position or P&L arithmetic.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Fixed exponent for every price mantissa in the system.
pub const PRICE_EXPONENT: i32 = -8;

/// Multiplier implied by [`PRICE_EXPONENT`].
pub const PRICE_SCALE: i64 = 100_000_000;

// =============================================================================
// SIDE
// =============================================================================

/// Execution side as reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
    SellShort,
    SellShortExempt,
    Unspecified,
}

impl Side {
    /// Wire tag values: 1=Buy, 2=Sell, 5=SellShort, 6=SellShortExempt.
    pub fn from_wire(v: u8) -> Self {
        match v {
            1 => Self::Buy,
            2 => Self::Sell,
            5 => Self::SellShort,
            6 => Self::SellShortExempt,
            _ => Self::Unspecified,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Buy => 1,
            Self::Sell => 2,
            Self::SellShort => 5,
            Self::SellShortExempt => 6,
            Self::Unspecified => 0,
        }
    }

    /// Signed direction applied to quantities: buys add, everything that
    /// sells (including shorts) subtracts. Unspecified is treated as flat.
    #[inline]
    pub fn sign(self) -> i64 {
        match self {
            Self::Buy => 1,
            Self::Sell | Self::SellShort | Self::SellShortExempt => -1,
            Self::Unspecified => 0,
        }
    }
}

impl Default for Side {
    fn default() -> Self {
        Self::Unspecified
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::SellShort => write!(f, "SELL_SHORT"),
            Self::SellShortExempt => write!(f, "SELL_SHORT_EXEMPT"),
            Self::Unspecified => write!(f, "UNSPECIFIED"),
        }
    }
}

// =============================================================================
// TRADE ENVELOPE
// =============================================================================

/// Canonical in-log record for one trade execution.
///
/// `exec_id` is the natural idempotency key (unique per trading day).
/// `symbol` is the partition key; all executions of an instrument land on
/// the same log partition and stay ordered end-to-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEnvelope {
    pub exec_id: String,
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    /// Number of shares, unsigned on the wire; the sign comes from `side`.
    pub quantity: i64,
    /// Price × 1e8.
    pub price_mantissa: i64,
    pub trader_id: String,
    pub account: String,
    pub strategy_code: String,
    pub exchange: String,
    /// Monotonic tick at the gateway, nanoseconds.
    pub receive_timestamp: u64,
    /// Wall-clock at the gateway, epoch milliseconds.
    pub gateway_timestamp: i64,
    /// Wall-clock at the exchange, epoch milliseconds.
    pub exec_timestamp: i64,
    /// Original wire frame, preserved verbatim for replay.
    #[serde(with = "serde_bytes_b64")]
    pub raw_frame: Vec<u8>,
    pub gateway_id: String,
}

impl TradeEnvelope {
    /// Signed share count (+buy / -sell).
    #[inline]
    pub fn signed_quantity(&self) -> i64 {
        self.side.sign() * self.quantity
    }

    /// Signed notional in price mantissa units. i128 intermediate so a
    /// full-size quantity against a full-size mantissa cannot wrap.
    #[inline]
    pub fn notional_mantissa(&self) -> i128 {
        self.signed_quantity() as i128 * self.price_mantissa as i128
    }

    /// Position key for the hot path.
    #[inline]
    pub fn position_key(&self) -> (String, String) {
        (self.trader_id.clone(), self.symbol.clone())
    }
}

/// base64 framing for raw frames inside JSON diagnostics. The binary log
/// codec never goes through serde; this is only for DLQ payload echo and
/// operator tooling.
mod serde_bytes_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// MARK SOURCE
// =============================================================================

/// Where a mark price came from, in strict priority order.
///
/// A lower-priority source never overwrites a higher-priority cached value
/// that is still inside the freshness window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarkSource {
    Official,
    Ltp,
    Mid,
    Stale,
    Unknown,
}

impl MarkSource {
    /// Higher wins. Unknown never wins.
    #[inline]
    pub fn priority(self) -> u8 {
        match self {
            Self::Official => 4,
            Self::Ltp => 3,
            Self::Mid => 2,
            Self::Stale => 1,
            Self::Unknown => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Official => "OFFICIAL",
            Self::Ltp => "LTP",
            Self::Mid => "MID",
            Self::Stale => "STALE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for MarkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// P&L SNAPSHOT
// =============================================================================

/// Published form of one (trader, symbol) position at a point in time.
/// Serialized to JSON on the `pnl-updates:<trader_id>` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnlSnapshot {
    pub trader_id: String,
    pub symbol: String,
    pub net_quantity: i64,
    pub realized_pnl_mantissa: i64,
    pub unrealized_pnl_mantissa: i64,
    pub mark_price_mantissa: i64,
    pub mark_source: MarkSource,
    pub trade_count: u64,
    /// Epoch milliseconds at snapshot build.
    pub snapshot_ts: i64,
}

impl PnlSnapshot {
    pub fn channel(&self) -> String {
        format!("pnl-updates:{}", self.trader_id)
    }
}

// =============================================================================
// ENRICHED TRADE
// =============================================================================

/// Cold-path persisted record: the envelope joined with reference data.
/// Every enriched field is nullable; a reference-data miss never fails
/// the insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedTrade {
    pub envelope: TradeEnvelope,
    pub trader_name: Option<String>,
    pub trader_mpid: Option<String>,
    pub strategy_name: Option<String>,
    pub cusip: Option<String>,
    pub sedol: Option<String>,
    pub isin: Option<String>,
    pub security_name: Option<String>,
    pub mic: Option<String>,
    /// Epoch milliseconds at enrichment.
    pub enrichment_timestamp: i64,
}

// =============================================================================
// DLQ ENVELOPE
// =============================================================================

/// Why a record landed on the dead-letter topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DlqReason {
    DeserializationError,
    ValidationError,
    ProcessingError,
    TimeoutError,
    DownstreamError,
}

impl DlqReason {
    pub const ALL: [DlqReason; 5] = [
        Self::DeserializationError,
        Self::ValidationError,
        Self::ProcessingError,
        Self::TimeoutError,
        Self::DownstreamError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeserializationError => "DESERIALIZATION_ERROR",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::ProcessingError => "PROCESSING_ERROR",
            Self::TimeoutError => "TIMEOUT_ERROR",
            Self::DownstreamError => "DOWNSTREAM_ERROR",
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Self::DeserializationError => 0,
            Self::ValidationError => 1,
            Self::ProcessingError => 2,
            Self::TimeoutError => 3,
            Self::DownstreamError => 4,
        }
    }
}

impl std::fmt::Display for DlqReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic wrapper published to `trades.dlq` alongside the original
/// record bytes. Header map keys mirror the on-wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEnvelope {
    #[serde(with = "serde_bytes_b64")]
    pub original_payload: Vec<u8>,
    pub reason: DlqReason,
    pub original_topic: String,
    pub original_partition: u32,
    pub original_offset: u64,
    pub retry_count: u32,
    /// Epoch milliseconds of the first failure.
    pub first_failure_timestamp: i64,
    pub diagnostics: HashMap<String, String>,
}

impl DlqEnvelope {
    pub fn headers(&self) -> HashMap<String, String> {
        let mut h = HashMap::with_capacity(6 + self.diagnostics.len());
        h.insert("reason".into(), self.reason.to_string());
        h.insert("original_topic".into(), self.original_topic.clone());
        h.insert(
            "original_partition".into(),
            self.original_partition.to_string(),
        );
        h.insert("original_offset".into(), self.original_offset.to_string());
        h.insert("retry_count".into(), self.retry_count.to_string());
        h.insert(
            "first_failure_timestamp".into(),
            self.first_failure_timestamp.to_string(),
        );
        for (k, v) in &self.diagnostics {
            h.insert(k.clone(), v.clone());
        }
        h
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> TradeEnvelope {
        TradeEnvelope {
            exec_id: "E1".into(),
            order_id: "O1".into(),
            client_order_id: "C1".into(),
            symbol: "AAPL".into(),
            side: Side::Buy,
            quantity: 100,
            price_mantissa: 15_050_000_000,
            trader_id: "T1".into(),
            account: "ACC".into(),
            strategy_code: "S".into(),
            exchange: "XNAS".into(),
            receive_timestamp: 1,
            gateway_timestamp: 2,
            exec_timestamp: 3,
            raw_frame: vec![1, 2, 3],
            gateway_id: "gw-1".into(),
        }
    }

    #[test]
    fn signed_quantity_follows_side() {
        let mut e = envelope();
        assert_eq!(e.signed_quantity(), 100);
        e.side = Side::Sell;
        assert_eq!(e.signed_quantity(), -100);
        e.side = Side::SellShort;
        assert_eq!(e.signed_quantity(), -100);
        e.side = Side::Unspecified;
        assert_eq!(e.signed_quantity(), 0);
    }

    #[test]
    fn notional_uses_wide_intermediate() {
        let mut e = envelope();
        e.quantity = i64::MAX / 2;
        e.price_mantissa = 4;
        // Would wrap in i64; must not in i128.
        assert_eq!(e.notional_mantissa(), (i64::MAX / 2) as i128 * 4);
    }

    #[test]
    fn side_wire_roundtrip() {
        for side in [
            Side::Buy,
            Side::Sell,
            Side::SellShort,
            Side::SellShortExempt,
        ] {
            assert_eq!(Side::from_wire(side.to_wire()), side);
        }
        assert_eq!(Side::from_wire(99), Side::Unspecified);
    }

    #[test]
    fn mark_source_priority_order() {
        assert!(MarkSource::Official.priority() > MarkSource::Ltp.priority());
        assert!(MarkSource::Ltp.priority() > MarkSource::Mid.priority());
        assert!(MarkSource::Mid.priority() > MarkSource::Stale.priority());
        assert!(MarkSource::Stale.priority() > MarkSource::Unknown.priority());
    }

    #[test]
    fn raw_frame_survives_json_framing() {
        let mut e = envelope();
        e.raw_frame = (0u8..=255).collect();
        let json = serde_json::to_string(&e).unwrap();
        let back: TradeEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn dlq_headers_carry_contract_keys() {
        let mut diagnostics = HashMap::new();
        diagnostics.insert("error".into(), "boom".into());
        let env = DlqEnvelope {
            original_payload: vec![0xAA],
            reason: DlqReason::ValidationError,
            original_topic: "trades.raw".into(),
            original_partition: 3,
            original_offset: 42,
            retry_count: 0,
            first_failure_timestamp: 1_700_000_000_000,
            diagnostics,
        };
        let h = env.headers();
        assert_eq!(h["reason"], "VALIDATION_ERROR");
        assert_eq!(h["original_partition"], "3");
        assert_eq!(h["original_offset"], "42");
        assert_eq!(h["error"], "boom");
    }
}
