//! Trade Envelope Codec
//!
//! Compact binary encoding of the canonical envelope, with an optional
//! schema-id prefix. Two on-wire shapes are accepted:
//!
//! ```text
//! raw:      [body]
//! prefixed: [0x00][schema_id: u32 BE][0x00 message index][body]
//! ```
//!
//! The body always opens with a version byte (currently 0x01), so a raw
//! body can never be mistaken for the 0x00 prefix magic. Decoding sniffs
//! the first byte: 0x00 tries the prefixed shape and falls back to raw.
//!
//! Body layout (all integers big-endian):
//!
//! ```text
//! u8  version (0x01)
//! str exec_id, order_id, client_order_id, symbol          (u16 len + UTF-8)
//! u8  side
//! i64 quantity
//! i64 price_mantissa
//! str trader_id, account, strategy_code, exchange
//! u64 receive_timestamp
//! i64 gateway_timestamp
//! i64 exec_timestamp
//! str gateway_id
//! u32 raw_frame len + bytes
//! ```

pub mod registry;

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::{
    config::CodecConfig,
    models::{Side, TradeEnvelope},
};
use registry::SchemaRegistry;

/// Leading byte of the schema-prefixed shape.
pub const SCHEMA_MAGIC: u8 = 0x00;
/// Message index within a schema (single-record schemas only).
pub const MESSAGE_INDEX: u8 = 0x00;
/// Body format version.
pub const BODY_VERSION: u8 = 0x01;
/// Prefix length: magic + schema id + message index.
const PREFIX_LEN: usize = 6;

/// Record name used for subject derivation.
pub const TRADE_RECORD: &str = "TradeEnvelope";

/// Canonical descriptor registered for the envelope: the ordered field
/// list of the body layout.
pub const TRADE_DESCRIPTOR: &str = "exec_id,order_id,client_order_id,symbol,side,quantity,\
price_mantissa,trader_id,account,strategy_code,exchange,receive_timestamp,gateway_timestamp,\
exec_timestamp,gateway_id,raw_frame";

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    Truncated,
    BadVersion(u8),
    BadUtf8,
    StringTooLong(usize),
    FrameTooLong(usize),
    TrailingBytes(usize),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "payload truncated"),
            Self::BadVersion(v) => write!(f, "unsupported body version: 0x{v:02X}"),
            Self::BadUtf8 => write!(f, "invalid utf-8 in string field"),
            Self::StringTooLong(n) => write!(f, "string field too long: {n}"),
            Self::FrameTooLong(n) => write!(f, "raw frame too long: {n}"),
            Self::TrailingBytes(n) => write!(f, "{n} trailing bytes after body"),
        }
    }
}

impl std::error::Error for CodecError {}

// =============================================================================
// BODY ENCODE / DECODE
// =============================================================================

fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<(), CodecError> {
    let bytes = s.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(CodecError::StringTooLong(bytes.len()));
    }
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.buf.len() {
            return Err(CodecError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::BadUtf8)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Encode the envelope body (raw shape).
pub fn encode_body(env: &TradeEnvelope) -> Result<Vec<u8>, CodecError> {
    if env.raw_frame.len() > u32::MAX as usize {
        return Err(CodecError::FrameTooLong(env.raw_frame.len()));
    }
    let mut buf = Vec::with_capacity(128 + env.raw_frame.len());
    buf.push(BODY_VERSION);
    put_str(&mut buf, &env.exec_id)?;
    put_str(&mut buf, &env.order_id)?;
    put_str(&mut buf, &env.client_order_id)?;
    put_str(&mut buf, &env.symbol)?;
    buf.push(env.side.to_wire());
    buf.extend_from_slice(&env.quantity.to_be_bytes());
    buf.extend_from_slice(&env.price_mantissa.to_be_bytes());
    put_str(&mut buf, &env.trader_id)?;
    put_str(&mut buf, &env.account)?;
    put_str(&mut buf, &env.strategy_code)?;
    put_str(&mut buf, &env.exchange)?;
    buf.extend_from_slice(&env.receive_timestamp.to_be_bytes());
    buf.extend_from_slice(&env.gateway_timestamp.to_be_bytes());
    buf.extend_from_slice(&env.exec_timestamp.to_be_bytes());
    put_str(&mut buf, &env.gateway_id)?;
    buf.extend_from_slice(&(env.raw_frame.len() as u32).to_be_bytes());
    buf.extend_from_slice(&env.raw_frame);
    Ok(buf)
}

/// Decode a body (raw shape, no prefix).
pub fn decode_body(bytes: &[u8]) -> Result<TradeEnvelope, CodecError> {
    let mut r = Reader::new(bytes);
    let version = r.u8()?;
    if version != BODY_VERSION {
        return Err(CodecError::BadVersion(version));
    }
    let exec_id = r.string()?;
    let order_id = r.string()?;
    let client_order_id = r.string()?;
    let symbol = r.string()?;
    let side = Side::from_wire(r.u8()?);
    let quantity = r.i64()?;
    let price_mantissa = r.i64()?;
    let trader_id = r.string()?;
    let account = r.string()?;
    let strategy_code = r.string()?;
    let exchange = r.string()?;
    let receive_timestamp = r.u64()?;
    let gateway_timestamp = r.i64()?;
    let exec_timestamp = r.i64()?;
    let gateway_id = r.string()?;
    let frame_len = r.u32()? as usize;
    let raw_frame = r.take(frame_len)?.to_vec();
    if r.remaining() > 0 {
        return Err(CodecError::TrailingBytes(r.remaining()));
    }
    Ok(TradeEnvelope {
        exec_id,
        order_id,
        client_order_id,
        symbol,
        side,
        quantity,
        price_mantissa,
        trader_id,
        account,
        strategy_code,
        exchange,
        receive_timestamp,
        gateway_timestamp,
        exec_timestamp,
        raw_frame,
        gateway_id,
    })
}

// =============================================================================
// TRADE CODEC (registry-aware)
// =============================================================================

/// Topic-aware codec. Encoding consults a per-(topic, record) schema-id
/// cache; a miss goes to the registry under a single-flight lock so a
/// burst of first emissions produces one registration, not thousands.
/// Registry failure never prevents emission: the record goes out raw.
pub struct TradeCodec {
    config: CodecConfig,
    registry: Arc<dyn SchemaRegistry>,
    /// (topic, record) -> registered schema id.
    ids: RwLock<HashMap<(String, String), u32>>,
    flight: tokio::sync::Mutex<()>,
}

impl TradeCodec {
    pub fn new(config: CodecConfig, registry: Arc<dyn SchemaRegistry>) -> Self {
        Self {
            config,
            registry,
            ids: RwLock::new(HashMap::new()),
            flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Encode for `topic`: schema-prefixed when a schema id is known (or
    /// becomes known via auto-registration), raw otherwise.
    pub async fn encode(&self, topic: &str, env: &TradeEnvelope) -> Result<Vec<u8>, CodecError> {
        let body = encode_body(env)?;
        if !self.config.enabled {
            return Ok(body);
        }
        match self.schema_id(topic).await {
            Some(id) => {
                let mut out = Vec::with_capacity(PREFIX_LEN + body.len());
                out.push(SCHEMA_MAGIC);
                out.extend_from_slice(&id.to_be_bytes());
                out.push(MESSAGE_INDEX);
                out.extend_from_slice(&body);
                Ok(out)
            }
            None => Ok(body),
        }
    }

    /// Decode either shape; the schema id, when present, is surfaced.
    pub fn decode(&self, bytes: &[u8]) -> Result<(TradeEnvelope, Option<u32>), CodecError> {
        decode(bytes)
    }

    /// Compatibility gate for a proposed descriptor on a topic's subject.
    pub async fn check_compatibility(&self, topic: &str, descriptor: &str) -> bool {
        let subject = self.config.subject_strategy.subject(topic, TRADE_RECORD);
        match self.registry.check_compatibility(&subject, descriptor).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(error = %e, subject = %subject, "compatibility_check_failed");
                false
            }
        }
    }

    async fn schema_id(&self, topic: &str) -> Option<u32> {
        let cache_key = (topic.to_string(), TRADE_RECORD.to_string());
        if let Some(&id) = self.ids.read().get(&cache_key) {
            return Some(id);
        }

        let _guard = self.flight.lock().await;
        if let Some(&id) = self.ids.read().get(&cache_key) {
            return Some(id);
        }

        let subject = self.config.subject_strategy.subject(topic, TRADE_RECORD);
        let result = if self.config.auto_register {
            self.registry.register(&subject, TRADE_DESCRIPTOR).await
        } else {
            match self.registry.latest(&subject).await {
                Ok(Some((id, _))) => Ok(id),
                Ok(None) => {
                    debug!(subject = %subject, "no_schema_registered");
                    return None;
                }
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(id) => {
                self.ids.write().insert(cache_key, id);
                Some(id)
            }
            Err(e) => {
                // Stay on the raw shape; the next emission retries.
                warn!(error = %e, subject = %subject, "schema_registration_failed");
                None
            }
        }
    }
}

/// Free-function decode for consumers that have no registry handle.
pub fn decode(bytes: &[u8]) -> Result<(TradeEnvelope, Option<u32>), CodecError> {
    if bytes.first() == Some(&SCHEMA_MAGIC) && bytes.len() > PREFIX_LEN {
        let schema_id = u32::from_be_bytes(bytes[1..5].try_into().unwrap());
        if bytes[5] == MESSAGE_INDEX {
            if let Ok(env) = decode_body(&bytes[PREFIX_LEN..]) {
                return Ok((env, Some(schema_id)));
            }
        }
        // Fall through to the raw shape.
    }
    decode_body(bytes).map(|env| (env, None))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubjectStrategy;
    use async_trait::async_trait;
    use super::registry::{MemoryRegistry, RegistryError};

    fn envelope() -> TradeEnvelope {
        TradeEnvelope {
            exec_id: "E1".into(),
            order_id: "O-77".into(),
            client_order_id: "".into(),
            symbol: "AAPL".into(),
            side: Side::Buy,
            quantity: 100,
            price_mantissa: 15_050_000_000,
            trader_id: "T1".into(),
            account: "ACCT-9".into(),
            strategy_code: "VWAP".into(),
            exchange: "XNAS".into(),
            receive_timestamp: 123_456_789,
            gateway_timestamp: 1_700_000_000_123,
            exec_timestamp: 1_700_000_000_120,
            raw_frame: b"8=X|55=AAPL|".to_vec(),
            gateway_id: "gw-1".into(),
        }
    }

    #[test]
    fn body_roundtrip() {
        let env = envelope();
        let body = encode_body(&env).unwrap();
        assert_eq!(body[0], BODY_VERSION);
        let decoded = decode_body(&body).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn prefixed_and_raw_agree_except_schema_id() {
        let env = envelope();
        let body = encode_body(&env).unwrap();

        let mut prefixed = vec![SCHEMA_MAGIC];
        prefixed.extend_from_slice(&7u32.to_be_bytes());
        prefixed.push(MESSAGE_INDEX);
        prefixed.extend_from_slice(&body);

        let (from_raw, id_raw) = decode(&body).unwrap();
        let (from_prefixed, id_prefixed) = decode(&prefixed).unwrap();
        assert_eq!(from_raw, from_prefixed);
        assert_eq!(id_raw, None);
        assert_eq!(id_prefixed, Some(7));
    }

    #[test]
    fn truncated_payload_errors() {
        let body = encode_body(&envelope()).unwrap();
        for cut in [0, 1, 5, body.len() - 1] {
            assert!(decode(&body[..cut]).is_err(), "cut at {cut} must fail");
        }
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut body = encode_body(&envelope()).unwrap();
        body.push(0xFF);
        assert_eq!(decode_body(&body), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn garbage_is_an_error_not_a_panic() {
        assert!(decode(&[0xFF, 0x00, 0x13]).is_err());
        assert!(decode(&[]).is_err());
    }

    fn codec_config(enabled: bool) -> CodecConfig {
        CodecConfig {
            enabled,
            auto_register: true,
            compatibility_level: "BACKWARD".into(),
            subject_strategy: SubjectStrategy::TopicName,
        }
    }

    #[tokio::test]
    async fn encode_prefixes_after_registration() {
        let registry = Arc::new(MemoryRegistry::new("BACKWARD"));
        let codec = TradeCodec::new(codec_config(true), registry.clone());

        let bytes = codec.encode("trades.raw", &envelope()).await.unwrap();
        assert_eq!(bytes[0], SCHEMA_MAGIC);
        let (decoded, id) = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, envelope());
        let id = id.unwrap();
        assert_eq!(
            registry.fetch(id).await.unwrap(),
            Some(TRADE_DESCRIPTOR.to_string())
        );

        // Second encode hits the cache and reuses the id.
        let again = codec.encode("trades.raw", &envelope()).await.unwrap();
        assert_eq!(&again[1..5], &id.to_be_bytes());
    }

    #[tokio::test]
    async fn disabled_codec_emits_raw() {
        let registry = Arc::new(MemoryRegistry::new("BACKWARD"));
        let codec = TradeCodec::new(codec_config(false), registry);
        let bytes = codec.encode("trades.raw", &envelope()).await.unwrap();
        assert_eq!(bytes[0], BODY_VERSION);
    }

    struct DownRegistry;

    #[async_trait]
    impl SchemaRegistry for DownRegistry {
        async fn register(&self, _: &str, _: &str) -> Result<u32, RegistryError> {
            Err(RegistryError::Unavailable("down".into()))
        }
        async fn fetch(&self, _: u32) -> Result<Option<String>, RegistryError> {
            Err(RegistryError::Unavailable("down".into()))
        }
        async fn latest(&self, _: &str) -> Result<Option<(u32, String)>, RegistryError> {
            Err(RegistryError::Unavailable("down".into()))
        }
        async fn check_compatibility(&self, _: &str, _: &str) -> Result<bool, RegistryError> {
            Err(RegistryError::Unavailable("down".into()))
        }
        async fn set_compatibility(&self, _: &str, _: &str) -> Result<(), RegistryError> {
            Err(RegistryError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn registry_outage_still_emits_raw_shape() {
        let codec = TradeCodec::new(codec_config(true), Arc::new(DownRegistry));
        let bytes = codec.encode("trades.raw", &envelope()).await.unwrap();
        assert_eq!(bytes[0], BODY_VERSION);
        let (decoded, id) = decode(&bytes).unwrap();
        assert_eq!(decoded, envelope());
        assert_eq!(id, None);
    }
}
