//! Raw Wire Frame
//!
//! The gateway feed delivers tag=value frames: ASCII fields separated by
//! SOH (0x01), closed by a checksum trailer. The ingestion engine treats
//! the format as validate-then-forward: it checks the trailer and scans
//! out only the fields the envelope needs, without a structural parse.
//! Anything it cannot find defaults to empty; downstream validation
//! decides what is fatal.
//!
//! ```text
//! 17=E1|37=O1|11=C1|55=AAPL|54=1|32=100|31=150.50|448=T1|1=ACC|847=VWAP|207=XNAS|60=1700000000000|10=9A0B1C2D|
//! ```
//! (`|` shown for SOH). The trailer value is the CRC32 of every byte up
//! to and including the SOH before `10=`.

use crate::models::{Side, TradeEnvelope};

/// Field separator.
pub const SOH: u8 = 0x01;

/// Tag numbers scanned from the body.
pub mod tags {
    pub const EXEC_ID: &str = "17";
    pub const ORDER_ID: &str = "37";
    pub const CLIENT_ORDER_ID: &str = "11";
    pub const SYMBOL: &str = "55";
    pub const SIDE: &str = "54";
    pub const QUANTITY: &str = "32";
    pub const PRICE: &str = "31";
    pub const TRADER_ID: &str = "448";
    pub const ACCOUNT: &str = "1";
    pub const STRATEGY: &str = "847";
    pub const EXCHANGE: &str = "207";
    pub const EXEC_TS: &str = "60";
    pub const CHECKSUM: &str = "10";
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    Empty,
    MissingChecksum,
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty frame"),
            Self::MissingChecksum => write!(f, "missing checksum trailer"),
            Self::ChecksumMismatch { expected, actual } => write!(
                f,
                "checksum mismatch: trailer {expected:08X}, computed {actual:08X}"
            ),
        }
    }
}

impl std::error::Error for FrameError {}

// =============================================================================
// VALIDATION
// =============================================================================

/// Validate the trailer and return the body slice (trailer excluded).
pub fn verify(frame: &[u8]) -> Result<&[u8], FrameError> {
    if frame.is_empty() {
        return Err(FrameError::Empty);
    }
    // The trailer is the final field: "10=XXXXXXXX" + SOH.
    let trimmed = match frame.last() {
        Some(&SOH) => &frame[..frame.len() - 1],
        _ => frame,
    };
    let trailer_start = trimmed
        .iter()
        .rposition(|&b| b == SOH)
        .map(|p| p + 1)
        .unwrap_or(0);
    let trailer = &trimmed[trailer_start..];
    if !trailer.starts_with(b"10=") {
        return Err(FrameError::MissingChecksum);
    }
    let expected = std::str::from_utf8(&trailer[3..])
        .ok()
        .and_then(|s| u32::from_str_radix(s, 16).ok())
        .ok_or(FrameError::MissingChecksum)?;

    let body = &frame[..trailer_start];
    let actual = crc32fast::hash(body);
    if actual != expected {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }
    Ok(body)
}

// =============================================================================
// MINIMAL SCAN
// =============================================================================

/// Fields the envelope needs, scanned out of a validated body. Absent
/// tags stay at their defaults.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FrameFields {
    pub exec_id: String,
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: i64,
    pub price_mantissa: i64,
    pub trader_id: String,
    pub account: String,
    pub strategy_code: String,
    pub exchange: String,
    pub exec_timestamp: i64,
}

/// Single pass over the body; no allocation beyond the captured values.
pub fn scan(body: &[u8]) -> FrameFields {
    let mut out = FrameFields::default();
    for field in body.split(|&b| b == SOH) {
        if field.is_empty() {
            continue;
        }
        let Some(eq) = field.iter().position(|&b| b == b'=') else {
            continue;
        };
        let (tag, value) = (&field[..eq], &field[eq + 1..]);
        let Ok(tag) = std::str::from_utf8(tag) else {
            continue;
        };
        let Ok(value) = std::str::from_utf8(value) else {
            continue;
        };
        match tag {
            tags::EXEC_ID => out.exec_id = value.to_string(),
            tags::ORDER_ID => out.order_id = value.to_string(),
            tags::CLIENT_ORDER_ID => out.client_order_id = value.to_string(),
            tags::SYMBOL => out.symbol = value.to_string(),
            tags::SIDE => {
                out.side = Side::from_wire(value.parse::<u8>().unwrap_or(0));
            }
            tags::QUANTITY => out.quantity = value.parse().unwrap_or(0),
            tags::PRICE => out.price_mantissa = parse_price_mantissa(value).unwrap_or(0),
            tags::TRADER_ID => out.trader_id = value.to_string(),
            tags::ACCOUNT => out.account = value.to_string(),
            tags::STRATEGY => out.strategy_code = value.to_string(),
            tags::EXCHANGE => out.exchange = value.to_string(),
            tags::EXEC_TS => out.exec_timestamp = value.parse().unwrap_or(0),
            _ => {}
        }
    }
    out
}

/// Decimal price string to a 1e-8 mantissa without going through f64.
pub fn parse_price_mantissa(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1i64, rest),
        None => (1i64, s),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    let int_val: i64 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().ok()?
    };
    // Pad or truncate the fraction to exactly 8 digits.
    let mut frac_val: i64 = 0;
    for i in 0..8 {
        let d = frac_part.as_bytes().get(i).copied().unwrap_or(b'0');
        if !d.is_ascii_digit() {
            return None;
        }
        frac_val = frac_val * 10 + (d - b'0') as i64;
    }
    Some(sign * (int_val.checked_mul(crate::models::PRICE_SCALE)? + frac_val))
}

impl FrameFields {
    /// Promote to a canonical envelope with gateway-side stamps.
    pub fn into_envelope(
        self,
        raw_frame: Vec<u8>,
        receive_timestamp: u64,
        gateway_timestamp: i64,
        gateway_id: String,
    ) -> TradeEnvelope {
        TradeEnvelope {
            exec_id: self.exec_id,
            order_id: self.order_id,
            client_order_id: self.client_order_id,
            symbol: self.symbol,
            side: self.side,
            quantity: self.quantity,
            price_mantissa: self.price_mantissa,
            trader_id: self.trader_id,
            account: self.account,
            strategy_code: self.strategy_code,
            exchange: self.exchange,
            receive_timestamp,
            gateway_timestamp,
            exec_timestamp: self.exec_timestamp,
            raw_frame,
            gateway_id,
        }
    }
}

// =============================================================================
// FRAME CONSTRUCTION (replay / test tooling)
// =============================================================================

/// Build a checksummed frame from fields. The production inlet receives
/// frames from the gateway; this exists for replay tooling and tests.
pub fn build(fields: &FrameFields) -> Vec<u8> {
    let mut body = Vec::with_capacity(128);
    let mut push = |tag: &str, value: &str| {
        if !value.is_empty() {
            body.extend_from_slice(tag.as_bytes());
            body.push(b'=');
            body.extend_from_slice(value.as_bytes());
            body.push(SOH);
        }
    };
    push(tags::EXEC_ID, &fields.exec_id);
    push(tags::ORDER_ID, &fields.order_id);
    push(tags::CLIENT_ORDER_ID, &fields.client_order_id);
    push(tags::SYMBOL, &fields.symbol);
    push(tags::SIDE, &fields.side.to_wire().to_string());
    push(tags::QUANTITY, &fields.quantity.to_string());
    push(tags::PRICE, &format_price(fields.price_mantissa));
    push(tags::TRADER_ID, &fields.trader_id);
    push(tags::ACCOUNT, &fields.account);
    push(tags::STRATEGY, &fields.strategy_code);
    push(tags::EXCHANGE, &fields.exchange);
    push(tags::EXEC_TS, &fields.exec_timestamp.to_string());

    let checksum = crc32fast::hash(&body);
    let mut frame = body;
    frame.extend_from_slice(format!("10={checksum:08X}").as_bytes());
    frame.push(SOH);
    frame
}

fn format_price(mantissa: i64) -> String {
    let sign = if mantissa < 0 { "-" } else { "" };
    let abs = mantissa.unsigned_abs();
    format!(
        "{sign}{}.{:08}",
        abs / crate::models::PRICE_SCALE as u64,
        abs % crate::models::PRICE_SCALE as u64
    )
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> FrameFields {
        FrameFields {
            exec_id: "E1".into(),
            order_id: "O1".into(),
            client_order_id: "C1".into(),
            symbol: "AAPL".into(),
            side: Side::Buy,
            quantity: 100,
            price_mantissa: 15_050_000_000,
            trader_id: "T1".into(),
            account: "ACC".into(),
            strategy_code: "VWAP".into(),
            exchange: "XNAS".into(),
            exec_timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn build_verify_scan_roundtrip() {
        let frame = build(&fields());
        let body = verify(&frame).unwrap();
        let scanned = scan(body);
        assert_eq!(scanned, fields());
    }

    #[test]
    fn corrupted_byte_fails_checksum() {
        let mut frame = build(&fields());
        frame[3] ^= 0x40;
        assert!(matches!(
            verify(&frame),
            Err(FrameError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn missing_trailer_is_rejected() {
        let frame = b"17=E1\x0155=AAPL\x01".to_vec();
        assert_eq!(verify(&frame), Err(FrameError::MissingChecksum));
        assert_eq!(verify(b""), Err(FrameError::Empty));
    }

    #[test]
    fn scan_tolerates_unknown_and_malformed_fields() {
        let mut body = b"99=zzz\x01notag\x0155=MSFT\x0154=junk\x01".to_vec();
        body.extend_from_slice(b"31=abc\x01");
        let scanned = scan(&body);
        assert_eq!(scanned.symbol, "MSFT");
        assert_eq!(scanned.side, Side::Unspecified);
        assert_eq!(scanned.price_mantissa, 0);
        assert_eq!(scanned.exec_id, "");
    }

    #[test]
    fn price_mantissa_parsing() {
        assert_eq!(parse_price_mantissa("150.50"), Some(15_050_000_000));
        assert_eq!(parse_price_mantissa("150"), Some(15_000_000_000));
        assert_eq!(parse_price_mantissa("0.00000001"), Some(1));
        assert_eq!(parse_price_mantissa("-2.5"), Some(-250_000_000));
        assert_eq!(parse_price_mantissa(".5"), Some(50_000_000));
        // More than 8 decimals truncates.
        assert_eq!(parse_price_mantissa("1.123456789"), Some(112_345_678));
        assert_eq!(parse_price_mantissa(""), None);
        assert_eq!(parse_price_mantissa("abc"), None);
    }

    #[test]
    fn price_format_roundtrip() {
        for m in [0, 1, 15_050_000_000, -250_000_000] {
            assert_eq!(parse_price_mantissa(&format_price(m)), Some(m));
        }
    }
}
