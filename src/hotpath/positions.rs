//! Position Store
//!
//! Thread-safe map of (trader, symbol) -> position, striped so updates
//! to distinct keys do not contend. Updates to one key serialize on its
//! stripe; readers get value snapshots, never live references. Entries
//! are never deleted during a session (the universe is bounded by the
//! day's traded symbols).
//!
//! P&L is average-cost: `cost_basis_mantissa` carries the signed
//! notional of the open position, closing trades relieve it
//! proportionally, and `unrealized = net * mark - basis`. Arithmetic
//! runs in i128 and lands in i64 fields; a day of realistic notionals
//! stays far inside the narrow range.

use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;

use crate::models::{MarkSource, TradeEnvelope};

const STRIPES: usize = 16;

type PosKey = (String, String);

/// One position value. Cloned out on every read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub trader_id: String,
    pub symbol: String,
    pub net_quantity: i64,
    pub cost_basis_mantissa: i64,
    pub realized_pnl_mantissa: i64,
    pub trade_count: u64,
    /// Monotonic nanoseconds of the last applied trade.
    pub last_update_tick: u64,
    pub mark_price_mantissa: i64,
    pub mark_source: MarkSource,
}

impl Position {
    fn new(trader_id: &str, symbol: &str) -> Self {
        Self {
            trader_id: trader_id.to_string(),
            symbol: symbol.to_string(),
            net_quantity: 0,
            cost_basis_mantissa: 0,
            realized_pnl_mantissa: 0,
            trade_count: 0,
            last_update_tick: 0,
            mark_price_mantissa: 0,
            mark_source: MarkSource::Unknown,
        }
    }

    /// Mark-to-market of the open quantity at the recorded mark.
    pub fn unrealized_pnl_mantissa(&self) -> i64 {
        if self.net_quantity == 0 || self.mark_source == MarkSource::Unknown {
            return 0;
        }
        let unrealized = self.net_quantity as i128 * self.mark_price_mantissa as i128
            - self.cost_basis_mantissa as i128;
        unrealized as i64
    }

    fn apply(&mut self, env: &TradeEnvelope, tick: u64) {
        let net = self.net_quantity as i128;
        let q = env.signed_quantity() as i128;
        let p = env.price_mantissa as i128;
        let basis = self.cost_basis_mantissa as i128;

        if net == 0 || (net > 0) == (q > 0) || q == 0 {
            // Opening or increasing.
            self.cost_basis_mantissa = (basis + env.notional_mantissa()) as i64;
        } else {
            let closing = q.abs().min(net.abs());
            let relief = basis * closing / net.abs();
            // Long closes sell at p, short closes buy at p; both collapse
            // to proceeds-minus-relief once the signs are carried through.
            let realized = closing * p * net.signum() - relief;
            self.realized_pnl_mantissa =
                (self.realized_pnl_mantissa as i128 + realized) as i64;

            // Past the flat point the residue opens a new position at p.
            let crossed = q.abs() > net.abs();
            self.cost_basis_mantissa = if crossed {
                ((q + net) * p) as i64
            } else {
                (basis - relief) as i64
            };
        }

        self.net_quantity = (net + q) as i64;
        self.trade_count += 1;
        self.last_update_tick = tick;
    }
}

// =============================================================================
// STORE
// =============================================================================

pub struct PositionStore {
    stripes: Vec<RwLock<HashMap<PosKey, Position>>>,
    /// trader -> traded symbols, maintained on first creation.
    by_trader: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl PositionStore {
    pub fn new() -> Self {
        Self {
            stripes: (0..STRIPES).map(|_| RwLock::new(HashMap::new())).collect(),
            by_trader: RwLock::new(HashMap::new()),
        }
    }

    fn stripe(&self, key: &PosKey) -> &RwLock<HashMap<PosKey, Position>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() % STRIPES as u64) as usize]
    }

    /// Apply one execution and return the updated value. Infallible: an
    /// absent entry is created.
    pub fn apply_trade(&self, env: &TradeEnvelope, tick: u64) -> Position {
        let key = env.position_key();
        let (snapshot, created) = {
            let mut map = self.stripe(&key).write();
            let created = !map.contains_key(&key);
            let position = map
                .entry(key.clone())
                .or_insert_with(|| Position::new(&env.trader_id, &env.symbol));
            position.apply(env, tick);
            (position.clone(), created)
        };
        if created {
            // Index write happens outside the stripe lock; lock order
            // with readers stays single-level.
            self.by_trader
                .write()
                .entry(env.trader_id.clone())
                .or_default()
                .insert(env.symbol.clone());
        }
        snapshot
    }

    /// Record the mark used for the latest valuation of one key.
    pub fn set_mark(
        &self,
        trader_id: &str,
        symbol: &str,
        price: i64,
        source: MarkSource,
    ) -> Option<Position> {
        let key = (trader_id.to_string(), symbol.to_string());
        let mut map = self.stripe(&key).write();
        let position = map.get_mut(&key)?;
        position.mark_price_mantissa = price;
        position.mark_source = source;
        Some(position.clone())
    }

    pub fn get(&self, trader_id: &str, symbol: &str) -> Option<Position> {
        let key = (trader_id.to_string(), symbol.to_string());
        self.stripe(&key).read().get(&key).cloned()
    }

    /// Snapshot of every position. Order is unspecified.
    pub fn all(&self) -> Vec<Position> {
        self.stripes
            .iter()
            .flat_map(|s| s.read().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Snapshot of one trader's positions, in symbol order.
    pub fn for_trader(&self, trader_id: &str) -> Vec<Position> {
        let symbols: Vec<String> = self
            .by_trader
            .read()
            .get(trader_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        symbols
            .into_iter()
            .filter_map(|symbol| self.get(trader_id, &symbol))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.stripes.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PositionStore {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;

    fn env(exec: &str, trader: &str, symbol: &str, side: Side, qty: i64, px: i64) -> TradeEnvelope {
        TradeEnvelope {
            exec_id: exec.into(),
            order_id: String::new(),
            client_order_id: String::new(),
            symbol: symbol.into(),
            side,
            quantity: qty,
            price_mantissa: px,
            trader_id: trader.into(),
            account: String::new(),
            strategy_code: String::new(),
            exchange: String::new(),
            receive_timestamp: 0,
            gateway_timestamp: 0,
            exec_timestamp: 0,
            raw_frame: Vec::new(),
            gateway_id: String::new(),
        }
    }

    const PX_150: i64 = 15_000_000_000;
    const PX_151: i64 = 15_100_000_000;
    const PX_149: i64 = 14_900_000_000;

    #[test]
    fn buy_then_sell_nets_out() {
        let store = PositionStore::new();
        store.apply_trade(&env("E1", "T1", "AAPL", Side::Buy, 100, PX_150), 1);
        let p = store.apply_trade(&env("E2", "T1", "AAPL", Side::Sell, 30, PX_151), 2);
        assert_eq!(p.net_quantity, 70);
        assert_eq!(p.trade_count, 2);
        assert_eq!(p.last_update_tick, 2);
        // Sold 30 bought at 150 for 151: 30 * 1.00 realized.
        assert_eq!(p.realized_pnl_mantissa, 30 * (PX_151 - PX_150));
        // Remaining basis is 70 shares at 150.
        assert_eq!(p.cost_basis_mantissa, 70 * PX_150);
    }

    #[test]
    fn short_position_realizes_on_cover() {
        let store = PositionStore::new();
        store.apply_trade(&env("E1", "T1", "MSFT", Side::SellShort, 100, PX_150), 1);
        let p = store.get("T1", "MSFT").unwrap();
        assert_eq!(p.net_quantity, -100);
        assert_eq!(p.cost_basis_mantissa, -100 * PX_150);

        let p = store.apply_trade(&env("E2", "T1", "MSFT", Side::Buy, 40, PX_149), 2);
        assert_eq!(p.net_quantity, -60);
        // Covered 40 shorted at 150 for 149: 40 * 1.00 realized.
        assert_eq!(p.realized_pnl_mantissa, 40 * (PX_150 - PX_149));
        assert_eq!(p.cost_basis_mantissa, -60 * PX_150);
    }

    #[test]
    fn crossing_zero_opens_new_basis() {
        let store = PositionStore::new();
        store.apply_trade(&env("E1", "T1", "AAPL", Side::Buy, 50, PX_150), 1);
        let p = store.apply_trade(&env("E2", "T1", "AAPL", Side::Sell, 80, PX_151), 2);
        assert_eq!(p.net_quantity, -30);
        // 50 closed with 1.00 gain; 30 opened short at 151.
        assert_eq!(p.realized_pnl_mantissa, 50 * (PX_151 - PX_150));
        assert_eq!(p.cost_basis_mantissa, -30 * PX_151);
    }

    #[test]
    fn net_equals_signed_sum() {
        let store = PositionStore::new();
        let trades = [
            (Side::Buy, 100),
            (Side::Sell, 40),
            (Side::Buy, 25),
            (Side::SellShort, 110),
            (Side::Buy, 5),
        ];
        let mut expected = 0i64;
        for (i, (side, qty)) in trades.iter().enumerate() {
            expected += side.sign() * qty;
            store.apply_trade(
                &env(&format!("E{i}"), "T9", "TSLA", *side, *qty, PX_150),
                i as u64,
            );
        }
        assert_eq!(store.get("T9", "TSLA").unwrap().net_quantity, expected);
        assert_eq!(store.get("T9", "TSLA").unwrap().trade_count, 5);
    }

    #[test]
    fn unrealized_uses_mark_minus_basis() {
        let store = PositionStore::new();
        store.apply_trade(&env("E1", "T1", "AAPL", Side::Buy, 100, PX_150), 1);
        let p = store
            .set_mark("T1", "AAPL", PX_151, MarkSource::Ltp)
            .unwrap();
        assert_eq!(p.unrealized_pnl_mantissa(), 100 * (PX_151 - PX_150));

        // Unknown mark values to zero, not to a misleading number.
        let store2 = PositionStore::new();
        store2.apply_trade(&env("E1", "T1", "AAPL", Side::Buy, 100, PX_150), 1);
        assert_eq!(store2.get("T1", "AAPL").unwrap().unrealized_pnl_mantissa(), 0);
    }

    #[test]
    fn trader_index_and_iteration() {
        let store = PositionStore::new();
        store.apply_trade(&env("E1", "T1", "AAPL", Side::Buy, 1, PX_150), 1);
        store.apply_trade(&env("E2", "T1", "MSFT", Side::Buy, 2, PX_150), 2);
        store.apply_trade(&env("E3", "T2", "AAPL", Side::Buy, 3, PX_150), 3);

        let t1 = store.for_trader("T1");
        assert_eq!(t1.len(), 2);
        assert_eq!(t1[0].symbol, "AAPL");
        assert_eq!(t1[1].symbol, "MSFT");
        assert!(store.for_trader("T3").is_empty());
        assert_eq!(store.all().len(), 3);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn distinct_keys_do_not_interfere() {
        let store = PositionStore::new();
        store.apply_trade(&env("E1", "T1", "AAPL", Side::Buy, 10, PX_150), 1);
        store.apply_trade(&env("E2", "T2", "AAPL", Side::Sell, 10, PX_150), 1);
        assert_eq!(store.get("T1", "AAPL").unwrap().net_quantity, 10);
        assert_eq!(store.get("T2", "AAPL").unwrap().net_quantity, -10);
    }
}
