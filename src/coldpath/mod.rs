//! Correctness-sensitive consumer path: reference enrichment and
//! durable idempotent persistence for regulatory audit.

pub mod engine;
pub mod refdata;
pub mod trade_store;

pub use engine::{ColdPathEngine, ColdStats};
pub use refdata::{RefDataCache, RefDataSource, StaticRefData};
pub use trade_store::{FlushMode, FlushOutcome, TradeStore};
