//! Latency-sensitive consumer path: in-memory positions, mark
//! waterfall, throttled P&L snapshot publishing.

pub mod engine;
pub mod marks;
pub mod positions;

pub use engine::{HotPathEngine, HotStats};
pub use marks::PriceWaterfall;
pub use positions::{Position, PositionStore};
