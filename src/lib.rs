//! tapeline - end-of-day trade burst pipeline
//!
//! Exposes the engines and primitives for the binary and the
//! integration suite. The binary wires everything in `main.rs`;
//! everything here is handle-passing, no ambient state.

pub mod breaker;
pub mod codec;
pub mod coldpath;
pub mod config;
pub mod dlq;
pub mod hotpath;
pub mod ingest;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod transport;

pub use config::Config;
pub use pipeline::Pipeline;
