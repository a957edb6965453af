//! Happens-before dynamic data-race detection engine.
//!
//! This crate is the detector core: vector clocks, shadow memory, the
//! synchronization object table, per-thread event ingestion, and the race
//! collector. It does not instrument anything itself — it is driven by an
//! external binary-instrumentation front end through [`engine::Engine`],
//! the detector contract's Rust-side implementation.

pub mod annotations;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod race;
pub mod resolver;
pub mod shadow;
pub mod sink;
pub mod sync_table;
pub mod thread_state;

pub use clock::VectorClock;
pub use config::Config;
pub use engine::{Engine, Tls};
pub use error::DetectorError;
pub use race::{AccessSnapshot, FinalizeSummary, Race, RaceCollector};
pub use sink::Sink;
pub use thread_state::{MemRef, ThreadId, ThreadState};
