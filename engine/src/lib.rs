//! # Vesper engine crate
//!
//! The shared transposition table, per-worker search state and the
//! evaluation driver sitting on top of the board and network crates.

pub mod eval;
pub mod memory;
pub mod thread;
pub mod tt;
pub mod types;

pub use thread::{SearchWorker, ThreadPool};
pub use tt::{TTData, TTWriter, TranspositionTable};
pub use types::*;
