//! # Vesper NNUE crate
//!
//! Efficiently updatable network evaluation: parameter blocks, the
//! incremental accumulator stacks with their per-king-square refresh
//! cache, and the SIMD kernels that drive both.

pub mod accumulator;
pub mod cache;
pub mod features;
pub mod network;
pub mod params;
pub mod simd;
pub mod utils;

pub use accumulator::{Accumulator, BigAccumulator, SmallAccumulator};
pub use cache::AccumulatorCaches;
pub use network::{BigNetwork, NetworkError, Networks, SmallNetwork};
pub use params::{L1_BIG, L1_SMALL, LAYER_STACKS, PSQT_BUCKETS};
