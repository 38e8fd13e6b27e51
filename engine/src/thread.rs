//! Worker threads and their private evaluation state.
//!
//! Each worker owns its accumulator stacks and refresh caches; nothing in
//! here is shared. The pool holds the workers, the cooperative stop flag
//! and the thread count the transposition table partitions its clears by.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chess::Board;
use nnue::{AccumulatorCaches, BigAccumulator, Networks, SmallAccumulator};

use crate::types::Value;

/******************************************\
|==========================================|
|              Search Worker               |
|==========================================|
\******************************************/

/// Thread-local search state: both networks' accumulator stacks and their
/// refresh caches.
pub struct SearchWorker {
    pub id: usize,
    pub big: BigAccumulator,
    pub small: SmallAccumulator,
    pub caches: AccumulatorCaches,
    pub nodes: u64,
}

impl SearchWorker {
    pub fn new(id: usize, networks: &Networks) -> Self {
        Self {
            id,
            big: BigAccumulator::new(),
            small: SmallAccumulator::new(),
            caches: AccumulatorCaches::new(networks),
            nodes: 0,
        }
    }

    /// Fresh state for a new root search
    pub fn reset(&mut self, networks: &Networks) {
        self.big.reset();
        self.small.reset();
        self.caches.clear(networks);
        self.nodes = 0;
    }

    /// Advances the accumulators by the move just made on `pos`.
    pub fn push(&mut self, pos: &Board) {
        self.big.push(pos.dirty_piece(), pos.dirty_threats());
        self.small.push(pos.dirty_piece());
    }

    /// Retracts one ply.
    pub fn pop(&mut self) {
        self.big.pop();
        self.small.pop();
    }

    pub fn evaluate(&mut self, pos: &Board, networks: &Networks) -> Value {
        crate::eval::evaluate(pos, networks, self)
    }
}

/******************************************\
|==========================================|
|               Thread Pool                |
|==========================================|
\******************************************/

/// Fixed set of workers plus the shared stop flag. The pool's size is
/// also what the transposition table partitions parallel clears by.
pub struct ThreadPool {
    workers: Vec<SearchWorker>,
    stop: Arc<AtomicBool>,
}

impl ThreadPool {
    pub fn new(threads: usize, networks: &Networks) -> Self {
        let threads = threads.max(1);
        Self {
            workers: (0..threads).map(|id| SearchWorker::new(id, networks)).collect(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Re-sizes the pool, rebuilding every worker.
    pub fn set(&mut self, threads: usize, networks: &Networks) {
        let threads = threads.max(1);
        self.workers = (0..threads).map(|id| SearchWorker::new(id, networks)).collect();
    }

    #[inline]
    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    pub fn worker(&mut self, idx: usize) -> &mut SearchWorker {
        &mut self.workers[idx]
    }

    pub fn main_worker(&mut self) -> &mut SearchWorker {
        &mut self.workers[0]
    }

    /// Resets every worker ahead of a root search.
    pub fn new_search(&mut self, networks: &Networks) {
        self.clear_stop();
        for worker in self.workers.iter_mut() {
            worker.reset(networks);
        }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn clear_stop(&self) {
        self.stop.store(false, Ordering::Relaxed);
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

/******************************************\
|==========================================|
|                Unit Tests                |
|==========================================|
\******************************************/

#[cfg(test)]
mod tests {
    use super::*;
    use chess::utils::PRNG;
    use chess::{Move, MoveFlag, Square};

    #[test]
    fn test_pool_sizing() {
        let networks = Networks::zeroed();
        let mut pool = ThreadPool::new(0, &networks);
        assert_eq!(pool.num_threads(), 1, "pool never drops below one worker");
        pool.set(4, &networks);
        assert_eq!(pool.num_threads(), 4);
        assert_eq!(pool.worker(3).id, 3);
    }

    #[test]
    fn test_stop_flag() {
        let networks = Networks::zeroed();
        let pool = ThreadPool::new(1, &networks);
        assert!(!pool.should_stop());
        pool.request_stop();
        assert!(pool.should_stop());
        pool.clear_stop();
        assert!(!pool.should_stop());
    }

    #[test]
    fn test_zeroed_networks_evaluate_to_zero() {
        let networks = Networks::zeroed();
        let mut worker = SearchWorker::new(0, &networks);
        let board = Board::default();
        assert_eq!(worker.evaluate(&board, &networks), 0);
    }

    #[test]
    fn test_incremental_evaluate_matches_fresh_worker() {
        // Random small network; a queen-up position keeps the driver on
        // the small net. The incrementally-updated worker must agree with
        // a fresh worker evaluating the final position from scratch.
        let mut networks = Networks::zeroed();
        let mut rng = PRNG::new(0xABCD);
        for w in networks.small.ft.biases.0.iter_mut() {
            *w = (rng.random_u64() % 121) as i16 - 60;
        }
        for w in networks.small.ft.weights.iter_mut() {
            *w = (rng.random_u64() % 61) as i16 - 30;
        }
        for w in networks.small.ft.psqt_weights.iter_mut() {
            *w = (rng.random_u64() % 2001) as i32 - 1000;
        }
        for head in networks.small.heads.iter_mut() {
            for w in head.l1.weights.iter_mut() {
                *w = rng.random_u64() as i8;
            }
        }

        let mut board = Board::from_fen("k6r/8/8/8/8/8/Q7/K6R w - - 0 1").unwrap();
        let mut worker = SearchWorker::new(0, &networks);
        let _ = worker.evaluate(&board, &networks);

        for (from, to, flag) in [
            (Square::A2, Square::E6, MoveFlag::QuietMove),
            (Square::H8, Square::H4, MoveFlag::QuietMove),
            (Square::A1, Square::B2, MoveFlag::QuietMove),
        ] {
            board.make_move(Move::new(from, to, flag));
            worker.push(&board);
        }

        let incremental = worker.evaluate(&board, &networks);

        let mut fresh = SearchWorker::new(1, &networks);
        let from_scratch = fresh.evaluate(&board, &networks);

        assert_eq!(incremental, from_scratch);
    }
}
