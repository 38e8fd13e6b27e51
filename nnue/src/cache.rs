//! Per-king-square refresh cache ("Finny tables").
//!
//! When a perspective cannot be updated incrementally (its king moved),
//! the cache entry for the new king square already holds an accumulation
//! for some earlier piece placement. Diffing the stored placement against
//! the live board turns a ~32-feature rebuild into a handful of rows.

use chess::{Bitboard, Board, Colour, Piece, Square};

use crate::{
    accumulator::HalfKaState,
    features::{HalfKa, IndexList},
    network::Networks,
    params::{FeatureTransformer, L1_BIG, L1_SMALL, PSQT_BUCKETS},
    simd,
    utils::Align64,
};

/******************************************\
|==========================================|
|               Cache Entry                |
|==========================================|
\******************************************/

/// Snapshot of a piece placement and its accumulation, keyed by
/// (king square, perspective).
///
/// Invariant: `accumulation` equals biases plus the weight rows of every
/// feature implied by (`pieces`, the entry's king square, perspective).
#[derive(Clone)]
pub struct CacheEntry<const N: usize> {
    pub accumulation: Align64<[i16; N]>,
    pub psqt: Align64<[i32; PSQT_BUCKETS]>,
    pub pieces: [Option<Piece>; Square::NUM],
    pub piece_bb: Bitboard,
}

impl<const N: usize> CacheEntry<N> {
    /// Empty board: the accumulation is exactly the biases.
    fn clear(&mut self, biases: &Align64<[i16; N]>) {
        self.accumulation = *biases;
        self.psqt = Align64([0; PSQT_BUCKETS]);
        self.pieces = [None; Square::NUM];
        self.piece_bb = Bitboard::EMPTY;
    }
}

/******************************************\
|==========================================|
|                  Cache                   |
|==========================================|
\******************************************/

/// One entry per (king square, perspective) pair.
pub struct Cache<const N: usize> {
    entries: Vec<[CacheEntry<N>; 2]>,
}

impl<const N: usize> Cache<N> {
    pub fn new(biases: &Align64<[i16; N]>) -> Self {
        let template = CacheEntry {
            accumulation: *biases,
            psqt: Align64([0; PSQT_BUCKETS]),
            pieces: [None; Square::NUM],
            piece_bb: Bitboard::EMPTY,
        };
        Self {
            entries: (0..Square::NUM)
                .map(|_| [template.clone(), template.clone()])
                .collect(),
        }
    }

    pub fn clear(&mut self, biases: &Align64<[i16; N]>) {
        for pair in self.entries.iter_mut() {
            for entry in pair.iter_mut() {
                entry.clear(biases);
            }
        }
    }

    pub fn entry(&self, ksq: Square, perspective: Colour) -> &CacheEntry<N> {
        &self.entries[ksq.index()][perspective.index()]
    }

    /// Refreshes `state`'s accumulation for `perspective` through the
    /// cache: apply the placement diff to the snapshot, copy the snapshot
    /// into the live accumulator, then overwrite the stored placement.
    pub fn refresh(
        &mut self,
        perspective: Colour,
        pos: &Board,
        ft: &FeatureTransformer<N>,
        state: &mut HalfKaState<N>,
    ) {
        let pi = perspective.index();
        let ksq = pos.king_square(perspective);
        let entry = &mut self.entries[ksq.index()][pi];
        let board_pieces = pos.piece_array();

        let mut removed = IndexList::new();
        let mut added = IndexList::new();

        let mut changed = Bitboard::EMPTY;
        for sq in Square::iter() {
            if entry.pieces[sq.index()] != board_pieces[sq.index()] {
                changed.set(sq);
            }
        }

        for sq in changed & entry.piece_bb {
            let piece = entry.pieces[sq.index()].expect("stale entry square is empty");
            removed.push(HalfKa::make_index(perspective, sq, piece, ksq));
        }
        for sq in changed & pos.all_occupied() {
            let piece = board_pieces[sq.index()].expect("occupied square is empty");
            added.push(HalfKa::make_index(perspective, sq, piece, ksq));
        }

        simd::update_in_place_i16(
            &mut entry.accumulation,
            &ft.weights,
            removed.as_slice(),
            added.as_slice(),
        );
        simd::update_in_place_i32(
            &mut entry.psqt,
            &ft.psqt_weights,
            removed.as_slice(),
            added.as_slice(),
        );

        entry.pieces = *board_pieces;
        entry.piece_bb = pos.all_occupied();

        state.acc.accumulation[pi] = entry.accumulation;
        state.acc.psqt[pi] = entry.psqt;
        state.acc.computed[pi] = true;
    }
}

/******************************************\
|==========================================|
|             Per-worker Caches            |
|==========================================|
\******************************************/

/// Both networks' refresh caches, owned by one worker thread.
pub struct AccumulatorCaches {
    pub big: Cache<L1_BIG>,
    pub small: Cache<L1_SMALL>,
}

impl AccumulatorCaches {
    pub fn new(networks: &Networks) -> Self {
        Self {
            big: Cache::new(&networks.big.ft.biases),
            small: Cache::new(&networks.small.ft.biases),
        }
    }

    pub fn clear(&mut self, networks: &Networks) {
        self.big.clear(&networks.big.ft.biases);
        self.small.clear(&networks.small.ft.biases);
    }
}
