//! Per-worker accumulator stacks.
//!
//! Each worker keeps one stack of per-ply accumulator states per feature
//! set. A state is pushed with the move's delta and computed lazily: the
//! cheapest of forward walking, backward walking after a cache refresh, or
//! a full rebuild brings the top of the stack up to date.

use chess::{Board, Colour, DirtyPiece, DirtyThreats};

use crate::{
    cache::Cache,
    features::{HalfKa, IndexList, Threats},
    params::{FeatureTransformer, ThreatTransformer, L1_BIG, L1_SMALL, PSQT_BUCKETS, STACK_SIZE},
    simd,
    utils::Align64,
};

/******************************************\
|==========================================|
|               Accumulator                |
|==========================================|
\******************************************/

/// First-layer state for one ply: a hidden vector and a PSQT vector per
/// perspective, plus the flags saying which perspectives are up to date.
#[derive(Clone)]
pub struct Accumulator<const N: usize> {
    pub accumulation: [Align64<[i16; N]>; 2],
    pub psqt: [Align64<[i32; PSQT_BUCKETS]>; 2],
    pub computed: [bool; 2],
}

impl<const N: usize> Accumulator<N> {
    fn new() -> Self {
        Self {
            accumulation: [Align64([0; N]); 2],
            psqt: [Align64([0; PSQT_BUCKETS]); 2],
            computed: [false; 2],
        }
    }
}

/******************************************\
|==========================================|
|            King-relative Stack           |
|==========================================|
\******************************************/

#[derive(Clone)]
pub struct HalfKaState<const N: usize> {
    pub acc: Accumulator<N>,
    pub diff: DirtyPiece,
}

/// Stack of king-relative accumulator states, one per ply.
pub struct HalfKaStack<const N: usize> {
    states: Vec<HalfKaState<N>>,
    size: usize,
}

impl<const N: usize> HalfKaStack<N> {
    pub fn new() -> Self {
        let states = (0..STACK_SIZE)
            .map(|_| HalfKaState {
                acc: Accumulator::new(),
                diff: DirtyPiece::EMPTY,
            })
            .collect();
        Self { states, size: 1 }
    }

    /// Clears back to a single, uncomputed root entry.
    pub fn reset(&mut self) {
        self.size = 1;
        self.states[0].acc.computed = [false; 2];
        self.states[0].diff = DirtyPiece::EMPTY;
    }

    /// Appends an uncomputed entry carrying the move's delta.
    pub fn push(&mut self, diff: DirtyPiece) {
        debug_assert!(self.size < STACK_SIZE, "accumulator stack overflow");
        let state = &mut self.states[self.size];
        state.diff = diff;
        state.acc.computed = [false; 2];
        self.size += 1;
    }

    /// Drops the top entry. The root entry is never popped.
    pub fn pop(&mut self) {
        debug_assert!(self.size > 1, "cannot pop the root accumulator");
        self.size -= 1;
    }

    #[inline]
    pub fn top(&self) -> &HalfKaState<N> {
        &self.states[self.size - 1]
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub(crate) fn diff_at(&self, idx: usize) -> &DirtyPiece {
        &self.states[idx].diff
    }

    /// Brings both perspectives of the top entry up to date.
    pub fn evaluate(&mut self, pos: &Board, ft: &FeatureTransformer<N>, cache: &mut Cache<N>) {
        for perspective in [Colour::White, Colour::Black] {
            self.evaluate_side(perspective, pos, ft, cache);
        }
    }

    pub(crate) fn evaluate_side(
        &mut self,
        perspective: Colour,
        pos: &Board,
        ft: &FeatureTransformer<N>,
        cache: &mut Cache<N>,
    ) {
        if self.top().acc.computed[perspective.index()] {
            return;
        }

        let last = self.find_last_usable(perspective);
        if self.states[last].acc.computed[perspective.index()] {
            self.forward_update(perspective, pos, ft, last);
        } else {
            cache.refresh(perspective, pos, ft, &mut self.states[self.size - 1]);
            self.backward_update(perspective, pos, ft, last);
        }
    }

    /// Walks back from the top, returning the first entry that is either
    /// already computed or whose delta demands a cache refresh.
    fn find_last_usable(&self, perspective: Colour) -> usize {
        for idx in (1..self.size).rev() {
            if self.states[idx].acc.computed[perspective.index()] {
                return idx;
            }
            if HalfKa::requires_refresh(&self.states[idx].diff, perspective) {
                return idx;
            }
        }
        0
    }

    fn forward_update(
        &mut self,
        perspective: Colour,
        pos: &Board,
        ft: &FeatureTransformer<N>,
        begin: usize,
    ) {
        debug_assert!(self.states[begin].acc.computed[perspective.index()]);
        let ksq = pos.king_square(perspective);

        let mut next = begin + 1;
        while next < self.size {
            if next + 1 < self.size {
                let d1 = self.states[next].diff;
                let d2 = self.states[next + 1].diff;
                // A capture followed by a recapture on the same square
                // fuses into one pass over the weights.
                if let (Some((_, to)), Some((_, cap_sq))) = (d1.to, d2.captured) {
                    if to == cap_sq {
                        self.double_update(perspective, ft, pos, next);
                        next += 2;
                        continue;
                    }
                }
            }
            self.single_update(perspective, ft, ksq, next, true);
            next += 1;
        }
        debug_assert!(self.top().acc.computed[perspective.index()]);
    }

    fn backward_update(
        &mut self,
        perspective: Colour,
        pos: &Board,
        ft: &FeatureTransformer<N>,
        end: usize,
    ) {
        debug_assert!(self.top().acc.computed[perspective.index()]);
        let ksq = pos.king_square(perspective);

        let mut next = self.size as i64 - 2;
        while next >= end as i64 {
            self.single_update(perspective, ft, ksq, next as usize, false);
            next -= 1;
        }
        debug_assert!(self.states[end].acc.computed[perspective.index()]);
    }

    /// One incremental step. Forward computes entry `next` from `next - 1`
    /// using `next`'s delta; backward computes `next` from `next + 1` by
    /// inverting `next + 1`'s delta.
    fn single_update(
        &mut self,
        perspective: Colour,
        ft: &FeatureTransformer<N>,
        ksq: chess::Square,
        next: usize,
        forward: bool,
    ) {
        let pi = perspective.index();
        let mut removed = IndexList::new();
        let mut added = IndexList::new();

        if forward {
            HalfKa::append_changed_indices(
                perspective,
                ksq,
                &self.states[next].diff,
                &mut removed,
                &mut added,
            );
            let (a, b) = self.states.split_at_mut(next);
            apply_halfka(&a[next - 1], &mut b[0], pi, ft, &removed, &added);
        } else {
            HalfKa::append_changed_indices(
                perspective,
                ksq,
                &self.states[next + 1].diff,
                &mut added,
                &mut removed,
            );
            let (a, b) = self.states.split_at_mut(next + 1);
            apply_halfka(&b[0], &mut a[next], pi, ft, &removed, &added);
        }
    }

    fn double_update(
        &mut self,
        perspective: Colour,
        ft: &FeatureTransformer<N>,
        pos: &Board,
        next: usize,
    ) {
        let pi = perspective.index();
        let ksq = pos.king_square(perspective);
        let d1 = self.states[next].diff.without_destination();
        let d2 = self.states[next + 1].diff.without_capture();

        let mut removed = IndexList::new();
        let mut added = IndexList::new();
        HalfKa::append_changed_indices(perspective, ksq, &d1, &mut removed, &mut added);
        HalfKa::append_changed_indices(perspective, ksq, &d2, &mut removed, &mut added);

        debug_assert!(added.len() == 1);
        debug_assert!(removed.len() == 2 || removed.len() == 3);

        let (a, b) = self.states.split_at_mut(next + 1);
        apply_halfka(&a[next - 1], &mut b[0], pi, ft, &removed, &added);
    }
}

fn apply_halfka<const N: usize>(
    from: &HalfKaState<N>,
    to: &mut HalfKaState<N>,
    pi: usize,
    ft: &FeatureTransformer<N>,
    removed: &IndexList,
    added: &IndexList,
) {
    debug_assert!(from.acc.computed[pi]);
    simd::update_i16(
        &from.acc.accumulation[pi],
        &mut to.acc.accumulation[pi],
        &ft.weights,
        removed.as_slice(),
        added.as_slice(),
    );
    simd::update_i32(
        &from.acc.psqt[pi],
        &mut to.acc.psqt[pi],
        &ft.psqt_weights,
        removed.as_slice(),
        added.as_slice(),
    );
    to.acc.computed[pi] = true;
}

/******************************************\
|==========================================|
|               Threat Stack               |
|==========================================|
\******************************************/

#[derive(Clone)]
pub struct ThreatState<const N: usize> {
    pub acc: Accumulator<N>,
    pub diff: DirtyThreats,
}

/// Stack of threat-half accumulator states. No refresh cache exists for
/// this half; a rebuild starts from zero over the active facts.
pub struct ThreatStack<const N: usize> {
    states: Vec<ThreatState<N>>,
    size: usize,
}

impl<const N: usize> ThreatStack<N> {
    pub fn new() -> Self {
        let states = (0..STACK_SIZE)
            .map(|_| ThreatState {
                acc: Accumulator::new(),
                diff: DirtyThreats::default(),
            })
            .collect();
        Self { states, size: 1 }
    }

    pub fn reset(&mut self) {
        self.size = 1;
        self.states[0].acc.computed = [false; 2];
        self.states[0].diff = DirtyThreats::default();
    }

    pub fn push(&mut self, diff: DirtyThreats) {
        debug_assert!(self.size < STACK_SIZE, "accumulator stack overflow");
        let state = &mut self.states[self.size];
        state.diff = diff;
        state.acc.computed = [false; 2];
        self.size += 1;
    }

    pub fn pop(&mut self) {
        debug_assert!(self.size > 1, "cannot pop the root accumulator");
        self.size -= 1;
    }

    #[inline]
    pub fn top(&self) -> &ThreatState<N> {
        &self.states[self.size - 1]
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn evaluate_side(
        &mut self,
        perspective: Colour,
        pos: &Board,
        tt: &ThreatTransformer<N>,
        psq: &HalfKaStack<N>,
    ) {
        if self.top().acc.computed[perspective.index()] {
            return;
        }

        let last = self.find_last_usable(perspective);
        if self.states[last].acc.computed[perspective.index()] {
            self.forward_update(perspective, tt, psq, last);
        } else {
            self.full_refresh(perspective, pos, tt);
            self.backward_update(perspective, tt, last);
        }
    }

    fn find_last_usable(&self, perspective: Colour) -> usize {
        for idx in (1..self.size).rev() {
            if self.states[idx].acc.computed[perspective.index()] {
                return idx;
            }
            if Threats::requires_refresh(&self.states[idx].diff) {
                return idx;
            }
        }
        0
    }

    fn forward_update(
        &mut self,
        perspective: Colour,
        tt: &ThreatTransformer<N>,
        psq: &HalfKaStack<N>,
        begin: usize,
    ) {
        debug_assert!(self.states[begin].acc.computed[perspective.index()]);

        let mut next = begin + 1;
        while next < self.size {
            if next + 1 < self.size {
                // A recapture landing on a square this ply's threat delta
                // already touched fuses with it; overlapping facts cancel.
                if let Some((_, cap_sq)) = psq.diff_at(next + 1).captured {
                    if self.states[next].diff.touched.contains(cap_sq) {
                        self.double_update(perspective, tt, next);
                        next += 2;
                        continue;
                    }
                }
            }
            self.single_update(perspective, tt, next, true);
            next += 1;
        }
        debug_assert!(self.top().acc.computed[perspective.index()]);
    }

    fn backward_update(&mut self, perspective: Colour, tt: &ThreatTransformer<N>, end: usize) {
        debug_assert!(self.top().acc.computed[perspective.index()]);

        let mut next = self.size as i64 - 2;
        while next >= end as i64 {
            self.single_update(perspective, tt, next as usize, false);
            next -= 1;
        }
        debug_assert!(self.states[end].acc.computed[perspective.index()]);
    }

    fn single_update(
        &mut self,
        perspective: Colour,
        tt: &ThreatTransformer<N>,
        next: usize,
        forward: bool,
    ) {
        let pi = perspective.index();
        let mut removed = IndexList::new();
        let mut added = IndexList::new();

        if forward {
            Threats::append_changed_indices(
                perspective,
                &self.states[next].diff,
                &mut removed,
                &mut added,
            );
            let (a, b) = self.states.split_at_mut(next);
            apply_threats(&a[next - 1], &mut b[0], pi, tt, &removed, &added);
        } else {
            Threats::append_changed_indices(
                perspective,
                &self.states[next + 1].diff,
                &mut added,
                &mut removed,
            );
            let (a, b) = self.states.split_at_mut(next + 1);
            apply_threats(&b[0], &mut a[next], pi, tt, &removed, &added);
        }
    }

    fn double_update(&mut self, perspective: Colour, tt: &ThreatTransformer<N>, next: usize) {
        let pi = perspective.index();
        let mut removed = IndexList::new();
        let mut added = IndexList::new();
        Threats::append_fused_indices(
            perspective,
            &self.states[next].diff,
            &self.states[next + 1].diff,
            &mut removed,
            &mut added,
        );

        let (a, b) = self.states.split_at_mut(next + 1);
        apply_threats(&a[next - 1], &mut b[0], pi, tt, &removed, &added);
    }

    fn full_refresh(&mut self, perspective: Colour, pos: &Board, tt: &ThreatTransformer<N>) {
        let pi = perspective.index();
        let mut active = IndexList::new();
        Threats::append_active_indices(perspective, pos, &mut active);

        let top = &mut self.states[self.size - 1];
        simd::refresh_i8w(&mut top.acc.accumulation[pi], &tt.weights, active.as_slice());
        simd::refresh_i32(&mut top.acc.psqt[pi], &tt.psqt_weights, active.as_slice());
        top.acc.computed[pi] = true;
    }
}

fn apply_threats<const N: usize>(
    from: &ThreatState<N>,
    to: &mut ThreatState<N>,
    pi: usize,
    tt: &ThreatTransformer<N>,
    removed: &IndexList,
    added: &IndexList,
) {
    debug_assert!(from.acc.computed[pi]);
    simd::update_i8w(
        &from.acc.accumulation[pi],
        &mut to.acc.accumulation[pi],
        &tt.weights,
        removed.as_slice(),
        added.as_slice(),
    );
    simd::update_i32(
        &from.acc.psqt[pi],
        &mut to.acc.psqt[pi],
        &tt.psqt_weights,
        removed.as_slice(),
        added.as_slice(),
    );
    to.acc.computed[pi] = true;
}

/******************************************\
|==========================================|
|            Network Accumulators          |
|==========================================|
\******************************************/

/// Accumulator state of the big network: a king-relative half and a
/// threat half, updated in lockstep.
pub struct BigAccumulator {
    pub psq: HalfKaStack<L1_BIG>,
    pub threats: ThreatStack<L1_BIG>,
}

impl Default for BigAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl BigAccumulator {
    pub fn new() -> Self {
        Self {
            psq: HalfKaStack::new(),
            threats: ThreatStack::new(),
        }
    }

    pub fn reset(&mut self) {
        self.psq.reset();
        self.threats.reset();
    }

    pub fn push(&mut self, dp: &DirtyPiece, dt: &DirtyThreats) {
        self.psq.push(*dp);
        self.threats.push(*dt);
    }

    pub fn pop(&mut self) {
        self.psq.pop();
        self.threats.pop();
    }

    pub fn evaluate(
        &mut self,
        pos: &Board,
        ft: &FeatureTransformer<L1_BIG>,
        tt: &ThreatTransformer<L1_BIG>,
        cache: &mut Cache<L1_BIG>,
    ) {
        self.psq.evaluate_side(Colour::White, pos, ft, cache);
        self.threats.evaluate_side(Colour::White, pos, tt, &self.psq);
        self.psq.evaluate_side(Colour::Black, pos, ft, cache);
        self.threats.evaluate_side(Colour::Black, pos, tt, &self.psq);
    }
}

/// Accumulator state of the small network: king-relative half only.
pub struct SmallAccumulator {
    pub psq: HalfKaStack<L1_SMALL>,
}

impl Default for SmallAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl SmallAccumulator {
    pub fn new() -> Self {
        Self {
            psq: HalfKaStack::new(),
        }
    }

    pub fn reset(&mut self) {
        self.psq.reset();
    }

    pub fn push(&mut self, dp: &DirtyPiece) {
        self.psq.push(*dp);
    }

    pub fn pop(&mut self) {
        self.psq.pop();
    }

    pub fn evaluate(
        &mut self,
        pos: &Board,
        ft: &FeatureTransformer<L1_SMALL>,
        cache: &mut Cache<L1_SMALL>,
    ) {
        self.psq.evaluate(pos, ft, cache);
    }
}

/******************************************\
|==========================================|
|           Scratch Recomputation          |
|==========================================|
\******************************************/

/// King-relative accumulation rebuilt from biases and the full active
/// feature list. The incremental paths must match this bit for bit.
pub fn scratch_halfka<const N: usize>(
    perspective: Colour,
    pos: &Board,
    ft: &FeatureTransformer<N>,
) -> (Align64<[i16; N]>, Align64<[i32; PSQT_BUCKETS]>) {
    let mut active = IndexList::new();
    HalfKa::append_active_indices(perspective, pos, &mut active);

    let mut acc = *ft.biases;
    let mut psqt = Align64([0; PSQT_BUCKETS]);
    simd::update_in_place_i16(&mut acc, &ft.weights, &[], active.as_slice());
    simd::update_in_place_i32(&mut psqt, &ft.psqt_weights, &[], active.as_slice());
    (acc, psqt)
}

/// Threat-half accumulation rebuilt from zero and the active facts.
pub fn scratch_threats<const N: usize>(
    perspective: Colour,
    pos: &Board,
    tt: &ThreatTransformer<N>,
) -> (Align64<[i16; N]>, Align64<[i32; PSQT_BUCKETS]>) {
    let mut active = IndexList::new();
    Threats::append_active_indices(perspective, pos, &mut active);

    let mut acc = Align64([0; N]);
    let mut psqt = Align64([0; PSQT_BUCKETS]);
    simd::refresh_i8w(&mut acc, &tt.weights, active.as_slice());
    simd::refresh_i32(&mut psqt, &tt.psqt_weights, active.as_slice());
    (acc, psqt)
}

/******************************************\
|==========================================|
|                Unit Tests                |
|==========================================|
\******************************************/
