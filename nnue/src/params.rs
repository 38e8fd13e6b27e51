use crate::utils::{boxed_slice, box_array, Align64};

/******************************************\
|==========================================|
|               Dimensions                 |
|==========================================|
\******************************************/

/// Hidden width of the big network
pub const L1_BIG: usize = 1024;
/// Hidden width of the small network
pub const L1_SMALL: usize = 128;

/// Per-perspective PSQT outputs
pub const PSQT_BUCKETS: usize = 8;
/// Number of per-piece-count network heads
pub const LAYER_STACKS: usize = 8;

/// Deepest ply an accumulator stack has to hold
pub const MAX_PLY: usize = 246;
/// One slot per ply plus the root
pub const STACK_SIZE: usize = MAX_PLY + 1;

/// King placements are folded into 32 buckets on the a–d files; positions
/// with the king on e–h are file-mirrored first.
pub const KING_BUCKETS: usize = 32;

/// 12 pieces × 64 squares per king bucket
pub const HALFKA_DIMENSIONS: usize = KING_BUCKETS * 768;

/// Threat facts are king-independent: 12 pieces × 64 squares
pub const THREAT_DIMENSIONS: usize = 768;

/******************************************\
|==========================================|
|           Feature Transformer            |
|==========================================|
\******************************************/

/// First-layer parameters of one network: per-feature weight rows summed
/// into the hidden accumulator, plus the PSQT rows summed into the i32
/// material accumulator.
pub struct FeatureTransformer<const N: usize> {
    pub biases: Box<Align64<[i16; N]>>,
    /// `HALFKA_DIMENSIONS` rows of `N` weights
    pub weights: Box<[i16]>,
    /// `HALFKA_DIMENSIONS` rows of `PSQT_BUCKETS` weights
    pub psqt_weights: Box<[i32]>,
}

impl<const N: usize> FeatureTransformer<N> {
    pub fn zeroed() -> Self {
        Self {
            biases: box_array(),
            weights: boxed_slice(HALFKA_DIMENSIONS * N),
            psqt_weights: boxed_slice(HALFKA_DIMENSIONS * PSQT_BUCKETS),
        }
    }

    #[inline]
    pub fn weight_row(&self, index: usize) -> &[i16] {
        &self.weights[index * N..(index + 1) * N]
    }

    #[inline]
    pub fn psqt_row(&self, index: usize) -> &[i32] {
        &self.psqt_weights[index * PSQT_BUCKETS..(index + 1) * PSQT_BUCKETS]
    }
}

/// First-layer parameters of the threat half of the big network. Threat
/// weight rows are 8-bit and widened on the fly; the half has no biases,
/// a full rebuild starts from zero.
pub struct ThreatTransformer<const N: usize> {
    /// `THREAT_DIMENSIONS` rows of `N` weights
    pub weights: Box<[i8]>,
    /// `THREAT_DIMENSIONS` rows of `PSQT_BUCKETS` weights
    pub psqt_weights: Box<[i32]>,
}

impl<const N: usize> ThreatTransformer<N> {
    pub fn zeroed() -> Self {
        Self {
            weights: boxed_slice(THREAT_DIMENSIONS * N),
            psqt_weights: boxed_slice(THREAT_DIMENSIONS * PSQT_BUCKETS),
        }
    }

    #[inline]
    pub fn weight_row(&self, index: usize) -> &[i8] {
        &self.weights[index * N..(index + 1) * N]
    }

    #[inline]
    pub fn psqt_row(&self, index: usize) -> &[i32] {
        &self.psqt_weights[index * PSQT_BUCKETS..(index + 1) * PSQT_BUCKETS]
    }
}
