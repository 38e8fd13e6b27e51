//! Shared transposition table.
//!
//! One fixed-size associative store probed and written by every worker
//! thread. All accesses are relaxed atomics and no ordering is
//! established between operations: readers can observe a tag paired with
//! another position's data, and accept it. Probe results are hints; the
//! caller validates the stored move for pseudo-legality before trusting
//! it.

use std::sync::atomic::{AtomicU16, AtomicU64, AtomicU8, Ordering};

use chess::{Key, Move};

use crate::memory::LargePageAlloc;
use crate::types::{Bound, Depth, Value, DEPTH_ENTRY_OFFSET, VALUE_NONE};

/******************************************\
|==========================================|
|                Constants                 |
|==========================================|
\******************************************/

/// Entries per cluster; a cluster fills a 32-byte half cache line.
pub const CLUSTER_SIZE: usize = 3;

/// Low bits of `gen_bound8` carry the PV flag and the bound, the
/// remaining five bits the generation.
const GENERATION_BITS: u8 = 3;
pub const GENERATION_DELTA: u8 = 1 << GENERATION_BITS;
const GENERATION_CYCLE: u16 = 255 + GENERATION_DELTA as u16;
const GENERATION_MASK: u16 = 0xF8;

/******************************************\
|==========================================|
|               Packed Entry               |
|==========================================|
\******************************************/

/// Field view of one 64-bit data word. Byte order, low to high:
/// `depth8 | gen_bound8 | move16 | value16 | eval16`.
#[derive(Debug, Clone, Copy)]
struct TTData8 {
    depth8: u8,
    gen_bound8: u8,
    move16: u16,
    value16: i16,
    eval16: i16,
}

impl TTData8 {
    fn unpack(data: u64) -> Self {
        Self {
            depth8: data as u8,
            gen_bound8: (data >> 8) as u8,
            move16: (data >> 16) as u16,
            value16: (data >> 32) as i16,
            eval16: (data >> 48) as i16,
        }
    }

    fn pack(&self) -> u64 {
        u64::from(self.depth8)
            | u64::from(self.gen_bound8) << 8
            | u64::from(self.move16) << 16
            | u64::from(self.value16 as u16) << 32
            | u64::from(self.eval16 as u16) << 48
    }

    /// `depth8 == 0` is reserved for empty slots.
    fn is_occupied(&self) -> bool {
        self.depth8 != 0
    }

    /// Cyclic distance from the entry's generation to `generation8`, a
    /// multiple of `GENERATION_DELTA`. The cycle constant keeps the
    /// reserved low bits from affecting the result across wraparound.
    fn relative_age(&self, generation8: u8) -> u8 {
        ((GENERATION_CYCLE + u16::from(generation8) - u16::from(self.gen_bound8))
            & GENERATION_MASK) as u8
    }
}

/******************************************\
|==========================================|
|               Probe Result               |
|==========================================|
\******************************************/

/// Caller-owned copy of a probed entry. May be self-inconsistent after a
/// racy read; no field is trusted blindly.
#[derive(Debug, Clone, Copy)]
pub struct TTData {
    pub mv: Move,
    pub value: Value,
    pub eval: Value,
    pub depth: Depth,
    pub bound: Bound,
    pub is_pv: bool,
}

impl TTData {
    fn from_packed(d: TTData8) -> Self {
        Self {
            mv: Move::from_raw(d.move16),
            value: Value::from(d.value16),
            eval: Value::from(d.eval16),
            depth: Depth::from(d.depth8) + DEPTH_ENTRY_OFFSET,
            bound: Bound::from_bits(d.gen_bound8),
            is_pv: d.gen_bound8 & 0x4 != 0,
        }
    }

    fn empty() -> Self {
        Self {
            mv: Move::NONE,
            value: VALUE_NONE,
            eval: VALUE_NONE,
            depth: DEPTH_ENTRY_OFFSET,
            bound: Bound::None,
            is_pv: false,
        }
    }
}

/******************************************\
|==========================================|
|                 Cluster                  |
|==========================================|
\******************************************/

/// Three tag words plus three data words. Tag and data of a slot are
/// independently atomic; a (tag, data) pair may be read torn.
#[repr(C, align(32))]
struct Cluster {
    tags: [AtomicU16; CLUSTER_SIZE],
    data: [AtomicU64; CLUSTER_SIZE],
}

/******************************************\
|==========================================|
|                  Writer                  |
|==========================================|
\******************************************/

/// Handle to one slot, returned by `probe` and used to publish a result
/// after the node has been searched.
pub struct TTWriter<'a> {
    tag: &'a AtomicU16,
    data: &'a AtomicU64,
}

impl TTWriter<'_> {
    /// Publishes an entry, possibly overwriting an unrelated position.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &self,
        key: Key,
        value: Value,
        pv: bool,
        bound: Bound,
        depth: Depth,
        mv: Move,
        eval: Value,
        generation8: u8,
    ) {
        let key16 = key as u16;
        let current_tag = self.tag.load(Ordering::Relaxed);
        let mut current = TTData8::unpack(self.data.load(Ordering::Relaxed));

        // Preserve the old ttmove unless there is a new one
        let mut move_updated = false;
        if !mv.is_none() || key16 != current_tag {
            move_updated = true;
            current.move16 = mv.raw();
        }

        // Overwrite less valuable entries (cheapest checks first)
        if bound == Bound::Exact
            || key16 != current_tag
            || depth - DEPTH_ENTRY_OFFSET + 2 * Depth::from(pv) > Depth::from(current.depth8) - 4
            || current.relative_age(generation8) != 0
        {
            debug_assert!(depth > DEPTH_ENTRY_OFFSET);
            debug_assert!(depth < 256 + DEPTH_ENTRY_OFFSET);

            let new = TTData8 {
                depth8: (depth - DEPTH_ENTRY_OFFSET) as u8,
                gen_bound8: generation8 | (pv as u8) << 2 | bound as u8,
                move16: current.move16,
                value16: value as i16,
                eval16: eval as i16,
            };

            // Data first, then the tag, so a reader matching the tag
            // usually sees the matching data. Not guaranteed; readers
            // tolerate torn pairs.
            self.data.store(new.pack(), Ordering::Relaxed);
            self.tag.store(key16, Ordering::Relaxed);
            return;
        }

        if move_updated {
            self.data.store(current.pack(), Ordering::Relaxed);
        }
    }
}

/******************************************\
|==========================================|
|           Transposition Table            |
|==========================================|
\******************************************/

/// The table itself: a huge-page-aligned array of clusters and the
/// 8-bit search generation.
pub struct TranspositionTable {
    alloc: Option<LargePageAlloc>,
    cluster_count: usize,
    generation8: AtomicU8,
}

// The backing store is shared raw memory accessed only through atomics.
unsafe impl Send for TranspositionTable {}
unsafe impl Sync for TranspositionTable {}

impl Default for TranspositionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TranspositionTable {
    /// An unsized table; `resize` must run before first use.
    pub fn new() -> Self {
        Self {
            alloc: None,
            cluster_count: 0,
            generation8: AtomicU8::new(0),
        }
    }

    #[inline]
    fn cluster(&self, index: usize) -> &Cluster {
        debug_assert!(index < self.cluster_count);
        let base = self
            .alloc
            .as_ref()
            .expect("transposition table not allocated")
            .as_ptr() as *const Cluster;
        unsafe { &*base.add(index) }
    }

    /// Cluster selection from the upper key bits: `(key · count) >> 64`.
    #[inline]
    fn cluster_index(&self, key: Key) -> usize {
        ((u128::from(key) * self.cluster_count as u128) >> 64) as usize
    }

    pub fn size_mb(&self) -> usize {
        self.cluster_count * std::mem::size_of::<Cluster>() / (1024 * 1024)
    }

    /// Frees the previous storage, allocates `mb_size` MiB of clusters and
    /// zero-fills them across `threads` threads. Allocation failure is
    /// fatal: the engine cannot search without its table.
    pub fn resize(&mut self, mb_size: usize, threads: usize) {
        self.alloc = None;
        self.cluster_count = mb_size * 1024 * 1024 / std::mem::size_of::<Cluster>();

        match LargePageAlloc::zeroed(self.cluster_count * std::mem::size_of::<Cluster>()) {
            Some(alloc) => {
                if !alloc.on_large_pages() {
                    log::info!("transposition table allocated without large pages");
                }
                self.alloc = Some(alloc);
            }
            None => {
                log::error!("failed to allocate {mb_size} MB for transposition table");
                std::process::exit(1);
            }
        }

        self.clear(threads);
    }

    /// Zero-fills every cluster, partitioned evenly across `threads`
    /// scoped threads, and resets the generation counter.
    pub fn clear(&self, threads: usize) {
        self.generation8.store(0, Ordering::Relaxed);
        if self.cluster_count == 0 {
            return;
        }

        let threads = threads.max(1);
        let stride = self.cluster_count / threads;

        std::thread::scope(|s| {
            for i in 0..threads {
                let start = stride * i;
                let len = if i + 1 == threads {
                    self.cluster_count - start
                } else {
                    stride
                };

                s.spawn(move || {
                    for j in start..start + len {
                        let cluster = self.cluster(j);
                        for k in 0..CLUSTER_SIZE {
                            cluster.tags[k].store(0, Ordering::Relaxed);
                            cluster.data[k].store(0, Ordering::Relaxed);
                        }
                    }
                });
            }
        });
    }

    /// Bumps the generation by `GENERATION_DELTA`, keeping the low bits
    /// free for the bound and PV flag. Must run before each root search.
    pub fn new_search(&self) {
        self.generation8
            .fetch_add(GENERATION_DELTA, Ordering::Relaxed);
    }

    pub fn generation(&self) -> u8 {
        self.generation8.load(Ordering::Relaxed)
    }

    /// Looks up `key`. On a tag match returns (occupied, copy, writer to
    /// that slot); otherwise (false, empty, writer to the least valuable
    /// slot), where value is `depth8` minus eight times the relative age.
    pub fn probe(&self, key: Key) -> (bool, TTData, TTWriter<'_>) {
        let cluster = self.cluster(self.cluster_index(key));
        let key16 = key as u16;

        for i in 0..CLUSTER_SIZE {
            if cluster.tags[i].load(Ordering::Relaxed) == key16 {
                // The gap between the tag and data loads is the main read
                // race window. The copy below is final but may be
                // self-inconsistent.
                let data = TTData8::unpack(cluster.data[i].load(Ordering::Relaxed));
                return (
                    data.is_occupied(),
                    TTData::from_packed(data),
                    TTWriter {
                        tag: &cluster.tags[i],
                        data: &cluster.data[i],
                    },
                );
            }
        }

        let generation8 = self.generation();
        let mut replace = 0;
        for i in 1..CLUSTER_SIZE {
            let current = TTData8::unpack(cluster.data[replace].load(Ordering::Relaxed));
            let candidate = TTData8::unpack(cluster.data[i].load(Ordering::Relaxed));
            if i32::from(current.depth8) - i32::from(current.relative_age(generation8))
                > i32::from(candidate.depth8) - i32::from(candidate.relative_age(generation8))
            {
                replace = i;
            }
        }

        (
            false,
            TTData::empty(),
            TTWriter {
                tag: &cluster.tags[replace],
                data: &cluster.data[replace],
            },
        )
    }

    /// Hints the prefetcher at the cluster `key` maps to.
    #[inline]
    pub fn prefetch(&self, key: Key) {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
            let cluster = self.cluster(self.cluster_index(key));
            _mm_prefetch((cluster as *const Cluster).cast::<i8>(), _MM_HINT_T0);
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = key;
    }

    /// Permille of sampled slots holding an entry no older than `max_age`
    /// generations.
    pub fn hashfull(&self, max_age: i32) -> usize {
        let max_age_internal = max_age << GENERATION_BITS;
        let generation8 = self.generation();
        let samples = self.cluster_count.min(1000);
        if samples == 0 {
            return 0;
        }

        let mut cnt = 0;
        for i in 0..samples {
            let cluster = self.cluster(i);
            for k in 0..CLUSTER_SIZE {
                let entry = TTData8::unpack(cluster.data[k].load(Ordering::Relaxed));
                if entry.is_occupied()
                    && i32::from(entry.relative_age(generation8)) <= max_age_internal
                {
                    cnt += 1;
                }
            }
        }

        cnt * 1000 / (samples * CLUSTER_SIZE)
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
    use chess::{Board, MoveFlag, Square};

    fn sized_tt(mb: usize) -> TranspositionTable {
        let mut tt = TranspositionTable::new();
        tt.resize(mb, 1);
        tt
    }

    fn write_entry(tt: &TranspositionTable, key: Key, value: Value, depth: Depth, bound: Bound) {
        let (_, _, writer) = tt.probe(key);
        writer.write(
            key,
            value,
            false,
            bound,
            depth,
            Move::NONE,
            VALUE_ZERO,
            tt.generation(),
        );
    }

    use crate::types::VALUE_ZERO;

    #[test]
    fn test_probe_miss_write_probe_hit() {
        let tt = sized_tt(16);
        tt.new_search();
        let key: Key = 0xDEAD_BEEF_CAFE_BABE;

        let (found, _, writer) = tt.probe(key);
        assert!(!found, "empty table must miss");

        let mv = Move::new(Square::E2, Square::E4, MoveFlag::DoublePawnPush);
        writer.write(key, 42, true, Bound::Exact, 10, mv, 17, tt.generation());

        let (found, data, _) = tt.probe(key);
        assert!(found);
        assert_eq!(data.value, 42);
        assert_eq!(data.eval, 17);
        assert_eq!(data.depth, 10);
        assert_eq!(data.mv, mv);
        assert_eq!(data.bound, Bound::Exact);
        assert!(data.is_pv);
    }

    #[test]
    fn test_move_preserved_on_null_move_write() {
        let tt = sized_tt(4);
        tt.new_search();
        let key: Key = 0x1234_5678_9ABC_DEF0;
        let mv = Move::new(Square::G1, Square::F3, MoveFlag::QuietMove);

        let (_, _, writer) = tt.probe(key);
        writer.write(key, 5, false, Bound::Lower, 8, mv, 0, tt.generation());

        // Deeper write with no move must keep the old move
        let (_, _, writer) = tt.probe(key);
        writer.write(key, 9, false, Bound::Lower, 12, Move::NONE, 0, tt.generation());

        let (found, data, _) = tt.probe(key);
        assert!(found);
        assert_eq!(data.depth, 12, "deeper write must land");
        assert_eq!(data.mv, mv, "null-move write must preserve the move");
    }

    #[test]
    fn test_exact_always_overwrites() {
        let tt = sized_tt(4);
        tt.new_search();
        let key: Key = 0x42;

        write_entry(&tt, key, 100, 20, Bound::Lower);
        // Shallower, same key, same generation, but exact
        write_entry(&tt, key, 55, 4, Bound::Exact);

        let (_, data, _) = tt.probe(key);
        assert_eq!(data.value, 55);
        assert_eq!(data.depth, 4);
    }

    #[test]
    fn test_shallow_non_exact_does_not_overwrite() {
        let tt = sized_tt(4);
        tt.new_search();
        let key: Key = 0x43;

        write_entry(&tt, key, 100, 20, Bound::Lower);
        write_entry(&tt, key, 55, 4, Bound::Upper);

        let (_, data, _) = tt.probe(key);
        assert_eq!(data.value, 100, "shallow same-gen write must be ignored");
        assert_eq!(data.depth, 20);
    }

    #[test]
    fn test_generation_cycle_wraps() {
        let tt = sized_tt(4);
        tt.new_search();
        let key: Key = 0xF00D;
        write_entry(&tt, key, 1, 10, Bound::Lower);

        let stored = TTData8::unpack(
            tt.cluster(tt.cluster_index(key)).data[slot_of(&tt, key)].load(Ordering::Relaxed),
        );
        assert_eq!(stored.relative_age(tt.generation()), 0);

        // One generation later the entry is GENERATION_DELTA old
        tt.new_search();
        assert_eq!(stored.relative_age(tt.generation()), GENERATION_DELTA);

        // 32 bumps wrap the 5-bit generation back to the same age
        for _ in 0..31 {
            tt.new_search();
        }
        assert_eq!(stored.relative_age(tt.generation()), 0);
    }

    fn slot_of(tt: &TranspositionTable, key: Key) -> usize {
        let cluster = tt.cluster(tt.cluster_index(key));
        let key16 = key as u16;
        (0..CLUSTER_SIZE)
            .find(|&i| cluster.tags[i].load(Ordering::Relaxed) == key16)
            .expect("entry not found")
    }

    #[test]
    fn test_stale_generation_is_replaced() {
        let tt = sized_tt(4);
        tt.new_search();
        let key: Key = 0xBEE;

        write_entry(&tt, key, 7, 20, Bound::Lower);
        tt.new_search();

        // Shallower but from the current search: age wins
        write_entry(&tt, key, 8, 5, Bound::Upper);
        let (_, data, _) = tt.probe(key);
        assert_eq!(data.value, 8);
        assert_eq!(data.depth, 5);
    }

    #[test]
    fn test_replacement_prefers_old_and_shallow() {
        let tt = sized_tt(1);
        tt.new_search();

        // Three keys landing in the same cluster: same upper bits,
        // different low-16 tags.
        let base: Key = 0x7777_0000_0000_0000;
        let keys = [base | 1, base | 2, base | 3];
        for &k in &keys {
            write_entry(&tt, k, 1, 20, Bound::Lower);
        }

        // All slots full with deep, current entries; a new search plus a
        // shallow write must still land somewhere (S2).
        tt.new_search();
        let fresh = base | 4;
        write_entry(&tt, fresh, 9, 1, Bound::Upper);

        let (found, data, _) = tt.probe(fresh);
        assert!(found, "replacement must evict an old slot");
        assert_eq!(data.value, 9);
    }

    #[test]
    fn test_parallel_clear_empties_table() {
        let tt = sized_tt(64);
        tt.new_search();

        let mut rng = chess::utils::PRNG::new(0xC0FFEE);
        let keys: Vec<Key> = (0..4096).map(|_| rng.random_u64()).collect();
        for &k in &keys {
            write_entry(&tt, k, 3, 6, Bound::Exact);
        }

        tt.clear(8);

        for &k in &keys {
            let (found, _, _) = tt.probe(k);
            assert!(!found, "entry for {k:#x} survived clear");
        }
        assert_eq!(tt.generation(), 0);
        assert_eq!(tt.hashfull(0), 0);
    }

    #[test]
    fn test_hashfull_counts_current_generation() {
        let tt = sized_tt(1);
        tt.new_search();

        assert_eq!(tt.hashfull(0), 0);

        let mut rng = chess::utils::PRNG::new(0xFEED);
        for _ in 0..2000 {
            write_entry(&tt, rng.random_u64(), 1, 6, Bound::Exact);
        }

        let full_now = tt.hashfull(0);
        assert!(full_now > 0 && full_now <= 1000);

        // After a new search the same entries only count with max_age > 0
        tt.new_search();
        let full_aged = tt.hashfull(0);
        assert!(full_aged <= full_now);
        assert!(tt.hashfull(31) >= full_now, "wide age window must keep them");
    }

    #[test]
    fn test_cluster_layout() {
        assert_eq!(std::mem::size_of::<Cluster>(), 32);
        assert_eq!(std::mem::align_of::<Cluster>(), 32);
    }

    #[test]
    fn test_cluster_mapping_deterministic_and_spread() {
        let tt = sized_tt(4);
        let mut rng = chess::utils::PRNG::new(0x9999);
        let mut bins = [0usize; 16];

        for _ in 0..100_000 {
            let key = rng.random_u64();
            let index = tt.cluster_index(key);
            assert_eq!(index, tt.cluster_index(key));
            assert!(index < tt.cluster_count);
            bins[index * 16 / tt.cluster_count] += 1;
        }

        // Uniform keys must spread roughly evenly over the table
        let expected = 100_000 / 16;
        for (i, &count) in bins.iter().enumerate() {
            assert!(
                count > expected / 2 && count < expected * 2,
                "bin {i} holds {count} of ~{expected} keys"
            );
        }
    }

    #[test]
    fn test_torn_reads_are_caught_by_move_validation() {
        // Writer thread alternates two positions whose tags share a
        // cluster; the reader probes one key and validates the move
        // against that key's position. The caller-level guard must reject
        // every payload belonging to the other position (S5).
        let tt = sized_tt(1);
        tt.new_search();

        let board = Board::default();
        let k1: Key = 0x5151_5151_5151_0001;
        let k2: Key = k1 ^ 1;

        // Legal for the start position
        let mv1 = Move::new(Square::E2, Square::E4, MoveFlag::DoublePawnPush);
        // Black's move: pseudo-legal validation on the white-to-move
        // start position rejects it.
        let mv2 = Move::new(Square::E7, Square::E5, MoveFlag::DoublePawnPush);

        let stop = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..200_000u32 {
                    let (key, mv, value) = if i % 2 == 0 { (k1, mv1, 10) } else { (k2, mv2, 20) };
                    let (_, _, writer) = tt.probe(key);
                    writer.write(key, value, false, Bound::Exact, 8, mv, 0, tt.generation());
                }
                stop.store(true, Ordering::Relaxed);
            });

            s.spawn(|| {
                while !stop.load(Ordering::Relaxed) {
                    let (found, data, _) = tt.probe(k1);
                    if found && board.is_pseudo_legal(data.mv) {
                        assert_eq!(
                            data.mv, mv1,
                            "validated probe returned the other position's move"
                        );
                    }
                }
            });
        });
    }
}
