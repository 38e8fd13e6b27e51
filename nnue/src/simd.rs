//! Register-tiled accumulator kernels.
//!
//! Every kernel walks the vector in tiles sized so one tile fills the
//! register file, applying all weight rows to a tile before moving on.
//! The AVX2 path and the scalar fallback are byte-identical: both use
//! wrapping two's-complement arithmetic and no saturation.

use crate::utils::Align64;

/// Register budget per tile
pub const MAX_REGISTERS: usize = 16;

/// Largest divisor of the ideal register count that still fits the
/// register file. The ideal count covers the whole vector at once.
pub const fn best_register_count(
    register_bytes: usize,
    lane_bytes: usize,
    lanes: usize,
    max_regs: usize,
) -> usize {
    let ideal = (lanes * lane_bytes) / register_bytes;
    if ideal == 0 {
        return 1;
    }
    if ideal <= max_regs {
        return ideal;
    }
    let mut divisor = max_regs;
    while divisor > 1 {
        if ideal % divisor == 0 {
            return divisor;
        }
        divisor -= 1;
    }
    1
}

/******************************************\
|==========================================|
|              Hidden (i16)                |
|==========================================|
\******************************************/

/// `out = base - Σ removed rows + Σ added rows` over `N`-wide i16 rows.
pub fn update_i16<const N: usize>(
    base: &Align64<[i16; N]>,
    out: &mut Align64<[i16; N]>,
    weights: &[i16],
    removed: &[u16],
    added: &[u16],
) {
    #[cfg(all(target_arch = "x86_64", target_feature = "avx2"))]
    unsafe {
        avx2::update_i16(base.0.as_ptr(), out.0.as_mut_ptr(), N, weights.as_ptr(), removed, added);
    }

    #[cfg(not(all(target_arch = "x86_64", target_feature = "avx2")))]
    {
        out.0 = base.0;
        fallback::apply_i16(&mut out.0, weights, removed, added);
    }
}

/// In-place variant used by the refresh cache.
pub fn update_in_place_i16<const N: usize>(
    acc: &mut Align64<[i16; N]>,
    weights: &[i16],
    removed: &[u16],
    added: &[u16],
) {
    #[cfg(all(target_arch = "x86_64", target_feature = "avx2"))]
    unsafe {
        let ptr = acc.0.as_mut_ptr();
        avx2::update_i16(ptr, ptr, N, weights.as_ptr(), removed, added);
    }

    #[cfg(not(all(target_arch = "x86_64", target_feature = "avx2")))]
    fallback::apply_i16(&mut acc.0, weights, removed, added);
}

/// i16 update over 8-bit weight rows, widened on the fly (threat half).
pub fn update_i8w<const N: usize>(
    base: &Align64<[i16; N]>,
    out: &mut Align64<[i16; N]>,
    weights: &[i8],
    removed: &[u16],
    added: &[u16],
) {
    #[cfg(all(target_arch = "x86_64", target_feature = "avx2"))]
    unsafe {
        avx2::update_i8w(base.0.as_ptr(), out.0.as_mut_ptr(), N, weights.as_ptr(), removed, added);
    }

    #[cfg(not(all(target_arch = "x86_64", target_feature = "avx2")))]
    {
        out.0 = base.0;
        fallback::apply_i8w(&mut out.0, weights, removed, added);
    }
}

/// Rebuild from zero over 8-bit weight rows (threat full refresh).
pub fn refresh_i8w<const N: usize>(out: &mut Align64<[i16; N]>, weights: &[i8], active: &[u16]) {
    out.0 = [0; N];
    #[cfg(all(target_arch = "x86_64", target_feature = "avx2"))]
    unsafe {
        let ptr = out.0.as_mut_ptr();
        avx2::update_i8w(ptr, ptr, N, weights.as_ptr(), &[], active);
    }

    #[cfg(not(all(target_arch = "x86_64", target_feature = "avx2")))]
    fallback::apply_i8w(&mut out.0, weights, &[], active);
}

/******************************************\
|==========================================|
|               PSQT (i32)                 |
|==========================================|
\******************************************/

/// `out = base - Σ removed rows + Σ added rows` over `B`-wide i32 rows.
pub fn update_i32<const B: usize>(
    base: &Align64<[i32; B]>,
    out: &mut Align64<[i32; B]>,
    weights: &[i32],
    removed: &[u16],
    added: &[u16],
) {
    #[cfg(all(target_arch = "x86_64", target_feature = "avx2"))]
    unsafe {
        avx2::update_i32(base.0.as_ptr(), out.0.as_mut_ptr(), B, weights.as_ptr(), removed, added);
    }

    #[cfg(not(all(target_arch = "x86_64", target_feature = "avx2")))]
    {
        out.0 = base.0;
        fallback::apply_i32(&mut out.0, weights, removed, added);
    }
}

pub fn update_in_place_i32<const B: usize>(
    acc: &mut Align64<[i32; B]>,
    weights: &[i32],
    removed: &[u16],
    added: &[u16],
) {
    #[cfg(all(target_arch = "x86_64", target_feature = "avx2"))]
    unsafe {
        let ptr = acc.0.as_mut_ptr();
        avx2::update_i32(ptr, ptr, B, weights.as_ptr(), removed, added);
    }

    #[cfg(not(all(target_arch = "x86_64", target_feature = "avx2")))]
    fallback::apply_i32(&mut acc.0, weights, removed, added);
}

/// Rebuild from zero over i32 rows.
pub fn refresh_i32<const B: usize>(out: &mut Align64<[i32; B]>, weights: &[i32], active: &[u16]) {
    out.0 = [0; B];
    #[cfg(all(target_arch = "x86_64", target_feature = "avx2"))]
    unsafe {
        let ptr = out.0.as_mut_ptr();
        avx2::update_i32(ptr, ptr, B, weights.as_ptr(), &[], active);
    }

    #[cfg(not(all(target_arch = "x86_64", target_feature = "avx2")))]
    fallback::apply_i32(&mut out.0, weights, &[], active);
}

/******************************************\
|==========================================|
|             Scalar Fallback              |
|==========================================|
\******************************************/

#[cfg(any(test, not(all(target_arch = "x86_64", target_feature = "avx2"))))]
mod fallback {
    pub fn apply_i16(acc: &mut [i16], weights: &[i16], removed: &[u16], added: &[u16]) {
        let n = acc.len();
        for &r in removed {
            let row = &weights[r as usize * n..][..n];
            for (a, &w) in acc.iter_mut().zip(row) {
                *a = a.wrapping_sub(w);
            }
        }
        for &r in added {
            let row = &weights[r as usize * n..][..n];
            for (a, &w) in acc.iter_mut().zip(row) {
                *a = a.wrapping_add(w);
            }
        }
    }

    pub fn apply_i8w(acc: &mut [i16], weights: &[i8], removed: &[u16], added: &[u16]) {
        let n = acc.len();
        for &r in removed {
            let row = &weights[r as usize * n..][..n];
            for (a, &w) in acc.iter_mut().zip(row) {
                *a = a.wrapping_sub(w as i16);
            }
        }
        for &r in added {
            let row = &weights[r as usize * n..][..n];
            for (a, &w) in acc.iter_mut().zip(row) {
                *a = a.wrapping_add(w as i16);
            }
        }
    }

    pub fn apply_i32(acc: &mut [i32], weights: &[i32], removed: &[u16], added: &[u16]) {
        let n = acc.len();
        for &r in removed {
            let row = &weights[r as usize * n..][..n];
            for (a, &w) in acc.iter_mut().zip(row) {
                *a = a.wrapping_sub(w);
            }
        }
        for &r in added {
            let row = &weights[r as usize * n..][..n];
            for (a, &w) in acc.iter_mut().zip(row) {
                *a = a.wrapping_add(w);
            }
        }
    }
}

/******************************************\
|==========================================|
|                  AVX2                    |
|==========================================|
\******************************************/

#[cfg(all(target_arch = "x86_64", target_feature = "avx2"))]
mod avx2 {
    use std::arch::x86_64::*;

    const REG_BYTES: usize = 32;
    const I16_LANES: usize = 16;
    const I32_LANES: usize = 8;

    /// # Safety
    /// `base`/`out` point at `n` lanes aligned to 32 bytes; every index in
    /// `removed`/`added` addresses a full `n`-wide row of `weights`.
    pub unsafe fn update_i16(
        base: *const i16,
        out: *mut i16,
        n: usize,
        weights: *const i16,
        removed: &[u16],
        added: &[u16],
    ) {
        let num_regs = super::best_register_count(REG_BYTES, 2, n, super::MAX_REGISTERS);
        let tile = num_regs * I16_LANES;
        let mut acc = [_mm256_setzero_si256(); super::MAX_REGISTERS];

        let mut j = 0;
        while j < n {
            for k in 0..num_regs {
                acc[k] = _mm256_load_si256(base.add(j + k * I16_LANES) as *const __m256i);
            }
            for &r in removed {
                let col = weights.add(r as usize * n + j);
                for k in 0..num_regs {
                    let w = _mm256_loadu_si256(col.add(k * I16_LANES) as *const __m256i);
                    acc[k] = _mm256_sub_epi16(acc[k], w);
                }
            }
            for &r in added {
                let col = weights.add(r as usize * n + j);
                for k in 0..num_regs {
                    let w = _mm256_loadu_si256(col.add(k * I16_LANES) as *const __m256i);
                    acc[k] = _mm256_add_epi16(acc[k], w);
                }
            }
            for k in 0..num_regs {
                _mm256_store_si256(out.add(j + k * I16_LANES) as *mut __m256i, acc[k]);
            }
            j += tile;
        }
    }

    /// # Safety
    /// As `update_i16`, with 8-bit weight rows widened to 16 bits.
    pub unsafe fn update_i8w(
        base: *const i16,
        out: *mut i16,
        n: usize,
        weights: *const i8,
        removed: &[u16],
        added: &[u16],
    ) {
        let num_regs = super::best_register_count(REG_BYTES, 2, n, super::MAX_REGISTERS);
        let tile = num_regs * I16_LANES;
        let mut acc = [_mm256_setzero_si256(); super::MAX_REGISTERS];

        let mut j = 0;
        while j < n {
            for k in 0..num_regs {
                acc[k] = _mm256_load_si256(base.add(j + k * I16_LANES) as *const __m256i);
            }
            for &r in removed {
                let col = weights.add(r as usize * n + j);
                for k in 0..num_regs {
                    let w8 = _mm_loadu_si128(col.add(k * I16_LANES) as *const __m128i);
                    acc[k] = _mm256_sub_epi16(acc[k], _mm256_cvtepi8_epi16(w8));
                }
            }
            for &r in added {
                let col = weights.add(r as usize * n + j);
                for k in 0..num_regs {
                    let w8 = _mm_loadu_si128(col.add(k * I16_LANES) as *const __m128i);
                    acc[k] = _mm256_add_epi16(acc[k], _mm256_cvtepi8_epi16(w8));
                }
            }
            for k in 0..num_regs {
                _mm256_store_si256(out.add(j + k * I16_LANES) as *mut __m256i, acc[k]);
            }
            j += tile;
        }
    }

    /// # Safety
    /// As `update_i16`, over 32-bit lanes.
    pub unsafe fn update_i32(
        base: *const i32,
        out: *mut i32,
        n: usize,
        weights: *const i32,
        removed: &[u16],
        added: &[u16],
    ) {
        let num_regs = super::best_register_count(REG_BYTES, 4, n, super::MAX_REGISTERS);
        let tile = num_regs * I32_LANES;
        let mut acc = [_mm256_setzero_si256(); super::MAX_REGISTERS];

        let mut j = 0;
        while j < n {
            for k in 0..num_regs {
                acc[k] = _mm256_loadu_si256(base.add(j + k * I32_LANES) as *const __m256i);
            }
            for &r in removed {
                let col = weights.add(r as usize * n + j);
                for k in 0..num_regs {
                    let w = _mm256_loadu_si256(col.add(k * I32_LANES) as *const __m256i);
                    acc[k] = _mm256_sub_epi32(acc[k], w);
                }
            }
            for &r in added {
                let col = weights.add(r as usize * n + j);
                for k in 0..num_regs {
                    let w = _mm256_loadu_si256(col.add(k * I32_LANES) as *const __m256i);
                    acc[k] = _mm256_add_epi32(acc[k], w);
                }
            }
            for k in 0..num_regs {
                _mm256_storeu_si256(out.add(j + k * I32_LANES) as *mut __m256i, acc[k]);
            }
            j += tile;
        }
    }
}

/******************************************\
|==========================================|
|                Unit Tests                |
|==========================================|
\******************************************/
