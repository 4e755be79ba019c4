//! AVX2 pattern scanning backend

use std::arch::x86_64::{
    __m256i, _mm256_cmpeq_epi8, _mm256_load_si256, _mm256_movemask_epi8, _mm256_set1_epi8,
};

use super::{alignment_mask, scalar};
use crate::scan::align::{next_boundary, prev_boundary};
use crate::scan::context::ScanContext;

const UNIT_SIZE: usize = 32;

/// Find the first occurrence of the context's signature in `[begin, end)`
/// using AVX2 instructions
///
/// # Safety
///
/// * `[begin, end)` is readable and `ctx.sig.len() <= end - begin`
///
/// * Currently running CPU supports AVX2
#[target_feature(enable = "avx2")]
pub(crate) unsafe fn find(
    begin: *const u8,
    end: *const u8,
    ctx: &ScanContext,
) -> Option<*const u8> {
    // one past the last address the signature still fits at
    let scan_end = end.wrapping_sub(ctx.sig.len() - 1);

    let body_begin = next_boundary(begin, UNIT_SIZE, 0);
    let body_end = prev_boundary(scan_end, UNIT_SIZE, 0);

    if body_begin >= body_end {
        // SAFETY: all candidates below scan_end keep the signature readable
        return unsafe { scalar::find_in(begin, scan_end, ctx) };
    }

    // candidates ahead of the first aligned window
    // SAFETY: body_begin <= body_end <= scan_end
    if let Some(hit) = unsafe { scalar::find_in(begin, body_begin, ctx) } {
        return Some(hit);
    }

    let needle = _mm256_set1_epi8(ctx.first as i8);
    let lanes = alignment_mask(UNIT_SIZE, ctx) as u32;

    let mut window = body_begin;
    while window < body_end {
        // SAFETY: window is 32-aligned and window + 32 <= body_end <= end
        let chunk = unsafe { _mm256_load_si256(window as *const __m256i) };
        let eq = _mm256_cmpeq_epi8(chunk, needle);

        let mut mask = _mm256_movemask_epi8(eq) as u32 & lanes;
        while mask != 0 {
            // SAFETY: the candidate is inside the window, below scan_end
            let cand = unsafe { window.add(mask.trailing_zeros() as usize) };

            // SAFETY: candidates below scan_end keep the signature readable
            if unsafe { scalar::matches_tail(cand, ctx.sig) } {
                return Some(cand);
            }

            mask &= mask - 1;
        }

        // SAFETY: stays within [begin, body_end]
        window = unsafe { window.add(UNIT_SIZE) };
    }

    // candidates behind the last aligned window
    // SAFETY: window == body_end <= scan_end
    unsafe { scalar::find_in(window, scan_end, ctx) }
}
