//! AVX-512 pattern scanning backend

use std::arch::x86_64::{_mm512_cmpeq_epi8_mask, _mm512_load_si512, _mm512_set1_epi8};

use super::{alignment_mask, scalar};
use crate::scan::align::{next_boundary, prev_boundary};
use crate::scan::context::ScanContext;

const UNIT_SIZE: usize = 64;

/// Find the first occurrence of the context's signature in `[begin, end)`
/// using AVX-512 instructions
///
/// # Safety
///
/// * `[begin, end)` is readable and `ctx.sig.len() <= end - begin`
///
/// * Currently running CPU supports AVX-512F and AVX-512BW
#[target_feature(enable = "avx512f,avx512bw")]
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

    let needle = _mm512_set1_epi8(ctx.first as i8);
    let lanes = alignment_mask(UNIT_SIZE, ctx);

    let mut window = body_begin;
    while window < body_end {
        // SAFETY: window is 64-aligned and window + 64 <= body_end <= end
        let chunk = unsafe { _mm512_load_si512(window as *const _) };

        // the compare produces the candidate mask directly, no movemask step
        let mut mask = _mm512_cmpeq_epi8_mask(chunk, needle) & lanes;
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
