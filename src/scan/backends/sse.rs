//! SSE4.1 pattern scanning backend

use std::arch::x86_64::{__m128i, _mm_cmpeq_epi8, _mm_load_si128, _mm_movemask_epi8, _mm_set1_epi8};

use super::{alignment_mask, scalar};
use crate::scan::align::{next_boundary, prev_boundary};
use crate::scan::context::ScanContext;

const UNIT_SIZE: usize = 16;

/// Find the first occurrence of the context's signature in `[begin, end)`
/// using SSE4.1 instructions
///
/// # Safety
///
/// * `[begin, end)` is readable and `ctx.sig.len() <= end - begin`
///
/// * Currently running CPU supports SSE4.1
#[target_feature(enable = "sse4.1")]
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

    let needle = _mm_set1_epi8(ctx.first as i8);
    let lanes = alignment_mask(UNIT_SIZE, ctx) as u32;

    let mut window = body_begin;
    while window < body_end {
        // SAFETY: window is 16-aligned and window + 16 <= body_end <= end
        let chunk = unsafe { _mm_load_si128(window as *const __m128i) };
        let eq = _mm_cmpeq_epi8(chunk, needle);

        let mut mask = _mm_movemask_epi8(eq) as u32 & lanes;
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
