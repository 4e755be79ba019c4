//! Scalar pattern scanning backend (FastFirst)
//!
//! Portable fallback: find the next occurrence of the signature's first byte,
//! then verify the tail with a wildcard-aware compare. Also provides the
//! candidate-window primitives the SIMD backends use for their unaligned head
//! and tail bytes.

use std::slice;

use memchr::memchr_iter;

use crate::scan::align::next_boundary;
use crate::scan::context::ScanContext;
use crate::scan::ScanAlignment;

/// Verify the signature tail behind an already-matched first byte
///
/// # Safety
/// `sig.len()` bytes must be readable at `cand`
#[inline]
pub(crate) unsafe fn matches_tail(cand: *const u8, sig: &[Option<u8>]) -> bool {
    // SAFETY: upheld by the caller
    let tail = unsafe { slice::from_raw_parts(cand.add(1), sig.len() - 1) };

    sig[1..]
        .iter()
        .zip(tail)
        .all(|(pat, byte)| pat.map_or(true, |b| b == *byte))
}

/// Scan the candidate window `[cand_begin, cand_end)`, honoring the context's
/// alignment
///
/// # Safety
/// Every candidate in the window must have `ctx.sig.len()` readable bytes
/// behind it
pub(crate) unsafe fn find_in(
    cand_begin: *const u8,
    cand_end: *const u8,
    ctx: &ScanContext,
) -> Option<*const u8> {
    match ctx.alignment {
        // SAFETY: upheld by the caller
        ScanAlignment::X1 => unsafe { find_in_x1(cand_begin, cand_end, ctx) },
        // SAFETY: upheld by the caller
        ScanAlignment::X16 => unsafe { find_in_x16(cand_begin, cand_end, ctx) },
    }
}

unsafe fn find_in_x1(
    cand_begin: *const u8,
    cand_end: *const u8,
    ctx: &ScanContext,
) -> Option<*const u8> {
    if cand_begin >= cand_end {
        return None;
    }

    // SAFETY: the window is readable per this function's contract
    let window = unsafe { slice::from_raw_parts(cand_begin, cand_end.addr() - cand_begin.addr()) };

    for idx in memchr_iter(ctx.first, window) {
        // SAFETY: idx < window len, so the candidate is inside the window
        let cand = unsafe { cand_begin.add(idx) };

        // SAFETY: candidates keep the whole signature readable
        if unsafe { matches_tail(cand, ctx.sig) } {
            return Some(cand);
        }
    }

    None
}

unsafe fn find_in_x16(
    cand_begin: *const u8,
    cand_end: *const u8,
    ctx: &ScanContext,
) -> Option<*const u8> {
    let mut cand = next_boundary(cand_begin, 16, ctx.phase);

    while cand < cand_end {
        // SAFETY: cand is inside the window, which is readable
        if unsafe { *cand } == ctx.first {
            // SAFETY: candidates keep the whole signature readable
            if unsafe { matches_tail(cand, ctx.sig) } {
                return Some(cand);
            }
        }

        cand = cand.wrapping_add(16);
    }

    None
}

/// Find the first occurrence of the context's signature in `[begin, end)`
///
/// # Safety
/// `[begin, end)` is readable and `ctx.sig.len() <= end - begin`
pub(crate) unsafe fn find(
    begin: *const u8,
    end: *const u8,
    ctx: &ScanContext,
) -> Option<*const u8> {
    // one past the last address the signature still fits at
    let scan_end = end.wrapping_sub(ctx.sig.len() - 1);

    // SAFETY: candidates below scan_end leave sig.len() readable bytes
    unsafe { find_in(begin, scan_end, ctx) }
}
