//! Per-call scan state: the truncated signature, the matcher chosen for it,
//! and the alignment bookkeeping the matcher needs.

use super::backends::{self, ScanMode};
use super::{ScanAlignment, ScanHint};

/// A matcher. Scans `[begin, end)` for the context's signature and returns
/// the first match, or `None`.
pub(crate) type ScanFn =
    for<'a, 'b> unsafe fn(*const u8, *const u8, &'a ScanContext<'b>) -> Option<*const u8>;

/// With the x86_64 hint set, a signature at or below `vector_size / 8` bytes
/// verifies too little per vector load to win over the scalar first-byte
/// search, so it is demoted to FastFirst.
const SHORT_SIG_DIVISOR: usize = 8;

pub(crate) struct ScanContext<'a> {
    /// truncated signature; the first element is concrete
    pub(crate) sig: &'a [Option<u8>],
    /// the signature's first byte
    pub(crate) first: u8,
    pub(crate) scanner: ScanFn,
    pub(crate) alignment: ScanAlignment,
    /// residue class of valid candidates: truncating `offset` leading
    /// wildcards shifts the scanned signature by that much, so candidates sit
    /// at `addr % stride == offset % stride` instead of 0
    pub(crate) phase: usize,
    /// bytes processed per iteration by the matcher, 0 for scalar
    pub(crate) vector_size: usize,
    pub(crate) hints: ScanHint,
}

impl<'a> ScanContext<'a> {
    /// `sig` must be non-empty with a concrete first element, and `offset` is
    /// the number of leading wildcards truncated away from the original
    /// pattern.
    pub(crate) fn new(
        sig: &'a [Option<u8>],
        alignment: ScanAlignment,
        offset: usize,
        hints: ScanHint,
    ) -> Self {
        let mut ctx = Self::with_mode(sig, alignment, offset, hints, backends::mode());
        ctx.apply_hints();
        ctx
    }

    pub(crate) fn with_mode(
        sig: &'a [Option<u8>],
        alignment: ScanAlignment,
        offset: usize,
        hints: ScanHint,
        mode: ScanMode,
    ) -> Self {
        let (scanner, vector_size) = backends::scanner_for(mode);

        Self {
            sig,
            first: sig.first().copied().flatten().unwrap_or_default(),
            scanner,
            alignment,
            phase: offset % alignment.stride(),
            vector_size,
            hints,
        }
    }

    fn apply_hints(&mut self) {
        if self.hints.contains(ScanHint::X86_64)
            && self.vector_size != 0
            && self.sig.len() <= self.vector_size / SHORT_SIG_DIVISOR
        {
            let (scanner, vector_size) = backends::scanner_for(ScanMode::FastFirst);
            self.scanner = scanner;
            self.vector_size = vector_size;
        }
    }

    /// # Safety
    /// `[begin, end)` must be readable, with `sig.len() <= end - begin`
    pub(crate) unsafe fn scan(&self, begin: *const u8, end: *const u8) -> Option<*const u8> {
        // SAFETY: upheld by the caller
        unsafe { (self.scanner)(begin, end, self) }
    }
}
