//! This module allows one to scan memory ranges for byte signatures
//!
//! A signature is an IDA-style [`Pattern`]: concrete bytes mixed with
//! wildcards. Scans walk a raw `[ptr, ptr + size)` range and yield the
//! addresses the signature matches at, in ascending order, optionally
//! restricted to 16-byte boundaries.

pub(crate) mod align;
mod backends;
mod context;

use std::fmt::{self, Display};
use std::mem;
use std::ops::{BitAnd, BitOr};

use self::align::next_boundary;
use self::context::ScanContext;
use crate::pattern::Pattern;

/// Boundary constraint for candidate matches, measured in absolute address
/// space: a match at `addr` is only valid if `addr % stride == 0`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ScanAlignment {
    /// every address is a candidate
    #[default]
    X1,
    /// only 16-byte boundaries are candidates
    X16,
}

impl ScanAlignment {
    pub fn stride(self) -> usize {
        match self {
            Self::X1 => 1,
            Self::X16 => 16,
        }
    }
}

/// Hints about the scanned bytes, used to bias matcher selection
///
/// Unknown bits are ignored, so hints from newer callers degrade cleanly.
/// Hints never change what a scan finds, only how it searches.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanHint(u64);

impl ScanHint {
    /// no hints
    pub const NONE: Self = Self(0);
    /// the scanned bytes are x86-64 machine code
    pub const X86_64: Self = Self(1 << 0);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ScanHint {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for ScanHint {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// The result of a scan
#[derive(Debug, Clone, Copy)]
pub struct Scan {
    /// the address of a found match
    pub addr: *const u8,
}

unsafe impl Send for Scan {}
unsafe impl Sync for Scan {}

impl Display for Scan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scan {{ addr: {:?} }}", self.addr)
    }
}

impl Scan {
    /// Read a `T` located `offset` bytes past the match
    ///
    /// # Safety
    /// - Memory at location must be initialized
    /// - Memory at location must contain a valid bitpattern for T
    /// - Address must be valid for reads up to size of T
    pub unsafe fn read<T: Copy>(&self, offset: usize) -> T {
        // SAFETY: upheld by the caller; the read is unaligned because matches
        // land on arbitrary byte boundaries
        unsafe { self.addr.add(offset).cast::<T>().read_unaligned() }
    }

    /// Read a `u32` at `offset` which indexes an array of `T`, returning the
    /// element index
    ///
    /// # Safety
    /// Same as [`read`](Self::read)
    pub unsafe fn index<T>(&self, offset: usize) -> usize {
        // SAFETY: upheld by the caller
        unsafe { self.read::<u32>(offset) as usize / mem::size_of::<T>() }
    }

    /// Resolve the x86 rip-relative address stored `offset` bytes past the
    /// match: `addr + disp32 + offset + 4`
    ///
    /// # Safety
    /// The 4 bytes at `addr + offset` must be readable
    pub unsafe fn rel(&self, offset: usize) -> *const u8 {
        // SAFETY: upheld by the caller
        let disp = unsafe { self.read::<i32>(offset) };

        // the target may point anywhere, including outside the scanned
        // range, so keep the address math wrapping
        self.addr
            .wrapping_offset(disp as isize)
            .wrapping_add(offset + mem::size_of::<i32>())
    }
}

/// Iterator over every match of a pattern in a range, in ascending address
/// order
///
/// Created by [`scan_pattern`]. After a match at `A` the search resumes at
/// `A + stride`.
pub struct Matches<'a> {
    /// context for the truncated signature; `None` when the pattern is all
    /// wildcards
    ctx: Option<ScanContext<'a>>,
    /// leading wildcards stripped from the pattern
    offset: usize,
    stride: usize,
    phase: usize,
    /// next candidate, in truncated-signature space
    cursor: *const u8,
    end: *const u8,
    done: bool,
}

impl Matches<'_> {
    /// The address a fresh scan would continue from to yield the matches not
    /// consumed yet
    pub fn resume(&self) -> *const u8 {
        if self.done {
            return self.end;
        }

        let resume = self.cursor.wrapping_sub(self.offset);
        if resume.addr() > self.end.addr() {
            self.end
        } else {
            resume
        }
    }

    fn advance(&mut self) -> Option<*const u8> {
        let remaining = self.end.addr().checked_sub(self.cursor.addr())?;

        let hit = match &self.ctx {
            Some(ctx) => {
                if remaining < ctx.sig.len() {
                    return None;
                }

                // SAFETY: [cursor, end) stays inside the range the iterator
                // was created over, and the signature fits it
                unsafe { ctx.scan(self.cursor, self.end)? }
            }

            // all wildcards: the first aligned candidate that still fits
            // matches trivially
            None => {
                let cand = next_boundary(self.cursor, self.stride, self.phase);
                if cand.addr() > self.end.addr() {
                    return None;
                }
                cand
            }
        };

        self.cursor = hit.wrapping_add(self.stride);
        Some(hit.wrapping_sub(self.offset))
    }
}

impl Iterator for Matches<'_> {
    type Item = Scan;

    fn next(&mut self) -> Option<Scan> {
        if self.done {
            return None;
        }

        match self.advance() {
            Some(addr) => Some(Scan { addr }),
            None => {
                self.done = true;
                None
            }
        }
    }
}

/// Iterate over all matches of `pattern` in `[ptr, ptr + size)`
///
/// # Params
///
/// * `ptr` - pointer to the first byte of the range to search
///
/// * `size` - range size in bytes
///
/// # Safety
///
/// * `[ptr, ptr + size)` - is readable for the iterator's whole lifetime
///
/// * nothing mutates the range while the iterator is used
pub unsafe fn scan_pattern<'a>(
    pattern: &'a Pattern,
    ptr: *const u8,
    size: usize,
    alignment: ScanAlignment,
    hints: ScanHint,
) -> Matches<'a> {
    let (offset, trunc) = pattern.truncate();
    let stride = alignment.stride();

    // a range shorter than the pattern cannot match anywhere
    let done = size < pattern.len();
    let ctx =
        (!done && !trunc.is_empty()).then(|| ScanContext::new(trunc, alignment, offset, hints));

    Matches {
        ctx,
        offset,
        stride,
        phase: offset % stride,
        cursor: ptr.wrapping_add(offset),
        end: ptr.wrapping_add(size),
        done,
    }
}

/// Find the first occurrence of `pattern` in `[ptr, ptr + size)`
///
/// # Params
///
/// * `ptr` - pointer to the first byte of the range to search
///
/// * `size` - range size in bytes
///
/// # Safety
///
/// * `ptr` - is a valid pointer
///
/// * `size` - corresponds to a valid size of the range
///
/// # Example
///
/// ```rust,ignore
/// let binary = [0xab, 0xec, 0x48, 0x89, 0x5c, 0x24, 0xee, 0x48, 0x89, 0x6c];
///
/// let pattern = Pattern::new("48 89 5c 24 ?? 48 89 6c")?;
/// let result = unsafe {
///     find_pattern(&pattern, binary.as_ptr(), binary.len(), ScanAlignment::X1, ScanHint::NONE)
/// };
/// ```
pub unsafe fn find_pattern(
    pattern: &Pattern,
    ptr: *const u8,
    size: usize,
    alignment: ScanAlignment,
    hints: ScanHint,
) -> Option<Scan> {
    // SAFETY: safe to call as long as the safety conditions were met for this function
    unsafe { scan_pattern(pattern, ptr, size, alignment, hints) }.next()
}

/// Find every occurrence of `pattern` in `[ptr, ptr + size)`, in ascending
/// address order
///
/// # Safety
/// Same as [`find_pattern`]
pub unsafe fn find_all_pattern(
    pattern: &Pattern,
    ptr: *const u8,
    size: usize,
    alignment: ScanAlignment,
    hints: ScanHint,
) -> Vec<Scan> {
    // SAFETY: safe to call as long as the safety conditions were met for this function
    unsafe { scan_pattern(pattern, ptr, size, alignment, hints) }.collect()
}

/// Find occurrences of `pattern` in `[ptr, ptr + size)` until `out` is full
/// or the input is exhausted
///
/// Returns how many matches were written and the address at which the search
/// stopped; passing that address (with the remaining size) back in yields
/// exactly the matches not produced yet.
///
/// # Safety
/// Same as [`find_pattern`]
pub unsafe fn find_all_pattern_bounded(
    pattern: &Pattern,
    ptr: *const u8,
    size: usize,
    out: &mut [Scan],
    alignment: ScanAlignment,
    hints: ScanHint,
) -> (usize, *const u8) {
    // SAFETY: safe to call as long as the safety conditions were met for this function
    let mut matches = unsafe { scan_pattern(pattern, ptr, size, alignment, hints) };

    let mut written = 0;
    for slot in out.iter_mut() {
        let Some(hit) = matches.next() else {
            break;
        };

        *slot = hit;
        written += 1;
    }

    (written, matches.resume())
}

/// Parse an IDA-style pattern and find its first occurrence in
/// `[ptr, ptr + size)`
///
/// # Safety
/// Same as [`find_pattern`]
///
/// # Example
///
/// ```rust,ignore
/// let binary = [0xab, 0xec, 0x48, 0x89, 0x5c, 0x24, 0xee, 0x48, 0x89, 0x6c];
///
/// let result = unsafe { sig_scan("48 89 5c 24 ?? 48 89 6c", binary.as_ptr(), binary.len()) };
/// ```
pub unsafe fn sig_scan(pattern: &str, ptr: *const u8, size: usize) -> Option<Scan> {
    let pattern = pattern.try_into().ok()?;
    // SAFETY: safe to call as long as the safety conditions were met for this function
    unsafe { find_pattern(&pattern, ptr, size, ScanAlignment::X1, ScanHint::NONE) }
}

/// Find the first occurrence of `pattern` in the named PE section of a loaded
/// module (e.g. `".text"`)
///
/// A missing section is reported as no match.
///
/// # Safety
/// Nothing may rewrite the section's bytes while the scan runs
#[cfg(windows)]
pub unsafe fn find_pattern_in_section(
    pattern: &Pattern,
    section: &str,
    module: &crate::module::Module,
    alignment: ScanAlignment,
    hints: ScanHint,
) -> Option<Scan> {
    let Some(range) = module.section(section) else {
        tracing::trace!(section, module = %module.name, "section not found in module");
        return None;
    };

    let begin = std::ptr::with_exposed_provenance::<u8>(range.start);
    // SAFETY: the image stays mapped while `module` exists; the caller
    // guarantees the section is not mutated during the scan
    unsafe { find_pattern(pattern, begin, range.end - range.start, alignment, hints) }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::sig;

    #[repr(C, align(64))]
    struct Aligned<const N: usize>([u8; N]);

    fn find_off(
        pat: &Pattern,
        data: &[u8],
        alignment: ScanAlignment,
        hints: ScanHint,
    ) -> Option<usize> {
        // SAFETY: data is a live slice and unmutated for the call
        unsafe { find_pattern(pat, data.as_ptr(), data.len(), alignment, hints) }
            .map(|s| s.addr.addr() - data.as_ptr().addr())
    }

    fn find_all_off(pat: &Pattern, data: &[u8], alignment: ScanAlignment) -> Vec<usize> {
        // SAFETY: data is a live slice and unmutated for the call
        unsafe { find_all_pattern(pat, data.as_ptr(), data.len(), alignment, ScanHint::NONE) }
            .into_iter()
            .map(|s| s.addr.addr() - data.as_ptr().addr())
            .collect()
    }

    /// every offset the pattern matches at, filtered to the alignment's
    /// absolute boundaries
    fn naive_all(pat: &Pattern, data: &[u8], alignment: ScanAlignment) -> Vec<usize> {
        let stride = alignment.stride();
        let base = data.as_ptr().addr();

        (0..data.len().saturating_sub(pat.len() - 1))
            .filter(|i| (base + i) % stride == 0)
            .filter(|&i| {
                pat.bytes()
                    .iter()
                    .zip(&data[i..])
                    .all(|(p, b)| p.map_or(true, |v| v == *b))
            })
            .collect()
    }

    #[test]
    fn finds_with_wildcards_and_resolves_rel() {
        let data = [0x48, 0x8B, 0x05, 0x11, 0x22, 0x33, 0x44, 0x90];
        let pat = Pattern::new("48 8B 05 ? ? ? ? 90").unwrap();

        let scan =
            // SAFETY: data is a live array
            unsafe { find_pattern(&pat, data.as_ptr(), data.len(), ScanAlignment::X1, ScanHint::NONE) }
                .unwrap();
        assert_eq!(scan.addr, data.as_ptr());

        // SAFETY: offset 3 holds 4 readable bytes
        let rel = unsafe { scan.rel(3) };
        assert_eq!(rel.addr(), data.as_ptr().addr() + 0x4433_2211 + 3 + 4);
    }

    #[test]
    fn read_and_index() {
        let data = [0x90, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x90];
        let pat = Pattern::from(&[0x90][..]);

        let scan =
            // SAFETY: data is a live array
            unsafe { find_pattern(&pat, data.as_ptr(), data.len(), ScanAlignment::X1, ScanHint::NONE) }
                .unwrap();

        // SAFETY: both reads stay inside `data`
        unsafe {
            assert_eq!(scan.read::<u32>(3), 0x20);
            assert_eq!(scan.index::<u64>(3), 4);
        }
    }

    #[test]
    fn find_all_returns_every_occurrence() {
        let data = [0x00, 0x00, 0x00, 0xAA, 0xBB, 0xCC, 0x00, 0xAA, 0xBB, 0xCC];
        let pat = Pattern::new("AA BB CC").unwrap();

        assert_eq!(find_all_off(&pat, &data, ScanAlignment::X1), vec![3, 7]);
    }

    #[test]
    fn find_all_handles_overlap_by_stride() {
        let data = [0xAA; 4];
        let pat = Pattern::new("AA AA").unwrap();

        // after a match at A the next candidate is A + 1
        assert_eq!(find_all_off(&pat, &data, ScanAlignment::X1), vec![0, 1, 2]);
    }

    #[test]
    fn x16_requires_absolute_alignment() {
        let mut buf = Aligned([0u8; 64]);
        let needle = [0xDE, 0xAD, 0xBE, 0xEF];
        let pat = Pattern::from(&needle[..]);

        buf.0[31..35].copy_from_slice(&needle);
        assert_eq!(find_off(&pat, &buf.0, ScanAlignment::X16, ScanHint::NONE), None);
        // the pattern is still there for byte-granular scans
        assert_eq!(
            find_off(&pat, &buf.0, ScanAlignment::X1, ScanHint::NONE),
            Some(31)
        );

        let mut buf = Aligned([0u8; 64]);
        buf.0[32..36].copy_from_slice(&needle);
        assert_eq!(
            find_off(&pat, &buf.0, ScanAlignment::X16, ScanHint::NONE),
            Some(32)
        );
    }

    #[test]
    fn range_shorter_than_pattern_is_no_match() {
        let data = [0xAA];
        let pat = Pattern::new("AA AA").unwrap();

        assert_eq!(find_off(&pat, &data, ScanAlignment::X1, ScanHint::NONE), None);
        assert_eq!(find_all_off(&pat, &data, ScanAlignment::X1), vec![]);
        assert_eq!(find_off(&pat, &[], ScanAlignment::X1, ScanHint::NONE), None);
    }

    #[test]
    fn leading_wildcards_report_the_original_base() {
        let data = [0x11, 0x22, 0x90];
        let pat = Pattern::new("? ? 90").unwrap();

        assert_eq!(
            find_off(&pat, &data, ScanAlignment::X1, ScanHint::NONE),
            Some(0)
        );

        // the wildcard prefix must still fit in front of the match
        let data = [0x90, 0x00, 0x00, 0x90];
        assert_eq!(
            find_off(&pat, &data, ScanAlignment::X1, ScanHint::NONE),
            Some(1)
        );
    }

    #[test]
    fn truncation_is_equivalent_to_a_shifted_scan() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut data = vec![0u8; 512];
        rng.fill(&mut data[..]);

        let full = Pattern::from(sig![?, ?, 0xDE, 0xAD]);
        let trunc = Pattern::from(sig![0xDE, 0xAD]);

        let a = find_off(&full, &data, ScanAlignment::X1, ScanHint::NONE);
        let t = find_all_off(&trunc, &data, ScanAlignment::X1)
            .into_iter()
            .find(|&t| t >= 2);
        assert_eq!(a, t.map(|t| t - 2));
    }

    #[test]
    fn all_wildcard_patterns_match_trivially() {
        let data = [0x11, 0x22, 0x33];
        let pat = Pattern::new("?? ??").unwrap();

        assert_eq!(
            find_off(&pat, &data, ScanAlignment::X1, ScanHint::NONE),
            Some(0)
        );
        assert_eq!(find_all_off(&pat, &data, ScanAlignment::X1), vec![0, 1]);

        let short = [0x11];
        assert_eq!(find_off(&pat, &short, ScanAlignment::X1, ScanHint::NONE), None);

        // X16 still constrains the candidates
        let buf = Aligned([0u8; 64]);
        assert_eq!(find_all_off(&pat, &buf.0, ScanAlignment::X16), vec![0, 16, 32, 48]);
    }

    #[test]
    fn matches_agree_with_naive_reference() {
        let mut rng = StdRng::seed_from_u64(0xDEAD);

        let patterns = [
            Pattern::from(sig![0x42]),
            Pattern::from(sig![0x42, ?, 0x17]),
            Pattern::new("? 42 17").unwrap(),
            Pattern::new("AB CD ? ? EF").unwrap(),
        ];

        for size in [1usize, 7, 64, 255, 3000] {
            // a small alphabet so short patterns occur often
            let data: Vec<u8> = (0..size).map(|_| rng.gen::<u8>() & 0x5F).collect();

            for pat in &patterns {
                if pat.len() > size {
                    continue;
                }

                for alignment in [ScanAlignment::X1, ScanAlignment::X16] {
                    let expect = naive_all(pat, &data, alignment);
                    assert_eq!(
                        find_all_off(pat, &data, alignment),
                        expect,
                        "pattern {pat:?} over {size} bytes ({alignment:?})"
                    );
                    assert_eq!(
                        find_off(pat, &data, alignment, ScanHint::NONE),
                        expect.first().copied()
                    );
                }
            }
        }
    }

    #[test]
    fn x16_respects_unaligned_range_starts() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut buf = Aligned([0u8; 256]);
        rng.fill(&mut buf.0[..]);

        let pat = Pattern::from(&buf.0[16..17]);

        // start the range off-boundary; absolute 16-aligned candidates remain
        for skip in [1usize, 5, 15, 16, 17] {
            let data = &buf.0[skip..];
            assert_eq!(
                find_all_off(&pat, data, ScanAlignment::X16),
                naive_all(&pat, data, ScanAlignment::X16)
            );
        }
    }

    #[test]
    fn bounded_resume_equals_collecting() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut data = vec![0u8; 2048];
        rng.fill(&mut data[..]);
        // force plenty of matches
        for i in (0..data.len()).step_by(9) {
            data[i] = 0x7F;
        }

        let pat = Pattern::from(sig![0x7F, ?]);

        for alignment in [ScanAlignment::X1, ScanAlignment::X16] {
            let all = find_all_off(&pat, &data, alignment);

            let base = data.as_ptr();
            let end = base.addr() + data.len();

            let mut collected = Vec::new();
            let mut ptr = base;
            let mut size = data.len();

            loop {
                let mut out = [Scan { addr: std::ptr::null() }; 3];
                // SAFETY: [ptr, ptr + size) stays inside `data`
                let (written, resume) = unsafe {
                    find_all_pattern_bounded(&pat, ptr, size, &mut out, alignment, ScanHint::NONE)
                };

                collected.extend(out[..written].iter().map(|s| s.addr.addr() - base.addr()));

                if written < out.len() {
                    break;
                }

                ptr = resume;
                size = end - resume.addr();
            }

            assert_eq!(collected, all, "{alignment:?}");
        }
    }

    #[test]
    fn hints_do_not_change_results() {
        let mut rng = StdRng::seed_from_u64(23);
        let mut data = vec![0u8; 4096];
        rng.fill(&mut data[..]);

        // short signature, the demotion case
        let pat = Pattern::from(&data[100..102]);

        let plain = find_all_off(&pat, &data, ScanAlignment::X1);
        let hinted = unsafe {
            // SAFETY: data is a live slice
            find_all_pattern(
                &pat,
                data.as_ptr(),
                data.len(),
                ScanAlignment::X1,
                ScanHint::X86_64,
            )
        };
        let hinted: Vec<usize> = hinted
            .into_iter()
            .map(|s| s.addr.addr() - data.as_ptr().addr())
            .collect();
        assert_eq!(plain, hinted);

        // unknown hint bits are ignored
        let unknown = ScanHint::from_bits(1 << 63) | ScanHint::X86_64;
        assert_eq!(
            find_off(&pat, &data, ScanAlignment::X1, unknown),
            plain.first().copied()
        );
    }

    #[test]
    fn sig_scan_parses_and_finds() {
        let data = [0xAB, 0xEC, 0x48, 0x89, 0x5C, 0x24, 0xEE, 0x48, 0x89, 0x6C];

        // SAFETY: data is a live array
        let scan = unsafe { sig_scan("48 89 5c 24 ?? 48 89 6c", data.as_ptr(), data.len()) };
        assert_eq!(scan.unwrap().addr.addr(), data.as_ptr().addr() + 2);

        // SAFETY: data is a live array
        let bad = unsafe { sig_scan("not a pattern", data.as_ptr(), data.len()) };
        assert!(bad.is_none());
    }

    #[test]
    fn hint_ops() {
        let hints = ScanHint::NONE | ScanHint::X86_64;
        assert!(hints.contains(ScanHint::X86_64));
        assert_eq!(hints & ScanHint::X86_64, ScanHint::X86_64);
        assert!(!ScanHint::NONE.contains(ScanHint::X86_64));
    }
}
