//! Pointer boundary arithmetic for aligned scanning
//!
//! Candidate addresses are constrained to `addr % stride == phase` in
//! absolute address space. The math is modular on the numeric address, so it
//! is defined for every pointer the scanner can produce, one-past-end
//! included.

/// Round up to the smallest address `>= ptr` congruent to `phase` modulo
/// `stride`. Identity for stride 1.
pub(crate) fn next_boundary(ptr: *const u8, stride: usize, phase: usize) -> *const u8 {
    if stride == 1 {
        return ptr;
    }

    ptr.map_addr(|addr| {
        let rem = addr.wrapping_sub(phase) % stride;
        match rem {
            0 => addr,
            _ => addr.wrapping_add(stride - rem),
        }
    })
}

/// Round down to the largest address `<= ptr` congruent to `phase` modulo
/// `stride`. Identity for stride 1.
pub(crate) fn prev_boundary(ptr: *const u8, stride: usize, phase: usize) -> *const u8 {
    if stride == 1 {
        return ptr;
    }

    ptr.map_addr(|addr| addr.wrapping_sub(addr.wrapping_sub(phase) % stride))
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use super::*;

    fn at(addr: usize) -> *const u8 {
        ptr::without_provenance(addr)
    }

    #[test]
    fn stride_one_is_identity() {
        assert_eq!(next_boundary(at(0x1003), 1, 0), at(0x1003));
        assert_eq!(prev_boundary(at(0x1003), 1, 0), at(0x1003));
    }

    #[test]
    fn rounds_to_sixteen() {
        assert_eq!(next_boundary(at(0x1000), 16, 0), at(0x1000));
        assert_eq!(next_boundary(at(0x1001), 16, 0), at(0x1010));
        assert_eq!(next_boundary(at(0x100F), 16, 0), at(0x1010));
        assert_eq!(prev_boundary(at(0x1000), 16, 0), at(0x1000));
        assert_eq!(prev_boundary(at(0x100F), 16, 0), at(0x1000));
        assert_eq!(prev_boundary(at(0x1010), 16, 0), at(0x1010));
    }

    #[test]
    fn honors_phase() {
        assert_eq!(next_boundary(at(0x1000), 16, 3), at(0x1003));
        assert_eq!(next_boundary(at(0x1004), 16, 3), at(0x1013));
        assert_eq!(prev_boundary(at(0x1012), 16, 3), at(0x1003));
        assert_eq!(prev_boundary(at(0x1003), 16, 3), at(0x1003));
    }
}
