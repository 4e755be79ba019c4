//! Scanner backend selection
//!
//! The widest matcher the host supports is picked once, on first use, and
//! cached for the lifetime of the process. `is_x86_feature_detected!` also
//! checks (via XGETBV) that the OS preserves the extended register file a
//! tier needs, so a capability reported here is actually usable.

#[cfg(target_arch = "x86_64")]
mod avx2;
#[cfg(all(target_arch = "x86_64", feature = "avx512"))]
mod avx512;
mod scalar;
#[cfg(all(target_arch = "x86_64", feature = "sse"))]
mod sse;

use std::sync::OnceLock;

use tracing::debug;

#[cfg(target_arch = "x86_64")]
use super::context::ScanContext;
use super::context::ScanFn;
#[cfg(target_arch = "x86_64")]
use super::ScanAlignment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanMode {
    FastFirst,
    #[cfg(all(target_arch = "x86_64", feature = "sse"))]
    Sse,
    #[cfg(target_arch = "x86_64")]
    Avx2,
    #[cfg(all(target_arch = "x86_64", feature = "avx512"))]
    Avx512,
}

/// The widest enabled matcher the host CPU and OS support
pub(crate) fn mode() -> ScanMode {
    static MODE: OnceLock<ScanMode> = OnceLock::new();

    // racing first-time callers recompute the same value; publication is atomic
    *MODE.get_or_init(|| {
        let mode = detect();
        debug!(?mode, "resolved scan backend");
        mode
    })
}

fn detect() -> ScanMode {
    #[cfg(target_arch = "x86_64")]
    {
        #[cfg(feature = "avx512")]
        if is_x86_feature_detected!("avx512f")
            && is_x86_feature_detected!("avx512bw")
            && is_x86_feature_detected!("bmi1")
        {
            return ScanMode::Avx512;
        }

        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("bmi1") {
            return ScanMode::Avx2;
        }

        #[cfg(feature = "sse")]
        if is_x86_feature_detected!("sse4.1") {
            return ScanMode::Sse;
        }
    }

    ScanMode::FastFirst
}

/// Matcher and vector size (bytes per iteration, 0 for scalar) for a mode
pub(crate) fn scanner_for(mode: ScanMode) -> (ScanFn, usize) {
    match mode {
        ScanMode::FastFirst => (scalar::find, 0),
        #[cfg(all(target_arch = "x86_64", feature = "sse"))]
        ScanMode::Sse => (sse::find, 16),
        #[cfg(target_arch = "x86_64")]
        ScanMode::Avx2 => (avx2::find, 32),
        #[cfg(all(target_arch = "x86_64", feature = "avx512"))]
        ScanMode::Avx512 => (avx512::find, 64),
    }
}

/// Lane mask for a `width`-byte vector compare; a cleared bit skips that
/// candidate. All ones for X1, every 16th bit (shifted to the context's
/// phase) for X16.
#[cfg(target_arch = "x86_64")]
pub(crate) fn alignment_mask(width: usize, ctx: &ScanContext) -> u64 {
    match ctx.alignment {
        ScanAlignment::X1 => match width {
            64 => !0,
            _ => (1u64 << width) - 1,
        },
        ScanAlignment::X16 => {
            let mut mask = 0u64;
            let mut bit = ctx.phase;
            while bit < width {
                mask |= 1 << bit;
                bit += 16;
            }
            mask
        }
    }
}
