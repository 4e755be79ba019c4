//! Experimental: locate a class vtable by name through MSVC RTTI
//!
//! Works backwards through the compiler's RTTI records: the class name pins
//! its `type_info` in `.data`, complete object locators in `.rdata` reference
//! that `type_info` by image-relative address, and the vtable itself sits
//! right behind the pointer to its locator. Every step is a signature scan
//! over the module's sections.

use std::{mem, ptr};

use tracing::trace;

use crate::module::Module;
use crate::pattern::Pattern;
use crate::scan::{self, Scan, ScanAlignment, ScanHint};

/// byte offset of the mangled name inside msvc's `type_info`
const TYPE_DESC_NAME: usize = 0x10;
/// byte offset of the type descriptor rva inside `_RTTICompleteObjectLocator`
const COL_TYPE_DESC: usize = 0xC;
/// byte offset of the vtable displacement inside `_RTTICompleteObjectLocator`
const COL_OFFSET: usize = 0x4;

/// Find the primary vtable for `class_name` (unqualified, e.g. `"MyClass"`)
/// in a module compiled with MSVC
///
/// Returns `None` when the class has no RTTI records in the module.
pub fn find_vtable(class_name: &str, module: &Module) -> Option<Scan> {
    let data = module.section(".data")?;
    let rdata = module.section(".rdata")?;

    let data_ptr = ptr::with_exposed_provenance::<u8>(data.start);
    let rdata_ptr = ptr::with_exposed_provenance::<u8>(rdata.start);

    // the type descriptor's mangled name for `class C` is `.?AVC@@`
    let name = format!(".?AV{class_name}@@");
    let pat = Pattern::from(name.as_bytes());

    // SAFETY: the module handle keeps both sections mapped, and RTTI records
    // are static data nothing rewrites after load
    let hit = unsafe {
        scan::find_pattern(
            &pat,
            data_ptr,
            data.end - data.start,
            ScanAlignment::X1,
            ScanHint::NONE,
        )
    }?;

    let type_desc = hit.addr.addr().checked_sub(TYPE_DESC_NAME)?;
    if type_desc < data.start {
        return None;
    }

    let rva = u32::try_from(type_desc - module.base).ok()?;
    trace!(class_name, rva, "type descriptor located");

    // complete object locators store the descriptor's image-relative address
    let col_pat = Pattern::from(&rva.to_le_bytes()[..]);
    // SAFETY: same as above
    let col_refs = unsafe {
        scan::find_all_pattern(
            &col_pat,
            rdata_ptr,
            rdata.end - rdata.start,
            ScanAlignment::X1,
            ScanHint::NONE,
        )
    };

    for col_ref in col_refs {
        let Some(col) = col_ref.addr.addr().checked_sub(COL_TYPE_DESC) else {
            continue;
        };
        if col < rdata.start {
            continue;
        }

        // a non-zero displacement belongs to a secondary base; the primary
        // vtable is the one at 0
        // SAFETY: col + 8 stays inside .rdata since the rva match did
        let offset = unsafe {
            ptr::with_exposed_provenance::<u8>(col)
                .add(COL_OFFSET)
                .cast::<u32>()
                .read_unaligned()
        };
        if offset != 0 {
            continue;
        }

        // the vtable starts right after the pointer to its locator
        let meta_pat = Pattern::from(&(col as u64).to_le_bytes()[..]);
        // SAFETY: same as above
        let meta = unsafe {
            scan::find_pattern(
                &meta_pat,
                rdata_ptr,
                rdata.end - rdata.start,
                ScanAlignment::X1,
                ScanHint::NONE,
            )
        };
        let Some(meta) = meta else {
            continue;
        };

        trace!(class_name, col, meta = meta.addr.addr(), "vtable resolved");

        return Some(Scan {
            addr: meta.addr.wrapping_add(mem::size_of::<u64>()),
        });
    }

    None
}
