//! Process module introspection and named section lookup

use std::{
    fmt, iter, mem,
    ops::Range,
    os::windows::prelude::OsStrExt,
    path::{Path, PathBuf},
    string::FromUtf16Error,
};

use pelite::{pe::Pe, pe64::PeView};
use windows::{
    core::PCWSTR,
    Win32::{
        Foundation::{FreeLibrary, HMODULE},
        System::{
            LibraryLoader::{GetModuleFileNameW, GetModuleHandleW, LoadLibraryW},
            ProcessStatus::{GetModuleInformation, MODULEINFO},
            Threading::GetCurrentProcess,
        },
    },
};

use crate::Address;

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("filename does not exist")]
    BadPath,
    #[error("failed to convert to utf8")]
    OsStrConversion,
    #[error(transparent)]
    Utf16Conversion(#[from] FromUtf16Error),
    #[error(transparent)]
    Windows(#[from] windows::core::Error),
}

/// A handle based type which keeps the library loaded, which ensures the
/// base address is always correct as long as the handle exists
#[derive(Debug)]
struct ModuleHandle {
    path: Vec<u16>,
    base: Address,
}

impl ModuleHandle {
    fn new<P: AsRef<Path>>(path: P) -> Result<Self, ModuleError> {
        let path = path
            .as_ref()
            .as_os_str()
            .encode_wide()
            .chain(iter::once(0))
            .collect::<Vec<_>>();

        // increase library refcount
        let module = unsafe { LoadLibraryW(PCWSTR(path.as_ptr()))? };

        let slf = Self {
            path,
            // external ptr, but provenance OK
            base: module.0.expose_provenance(),
        };

        Ok(slf)
    }
}

impl Clone for ModuleHandle {
    fn clone(&self) -> Self {
        // increase refcount
        unsafe { LoadLibraryW(PCWSTR(self.path.as_ptr())).expect("load library failed") };

        Self {
            path: self.path.clone(),
            base: self.base,
        }
    }
}

impl Drop for ModuleHandle {
    fn drop(&mut self) {
        _ = unsafe { FreeLibrary(HMODULE(self.base as _)) };
    }
}

/// A loaded module. The dll refcount is increased 1 for this, so the image
/// stays mapped until every clone goes out of scope
#[derive(Clone)]
pub struct Module {
    // our own unalterable copy of the base
    handle: ModuleHandle,

    pub base: Address,
    pub end: Address,
    pub size: u32,
    pub path: PathBuf,
    pub name: String,
}

unsafe impl Send for Module {}
unsafe impl Sync for Module {}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("base", &self.base)
            .field("end", &self.end)
            .field("size", &self.size)
            .field("path", &self.path)
            .field("name", &self.name)
            .finish()
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Module {{ base: {:#x?}, end: {:#x?}, size: {}, path: {}, name: {} }}",
            self.base,
            self.end,
            self.size,
            self.path.display(),
            self.name
        )
    }
}

impl TryFrom<HMODULE> for Module {
    type Error = ModuleError;

    fn try_from(module: HMODULE) -> Result<Self, Self::Error> {
        let mut module_info = MODULEINFO::default();

        unsafe {
            GetModuleInformation(
                GetCurrentProcess(),
                module,
                &mut module_info,
                mem::size_of::<MODULEINFO>() as u32,
            )?;
        }

        let mut buffer = vec![0; 1024];
        let n = unsafe { GetModuleFileNameW(module, &mut buffer) };

        let path: PathBuf = String::from_utf16(&buffer[..n as usize])?.into();
        let name = path
            .file_name()
            .ok_or(ModuleError::BadPath)?
            .to_str()
            .ok_or(ModuleError::OsStrConversion)?
            .to_owned();

        let handle = ModuleHandle::new(&path)?;

        let base = module_info.lpBaseOfDll.expose_provenance();

        let module = Module {
            handle,
            base,
            end: base + module_info.SizeOfImage as usize,
            size: module_info.SizeOfImage,
            path,
            name,
        };

        Ok(module)
    }
}

impl Module {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ModuleError> {
        let path = path
            .as_ref()
            .as_os_str()
            .encode_wide()
            .chain(iter::once(0))
            .collect::<Vec<_>>();

        let module = unsafe { LoadLibraryW(PCWSTR(path.as_ptr()))? };

        module.try_into()
    }

    pub fn handle(&self) -> HMODULE {
        HMODULE(self.handle.base as _)
    }

    /// Virtual address range of the named PE section (e.g. `".text"`,
    /// `".rdata"`), if the module has one
    pub fn section(&self, name: &str) -> Option<Range<Address>> {
        // SAFETY: the handle keeps the image mapped, and we only support
        // 64-bit modules
        let view = unsafe { PeView::module(std::ptr::with_exposed_provenance(self.handle.base)) };

        let header = view
            .section_headers()
            .iter()
            .find(|section| section.name().map_or(false, |n| n == name))?;

        let begin = self.base + header.VirtualAddress as usize;
        Some(begin..begin + header.VirtualSize as usize)
    }
}

/// The module the current process was started from
pub fn get_process_module() -> Result<Module, ModuleError> {
    // null asks for the process image itself
    let module = unsafe { GetModuleHandleW(PCWSTR::null())? };

    module.try_into()
}
