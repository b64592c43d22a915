//! Kernel symbol source backed by a kallsyms blob.
//!
//! Lets a Linux guest's symbol addresses come from a `kallsyms.bin` blob
//! extracted alongside the guest kernel instead of a `System.map`. The blob
//! carries symbols only; struct offsets still come from DWARF.

use alloc::format;
use alloc::string::{String, ToString};
use ksym::{KSYM_NAME_LEN, KallsymsMapped};

use crate::error::{Error, Result};
use crate::symbols::SymbolSource;

/// Absolute kernel symbols from a kallsyms blob.
pub struct KernelSymbolMap {
    table: KallsymsMapped<'static>,
}

// The mapped table is never mutated after `from_blob` and only borrows the
// static blob.
unsafe impl Send for KernelSymbolMap {}
unsafe impl Sync for KernelSymbolMap {}

impl KernelSymbolMap {
    /// Parse a kallsyms blob covering the guest text range `stext..etext`.
    pub fn from_blob(data: &'static [u8], stext: u64, etext: u64) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::DebugInfoParse(String::from("empty kallsyms blob")));
        }
        if stext > etext {
            return Err(Error::DebugInfoParse(format!(
                "kallsyms text range {:#x} - {:#x} is inverted",
                stext, etext
            )));
        }

        let ptr = data.as_ptr() as usize;
        if ptr % 4096 != 0 {
            warn!("kallsyms: blob is not page-aligned (ptr % 4096 = {})", ptr % 4096);
        }

        let table = KallsymsMapped::from_blob(data, stext, etext)
            .map_err(|e| Error::DebugInfoParse(e.to_string()))?;
        info!(
            "kallsyms: loaded {} bytes, text range {:#x} - {:#x}",
            data.len(),
            stext,
            etext
        );
        Ok(Self { table })
    }
}

impl SymbolSource for KernelSymbolMap {
    fn symbol(&self, name: &str) -> Option<u64> {
        self.table.lookup_name(name)
    }

    fn struct_offset(&self, _struc: &str, _member: &str) -> Option<u64> {
        None
    }

    fn find(&self, addr: u64) -> Option<(String, u64)> {
        let mut name_buf = [0u8; KSYM_NAME_LEN];
        let (name, _size, offset, _ty) = self.table.lookup_address(addr, &mut name_buf)?;
        Some((String::from(name), offset))
    }
}
