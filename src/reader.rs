//! Guest memory reader: GVA → GPA translation and typed reads.
//!
//! Walks the guest's 4-level x86-64 page tables rooted at a [`Dtb`] using
//! physical reads from the debug transport, then reads guest memory page by
//! page. A reader is bound to one address space; the OS modules keep one for
//! the kernel and derive per-process readers on demand.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use axerrno::AxResult;

use crate::debug::{DebugCore, Dtb};

/// Page size (4KB)
const PAGE_SIZE: u64 = 0x1000;
const PAGE_MASK: u64 = PAGE_SIZE - 1;

bitflags::bitflags! {
    /// x86-64 paging entry bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct PteFlags: u64 {
        /// Present bit
        const PRESENT = 1 << 0;
        /// Page size bit (1GB at PDPT level, 2MB at PD level)
        const LARGE = 1 << 7;
    }
}

/// Address mask for next-level table or 4KB frame
const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;
/// Frame mask for a 1GB page
const ADDR_MASK_1G: u64 = 0x000f_ffff_c000_0000;
/// Frame mask for a 2MB page
const ADDR_MASK_2M: u64 = 0x000f_ffff_ffe0_0000;

fn read_entry(core: &dyn DebugCore, table: u64, index: u64) -> AxResult<(u64, PteFlags)> {
    let mut raw = [0u8; 8];
    core.read_physical(table + (index & 0x1ff) * 8, &mut raw)?;
    let entry = u64::from_le_bytes(raw);
    Ok((entry, PteFlags::from_bits_truncate(entry)))
}

/// Translates a Guest Virtual Address (GVA) to a Guest Physical Address (GPA)
/// by walking the page tables rooted at `dtb`.
///
/// Handles 1GB and 2MB large pages. Fails with `BadAddress` on any
/// non-present entry.
pub fn gva_to_gpa(core: &dyn DebugCore, gva: u64, dtb: Dtb) -> AxResult<u64> {
    let (pml4e, flags) = read_entry(core, dtb.table_base(), gva >> 39)?;
    log::trace!("reader: PML4[{}] = {:#x}", (gva >> 39) & 0x1ff, pml4e);
    if !flags.contains(PteFlags::PRESENT) {
        return axerrno::ax_err!(BadAddress, "PML4 entry not present");
    }

    let (pdpte, flags) = read_entry(core, pml4e & ADDR_MASK, gva >> 30)?;
    if !flags.contains(PteFlags::PRESENT) {
        return axerrno::ax_err!(BadAddress, "PDPT entry not present");
    }
    if flags.contains(PteFlags::LARGE) {
        return Ok((pdpte & ADDR_MASK_1G) | (gva & 0x3fff_ffff));
    }

    let (pde, flags) = read_entry(core, pdpte & ADDR_MASK, gva >> 21)?;
    if !flags.contains(PteFlags::PRESENT) {
        return axerrno::ax_err!(BadAddress, "PD entry not present");
    }
    if flags.contains(PteFlags::LARGE) {
        return Ok((pde & ADDR_MASK_2M) | (gva & 0x1f_ffff));
    }

    let (pte, flags) = read_entry(core, pde & ADDR_MASK, gva >> 12)?;
    if !flags.contains(PteFlags::PRESENT) {
        return axerrno::ax_err!(BadAddress, "PT entry not present");
    }

    Ok((pte & ADDR_MASK) | (gva & PAGE_MASK))
}

/// A null-padded fixed buffer decoded as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedStr {
    /// Bytes up to the first NUL, lossily decoded.
    pub value: String,
    /// No NUL was found within the buffer bound.
    pub truncated: bool,
}

/// Guest memory reader bound to one address space.
#[derive(Clone)]
pub struct Reader {
    core: Arc<dyn DebugCore>,
    dtb: Dtb,
}

impl Reader {
    pub fn new(core: Arc<dyn DebugCore>, dtb: Dtb) -> Self {
        Self { core, dtb }
    }

    /// Same transport, another address space.
    pub fn with_dtb(&self, dtb: Dtb) -> Self {
        Self {
            core: self.core.clone(),
            dtb,
        }
    }

    pub fn dtb(&self) -> Dtb {
        self.dtb
    }

    pub fn core(&self) -> &Arc<dyn DebugCore> {
        &self.core
    }

    /// Translate a virtual address in this reader's address space.
    pub fn translate(&self, va: u64) -> AxResult<u64> {
        gva_to_gpa(&*self.core, va, self.dtb)
    }

    /// Fill `buf` from guest virtual memory, translating each page.
    pub fn read(&self, va: u64, buf: &mut [u8]) -> AxResult {
        let mut done = 0usize;
        while done < buf.len() {
            let cur = va.wrapping_add(done as u64);
            let in_page = (PAGE_SIZE - (cur & PAGE_MASK)) as usize;
            let chunk = in_page.min(buf.len() - done);
            let gpa = self.translate(cur)?;
            self.core.read_physical(gpa, &mut buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    /// Read `len` bytes into a fresh buffer.
    pub fn read_vec(&self, va: u64, len: usize) -> AxResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read(va, &mut buf)?;
        Ok(buf)
    }

    pub fn read_u8(&self, va: u64) -> AxResult<u8> {
        let mut raw = [0u8; 1];
        self.read(va, &mut raw)?;
        Ok(raw[0])
    }

    pub fn le16(&self, va: u64) -> AxResult<u16> {
        let mut raw = [0u8; 2];
        self.read(va, &mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    pub fn le32(&self, va: u64) -> AxResult<u32> {
        let mut raw = [0u8; 4];
        self.read(va, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn le64(&self, va: u64) -> AxResult<u64> {
        let mut raw = [0u8; 8];
        self.read(va, &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    /// Read a guest pointer (64-bit guests only).
    pub fn read_ptr(&self, va: u64) -> AxResult<u64> {
        self.le64(va)
    }

    /// Read exactly `len` bytes and cut at the first NUL.
    ///
    /// Never reads past `va + len`.
    pub fn read_padded_str(&self, va: u64, len: usize) -> AxResult<PaddedStr> {
        let buf = self.read_vec(va, len)?;
        let (bytes, truncated) = match buf.iter().position(|&b| b == 0) {
            Some(end) => (&buf[..end], false),
            None => (&buf[..], true),
        };
        Ok(PaddedStr {
            value: String::from_utf8_lossy(bytes).into_owned(),
            truncated,
        })
    }

    /// Read a NUL-terminated string of at most `max` bytes.
    ///
    /// Reads page by page so a short string at the end of a mapped page does
    /// not fault on the next one.
    pub fn read_cstr(&self, va: u64, max: usize) -> AxResult<String> {
        let mut out = Vec::new();
        let mut cur = va;
        while out.len() < max {
            let in_page = (PAGE_SIZE - (cur & PAGE_MASK)) as usize;
            let chunk = in_page.min(max - out.len());
            let buf = self.read_vec(cur, chunk)?;
            if let Some(end) = buf.iter().position(|&b| b == 0) {
                out.extend_from_slice(&buf[..end]);
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            out.extend_from_slice(&buf);
            cur = cur.wrapping_add(chunk as u64);
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Read `byte_len` bytes of UTF-16LE text.
    pub fn read_utf16(&self, va: u64, byte_len: usize) -> AxResult<String> {
        let buf = self.read_vec(va, byte_len & !1)?;
        let units: Vec<u16> = buf
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }
}
