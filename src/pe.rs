//! Minimal PE header walking over guest memory.
//!
//! Only what introspection needs: validating an image header, reading its
//! size, and finding the CodeView debug record.

use alloc::format;
use alloc::string::String;

use crate::error::{Error, Result};
use crate::reader::Reader;
use crate::types::Span;

const DOS_MAGIC: u16 = 0x5a4d; // "MZ"
const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
const OPT_MAGIC_PE32: u16 = 0x10b;
const OPT_MAGIC_PE32_PLUS: u16 = 0x20b;

/// `IMAGE_DIRECTORY_ENTRY_DEBUG`
const DIRECTORY_DEBUG: u64 = 6;
/// `IMAGE_DEBUG_TYPE_CODEVIEW`
const DEBUG_TYPE_CODEVIEW: u32 = 2;
/// `sizeof(IMAGE_DEBUG_DIRECTORY)`
const DEBUG_DIRECTORY_SIZE: u64 = 28;

const E_LFANEW: u64 = 0x3c;
/// Offset of the optional header from the PE signature.
const OPTIONAL_HEADER: u64 = 4 + 20;
/// Offset of `SizeOfImage` in the optional header (both formats).
const SIZE_OF_IMAGE: u64 = 56;
/// Offset of the data directories in the optional header.
const DATA_DIRECTORIES_PE32: u64 = 96;
const DATA_DIRECTORIES_PE32_PLUS: u64 = 112;

/// Sanity bounds on header fields read from an untrusted guest.
const MAX_LFANEW: u32 = 0x1000;
const MAX_DEBUG_ENTRIES: u64 = 32;

fn invalid(what: &str) -> Error {
    Error::DebugInfoParse(format!("invalid PE image: {}", what))
}

/// Address of the optional header of the image at `base`.
fn optional_header(reader: &Reader, base: u64) -> Result<(u64, u16)> {
    if reader.le16(base)? != DOS_MAGIC {
        return Err(invalid("missing MZ header"));
    }
    let lfanew = reader.le32(base.wrapping_add(E_LFANEW))?;
    if lfanew > MAX_LFANEW {
        return Err(invalid("e_lfanew out of range"));
    }
    let nt = base.wrapping_add(lfanew as u64);
    if reader.le32(nt)? != PE_SIGNATURE {
        return Err(invalid("missing PE signature"));
    }
    let opt = nt.wrapping_add(OPTIONAL_HEADER);
    let magic = reader.le16(opt)?;
    if magic != OPT_MAGIC_PE32 && magic != OPT_MAGIC_PE32_PLUS {
        return Err(invalid("unknown optional header magic"));
    }
    Ok((opt, magic))
}

/// Whether a valid PE header sits at `base`.
pub fn is_image(reader: &Reader, base: u64) -> bool {
    optional_header(reader, base).is_ok()
}

/// `SizeOfImage` of the image at `base`.
pub fn image_size(reader: &Reader, base: u64) -> Result<u64> {
    let (opt, _) = optional_header(reader, base)?;
    Ok(reader.le32(opt.wrapping_add(SIZE_OF_IMAGE))? as u64)
}

/// Locate the CodeView record of the image mapped at `image`.
pub fn find_debug_codeview(reader: &Reader, image: Span) -> Result<Span> {
    let (opt, magic) = optional_header(reader, image.addr)?;
    let dirs = match magic {
        OPT_MAGIC_PE32 => opt.wrapping_add(DATA_DIRECTORIES_PE32),
        _ => opt.wrapping_add(DATA_DIRECTORIES_PE32_PLUS),
    };

    let rva = reader.le32(dirs.wrapping_add(DIRECTORY_DEBUG * 8))? as u64;
    let size = reader.le32(dirs.wrapping_add(DIRECTORY_DEBUG * 8 + 4))? as u64;
    if rva == 0 || size == 0 {
        return Err(Error::NotFound(String::from("debug directory")));
    }

    let count = (size / DEBUG_DIRECTORY_SIZE).min(MAX_DEBUG_ENTRIES);
    for i in 0..count {
        let entry = image.addr.wrapping_add(rva + i * DEBUG_DIRECTORY_SIZE);
        if reader.le32(entry.wrapping_add(12))? != DEBUG_TYPE_CODEVIEW {
            continue;
        }
        let size = reader.le32(entry.wrapping_add(16))? as u64;
        let addr_rva = reader.le32(entry.wrapping_add(20))? as u64;
        let span = Span::new(image.addr.wrapping_add(addr_rva), size);
        if size == 0 || (image.size != 0 && span.end() > image.end()) {
            return Err(invalid("codeview record outside image"));
        }
        return Ok(span);
    }

    Err(Error::NotFound(String::from("codeview debug entry")))
}
