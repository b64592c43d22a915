//! Debug info backend boundary.
//!
//! Turning raw PDB/DWARF records into facts is done outside this crate. The
//! backend receives either the debug descriptor read from a guest image or a
//! module name for a filesystem-resident map, and returns a [`SymbolMap`].

use crate::error::{Error, Result};
use crate::pe;
use crate::reader::Reader;
use crate::symbols::SymbolMap;
use crate::types::Span;

/// Parser for debug information.
pub trait DebugInfoBackend: Send + Sync {
    /// Parse the debug blob read from a module image.
    ///
    /// For PE images the blob is the CodeView record (`RSDS`, GUID, age,
    /// PDB path) located by [`DebugInfoBackend::locate`]. Addresses in the
    /// returned map are relative to the module base.
    fn parse(&self, module: &str, blob: &[u8]) -> Result<SymbolMap>;

    /// Load symbols from a filesystem-resident source (DWARF, `System.map`).
    ///
    /// Addresses in the returned map are absolute.
    fn load_file(&self, module: &str) -> Result<SymbolMap> {
        let _ = module;
        Err(Error::Unsupported("filesystem symbol maps"))
    }

    /// Locate the debug descriptor inside a mapped module image.
    fn locate(&self, reader: &Reader, image: Span) -> Result<Span> {
        pe::find_debug_codeview(reader, image)
    }
}
