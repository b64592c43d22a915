//! Symbol store.
//!
//! Maps `(module, symbol)` to guest addresses and `(module, struct, member)`
//! to byte offsets. Each module contributes one [`SymbolSource`] once its
//! debug info is loaded; the first insertion for a module name wins and later
//! attempts are rejected with [`Error::AlreadyLoaded`].
//!
//! Lookups clone the module entry out of the lock before querying it, so the
//! store can be populated from inside breakpoint callbacks while other
//! callers are reading.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;
use spin::RwLock;

use crate::debug_info::DebugInfoBackend;
use crate::error::{Error, Result};
use crate::reader::Reader;
use crate::types::Span;

/// Upper bound on a debug descriptor read out of a guest image.
const MAX_DESCRIPTOR_SIZE: u64 = 0x10000;

/// A queryable set of symbol facts for one module.
///
/// Addresses returned by a source are relative to the module base when the
/// module was inserted with a span, absolute otherwise.
pub trait SymbolSource: Send + Sync {
    /// Address of a named symbol.
    fn symbol(&self, name: &str) -> Option<u64>;

    /// Byte offset of `member` inside `struc`.
    fn struct_offset(&self, struc: &str, member: &str) -> Option<u64>;

    /// Closest symbol at or below `addr`, with the distance from it.
    fn find(&self, addr: u64) -> Option<(String, u64)>;
}

/// In-memory symbol facts, as produced by a debug-info backend.
#[derive(Debug, Clone, Default)]
pub struct SymbolMap {
    symbols: HashMap<String, u64>,
    by_addr: BTreeMap<u64, String>,
    structs: HashMap<String, HashMap<String, u64>>,
}

impl SymbolMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_symbol(&mut self, name: &str, addr: u64) {
        self.symbols.insert(name.to_string(), addr);
        self.by_addr.entry(addr).or_insert_with(|| name.to_string());
    }

    pub fn add_member(&mut self, struc: &str, member: &str, offset: u64) {
        self.structs
            .entry(struc.to_string())
            .or_default()
            .insert(member.to_string(), offset);
    }

    /// Number of symbols (struct members excluded).
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty() && self.structs.is_empty()
    }

    /// Parse a `System.map` style listing: `<hex address> <type> <name>` per line.
    ///
    /// Lines that do not match the format are skipped.
    pub fn from_system_map(text: &str) -> Result<Self> {
        let mut map = Self::new();
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let (Some(addr), Some(_ty), Some(name)) = (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let Ok(addr) = u64::from_str_radix(addr, 16) else {
                continue;
            };
            map.add_symbol(name, addr);
        }

        if map.is_empty() {
            return Err(Error::DebugInfoParse("empty System.map".to_string()));
        }
        Ok(map)
    }
}

impl SymbolSource for SymbolMap {
    fn symbol(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    fn struct_offset(&self, struc: &str, member: &str) -> Option<u64> {
        self.structs.get(struc)?.get(member).copied()
    }

    fn find(&self, addr: u64) -> Option<(String, u64)> {
        let (start, name) = self.by_addr.range(..=addr).next_back()?;
        Some((name.clone(), addr - start))
    }
}

/// Result of a reverse lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRef {
    pub module: String,
    pub symbol: String,
    pub offset: u64,
}

impl fmt::Display for SymbolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.offset == 0 {
            write!(f, "{}!{}", self.module, self.symbol)
        } else {
            write!(f, "{}!{}+{:#x}", self.module, self.symbol, self.offset)
        }
    }
}

#[derive(Clone)]
struct ModuleEntry {
    span: Option<Span>,
    source: Arc<dyn SymbolSource>,
}

impl ModuleEntry {
    fn base(&self) -> u64 {
        self.span.map_or(0, |s| s.addr)
    }
}

/// Named collection of per-module symbol sources.
pub struct Symbols {
    backend: Arc<dyn DebugInfoBackend>,
    modules: RwLock<BTreeMap<String, ModuleEntry>>,
}

impl Symbols {
    pub fn new(backend: Arc<dyn DebugInfoBackend>) -> Self {
        Self {
            backend,
            modules: RwLock::new(BTreeMap::new()),
        }
    }

    /// Debug-info backend used to parse inserted blobs.
    pub fn backend(&self) -> &Arc<dyn DebugInfoBackend> {
        &self.backend
    }

    /// Parse `blob` with the backend and record its facts under `module`.
    ///
    /// With a span, backend addresses are treated as offsets from
    /// `span.addr`.
    pub fn insert(&self, module: &str, span: Option<Span>, blob: &[u8]) -> Result {
        if self.contains(module) {
            warn!("symbols: {} already loaded, ignoring new debug info", module);
            return Err(Error::AlreadyLoaded(module.to_string()));
        }

        let map = self.backend.parse(module, blob).map_err(|e| {
            error!("symbols: unable to parse debug info for {}: {}", module, e);
            e
        })?;
        self.insert_source(module, span, Arc::new(map))
    }

    /// Load the debug info of the image mapped at `image` under `module`.
    ///
    /// The backend locates the debug descriptor inside the image; the
    /// descriptor is read from guest memory and parsed like [`Symbols::insert`],
    /// rebased on the image span.
    pub fn insert_image(&self, module: &str, reader: &Reader, image: Span) -> Result {
        if self.contains(module) {
            return Err(Error::AlreadyLoaded(module.to_string()));
        }

        let descriptor = self.backend.locate(reader, image)?;
        if descriptor.size > MAX_DESCRIPTOR_SIZE {
            return Err(Error::DebugInfoParse(format!(
                "{} debug descriptor too large ({:#x} bytes)",
                module, descriptor.size
            )));
        }
        let blob = reader.read_vec(descriptor.addr, descriptor.size as usize)?;
        debug!(
            "symbols: {} debug descriptor at {} ({} bytes)",
            module,
            descriptor,
            blob.len()
        );
        self.insert(module, Some(image), &blob)
    }

    /// Ask the backend for a filesystem-resident map of `module` and record it.
    pub fn load_file(&self, module: &str) -> Result {
        if self.contains(module) {
            return Err(Error::AlreadyLoaded(module.to_string()));
        }
        let map = self.backend.load_file(module)?;
        self.insert_source(module, None, Arc::new(map))
    }

    /// Record a pre-built source under `module`.
    pub fn insert_source(
        &self,
        module: &str,
        span: Option<Span>,
        source: Arc<dyn SymbolSource>,
    ) -> Result {
        let mut modules = self.modules.write();
        if modules.contains_key(module) {
            warn!("symbols: {} already loaded, keeping first insertion", module);
            return Err(Error::AlreadyLoaded(module.to_string()));
        }

        modules.insert(module.to_string(), ModuleEntry { span, source });
        match span {
            Some(span) => info!("symbols: loaded {} at {}", module, span),
            None => info!("symbols: loaded {}", module),
        }
        Ok(())
    }

    /// Whether symbols for `module` are present.
    pub fn contains(&self, module: &str) -> bool {
        self.modules.read().contains_key(module)
    }

    /// Names of all loaded modules.
    pub fn modules(&self) -> Vec<String> {
        self.modules.read().keys().cloned().collect()
    }

    fn entry(&self, module: &str) -> Option<ModuleEntry> {
        self.modules.read().get(module).cloned()
    }

    /// Address of `module!name`.
    pub fn symbol(&self, module: &str, name: &str) -> Option<u64> {
        let entry = self.entry(module)?;
        let addr = entry.source.symbol(name)?;
        Some(entry.base().wrapping_add(addr))
    }

    /// Offset of `module!struc.member`.
    pub fn struct_offset(&self, module: &str, struc: &str, member: &str) -> Option<u64> {
        self.entry(module)?.source.struct_offset(struc, member)
    }

    /// Reverse lookup of a guest address.
    ///
    /// Modules whose span covers `addr` are tried first, then modules loaded
    /// with absolute addresses.
    pub fn find(&self, addr: u64) -> Option<SymbolRef> {
        let entries: Vec<(String, ModuleEntry)> = self
            .modules
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect();

        let spanned = entries
            .iter()
            .filter(|(_, e)| e.span.is_some_and(|s| s.contains(addr)));
        let absolute = entries.iter().filter(|(_, e)| e.span.is_none());

        spanned.chain(absolute).find_map(|(module, entry)| {
            let (symbol, offset) = entry.source.find(addr - entry.base())?;
            Some(SymbolRef {
                module: module.clone(),
                symbol,
                offset,
            })
        })
    }
}
