//! Offset and symbol tables resolved once at OS setup.
//!
//! Each OS variant declares a fixed list of struct members and symbols it
//! needs, tagged required or optional. Resolution fails when any required
//! entry is missing; optional misses stay `None` so that a legitimate offset
//! of zero is never confused with "unresolved".

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Debug;
use core::marker::PhantomData;

use crate::error::{Error, Result};
use crate::symbols::Symbols;

/// Whether a missing entry fails setup or only degrades a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Required,
    Optional,
}

/// A struct-member offset the OS module depends on.
#[derive(Debug, Clone, Copy)]
pub struct OffsetDecl<I> {
    pub cat: Category,
    pub id: I,
    pub module: &'static str,
    pub struc: &'static str,
    pub member: &'static str,
}

/// A symbol address the OS module depends on.
#[derive(Debug, Clone, Copy)]
pub struct SymbolDecl<I> {
    pub cat: Category,
    pub id: I,
    pub module: &'static str,
    pub name: &'static str,
}

/// Dense identifier of a table entry.
pub trait TableId: Copy + Debug {
    fn index(self) -> usize;
}

/// Checks at compile time that a declaration list has exactly `$count`
/// entries declared in enumeration order.
macro_rules! assert_table_order {
    ($decls:expr, $count:expr) => {
        const _: () = {
            let decls = $decls;
            assert!(decls.len() == $count, "table length mismatch");
            let mut i = 0;
            while i < decls.len() {
                assert!(decls[i].id as usize == i, "table declared out of order");
                i += 1;
            }
        };
    };
}
pub(crate) use assert_table_order;

/// Resolved values, indexed by entry id.
#[derive(Debug, Clone)]
pub struct Table<I, const N: usize> {
    values: [Option<u64>; N],
    _id: PhantomData<I>,
}

impl<I: TableId, const N: usize> Table<I, N> {
    /// A table with every entry unresolved.
    pub fn empty() -> Self {
        Self {
            values: [None; N],
            _id: PhantomData,
        }
    }

    /// Resolved value of `id`, or `SymbolUnresolved`.
    pub fn get(&self, id: I) -> Result<u64> {
        self.values[id.index()].ok_or_else(|| Error::SymbolUnresolved(format!("{:?}", id)))
    }

    /// Resolved value of `id`, if any.
    pub fn opt(&self, id: I) -> Option<u64> {
        self.values[id.index()]
    }

    pub fn has(&self, id: I) -> bool {
        self.values[id.index()].is_some()
    }

    fn set(&mut self, id: I, value: u64) {
        self.values[id.index()] = Some(value);
    }
}

fn report(cat: Category, what: &str, missing: &mut Vec<String>) {
    match cat {
        Category::Required => {
            error!("unable to read {}", what);
            missing.push(String::from(what));
        }
        Category::Optional => warn!("unable to read optional {}", what),
    }
}

fn finish<T>(value: T, missing: Vec<String>) -> Result<T> {
    if missing.is_empty() {
        Ok(value)
    } else {
        Err(Error::SymbolUnresolved(missing.join(", ")))
    }
}

/// Resolve struct-member offsets from the symbol store.
pub fn resolve_offsets<I: TableId, const N: usize>(
    symbols: &Symbols,
    decls: &[OffsetDecl<I>; N],
) -> Result<Table<I, N>> {
    let mut table = Table::empty();
    let mut missing = Vec::new();
    for decl in decls {
        match symbols.struct_offset(decl.module, decl.struc, decl.member) {
            Some(offset) => table.set(decl.id, offset),
            None => {
                let what = format!("{}!{}.{} member offset", decl.module, decl.struc, decl.member);
                report(decl.cat, &what, &mut missing);
            }
        }
    }
    finish(table, missing)
}

/// Resolve symbol addresses from the symbol store.
pub fn resolve_symbols<I: TableId, const N: usize>(
    symbols: &Symbols,
    decls: &[SymbolDecl<I>; N],
) -> Result<Table<I, N>> {
    let mut table = Table::empty();
    let mut missing = Vec::new();
    for decl in decls {
        match symbols.symbol(decl.module, decl.name) {
            Some(addr) => table.set(decl.id, addr),
            None => {
                let what = format!("{}!{} symbol", decl.module, decl.name);
                report(decl.cat, &what, &mut missing);
            }
        }
    }
    finish(table, missing)
}
