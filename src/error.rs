//! Error taxonomy shared by the introspection layers.
//!
//! Guest memory access itself reports [`axerrno::AxError`]; everything built
//! on top of it (symbol store, OS modules, monitors) reports [`Error`].

use alloc::string::String;
use axerrno::AxError;

/// Error types for introspection operations.
#[derive(Debug, Clone)]
pub enum Error {
    /// Guest memory could not be translated or read.
    ReadFault(AxError),
    /// A named symbol or struct member is absent from the symbol store.
    SymbolUnresolved(String),
    /// A module was intentionally skipped by the caller's predicate.
    PredicateRejected(String),
    /// A debug-info blob was malformed or unsupported.
    DebugInfoParse(String),
    /// The module already has symbols in the store.
    AlreadyLoaded(String),
    /// The guest OS variant has no such concept.
    Unsupported(&'static str),
    /// A named entry does not exist.
    NotFound(String),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ReadFault(e) => write!(f, "Guest read fault: {:?}", e),
            Self::SymbolUnresolved(name) => write!(f, "Unable to resolve {}", name),
            Self::PredicateRejected(name) => write!(f, "Module {} rejected by predicate", name),
            Self::DebugInfoParse(e) => write!(f, "Failed to parse debug info: {}", e),
            Self::AlreadyLoaded(name) => write!(f, "Symbols for {} already loaded", name),
            Self::Unsupported(what) => write!(f, "Unsupported on this guest: {}", what),
            Self::NotFound(name) => write!(f, "Not found: {}", name),
        }
    }
}

impl core::error::Error for Error {}

impl From<AxError> for Error {
    fn from(e: AxError) -> Self {
        Self::ReadFault(e)
    }
}

/// Result alias used across the crate.
pub type Result<T = ()> = core::result::Result<T, Error>;
