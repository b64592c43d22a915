//! AxVisor guest introspection
//!
//! Inspects a running guest OS from the hypervisor side, without an agent in
//! the guest: kernel struct layouts are resolved from debug symbols, kernel
//! memory is walked through the guest page tables, and execution breakpoints
//! filtered by address space report lifecycle events and syscalls.
//!
//! # Layers
//!
//! - [`reader`] - guest virtual memory access through a [`debug::DebugCore`]
//! - [`symbols`] - per-module symbol and struct-offset store
//! - [`os`] - Linux / NT process, thread, module and driver introspection
//! - [`monitor`] - syscall breakpoints with calling-convention argument access
//! - [`loader`] - follows a process' modules and loads their symbols
//!
//! # Features
//!
//! - `kallsyms` - kernel symbol source backed by a kallsyms blob (default)
//!
//! # Quick Start
//!
//! ```ignore
//! use core::ops::ControlFlow;
//! use axvmi::{OsModule, Session};
//!
//! let session = Session::setup(core, backend, None)?;
//! let _paused = session.pause()?;
//! session.os().proc_list(&mut |proc| {
//!     info!("{:#x} {:?}", proc.id, session.os().proc_name(proc));
//!     ControlFlow::Continue(())
//! })?;
//! ```

#![no_std]

extern crate alloc;

#[macro_use]
extern crate log;

// =============================================================================
// Guest Access
// =============================================================================

pub mod args;
pub mod debug;
pub mod error;
pub mod reader;
pub mod types;

// =============================================================================
// Symbols
// =============================================================================

pub mod debug_info;
pub mod pe;
pub mod symbols;

#[cfg(feature = "kallsyms")]
pub mod kallsyms;

// =============================================================================
// OS Introspection
// =============================================================================

pub mod os;

// =============================================================================
// Monitors
// =============================================================================

pub mod loader;
pub mod monitor;
pub mod session;

// Re-export key types for convenience
pub use args::CallConv;
pub use debug::{Breakpoint, DebugCore, Dtb, Filter, PauseGuard, Register};
pub use debug_info::DebugInfoBackend;
pub use error::{Error, Result};
pub use loader::{Loader, Predicate};
pub use monitor::{GenericMonitor, NT_SYSCALLS, SyscallCall, SyscallDef, SyscallTable};
pub use os::{EventId, Os, OsKind, OsModule};
pub use reader::Reader;
pub use session::Session;
pub use symbols::{SymbolMap, SymbolRef, SymbolSource, Symbols};
pub use types::{Driver, Flags, Module, Process, Span, Thread, VmArea, VmaAccess};

#[cfg(feature = "kallsyms")]
pub use kallsyms::KernelSymbolMap;
