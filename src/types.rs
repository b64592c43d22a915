//! Handles to guest kernel objects.
//!
//! Every handle is a snapshot of a live guest object. Nothing here owns guest
//! state: a handle goes stale when the guest frees the object, which only shows
//! up as read failures later on.

use core::fmt;

use crate::debug::Dtb;

/// A schedulable guest process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Process {
    /// Guest virtual address of the process kernel object.
    pub id: u64,
    /// Page-table root of the process address space.
    pub dtb: Dtb,
}

/// A guest thread. On Linux the id is the task itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Thread {
    pub id: u64,
}

/// A module mapped in a process (DLL, shared object).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Module {
    pub id: u64,
    pub flags: Flags,
}

/// A virtual memory area of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmArea {
    pub id: u64,
}

/// A loaded kernel driver / kernel module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Driver {
    pub id: u64,
}

/// Contiguous guest virtual range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Span {
    pub addr: u64,
    pub size: u64,
}

impl Span {
    pub fn new(addr: u64, size: u64) -> Self {
        Self { addr, size }
    }

    /// Exclusive end address.
    pub fn end(&self) -> u64 {
        self.addr.saturating_add(self.size)
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr < self.end()
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}-{:#x}", self.addr, self.end())
    }
}

bitflags::bitflags! {
    /// Process / module attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u32 {
        /// 32-bit code (WoW64 process or module).
        const X86 = 1 << 0;
        /// 64-bit code.
        const X64 = 1 << 1;
        /// Kernel-only process (Linux kernel thread, NT System process).
        const KERNEL = 1 << 2;
    }
}

/// Access rights of a VM area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmaAccess {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}
