//! Core debug service boundary.
//!
//! The hypervisor debug transport (pause/resume, physical memory, registers,
//! execution breakpoints) lives outside this crate. It is consumed through the
//! [`DebugCore`] trait; everything else in the crate only ever talks to the
//! guest through it.

use alloc::sync::Arc;
use core::fmt;

use axerrno::AxResult;

/// Page-table root identifying one guest address space (CR3 value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Dtb(pub u64);

impl Dtb {
    /// Physical address of the top-level table, without PCID/flag bits.
    pub fn table_base(self) -> u64 {
        self.0 & 0x000f_ffff_ffff_f000
    }
}

impl fmt::LowerHex for Dtb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// x86-64 registers exposed by the debug transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rsp,
    Rbp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Cr3,
    /// `IA32_GS_BASE`
    GsBase,
    /// `IA32_KERNEL_GS_BASE`
    KernelGsBase,
    /// `IA32_LSTAR`, the 64-bit syscall entry point.
    Lstar,
}

/// Address-space filter applied to an execution breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// Fire whatever address space is active (kernel-wide events).
    Any,
    /// Fire only while the given page-table root is loaded.
    Dtb(Dtb),
}

/// Identifier handed out by the debug transport for an installed breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BreakpointId(pub u64);

/// Callback run synchronously when a breakpoint is hit.
///
/// The guest stays stopped for the duration of the call; handlers read the
/// stopped context back through [`DebugCore`].
pub type BreakpointHandler = Arc<dyn Fn() + Send + Sync>;

/// Hypervisor debug transport.
pub trait DebugCore: Send + Sync {
    /// Stop every virtual CPU of the guest.
    fn pause(&self) -> AxResult;

    /// Resume guest execution.
    fn resume(&self) -> AxResult;

    /// Read guest physical memory into `buf`.
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> AxResult;

    /// Read a register of the current virtual CPU.
    fn read_register(&self, reg: Register) -> AxResult<u64>;

    /// Write a register of the current virtual CPU.
    fn write_register(&self, reg: Register, value: u64) -> AxResult;

    /// Install an execution breakpoint at a guest virtual address.
    fn set_breakpoint(
        &self,
        addr: u64,
        filter: Filter,
        handler: BreakpointHandler,
    ) -> AxResult<BreakpointId>;

    /// Remove a breakpoint previously returned by [`DebugCore::set_breakpoint`].
    fn clear_breakpoint(&self, id: BreakpointId) -> AxResult;
}

/// Owned breakpoint registration.
///
/// Dropping the handle clears the breakpoint in the debug transport; removal
/// takes effect for every later hit, including when dropped from inside a
/// callback.
pub struct Breakpoint {
    core: Arc<dyn DebugCore>,
    id: BreakpointId,
    addr: u64,
}

impl Breakpoint {
    /// Install a breakpoint and wrap it in an owning handle.
    pub fn install(
        core: &Arc<dyn DebugCore>,
        addr: u64,
        filter: Filter,
        handler: BreakpointHandler,
    ) -> AxResult<Self> {
        let id = core.set_breakpoint(addr, filter, handler)?;
        trace!("breakpoint: installed {:?} at {:#x} ({:?})", id, addr, filter);
        Ok(Self {
            core: core.clone(),
            id,
            addr,
        })
    }

    /// Guest virtual address the breakpoint traps.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Transport-level identifier.
    pub fn id(&self) -> BreakpointId {
        self.id
    }
}

impl Drop for Breakpoint {
    fn drop(&mut self) {
        if let Err(e) = self.core.clear_breakpoint(self.id) {
            error!(
                "breakpoint: unable to clear {:?} at {:#x}: {:?}",
                self.id, self.addr, e
            );
        }
    }
}

impl fmt::Debug for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Breakpoint")
            .field("id", &self.id)
            .field("addr", &format_args!("{:#x}", self.addr))
            .finish()
    }
}

/// Keeps the guest paused while alive.
///
/// Enumerations read live guest memory and should run under a pause guard to
/// avoid torn traversals.
pub struct PauseGuard<'a> {
    core: &'a dyn DebugCore,
}

impl<'a> PauseGuard<'a> {
    /// Pause the guest until the guard is dropped.
    pub fn new(core: &'a dyn DebugCore) -> AxResult<Self> {
        core.pause()?;
        Ok(Self { core })
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.core.resume() {
            error!("pause guard: unable to resume guest: {:?}", e);
        }
    }
}
