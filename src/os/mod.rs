//! Guest OS introspection.
//!
//! Provides one capability interface, [`OsModule`], over a closed set of guest
//! variants:
//! - Linux: `task_struct` walking, offsets from DWARF, symbols from
//!   `System.map` or kallsyms
//! - NT: `EPROCESS` walking, offsets and symbols from the kernel PDB
//!
//! The variant is picked once per session ([`OsKind`]) and never mixed.
//! Setting up a variant *is* its construction: a module that failed to
//! resolve its required offsets is never handed out.

use alloc::string::String;
use alloc::sync::Arc;
use core::ops::ControlFlow;

use crate::args::CallConv;
use crate::debug::{DebugCore, Register};
use crate::error::Result;
use crate::pe;
use crate::reader::Reader;
use crate::symbols::Symbols;
use crate::types::{Driver, Flags, Module, Process, Span, Thread, VmArea, VmaAccess};

pub mod events;
pub mod linux;
pub mod nt;
pub mod table;

pub use events::{DrvEventFn, EventId, EventKind, ModEventFn, ProcEventFn, ThreadEventFn};
pub use linux::OsLinux;
pub use nt::OsNt;

/// Upper bound on nodes visited in one guest list walk.
///
/// Guest lists are circular when healthy; the ceiling only stops corrupted
/// or concurrently modified ones.
pub const MAX_LIST_NODES: usize = 0x8000;

/// Lowest canonical kernel-half address on x86-64.
pub const KERNEL_SPACE_START: u64 = 0xffff_8000_0000_0000;

/// Visitor over process handles.
pub type ProcVisit<'a> = &'a mut dyn FnMut(Process) -> ControlFlow<()>;
/// Visitor over thread handles.
pub type ThreadVisit<'a> = &'a mut dyn FnMut(Thread) -> ControlFlow<()>;
/// Visitor over module handles.
pub type ModVisit<'a> = &'a mut dyn FnMut(Module) -> ControlFlow<()>;
/// Visitor over VM area handles.
pub type VmAreaVisit<'a> = &'a mut dyn FnMut(VmArea) -> ControlFlow<()>;
/// Visitor over driver handles.
pub type DriverVisit<'a> = &'a mut dyn FnMut(Driver) -> ControlFlow<()>;

/// Guest OS introspection capability.
///
/// List walks return `Ok` once the walk ends (list exhausted, visitor
/// stopped, or a broken link cut it short); they fail only when the list
/// anchor cannot be read or the variant has no such list.
pub trait OsModule: Send + Sync {
    /// Which variant this is.
    fn kind(&self) -> OsKind;

    /// Reader over the kernel address space.
    fn kernel_reader(&self) -> &Reader;

    /// Reader over the address space of `proc`.
    fn reader_for(&self, proc: Process) -> Reader {
        self.kernel_reader().with_dtb(proc.dtb)
    }

    fn is_kernel_address(&self, ptr: u64) -> bool {
        ptr >= KERNEL_SPACE_START
    }

    fn proc_list(&self, visit: ProcVisit<'_>) -> Result;
    fn proc_current(&self) -> Option<Process>;
    fn proc_id(&self, proc: Process) -> Option<u64>;
    fn proc_name(&self, proc: Process) -> Option<String>;
    fn proc_parent(&self, proc: Process) -> Option<Process>;
    fn proc_flags(&self, proc: Process) -> Flags;

    /// Whether the process object still reads back as a live process.
    fn proc_is_valid(&self, proc: Process) -> bool {
        self.proc_id(proc).is_some()
    }

    /// First process in list order named exactly `name`.
    fn proc_find_name(&self, name: &str) -> Option<Process> {
        let mut found = None;
        let _ = self.proc_list(&mut |proc| {
            if self.proc_name(proc).as_deref() != Some(name) {
                return ControlFlow::Continue(());
            }
            found = Some(proc);
            ControlFlow::Break(())
        });
        found
    }

    /// First process in list order with id `pid`.
    fn proc_find_pid(&self, pid: u64) -> Option<Process> {
        let mut found = None;
        let _ = self.proc_list(&mut |proc| {
            if self.proc_id(proc) != Some(pid) {
                return ControlFlow::Continue(());
            }
            found = Some(proc);
            ControlFlow::Break(())
        });
        found
    }

    fn thread_list(&self, proc: Process, visit: ThreadVisit<'_>) -> Result;
    fn thread_current(&self) -> Option<Thread>;
    fn thread_proc(&self, thread: Thread) -> Option<Process>;
    fn thread_id(&self, proc: Process, thread: Thread) -> Option<u64>;

    fn mod_list(&self, proc: Process, visit: ModVisit<'_>) -> Result;
    fn mod_name(&self, proc: Process, module: Module) -> Option<String>;
    fn mod_span(&self, proc: Process, module: Module) -> Option<Span>;

    /// Module of `proc` whose image covers `addr`.
    fn mod_find(&self, proc: Process, addr: u64) -> Option<Module> {
        let mut found = None;
        let _ = self.mod_list(proc, &mut |module| {
            if !self.mod_span(proc, module).is_some_and(|s| s.contains(addr)) {
                return ControlFlow::Continue(());
            }
            found = Some(module);
            ControlFlow::Break(())
        });
        found
    }

    fn vm_area_list(&self, proc: Process, visit: VmAreaVisit<'_>) -> Result;
    fn vm_area_span(&self, proc: Process, area: VmArea) -> Option<Span>;
    fn vm_area_access(&self, proc: Process, area: VmArea) -> VmaAccess;
    fn vm_area_name(&self, proc: Process, area: VmArea) -> Option<String>;

    /// VM area of `proc` covering `addr`.
    fn vm_area_find(&self, proc: Process, addr: u64) -> Option<VmArea> {
        let mut found = None;
        let _ = self.vm_area_list(proc, &mut |area| {
            if !self.vm_area_span(proc, area).is_some_and(|s| s.contains(addr)) {
                return ControlFlow::Continue(());
            }
            found = Some(area);
            ControlFlow::Break(())
        });
        found
    }

    fn driver_list(&self, visit: DriverVisit<'_>) -> Result;
    fn driver_name(&self, driver: Driver) -> Option<String>;
    fn driver_span(&self, driver: Driver) -> Option<Span>;

    /// Driver whose image covers `addr`.
    fn driver_find(&self, addr: u64) -> Option<Driver> {
        let mut found = None;
        let _ = self.driver_list(&mut |driver| {
            if !self.driver_span(driver).is_some_and(|s| s.contains(addr)) {
                return ControlFlow::Continue(());
            }
            found = Some(driver);
            ControlFlow::Break(())
        });
        found
    }

    fn listen_proc_create(&self, on_create: ProcEventFn) -> Option<EventId>;
    fn listen_proc_delete(&self, on_delete: ProcEventFn) -> Option<EventId>;
    fn listen_thread_create(&self, on_create: ThreadEventFn) -> Option<EventId>;
    fn listen_thread_delete(&self, on_delete: ThreadEventFn) -> Option<EventId>;
    fn listen_mod_create(&self, on_create: ModEventFn) -> Option<EventId>;
    fn listen_drv_create(&self, on_driver: DrvEventFn) -> Option<EventId>;

    /// Remove a listener; unknown ids remove nothing.
    fn unlisten(&self, id: EventId) -> usize;
}

/// Guest OS variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsKind {
    Linux,
    Nt,
}

/// How far below the syscall entry point an NT kernel image header may sit.
const KERNEL_SCAN_LIMIT: u64 = 32 << 20;
const PAGE_SIZE: u64 = 0x1000;

impl OsKind {
    /// Calling convention of the guest kernel.
    pub fn call_conv(self) -> CallConv {
        match self {
            OsKind::Linux => CallConv::SysV,
            OsKind::Nt => CallConv::Win64,
        }
    }

    /// Identify the guest from its syscall entry point.
    ///
    /// An NT kernel maps its PE image with headers just below `KiSystemCall64`;
    /// anything else is treated as Linux.
    pub fn identify(core: &Arc<dyn DebugCore>) -> Option<OsKind> {
        let cr3 = core.read_register(Register::Cr3).ok()?;
        let reader = Reader::new(core.clone(), crate::debug::Dtb(cr3));
        let lstar = core.read_register(Register::Lstar).ok()?;
        if lstar < KERNEL_SPACE_START {
            return None;
        }
        match find_kernel_image(&reader, lstar) {
            Some(_) => Some(OsKind::Nt),
            None => Some(OsKind::Linux),
        }
    }
}

/// Scan down from `entry` for a page-aligned PE header whose image covers it.
pub(crate) fn find_kernel_image(reader: &Reader, entry: u64) -> Option<Span> {
    let mut page = entry & !(PAGE_SIZE - 1);
    let floor = entry.saturating_sub(KERNEL_SCAN_LIMIT);
    while page >= floor && page >= KERNEL_SPACE_START {
        if pe::is_image(reader, page) {
            if let Ok(size) = pe::image_size(reader, page) {
                let span = Span::new(page, size);
                if span.contains(entry) {
                    return Some(span);
                }
            }
        }
        page -= PAGE_SIZE;
    }
    None
}

/// The OS module selected for a session.
pub enum Os {
    Linux(OsLinux),
    Nt(OsNt),
}

impl Os {
    /// Set up the variant `kind`.
    pub fn setup(kind: OsKind, core: Arc<dyn DebugCore>, symbols: Arc<Symbols>) -> Result<Self> {
        match kind {
            OsKind::Linux => OsLinux::setup(core, symbols).map(Os::Linux),
            OsKind::Nt => OsNt::setup(core, symbols).map(Os::Nt),
        }
    }

    fn inner(&self) -> &dyn OsModule {
        match self {
            Os::Linux(os) => os,
            Os::Nt(os) => os,
        }
    }
}

impl OsModule for Os {
    fn kind(&self) -> OsKind {
        self.inner().kind()
    }

    fn kernel_reader(&self) -> &Reader {
        self.inner().kernel_reader()
    }

    fn reader_for(&self, proc: Process) -> Reader {
        self.inner().reader_for(proc)
    }

    fn is_kernel_address(&self, ptr: u64) -> bool {
        self.inner().is_kernel_address(ptr)
    }

    fn proc_list(&self, visit: ProcVisit<'_>) -> Result {
        self.inner().proc_list(visit)
    }

    fn proc_current(&self) -> Option<Process> {
        self.inner().proc_current()
    }

    fn proc_id(&self, proc: Process) -> Option<u64> {
        self.inner().proc_id(proc)
    }

    fn proc_name(&self, proc: Process) -> Option<String> {
        self.inner().proc_name(proc)
    }

    fn proc_parent(&self, proc: Process) -> Option<Process> {
        self.inner().proc_parent(proc)
    }

    fn proc_flags(&self, proc: Process) -> Flags {
        self.inner().proc_flags(proc)
    }

    fn proc_is_valid(&self, proc: Process) -> bool {
        self.inner().proc_is_valid(proc)
    }

    fn thread_list(&self, proc: Process, visit: ThreadVisit<'_>) -> Result {
        self.inner().thread_list(proc, visit)
    }

    fn thread_current(&self) -> Option<Thread> {
        self.inner().thread_current()
    }

    fn thread_proc(&self, thread: Thread) -> Option<Process> {
        self.inner().thread_proc(thread)
    }

    fn thread_id(&self, proc: Process, thread: Thread) -> Option<u64> {
        self.inner().thread_id(proc, thread)
    }

    fn mod_list(&self, proc: Process, visit: ModVisit<'_>) -> Result {
        self.inner().mod_list(proc, visit)
    }

    fn mod_name(&self, proc: Process, module: Module) -> Option<String> {
        self.inner().mod_name(proc, module)
    }

    fn mod_span(&self, proc: Process, module: Module) -> Option<Span> {
        self.inner().mod_span(proc, module)
    }

    fn vm_area_list(&self, proc: Process, visit: VmAreaVisit<'_>) -> Result {
        self.inner().vm_area_list(proc, visit)
    }

    fn vm_area_span(&self, proc: Process, area: VmArea) -> Option<Span> {
        self.inner().vm_area_span(proc, area)
    }

    fn vm_area_access(&self, proc: Process, area: VmArea) -> VmaAccess {
        self.inner().vm_area_access(proc, area)
    }

    fn vm_area_name(&self, proc: Process, area: VmArea) -> Option<String> {
        self.inner().vm_area_name(proc, area)
    }

    fn driver_list(&self, visit: DriverVisit<'_>) -> Result {
        self.inner().driver_list(visit)
    }

    fn driver_name(&self, driver: Driver) -> Option<String> {
        self.inner().driver_name(driver)
    }

    fn driver_span(&self, driver: Driver) -> Option<Span> {
        self.inner().driver_span(driver)
    }

    fn listen_proc_create(&self, on_create: ProcEventFn) -> Option<EventId> {
        self.inner().listen_proc_create(on_create)
    }

    fn listen_proc_delete(&self, on_delete: ProcEventFn) -> Option<EventId> {
        self.inner().listen_proc_delete(on_delete)
    }

    fn listen_thread_create(&self, on_create: ThreadEventFn) -> Option<EventId> {
        self.inner().listen_thread_create(on_create)
    }

    fn listen_thread_delete(&self, on_delete: ThreadEventFn) -> Option<EventId> {
        self.inner().listen_thread_delete(on_delete)
    }

    fn listen_mod_create(&self, on_create: ModEventFn) -> Option<EventId> {
        self.inner().listen_mod_create(on_create)
    }

    fn listen_drv_create(&self, on_driver: DrvEventFn) -> Option<EventId> {
        self.inner().listen_drv_create(on_driver)
    }

    fn unlisten(&self, id: EventId) -> usize {
        self.inner().unlisten(id)
    }
}

/// Walk a circular doubly-linked kernel list (`list_head` / `LIST_ENTRY`).
///
/// `head` is the address of the anchor link and `offset` the position of
/// the link field inside each node; nodes are reported by their base
/// address. The walk ends when it loops back to `head`, when a forward
/// link is null, unreadable or below `offset`, or after [`MAX_LIST_NODES`].
/// Only an unreadable anchor fails. The next link is read only after
/// `visit` returned `Continue`.
pub(crate) fn walk_list(
    reader: &Reader,
    head: u64,
    offset: u64,
    what: &str,
    visit: &mut dyn FnMut(u64) -> ControlFlow<()>,
) -> Result {
    let mut link = reader.read_ptr(head).map_err(|e| {
        error!("{}: unable to read list head {:#x}", what, head);
        e
    })?;

    let mut count = 0usize;
    while link != head {
        if link == 0 {
            warn!("{}: null link after {} nodes", what, count);
            break;
        }
        if count >= MAX_LIST_NODES {
            warn!("{}: walk stopped after {} nodes", what, count);
            break;
        }
        let Some(node) = link.checked_sub(offset) else {
            warn!("{}: bogus link {:#x} after {} nodes", what, link, count);
            break;
        };
        count += 1;

        if visit(node).is_break() {
            break;
        }

        link = match reader.read_ptr(link) {
            Ok(next) => next,
            Err(e) => {
                error!("{}: unable to read link at {:#x}: {:?}", what, link, e);
                break;
            }
        };
    }
    Ok(())
}
