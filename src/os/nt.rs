//! Windows NT guest introspection.
//!
//! Processes are `EPROCESS` objects on the `PsActiveProcessHead` ring,
//! threads hang off `EPROCESS.ThreadListHead`, user modules come from the
//! PEB loader list and drivers from `PsLoadedModuleList`. Offsets and symbols
//! both come from the kernel PDB, loaded into the symbol store as "nt".
//!
//! NT has no VM area walk here: `vm_area_list` reports `Unsupported`.

use alloc::string::String;
use alloc::sync::Arc;
use core::ops::ControlFlow;

use axerrno::AxResult;

use crate::args::{self, CallConv};
use crate::debug::{Breakpoint, BreakpointHandler, DebugCore, Dtb, Filter, Register};
use crate::error::{Error, Result};
use crate::os::events::{Event, EventHub, EventId, EventKind, Listener};
use crate::os::table::Category::{Optional, Required};
use crate::os::table::{
    self, Category, OffsetDecl, SymbolDecl, Table, TableId, assert_table_order,
};
use crate::os::{
    DriverVisit, DrvEventFn, KERNEL_SPACE_START, ModEventFn, ModVisit, OsKind, OsModule,
    ProcEventFn, ProcVisit, ThreadEventFn, ThreadVisit, VmAreaVisit, find_kernel_image,
    walk_list,
};
use crate::reader::Reader;
use crate::symbols::Symbols;
use crate::types::{Driver, Flags, Module, Process, Span, Thread, VmArea, VmaAccess};

/// Symbol-store module of the NT kernel.
pub const KERNEL_MODULE: &str = "nt";
/// Symbol-store module of the user-mode loader.
pub const NTDLL_MODULE: &str = "ntdll";

/// Bytes read for `EPROCESS.ImageFileName`.
pub const PROC_NAME_LEN: usize = 15;
/// Longest `UNICODE_STRING` payload read, in bytes.
const UNICODE_MAX: usize = 0x1000;

#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Off {
    EprocActiveProcessLinks,
    EprocUniqueProcessId,
    EprocImageFileName,
    KprocDirectoryTableBase,
    KpcrPrcb,
    KprcbCurrentThread,
    KthreadApcState,
    KapcStateProcess,
    EprocInheritedFromUniqueProcessId,
    EprocPeb,
    EprocWow64Process,
    EprocThreadListHead,
    EthreadThreadListEntry,
    EthreadCid,
    ClientIdUniqueThread,
    PebLdr,
    PebLdrInLoadOrderModuleList,
    LdrInLoadOrderLinks,
    LdrDllBase,
    LdrSizeOfImage,
    LdrFullDllName,
    UnicodeLength,
    UnicodeBuffer,
}

const OFF_COUNT: usize = 23;

impl TableId for Off {
    fn index(self) -> usize {
        self as usize
    }
}

const fn off(cat: Category, id: Off, struc: &'static str, member: &'static str) -> OffsetDecl<Off> {
    OffsetDecl {
        cat,
        id,
        module: KERNEL_MODULE,
        struc,
        member,
    }
}

const OFFSETS: [OffsetDecl<Off>; OFF_COUNT] = [
    off(Required, Off::EprocActiveProcessLinks, "_EPROCESS", "ActiveProcessLinks"),
    off(Required, Off::EprocUniqueProcessId, "_EPROCESS", "UniqueProcessId"),
    off(Required, Off::EprocImageFileName, "_EPROCESS", "ImageFileName"),
    off(Required, Off::KprocDirectoryTableBase, "_KPROCESS", "DirectoryTableBase"),
    off(Required, Off::KpcrPrcb, "_KPCR", "Prcb"),
    off(Required, Off::KprcbCurrentThread, "_KPRCB", "CurrentThread"),
    off(Required, Off::KthreadApcState, "_KTHREAD", "ApcState"),
    off(Required, Off::KapcStateProcess, "_KAPC_STATE", "Process"),
    off(Optional, Off::EprocInheritedFromUniqueProcessId, "_EPROCESS", "InheritedFromUniqueProcessId"),
    off(Optional, Off::EprocPeb, "_EPROCESS", "Peb"),
    off(Optional, Off::EprocWow64Process, "_EPROCESS", "Wow64Process"),
    off(Optional, Off::EprocThreadListHead, "_EPROCESS", "ThreadListHead"),
    off(Optional, Off::EthreadThreadListEntry, "_ETHREAD", "ThreadListEntry"),
    off(Optional, Off::EthreadCid, "_ETHREAD", "Cid"),
    off(Optional, Off::ClientIdUniqueThread, "_CLIENT_ID", "UniqueThread"),
    off(Optional, Off::PebLdr, "_PEB", "Ldr"),
    off(Optional, Off::PebLdrInLoadOrderModuleList, "_PEB_LDR_DATA", "InLoadOrderModuleList"),
    off(Optional, Off::LdrInLoadOrderLinks, "_LDR_DATA_TABLE_ENTRY", "InLoadOrderLinks"),
    off(Optional, Off::LdrDllBase, "_LDR_DATA_TABLE_ENTRY", "DllBase"),
    off(Optional, Off::LdrSizeOfImage, "_LDR_DATA_TABLE_ENTRY", "SizeOfImage"),
    off(Optional, Off::LdrFullDllName, "_LDR_DATA_TABLE_ENTRY", "FullDllName"),
    off(Optional, Off::UnicodeLength, "_UNICODE_STRING", "Length"),
    off(Optional, Off::UnicodeBuffer, "_UNICODE_STRING", "Buffer"),
];
assert_table_order!(OFFSETS, OFF_COUNT);

#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sym {
    PsActiveProcessHead,
    PsLoadedModuleList,
    PspInsertProcess,
    MmCleanProcessAddressSpace,
    PspInsertThread,
    PspExitThread,
    MiProcessLoaderEntry,
    LdrpInsertDataTableEntry,
}

const SYM_COUNT: usize = 8;

impl TableId for Sym {
    fn index(self) -> usize {
        self as usize
    }
}

const fn sym(cat: Category, id: Sym, module: &'static str, name: &'static str) -> SymbolDecl<Sym> {
    SymbolDecl {
        cat,
        id,
        module,
        name,
    }
}

const SYMBOLS: [SymbolDecl<Sym>; SYM_COUNT] = [
    sym(Required, Sym::PsActiveProcessHead, KERNEL_MODULE, "PsActiveProcessHead"),
    sym(Optional, Sym::PsLoadedModuleList, KERNEL_MODULE, "PsLoadedModuleList"),
    sym(Optional, Sym::PspInsertProcess, KERNEL_MODULE, "PspInsertProcess"),
    sym(Optional, Sym::MmCleanProcessAddressSpace, KERNEL_MODULE, "MmCleanProcessAddressSpace"),
    sym(Optional, Sym::PspInsertThread, KERNEL_MODULE, "PspInsertThread"),
    sym(Optional, Sym::PspExitThread, KERNEL_MODULE, "PspExitThread"),
    sym(Optional, Sym::MiProcessLoaderEntry, KERNEL_MODULE, "MiProcessLoaderEntry"),
    sym(Optional, Sym::LdrpInsertDataTableEntry, NTDLL_MODULE, "LdrpInsertDataTableEntry"),
];
assert_table_order!(SYMBOLS, SYM_COUNT);

struct Inner {
    core: Arc<dyn DebugCore>,
    store: Arc<Symbols>,
    kernel: Reader,
    offsets: Table<Off, OFF_COUNT>,
    symbols: Table<Sym, SYM_COUNT>,
    events: EventHub,
}

/// Windows NT OS module.
pub struct OsNt {
    inner: Arc<Inner>,
}

/// Find the kernel image from the syscall entry point and load its symbols.
fn load_kernel(reader: &Reader, symbols: &Symbols) -> Result {
    let lstar = reader.core().read_register(Register::Lstar)?;
    let Some(image) = find_kernel_image(reader, lstar) else {
        error!("nt: no kernel image below syscall entry {:#x}", lstar);
        return Err(Error::NotFound(String::from("nt kernel image")));
    };
    info!("nt: kernel image at {}", image);
    symbols.insert_image(KERNEL_MODULE, reader, image)
}

impl OsNt {
    /// Resolve kernel offsets and symbols, locating and loading the kernel
    /// PDB first when the symbol store has none.
    pub fn setup(core: Arc<dyn DebugCore>, symbols: Arc<Symbols>) -> Result<Self> {
        let cr3 = core.read_register(Register::Cr3)?;
        let kernel = Reader::new(core.clone(), Dtb(cr3));

        if !symbols.contains(KERNEL_MODULE) {
            if let Err(e) = load_kernel(&kernel, &symbols) {
                error!("nt: unable to load kernel symbols: {}", e);
            }
        }

        let offsets = table::resolve_offsets(&symbols, &OFFSETS)?;
        let syms = table::resolve_symbols(&symbols, &SYMBOLS)?;
        info!("nt: kernel dtb {:#x}", kernel.dtb());

        Ok(Self {
            inner: Arc::new(Inner {
                core,
                store: symbols,
                kernel,
                offsets,
                symbols: syms,
                events: EventHub::new(),
            }),
        })
    }

    /// Listener registry, exposed for inspection.
    pub fn events(&self) -> &EventHub {
        &self.inner.events
    }

    fn listen(
        &self,
        kind: EventKind,
        anchor: Sym,
        listener: Listener,
        on_hit: fn(&Inner),
    ) -> Option<EventId> {
        self.inner
            .events
            .listen(kind, listener, || self.arm(kind, anchor, on_hit))
    }

    fn arm(&self, kind: EventKind, anchor: Sym, on_hit: fn(&Inner)) -> Option<Breakpoint> {
        let Some(addr) = self.inner.anchor(anchor) else {
            warn!("nt: {} unavailable, {:?} unresolved", kind.label(), anchor);
            return None;
        };

        let weak = Arc::downgrade(&self.inner);
        let handler: BreakpointHandler = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                on_hit(&inner);
            }
        });
        match Breakpoint::install(&self.inner.core, addr, Filter::Any, handler) {
            Ok(bp) => Some(bp),
            Err(e) => {
                error!("nt: unable to set {} breakpoint: {:?}", kind.label(), e);
                None
            }
        }
    }
}

impl Inner {
    fn off(&self, id: Off) -> u64 {
        // required entries are always resolved once setup succeeded
        self.offsets.opt(id).unwrap_or_default()
    }

    fn ptr(&self, addr: u64) -> AxResult<u64> {
        self.kernel.read_ptr(addr)
    }

    /// Address of an event anchor.
    ///
    /// User-mode anchors may live in modules loaded after setup, so a miss
    /// in the setup-time table is retried against the symbol store.
    fn anchor(&self, id: Sym) -> Option<u64> {
        self.symbols.opt(id).or_else(|| {
            let decl = SYMBOLS[id.index()];
            self.store.symbol(decl.module, decl.name)
        })
    }

    fn process(&self, eproc: u64) -> Result<Process> {
        let dtb = self.ptr(eproc.wrapping_add(self.off(Off::KprocDirectoryTableBase)))?;
        Ok(Process {
            id: eproc,
            dtb: Dtb(dtb),
        })
    }

    fn current_thread(&self) -> Result<u64> {
        let mut kpcr = self.core.read_register(Register::GsBase)?;
        if kpcr < KERNEL_SPACE_START {
            kpcr = self.core.read_register(Register::KernelGsBase)?;
        }
        if kpcr < KERNEL_SPACE_START {
            return Err(Error::NotFound(String::from("KPCR")));
        }
        let prcb = kpcr.wrapping_add(self.off(Off::KpcrPrcb));
        Ok(self.ptr(prcb.wrapping_add(self.off(Off::KprcbCurrentThread)))?)
    }

    fn thread_process(&self, thread: u64) -> Result<Process> {
        let apc = thread.wrapping_add(self.off(Off::KthreadApcState));
        let eproc = self.ptr(apc.wrapping_add(self.off(Off::KapcStateProcess)))?;
        self.process(eproc)
    }

    fn proc_list(&self, visit: ProcVisit<'_>) -> Result {
        let head = self.symbols.get(Sym::PsActiveProcessHead)?;
        let links = self.off(Off::EprocActiveProcessLinks);
        walk_list(&self.kernel, head, links, "nt: processes", &mut |eproc| {
            match self.process(eproc) {
                Ok(proc) => visit(proc),
                Err(e) => {
                    debug!("nt: skipping process {:#x}: {}", eproc, e);
                    ControlFlow::Continue(())
                }
            }
        })
    }

    fn thread_list(&self, proc: Process, visit: ThreadVisit<'_>) -> Result {
        let (Some(head), Some(entry)) = (
            self.offsets.opt(Off::EprocThreadListHead),
            self.offsets.opt(Off::EthreadThreadListEntry),
        ) else {
            debug!("nt: thread list offsets unresolved, no threads");
            return Ok(());
        };
        let head = proc.id.wrapping_add(head);
        walk_list(&self.kernel, head, entry, "nt: threads", &mut |id| {
            visit(Thread { id })
        })
    }

    fn mod_list(&self, proc: Process, visit: ModVisit<'_>) -> Result {
        let (Some(peb), Some(ldr), Some(list), Some(links)) = (
            self.offsets.opt(Off::EprocPeb),
            self.offsets.opt(Off::PebLdr),
            self.offsets.opt(Off::PebLdrInLoadOrderModuleList),
            self.offsets.opt(Off::LdrInLoadOrderLinks),
        ) else {
            debug!("nt: loader offsets unresolved, no modules");
            return Ok(());
        };

        let peb = self.ptr(proc.id.wrapping_add(peb))?;
        if peb == 0 {
            return Ok(());
        }
        let reader = self.kernel.with_dtb(proc.dtb);
        let ldr = reader.read_ptr(peb.wrapping_add(ldr))?;
        if ldr == 0 {
            // loader not initialised yet
            return Ok(());
        }
        let head = ldr.wrapping_add(list);
        walk_list(&reader, head, links, "nt: modules", &mut |id| {
            visit(Module {
                id,
                flags: Flags::X64,
            })
        })
    }

    fn driver_list(&self, visit: DriverVisit<'_>) -> Result {
        let (Some(head), Some(links)) = (
            self.symbols.opt(Sym::PsLoadedModuleList),
            self.offsets.opt(Off::LdrInLoadOrderLinks),
        ) else {
            debug!("nt: driver list unresolved, no drivers");
            return Ok(());
        };
        walk_list(&self.kernel, head, links, "nt: drivers", &mut |id| {
            visit(Driver { id })
        })
    }

    /// `FullDllName` of a loader entry, read through `reader`.
    fn entry_name(&self, reader: &Reader, entry: u64) -> Option<String> {
        let name = entry.wrapping_add(self.offsets.opt(Off::LdrFullDllName)?);
        let len = reader.le16(name.wrapping_add(self.offsets.opt(Off::UnicodeLength)?)).ok()?;
        let buffer = reader
            .read_ptr(name.wrapping_add(self.offsets.opt(Off::UnicodeBuffer)?))
            .ok()?;
        if buffer == 0 || len == 0 {
            return None;
        }
        reader.read_utf16(buffer, (len as usize).min(UNICODE_MAX)).ok()
    }

    /// `DllBase` / `SizeOfImage` of a loader entry, read through `reader`.
    fn entry_span(&self, reader: &Reader, entry: u64) -> Option<Span> {
        let base = reader.read_ptr(entry.wrapping_add(self.offsets.opt(Off::LdrDllBase)?)).ok()?;
        let size = reader.le32(entry.wrapping_add(self.offsets.opt(Off::LdrSizeOfImage)?)).ok()?;
        Some(Span::new(base, size as u64))
    }

    fn arg(&self, index: usize) -> Result<u64> {
        Ok(args::read_arg(&*self.core, &self.kernel, CallConv::Win64, index)?)
    }
}

// Breakpoint hit handlers, one per event kind.

fn on_proc_create(inner: &Inner) {
    match inner.arg(0).and_then(|eproc| inner.process(eproc)) {
        Ok(proc) => inner.events.emit(EventKind::ProcCreate, Event::Proc(proc)),
        Err(e) => debug!("nt: proc_create: {}", e),
    }
}

fn on_proc_delete(inner: &Inner) {
    match inner.arg(0).and_then(|eproc| inner.process(eproc)) {
        Ok(proc) => inner.events.emit(EventKind::ProcDelete, Event::Proc(proc)),
        Err(e) => debug!("nt: proc_delete: {}", e),
    }
}

fn on_thread_create(inner: &Inner) {
    let hit = || -> Result<Event> {
        let thread = inner.arg(0)?;
        let proc = inner.process(inner.arg(1)?)?;
        Ok(Event::Thread(proc, Thread { id: thread }))
    };
    match hit() {
        Ok(event) => inner.events.emit(EventKind::ThreadCreate, event),
        Err(e) => debug!("nt: thread_create: {}", e),
    }
}

fn on_thread_delete(inner: &Inner) {
    let hit = || -> Result<Event> {
        let thread = inner.current_thread()?;
        let proc = inner.thread_process(thread)?;
        Ok(Event::Thread(proc, Thread { id: thread }))
    };
    match hit() {
        Ok(event) => inner.events.emit(EventKind::ThreadDelete, event),
        Err(e) => debug!("nt: thread_delete: {}", e),
    }
}

fn on_mod_create(inner: &Inner) {
    let hit = || -> Result<Event> {
        let entry = inner.arg(0)?;
        let proc = inner.thread_process(inner.current_thread()?)?;
        let module = Module {
            id: entry,
            flags: Flags::X64,
        };
        Ok(Event::Mod(proc, module))
    };
    match hit() {
        Ok(event) => inner.events.emit(EventKind::ModCreate, event),
        Err(e) => debug!("nt: mod_create: {}", e),
    }
}

fn on_drv_create(inner: &Inner) {
    let hit = || -> Result<Event> {
        let entry = inner.arg(0)?;
        let insert = inner.arg(1)? & 0xff != 0;
        Ok(Event::Drv(Driver { id: entry }, insert))
    };
    match hit() {
        Ok(event) => inner.events.emit(EventKind::DrvCreate, event),
        Err(e) => debug!("nt: drv_create: {}", e),
    }
}

impl OsModule for OsNt {
    fn kind(&self) -> OsKind {
        OsKind::Nt
    }

    fn kernel_reader(&self) -> &Reader {
        &self.inner.kernel
    }

    fn proc_list(&self, visit: ProcVisit<'_>) -> Result {
        self.inner.proc_list(visit)
    }

    fn proc_current(&self) -> Option<Process> {
        let inner = &self.inner;
        let thread = inner
            .current_thread()
            .map_err(|e| error!("nt: unable to read current thread: {}", e))
            .ok()?;
        inner.thread_process(thread).ok()
    }

    fn proc_id(&self, proc: Process) -> Option<u64> {
        self.inner
            .ptr(proc.id.wrapping_add(self.inner.off(Off::EprocUniqueProcessId)))
            .ok()
    }

    fn proc_name(&self, proc: Process) -> Option<String> {
        let addr = proc.id.wrapping_add(self.inner.off(Off::EprocImageFileName));
        let name = match self.inner.kernel.read_padded_str(addr, PROC_NAME_LEN) {
            Ok(name) => name,
            Err(e) => {
                error!("nt: unable to read process name at {:#x}: {:?}", addr, e);
                return None;
            }
        };
        if name.truncated {
            warn!("nt: process name {:?} may be truncated", name.value);
        }
        Some(name.value)
    }

    fn proc_parent(&self, proc: Process) -> Option<Process> {
        let off = self.inner.offsets.opt(Off::EprocInheritedFromUniqueProcessId)?;
        let ppid = self.inner.ptr(proc.id.wrapping_add(off)).ok()?;
        self.proc_find_pid(ppid)
    }

    fn proc_flags(&self, proc: Process) -> Flags {
        let inner = &self.inner;
        let read = |id| {
            inner
                .offsets
                .opt(id)
                .and_then(|off| inner.ptr(proc.id.wrapping_add(off)).ok())
        };

        let mut flags = match read(Off::EprocWow64Process) {
            Some(wow64) if wow64 != 0 => Flags::X86,
            _ => Flags::X64,
        };
        if read(Off::EprocPeb) == Some(0) {
            flags = flags | Flags::KERNEL;
        }
        flags
    }

    fn thread_list(&self, proc: Process, visit: ThreadVisit<'_>) -> Result {
        self.inner.thread_list(proc, visit)
    }

    fn thread_current(&self) -> Option<Thread> {
        let thread = self.inner.current_thread().ok()?;
        Some(Thread { id: thread })
    }

    fn thread_proc(&self, thread: Thread) -> Option<Process> {
        self.inner.thread_process(thread.id).ok()
    }

    fn thread_id(&self, _proc: Process, thread: Thread) -> Option<u64> {
        let inner = &self.inner;
        let cid = thread.id.wrapping_add(inner.offsets.opt(Off::EthreadCid)?);
        inner.ptr(cid.wrapping_add(inner.offsets.opt(Off::ClientIdUniqueThread)?)).ok()
    }

    fn mod_list(&self, proc: Process, visit: ModVisit<'_>) -> Result {
        self.inner.mod_list(proc, visit)
    }

    fn mod_name(&self, proc: Process, module: Module) -> Option<String> {
        let reader = self.reader_for(proc);
        self.inner.entry_name(&reader, module.id)
    }

    fn mod_span(&self, proc: Process, module: Module) -> Option<Span> {
        let reader = self.reader_for(proc);
        self.inner.entry_span(&reader, module.id)
    }

    fn vm_area_list(&self, _proc: Process, _visit: VmAreaVisit<'_>) -> Result {
        Err(Error::Unsupported("nt vm area walk"))
    }

    fn vm_area_span(&self, _proc: Process, _area: VmArea) -> Option<Span> {
        None
    }

    fn vm_area_access(&self, _proc: Process, _area: VmArea) -> VmaAccess {
        VmaAccess::default()
    }

    fn vm_area_name(&self, _proc: Process, _area: VmArea) -> Option<String> {
        None
    }

    fn driver_list(&self, visit: DriverVisit<'_>) -> Result {
        self.inner.driver_list(visit)
    }

    fn driver_name(&self, driver: Driver) -> Option<String> {
        self.inner.entry_name(&self.inner.kernel, driver.id)
    }

    fn driver_span(&self, driver: Driver) -> Option<Span> {
        self.inner.entry_span(&self.inner.kernel, driver.id)
    }

    fn listen_proc_create(&self, on_create: ProcEventFn) -> Option<EventId> {
        self.listen(
            EventKind::ProcCreate,
            Sym::PspInsertProcess,
            Listener::Proc(on_create),
            on_proc_create,
        )
    }

    fn listen_proc_delete(&self, on_delete: ProcEventFn) -> Option<EventId> {
        self.listen(
            EventKind::ProcDelete,
            Sym::MmCleanProcessAddressSpace,
            Listener::Proc(on_delete),
            on_proc_delete,
        )
    }

    fn listen_thread_create(&self, on_create: ThreadEventFn) -> Option<EventId> {
        self.listen(
            EventKind::ThreadCreate,
            Sym::PspInsertThread,
            Listener::Thread(on_create),
            on_thread_create,
        )
    }

    fn listen_thread_delete(&self, on_delete: ThreadEventFn) -> Option<EventId> {
        self.listen(
            EventKind::ThreadDelete,
            Sym::PspExitThread,
            Listener::Thread(on_delete),
            on_thread_delete,
        )
    }

    fn listen_mod_create(&self, on_create: ModEventFn) -> Option<EventId> {
        self.listen(
            EventKind::ModCreate,
            Sym::LdrpInsertDataTableEntry,
            Listener::Mod(on_create),
            on_mod_create,
        )
    }

    fn listen_drv_create(&self, on_driver: DrvEventFn) -> Option<EventId> {
        self.listen(
            EventKind::DrvCreate,
            Sym::MiProcessLoaderEntry,
            Listener::Drv(on_driver),
            on_drv_create,
        )
    }

    fn unlisten(&self, id: EventId) -> usize {
        self.inner.events.unlisten(id)
    }
}
