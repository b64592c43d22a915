//! Linux guest introspection.
//!
//! Processes are thread-group leaders on the `task_struct.tasks` ring anchored
//! at `init_task`. Struct offsets come from the kernel DWARF ("vmlinux"),
//! addresses from `System.map` or a kallsyms blob ("kallsyms").
//!
//! Threads have no object of their own here: [`OsModule::thread_list`] yields
//! a single thread whose id is the process task. User-space module lists are
//! not tracked and report `Unsupported`.

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
    DriverVisit, DrvEventFn, MAX_LIST_NODES, ModEventFn, ModVisit, OsKind, OsModule,
    ProcEventFn, ProcVisit, ThreadEventFn, ThreadVisit, VmAreaVisit, walk_list,
};
use crate::reader::Reader;
use crate::symbols::Symbols;
use crate::types::{Driver, Flags, Module, Process, Span, Thread, VmArea, VmaAccess};

/// Symbol-store module carrying kernel struct layouts.
pub const OFFSETS_MODULE: &str = "vmlinux";
/// Symbol-store module carrying kernel symbol addresses.
pub const SYMBOLS_MODULE: &str = "kallsyms";

/// Bytes read for `task_struct.comm`.
pub const PROC_NAME_LEN: usize = 20;
/// `MODULE_NAME_LEN` on 64-bit kernels.
pub const DRIVER_NAME_LEN: usize = 56;
/// Longest dentry name read for a mapped file.
const PATH_NAME_MAX: usize = 256;

const VM_READ: u64 = 0x1;
const VM_WRITE: u64 = 0x2;
const VM_EXEC: u64 = 0x4;

#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Off {
    TaskComm,
    TaskPid,
    TaskTgid,
    TaskRealParent,
    TaskTasks,
    TaskMm,
    TaskActiveMm,
    MmPgd,
    TaskGroupLeader,
    MmMmap,
    VmaStart,
    VmaEnd,
    VmaNext,
    VmaFlags,
    VmaFile,
    FilePath,
    PathDentry,
    DentryName,
    QstrName,
    ModuleList,
    ModuleName,
    ModuleCoreLayout,
    LayoutBase,
    LayoutSize,
}

const OFF_COUNT: usize = 24;

impl TableId for Off {
    fn index(self) -> usize {
        self as usize
    }
}

const fn off(cat: Category, id: Off, struc: &'static str, member: &'static str) -> OffsetDecl<Off> {
    OffsetDecl {
        cat,
        id,
        module: OFFSETS_MODULE,
        struc,
        member,
    }
}

const OFFSETS: [OffsetDecl<Off>; OFF_COUNT] = [
    off(Required, Off::TaskComm, "task_struct", "comm"),
    off(Required, Off::TaskPid, "task_struct", "pid"),
    off(Required, Off::TaskTgid, "task_struct", "tgid"),
    off(Required, Off::TaskRealParent, "task_struct", "real_parent"),
    off(Required, Off::TaskTasks, "task_struct", "tasks"),
    off(Required, Off::TaskMm, "task_struct", "mm"),
    off(Required, Off::TaskActiveMm, "task_struct", "active_mm"),
    off(Required, Off::MmPgd, "mm_struct", "pgd"),
    off(Optional, Off::TaskGroupLeader, "task_struct", "group_leader"),
    off(Optional, Off::MmMmap, "mm_struct", "mmap"),
    off(Optional, Off::VmaStart, "vm_area_struct", "vm_start"),
    off(Optional, Off::VmaEnd, "vm_area_struct", "vm_end"),
    off(Optional, Off::VmaNext, "vm_area_struct", "vm_next"),
    off(Optional, Off::VmaFlags, "vm_area_struct", "vm_flags"),
    off(Optional, Off::VmaFile, "vm_area_struct", "vm_file"),
    off(Optional, Off::FilePath, "file", "f_path"),
    off(Optional, Off::PathDentry, "path", "dentry"),
    off(Optional, Off::DentryName, "dentry", "d_name"),
    off(Optional, Off::QstrName, "qstr", "name"),
    off(Optional, Off::ModuleList, "module", "list"),
    off(Optional, Off::ModuleName, "module", "name"),
    off(Optional, Off::ModuleCoreLayout, "module", "core_layout"),
    off(Optional, Off::LayoutBase, "module_layout", "base"),
    off(Optional, Off::LayoutSize, "module_layout", "size"),
];
assert_table_order!(OFFSETS, OFF_COUNT);

#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sym {
    CurrentTask,
    InitTask,
    Modules,
    WakeUpNewTask,
    DoExit,
    DoInitModule,
}

const SYM_COUNT: usize = 6;

impl TableId for Sym {
    fn index(self) -> usize {
        self as usize
    }
}

const fn sym(cat: Category, id: Sym, name: &'static str) -> SymbolDecl<Sym> {
    SymbolDecl {
        cat,
        id,
        module: SYMBOLS_MODULE,
        name,
    }
}

const SYMBOLS: [SymbolDecl<Sym>; SYM_COUNT] = [
    sym(Required, Sym::CurrentTask, "current_task"),
    sym(Optional, Sym::InitTask, "init_task"),
    sym(Optional, Sym::Modules, "modules"),
    sym(Optional, Sym::WakeUpNewTask, "wake_up_new_task"),
    sym(Optional, Sym::DoExit, "do_exit"),
    sym(Optional, Sym::DoInitModule, "do_init_module"),
];
assert_table_order!(SYMBOLS, SYM_COUNT);

struct Inner {
    core: Arc<dyn DebugCore>,
    kernel: Reader,
    offsets: Table<Off, OFF_COUNT>,
    symbols: Table<Sym, SYM_COUNT>,
    events: EventHub,
}

/// Linux OS module.
pub struct OsLinux {
    inner: Arc<Inner>,
}

impl OsLinux {
    /// Resolve kernel offsets and symbols and bind to the current kernel
    /// address space.
    ///
    /// Missing kernel symbol modules are requested from the debug-info
    /// backend first. Fails when any required entry stays unresolved.
    pub fn setup(core: Arc<dyn DebugCore>, symbols: Arc<Symbols>) -> Result<Self> {
        for module in [OFFSETS_MODULE, SYMBOLS_MODULE] {
            if symbols.contains(module) {
                continue;
            }
            if let Err(e) = symbols.load_file(module) {
                warn!("linux: unable to load {} symbols: {}", module, e);
            }
        }

        let offsets = table::resolve_offsets(&symbols, &OFFSETS)?;
        let syms = table::resolve_symbols(&symbols, &SYMBOLS)?;

        let cr3 = core.read_register(Register::Cr3)?;
        let kernel = Reader::new(core.clone(), Dtb(cr3));
        info!("linux: kernel dtb {:#x}", kernel.dtb());

        Ok(Self {
            inner: Arc::new(Inner {
                core,
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
        let Some(addr) = self.inner.symbols.opt(anchor) else {
            warn!("linux: {} unavailable, {:?} unresolved", kind.label(), anchor);
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
                error!("linux: unable to set {} breakpoint: {:?}", kind.label(), e);
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

    fn current_task(&self) -> Result<u64> {
        let mut base = self.core.read_register(Register::GsBase)?;
        if base < super::KERNEL_SPACE_START {
            base = self.core.read_register(Register::KernelGsBase)?;
        }
        if base < super::KERNEL_SPACE_START {
            return Err(Error::NotFound(String::from("per-cpu area")));
        }
        let task = self.ptr(base.wrapping_add(self.symbols.get(Sym::CurrentTask)?))?;
        Ok(task)
    }

    fn group_leader(&self, task: u64) -> u64 {
        self.offsets
            .opt(Off::TaskGroupLeader)
            .and_then(|off| self.ptr(task.wrapping_add(off)).ok())
            .filter(|&leader| leader != 0)
            .unwrap_or(task)
    }

    fn is_leader(&self, task: u64) -> AxResult<bool> {
        let pid = self.kernel.le32(task.wrapping_add(self.off(Off::TaskPid)))?;
        let tgid = self.kernel.le32(task.wrapping_add(self.off(Off::TaskTgid)))?;
        Ok(pid == tgid)
    }

    fn mm(&self, task: u64) -> AxResult<u64> {
        self.ptr(task.wrapping_add(self.off(Off::TaskMm)))
    }

    /// Reconstruct the process handle of `task`.
    ///
    /// Kernel threads borrow `active_mm`; with neither they run on the
    /// kernel address space.
    fn process(&self, task: u64) -> Result<Process> {
        let mut mm = self.mm(task)?;
        if mm == 0 {
            mm = self.ptr(task.wrapping_add(self.off(Off::TaskActiveMm)))?;
        }
        if mm == 0 {
            return Ok(Process {
                id: task,
                dtb: self.kernel.dtb(),
            });
        }
        let pgd = self.ptr(mm.wrapping_add(self.off(Off::MmPgd)))?;
        let dtb = Dtb(self.kernel.translate(pgd)?);
        Ok(Process { id: task, dtb })
    }

    fn proc_list(&self, visit: ProcVisit<'_>) -> Result {
        let anchor = match self.symbols.opt(Sym::InitTask) {
            Some(init) => init,
            // only leaders are linked on `tasks`
            None => self.group_leader(self.current_task()?),
        };
        let tasks = self.off(Off::TaskTasks);

        match self.process(anchor) {
            Ok(proc) => {
                if visit(proc).is_break() {
                    return Ok(());
                }
            }
            Err(e) => warn!("linux: unable to read anchor task {:#x}: {}", anchor, e),
        }

        let head = anchor.wrapping_add(tasks);
        walk_list(&self.kernel, head, tasks, "linux: tasks", &mut |task| {
            match self.process(task) {
                Ok(proc) => visit(proc),
                Err(e) => {
                    debug!("linux: skipping task {:#x}: {}", task, e);
                    ControlFlow::Continue(())
                }
            }
        })
    }

    fn vm_area_list(&self, proc: Process, visit: VmAreaVisit<'_>) -> Result {
        let (Some(mmap), Some(next)) = (self.offsets.opt(Off::MmMmap), self.offsets.opt(Off::VmaNext))
        else {
            debug!("linux: vm area offsets unresolved, no areas");
            return Ok(());
        };

        let mm = self.mm(proc.id)?;
        if mm == 0 {
            return Ok(());
        }

        let mut vma = self.ptr(mm.wrapping_add(mmap))?;
        let mut count = 0usize;
        while vma != 0 {
            if count >= MAX_LIST_NODES {
                warn!("linux: vm area walk stopped after {} nodes", count);
                break;
            }
            count += 1;

            if visit(VmArea { id: vma }).is_break() {
                break;
            }
            vma = match self.ptr(vma.wrapping_add(next)) {
                Ok(vma) => vma,
                Err(e) => {
                    error!("linux: unable to read vm_next at {:#x}: {:?}", vma, e);
                    break;
                }
            };
        }
        Ok(())
    }

    fn vm_area_name(&self, area: VmArea) -> Option<String> {
        let file = self.ptr(area.id.wrapping_add(self.offsets.opt(Off::VmaFile)?)).ok()?;
        if file == 0 {
            return None;
        }
        let path = file.wrapping_add(self.offsets.opt(Off::FilePath)?);
        let dentry = self.ptr(path.wrapping_add(self.offsets.opt(Off::PathDentry)?)).ok()?;
        let qstr = dentry.wrapping_add(self.offsets.opt(Off::DentryName)?);
        let name = self.ptr(qstr.wrapping_add(self.offsets.opt(Off::QstrName)?)).ok()?;
        self.kernel.read_cstr(name, PATH_NAME_MAX).ok()
    }

    fn driver_list(&self, visit: DriverVisit<'_>) -> Result {
        let (Some(head), Some(list)) = (
            self.symbols.opt(Sym::Modules),
            self.offsets.opt(Off::ModuleList),
        ) else {
            debug!("linux: kernel module list unresolved, no drivers");
            return Ok(());
        };

        walk_list(&self.kernel, head, list, "linux: modules", &mut |id| {
            visit(Driver { id })
        })
    }

    fn driver_span(&self, driver: Driver) -> Option<Span> {
        let layout = driver.id.wrapping_add(self.offsets.opt(Off::ModuleCoreLayout)?);
        let base = self.ptr(layout.wrapping_add(self.offsets.opt(Off::LayoutBase)?)).ok()?;
        let size = self.kernel.le32(layout.wrapping_add(self.offsets.opt(Off::LayoutSize)?)).ok()?;
        Some(Span::new(base, size as u64))
    }

    fn arg(&self, index: usize) -> Result<u64> {
        Ok(args::read_arg(&*self.core, &self.kernel, CallConv::SysV, index)?)
    }
}

// Breakpoint hit handlers, one per event kind.

fn on_proc_create(inner: &Inner) {
    let hit = || -> Result<Option<Process>> {
        let task = inner.arg(0)?;
        if !inner.is_leader(task)? {
            return Ok(None);
        }
        inner.process(task).map(Some)
    };
    match hit() {
        Ok(Some(proc)) => inner.events.emit(EventKind::ProcCreate, Event::Proc(proc)),
        Ok(None) => {}
        Err(e) => debug!("linux: proc_create: {}", e),
    }
}

fn on_proc_delete(inner: &Inner) {
    let hit = || -> Result<Option<Process>> {
        let task = inner.current_task()?;
        if !inner.is_leader(task)? {
            return Ok(None);
        }
        inner.process(task).map(Some)
    };
    match hit() {
        Ok(Some(proc)) => inner.events.emit(EventKind::ProcDelete, Event::Proc(proc)),
        Ok(None) => {}
        Err(e) => debug!("linux: proc_delete: {}", e),
    }
}

fn thread_event(inner: &Inner, task: u64) -> Result<Event> {
    let proc = inner.process(inner.group_leader(task))?;
    Ok(Event::Thread(proc, Thread { id: task }))
}

fn on_thread_create(inner: &Inner) {
    match inner.arg(0).and_then(|task| thread_event(inner, task)) {
        Ok(event) => inner.events.emit(EventKind::ThreadCreate, event),
        Err(e) => debug!("linux: thread_create: {}", e),
    }
}

fn on_thread_delete(inner: &Inner) {
    match inner.current_task().and_then(|task| thread_event(inner, task)) {
        Ok(event) => inner.events.emit(EventKind::ThreadDelete, event),
        Err(e) => debug!("linux: thread_delete: {}", e),
    }
}

fn on_drv_create(inner: &Inner) {
    match inner.arg(0) {
        Ok(module) => inner
            .events
            .emit(EventKind::DrvCreate, Event::Drv(Driver { id: module }, true)),
        Err(e) => debug!("linux: drv_create: {}", e),
    }
}

impl OsModule for OsLinux {
    fn kind(&self) -> OsKind {
        OsKind::Linux
    }

    fn kernel_reader(&self) -> &Reader {
        &self.inner.kernel
    }

    fn proc_list(&self, visit: ProcVisit<'_>) -> Result {
        self.inner.proc_list(visit)
    }

    fn proc_current(&self) -> Option<Process> {
        let inner = &self.inner;
        let task = inner
            .current_task()
            .map_err(|e| error!("linux: unable to read current task: {}", e))
            .ok()?;
        inner.process(inner.group_leader(task)).ok()
    }

    fn proc_id(&self, proc: Process) -> Option<u64> {
        let tgid = self.inner.kernel.le32(proc.id.wrapping_add(self.inner.off(Off::TaskTgid)));
        tgid.ok().map(u64::from)
    }

    fn proc_name(&self, proc: Process) -> Option<String> {
        let addr = proc.id.wrapping_add(self.inner.off(Off::TaskComm));
        let name = match self.inner.kernel.read_padded_str(addr, PROC_NAME_LEN) {
            Ok(name) => name,
            Err(e) => {
                error!("linux: unable to read task name at {:#x}: {:?}", addr, e);
                return None;
            }
        };
        if name.truncated {
            warn!("linux: task name {:?} may be truncated", name.value);
        }
        Some(name.value)
    }

    fn proc_parent(&self, proc: Process) -> Option<Process> {
        let parent = self
            .inner
            .ptr(proc.id.wrapping_add(self.inner.off(Off::TaskRealParent)))
            .ok()?;
        if parent == 0 {
            return None;
        }
        self.inner.process(parent).ok()
    }

    fn proc_flags(&self, proc: Process) -> Flags {
        match self.inner.mm(proc.id) {
            Ok(0) => Flags::X64 | Flags::KERNEL,
            _ => Flags::X64,
        }
    }

    fn thread_list(&self, proc: Process, visit: ThreadVisit<'_>) -> Result {
        let _ = visit(Thread { id: proc.id });
        Ok(())
    }

    fn thread_current(&self) -> Option<Thread> {
        let task = self.inner.current_task().ok()?;
        Some(Thread { id: task })
    }

    fn thread_proc(&self, thread: Thread) -> Option<Process> {
        let inner = &self.inner;
        inner.process(inner.group_leader(thread.id)).ok()
    }

    fn thread_id(&self, _proc: Process, thread: Thread) -> Option<u64> {
        let pid = self.inner.kernel.le32(thread.id.wrapping_add(self.inner.off(Off::TaskPid)));
        pid.ok().map(u64::from)
    }

    fn mod_list(&self, _proc: Process, _visit: ModVisit<'_>) -> Result {
        Err(Error::Unsupported("linux user-space module list"))
    }

    fn mod_name(&self, _proc: Process, _module: Module) -> Option<String> {
        None
    }

    fn mod_span(&self, _proc: Process, _module: Module) -> Option<Span> {
        None
    }

    fn vm_area_list(&self, proc: Process, visit: VmAreaVisit<'_>) -> Result {
        self.inner.vm_area_list(proc, visit)
    }

    fn vm_area_span(&self, _proc: Process, area: VmArea) -> Option<Span> {
        let inner = &self.inner;
        let start = inner.ptr(area.id.wrapping_add(inner.offsets.opt(Off::VmaStart)?)).ok()?;
        let end = inner.ptr(area.id.wrapping_add(inner.offsets.opt(Off::VmaEnd)?)).ok()?;
        Some(Span::new(start, end.saturating_sub(start)))
    }

    fn vm_area_access(&self, _proc: Process, area: VmArea) -> VmaAccess {
        let inner = &self.inner;
        let flags = inner
            .offsets
            .opt(Off::VmaFlags)
            .and_then(|off| inner.ptr(area.id.wrapping_add(off)).ok())
            .unwrap_or(0);
        VmaAccess {
            read: flags & VM_READ != 0,
            write: flags & VM_WRITE != 0,
            exec: flags & VM_EXEC != 0,
        }
    }

    fn vm_area_name(&self, _proc: Process, area: VmArea) -> Option<String> {
        self.inner.vm_area_name(area)
    }

    fn driver_list(&self, visit: DriverVisit<'_>) -> Result {
        self.inner.driver_list(visit)
    }

    fn driver_name(&self, driver: Driver) -> Option<String> {
        let off = self.inner.offsets.opt(Off::ModuleName)?;
        let name = self
            .inner
            .kernel
            .read_padded_str(driver.id.wrapping_add(off), DRIVER_NAME_LEN)
            .ok()?;
        Some(name.value)
    }

    fn driver_span(&self, driver: Driver) -> Option<Span> {
        self.inner.driver_span(driver)
    }

    fn listen_proc_create(&self, on_create: ProcEventFn) -> Option<EventId> {
        self.listen(
            EventKind::ProcCreate,
            Sym::WakeUpNewTask,
            Listener::Proc(on_create),
            on_proc_create,
        )
    }

    fn listen_proc_delete(&self, on_delete: ProcEventFn) -> Option<EventId> {
        self.listen(
            EventKind::ProcDelete,
            Sym::DoExit,
            Listener::Proc(on_delete),
            on_proc_delete,
        )
    }

    fn listen_thread_create(&self, on_create: ThreadEventFn) -> Option<EventId> {
        self.listen(
            EventKind::ThreadCreate,
            Sym::WakeUpNewTask,
            Listener::Thread(on_create),
            on_thread_create,
        )
    }

    fn listen_thread_delete(&self, on_delete: ThreadEventFn) -> Option<EventId> {
        self.listen(
            EventKind::ThreadDelete,
            Sym::DoExit,
            Listener::Thread(on_delete),
            on_thread_delete,
        )
    }

    fn listen_mod_create(&self, _on_create: ModEventFn) -> Option<EventId> {
        warn!("linux: user-space module events are not tracked");
        None
    }

    fn listen_drv_create(&self, on_driver: DrvEventFn) -> Option<EventId> {
        self.listen(
            EventKind::DrvCreate,
            Sym::DoInitModule,
            Listener::Drv(on_driver),
            on_drv_create,
        )
    }

    fn unlisten(&self, id: EventId) -> usize {
        self.inner.events.unlisten(id)
    }
}
