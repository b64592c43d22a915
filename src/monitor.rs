//! Generic syscall monitor.
//!
//! Traps user-mode syscall stubs of one process. The stubs come from a static
//! table of `(name, parameter names)` entries resolved against the symbol
//! store; breakpoints are filtered to the monitored process' address space.
//!
//! Two modes:
//! - [`GenericMonitor::setup_all`] arms every resolvable entry and routes hits
//!   to a single dispatch callback
//! - [`GenericMonitor::setup_func`] arms one entry whose hits decode the
//!   entry's arguments and notify the observers registered with
//!   [`GenericMonitor::observe`]

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::ops::ControlFlow;

use spin::{Mutex, RwLock};

use crate::args::{self, CallConv};
use crate::debug::{Breakpoint, BreakpointHandler, DebugCore, Dtb, Filter, Register};
use crate::error::{Error, Result};
use crate::reader::Reader;
use crate::symbols::Symbols;
use crate::types::Process;

/// One monitored function and the names of its parameters.
#[derive(Debug)]
pub struct SyscallDef {
    pub name: &'static str,
    pub params: &'static [&'static str],
}

/// A set of functions exported by one module, sharing a calling convention.
#[derive(Debug)]
pub struct SyscallTable {
    /// Symbol-store module the names resolve in.
    pub module: &'static str,
    pub conv: CallConv,
    pub entries: &'static [SyscallDef],
}

impl SyscallTable {
    /// Entry named `name`.
    pub fn get(&self, name: &str) -> Option<&'static SyscallDef> {
        self.entries.iter().find(|def| def.name == name)
    }
}

/// A decoded call, handed to observers.
#[derive(Debug)]
pub struct SyscallCall<'a> {
    pub syscall: &'a SyscallDef,
    /// Raw argument values, one per entry of `syscall.params`.
    pub args: Vec<u64>,
}

impl SyscallCall<'_> {
    /// Value of the parameter called `param`.
    pub fn arg(&self, param: &str) -> Option<u64> {
        let index = self.syscall.params.iter().position(|p| *p == param)?;
        self.args.get(index).copied()
    }
}

/// Callback for [`GenericMonitor::setup_all`] hits.
pub type DispatchFn = Arc<dyn Fn(&SyscallDef) + Send + Sync>;
/// Callback for decoded calls of one entry.
pub type SyscallObserver = Arc<dyn Fn(&SyscallCall<'_>) + Send + Sync>;

macro_rules! syscalls {
    ($($name:ident($($param:ident),* $(,)?)),* $(,)?) => {
        &[$(SyscallDef {
            name: stringify!($name),
            params: &[$(stringify!($param)),*],
        }),*]
    };
}

/// NT native API stubs exported by `ntdll`.
pub static NT_SYSCALLS: SyscallTable = SyscallTable {
    module: "ntdll",
    conv: CallConv::Win64,
    entries: syscalls![
        NtAllocateVirtualMemory(ProcessHandle, BaseAddress, ZeroBits, RegionSize, AllocationType, Protect),
        NtClose(Handle),
        NtCreateFile(
            FileHandle, DesiredAccess, ObjectAttributes, IoStatusBlock, AllocationSize,
            FileAttributes, ShareAccess, CreateDisposition, CreateOptions, EaBuffer, EaLength,
        ),
        NtCreateKey(KeyHandle, DesiredAccess, ObjectAttributes, TitleIndex, Class, CreateOptions, Disposition),
        NtCreateSection(
            SectionHandle, DesiredAccess, ObjectAttributes, MaximumSize, SectionPageProtection,
            AllocationAttributes, FileHandle,
        ),
        NtCreateThreadEx(
            ThreadHandle, DesiredAccess, ObjectAttributes, ProcessHandle, StartRoutine, Argument,
            CreateFlags, ZeroBits, StackSize, MaximumStackSize, AttributeList,
        ),
        NtCreateUserProcess(
            ProcessHandle, ThreadHandle, ProcessDesiredAccess, ThreadDesiredAccess,
            ProcessObjectAttributes, ThreadObjectAttributes, ProcessFlags, ThreadFlags,
            ProcessParameters, CreateInfo, AttributeList,
        ),
        NtDeleteKey(KeyHandle),
        NtDeviceIoControlFile(
            FileHandle, Event, ApcRoutine, ApcContext, IoStatusBlock, IoControlCode, InputBuffer,
            InputBufferLength, OutputBuffer, OutputBufferLength,
        ),
        NtFreeVirtualMemory(ProcessHandle, BaseAddress, RegionSize, FreeType),
        NtMapViewOfSection(
            SectionHandle, ProcessHandle, BaseAddress, ZeroBits, CommitSize, SectionOffset,
            ViewSize, InheritDisposition, AllocationType, Win32Protect,
        ),
        NtOpenFile(FileHandle, DesiredAccess, ObjectAttributes, IoStatusBlock, ShareAccess, OpenOptions),
        NtOpenKey(KeyHandle, DesiredAccess, ObjectAttributes),
        NtOpenProcess(ProcessHandle, DesiredAccess, ObjectAttributes, ClientId),
        NtProtectVirtualMemory(ProcessHandle, BaseAddress, RegionSize, NewProtect, OldProtect),
        NtQueryInformationProcess(
            ProcessHandle, ProcessInformationClass, ProcessInformation, ProcessInformationLength,
            ReturnLength,
        ),
        NtQueryValueKey(KeyHandle, ValueName, KeyValueInformationClass, KeyValueInformation, Length, ResultLength),
        NtReadFile(FileHandle, Event, ApcRoutine, ApcContext, IoStatusBlock, Buffer, Length, ByteOffset, Key),
        NtReadVirtualMemory(ProcessHandle, BaseAddress, Buffer, BufferSize, NumberOfBytesRead),
        NtSetValueKey(KeyHandle, ValueName, TitleIndex, Type, Data, DataSize),
        NtTerminateProcess(ProcessHandle, ExitStatus),
        NtWriteFile(FileHandle, Event, ApcRoutine, ApcContext, IoStatusBlock, Buffer, Length, ByteOffset, Key),
        NtWriteVirtualMemory(ProcessHandle, BaseAddress, Buffer, BufferSize, NumberOfBytesWritten),
    ],
};

#[derive(Default)]
struct Armed {
    process: Option<Process>,
    breakpoints: BTreeMap<&'static str, Breakpoint>,
}

struct Inner {
    core: Arc<dyn DebugCore>,
    symbols: Arc<Symbols>,
    table: &'static SyscallTable,
    armed: Mutex<Armed>,
    observers: RwLock<BTreeMap<&'static str, Vec<SyscallObserver>>>,
}

/// Breakpoint-driven monitor over a [`SyscallTable`].
///
/// Owns its breakpoints: they are released when the monitor is dropped or
/// re-armed for another process.
pub struct GenericMonitor {
    inner: Arc<Inner>,
}

impl GenericMonitor {
    /// Monitor over [`NT_SYSCALLS`].
    pub fn new(core: Arc<dyn DebugCore>, symbols: Arc<Symbols>) -> Self {
        Self::with_table(core, symbols, &NT_SYSCALLS)
    }

    /// Monitor over a caller-provided table.
    pub fn with_table(
        core: Arc<dyn DebugCore>,
        symbols: Arc<Symbols>,
        table: &'static SyscallTable,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                core,
                symbols,
                table,
                armed: Mutex::new(Armed::default()),
                observers: RwLock::new(BTreeMap::new()),
            }),
        }
    }

    pub fn table(&self) -> &'static SyscallTable {
        self.inner.table
    }

    /// Process the monitor is currently armed for.
    pub fn process(&self) -> Option<Process> {
        self.inner.armed.lock().process
    }

    /// Number of installed breakpoints.
    pub fn breakpoints(&self) -> usize {
        self.inner.armed.lock().breakpoints.len()
    }

    /// Arm every resolvable table entry for `process`, routing hits to
    /// `dispatch`.
    ///
    /// Unresolved entries are logged and skipped.
    pub fn setup_all(&self, process: Process, dispatch: DispatchFn) -> Result {
        let table = self.inner.table;
        let mut installed = 0usize;
        for def in table.entries {
            let Some(addr) = self.inner.symbols.symbol(table.module, def.name) else {
                error!("monitor: unable to find symbol {}!{}", table.module, def.name);
                continue;
            };

            let dispatch = dispatch.clone();
            let handler: BreakpointHandler = Arc::new(move || dispatch(def));
            match self.arm(process, def, addr, handler) {
                Ok(()) => installed += 1,
                Err(e) => error!("monitor: unable to trap {}: {}", def.name, e),
            }
        }

        info!(
            "monitor: {}/{} {} functions armed for process {:#x}",
            installed,
            table.entries.len(),
            table.module,
            process.id
        );
        Ok(())
    }

    /// Arm a single entry for `process`; hits notify its observers.
    pub fn setup_func(&self, process: Process, name: &str) -> Result {
        let table = self.inner.table;
        let Some(def) = table.get(name) else {
            return Err(Error::NotFound(format!("{} in syscall table", name)));
        };
        let Some(addr) = self.inner.symbols.symbol(table.module, def.name) else {
            error!("monitor: unable to find symbol {}!{}", table.module, def.name);
            return Err(Error::SymbolUnresolved(format!("{}!{}", table.module, def.name)));
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handler: BreakpointHandler = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_call(def);
            }
        });
        self.arm(process, def, addr, handler)?;
        info!("monitor: {} armed for process {:#x}", def.name, process.id);
        Ok(())
    }

    /// Names of the table entries that resolve in the symbol store.
    pub fn resolvable(&self) -> Vec<String> {
        let table = self.inner.table;
        table
            .entries
            .iter()
            .filter(|def| self.inner.symbols.symbol(table.module, def.name).is_some())
            .map(|def| String::from(def.name))
            .collect()
    }

    /// Register an observer for decoded calls of `name`.
    pub fn observe(&self, name: &str, observer: SyscallObserver) -> Result {
        let Some(def) = self.inner.table.get(name) else {
            return Err(Error::NotFound(format!("{} in syscall table", name)));
        };
        self.inner
            .observers
            .write()
            .entry(def.name)
            .or_default()
            .push(observer);
        Ok(())
    }

    /// Read positional arguments `0..count` of the function the guest is
    /// stopped at, stopping early when `on_arg` breaks.
    pub fn get_raw_args(
        &self,
        count: usize,
        on_arg: &mut dyn FnMut(u64) -> ControlFlow<()>,
    ) -> Result {
        let reader = self.inner.current_reader()?;
        for index in 0..count {
            let arg = args::read_arg(&*self.inner.core, &reader, self.inner.table.conv, index)?;
            if on_arg(arg).is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Release every breakpoint.
    pub fn disarm(&self) {
        let released = core::mem::take(&mut *self.inner.armed.lock());
        if let Some(process) = released.process {
            debug!(
                "monitor: releasing {} breakpoints of process {:#x}",
                released.breakpoints.len(),
                process.id
            );
        }
    }

    fn arm(
        &self,
        process: Process,
        def: &'static SyscallDef,
        addr: u64,
        handler: BreakpointHandler,
    ) -> Result {
        // re-arming for another process releases the previous set first
        if self.process().is_some_and(|p| p != process) {
            self.disarm();
        }

        let bp = Breakpoint::install(&self.inner.core, addr, Filter::Dtb(process.dtb), handler)?;
        let replaced = {
            let mut armed = self.inner.armed.lock();
            armed.process = Some(process);
            armed.breakpoints.insert(def.name, bp)
        };
        drop(replaced);
        Ok(())
    }
}

impl Inner {
    fn current_reader(&self) -> Result<Reader> {
        let cr3 = self.core.read_register(Register::Cr3)?;
        Ok(Reader::new(self.core.clone(), Dtb(cr3)))
    }

    fn on_call(&self, def: &SyscallDef) {
        let decode = || -> Result<Vec<u64>> {
            let reader = self.current_reader()?;
            let mut out = Vec::with_capacity(def.params.len());
            for index in 0..def.params.len() {
                out.push(args::read_arg(&*self.core, &reader, self.table.conv, index)?);
            }
            Ok(out)
        };
        let args = match decode() {
            Ok(args) => args,
            Err(e) => {
                error!("monitor: unable to read {} arguments: {}", def.name, e);
                return;
            }
        };

        let observers: Vec<SyscallObserver> = self
            .observers
            .read()
            .get(def.name)
            .cloned()
            .unwrap_or_default();
        trace!("monitor: {} hit, {} observers", def.name, observers.len());

        let call = SyscallCall { syscall: def, args };
        for observer in observers {
            observer(&call);
        }
    }
}
