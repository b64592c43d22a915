//! Shared test doubles: an in-memory guest behind `DebugCore`, a table-driven
//! debug-info backend, and builders for Linux and NT kernel object layouts.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axerrno::AxResult;
use axvmi::debug::{BreakpointHandler, BreakpointId};
use axvmi::{
    DebugCore, DebugInfoBackend, Dtb, Error, Filter, Register, Result, Span, SymbolMap,
    SymbolSource, Symbols,
};

pub const PAGE_SIZE: u64 = 0x1000;
const PRESENT_RW: u64 = 0x3;
const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

type ReadHook = Box<dyn FnOnce() + Send>;

struct MockBreakpoint {
    addr: u64,
    filter: Filter,
    handler: BreakpointHandler,
}

/// Sparse guest: physical pages, registers and breakpoints.
pub struct MockCore {
    memory: Mutex<BTreeMap<u64, Box<[u8; 4096]>>>,
    registers: Mutex<Vec<(Register, u64)>>,
    breakpoints: Mutex<BTreeMap<u64, MockBreakpoint>>,
    next_bp: AtomicU64,
    next_frame: AtomicU64,
    pauses: AtomicUsize,
    resumes: AtomicUsize,
    read_log: Mutex<Vec<(u64, usize)>>,
    read_hooks: Mutex<Vec<(u64, ReadHook)>>,
}

impl MockCore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            memory: Mutex::new(BTreeMap::new()),
            registers: Mutex::new(Vec::new()),
            breakpoints: Mutex::new(BTreeMap::new()),
            next_bp: AtomicU64::new(1),
            next_frame: AtomicU64::new(0x0100_0000),
            pauses: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
            read_log: Mutex::new(Vec::new()),
            read_hooks: Mutex::new(Vec::new()),
        })
    }

    pub fn as_core(self: &Arc<Self>) -> Arc<dyn DebugCore> {
        self.clone()
    }

    // -------------------------------------------------------------------------
    // Physical memory
    // -------------------------------------------------------------------------

    /// A fresh zeroed physical frame.
    pub fn alloc_frame(&self) -> u64 {
        let frame = self.next_frame.fetch_add(PAGE_SIZE, Ordering::Relaxed);
        self.memory
            .lock()
            .unwrap()
            .insert(frame, Box::new([0u8; 4096]));
        frame
    }

    pub fn write_phys(&self, paddr: u64, bytes: &[u8]) {
        let mut memory = self.memory.lock().unwrap();
        for (i, byte) in bytes.iter().enumerate() {
            let addr = paddr + i as u64;
            let page = memory
                .entry(addr & !(PAGE_SIZE - 1))
                .or_insert_with(|| Box::new([0u8; 4096]));
            page[(addr & (PAGE_SIZE - 1)) as usize] = *byte;
        }
    }

    pub fn read_phys_u64(&self, paddr: u64) -> u64 {
        let mut raw = [0u8; 8];
        self.copy_out(paddr, &mut raw);
        u64::from_le_bytes(raw)
    }

    fn copy_out(&self, paddr: u64, buf: &mut [u8]) {
        let memory = self.memory.lock().unwrap();
        for (i, byte) in buf.iter_mut().enumerate() {
            let addr = paddr + i as u64;
            *byte = memory
                .get(&(addr & !(PAGE_SIZE - 1)))
                .map_or(0, |page| page[(addr & (PAGE_SIZE - 1)) as usize]);
        }
    }

    /// Whether any physical read touched `paddr`.
    pub fn was_read(&self, paddr: u64) -> bool {
        self.read_log
            .lock()
            .unwrap()
            .iter()
            .any(|&(start, len)| paddr >= start && paddr < start + len as u64)
    }

    pub fn clear_read_log(&self) {
        self.read_log.lock().unwrap().clear();
    }

    /// Run `hook` once, right after the first physical read touching `paddr`.
    pub fn on_read(&self, paddr: u64, hook: impl FnOnce() + Send + 'static) {
        self.read_hooks.lock().unwrap().push((paddr, Box::new(hook)));
    }

    // -------------------------------------------------------------------------
    // Page tables
    // -------------------------------------------------------------------------

    /// A new, empty address space.
    pub fn new_dtb(&self) -> Dtb {
        Dtb(self.alloc_frame())
    }

    pub fn set_entry(&self, table: u64, index: u64, entry: u64) {
        self.write_phys(table + (index & 0x1ff) * 8, &entry.to_le_bytes());
    }

    fn next_table(&self, table: u64, index: u64) -> u64 {
        let entry = self.read_phys_u64(table + (index & 0x1ff) * 8);
        if entry & 1 != 0 {
            return entry & ADDR_MASK;
        }
        let frame = self.alloc_frame();
        self.set_entry(table, index, frame | PRESENT_RW);
        frame
    }

    /// Map the 4KB page holding `va` to `pa`.
    pub fn map_page(&self, dtb: Dtb, va: u64, pa: u64) {
        let pdpt = self.next_table(dtb.table_base(), va >> 39);
        let pd = self.next_table(pdpt, va >> 30);
        let pt = self.next_table(pd, va >> 21);
        self.set_entry(pt, va >> 12, (pa & ADDR_MASK) | PRESENT_RW);
    }

    /// Physical address backing `va`, mapping a fresh frame when needed.
    pub fn back(&self, dtb: Dtb, va: u64) -> u64 {
        let pdpt = self.next_table(dtb.table_base(), va >> 39);
        let pd = self.next_table(pdpt, va >> 30);
        let pt = self.next_table(pd, va >> 21);
        let frame = self.next_table(pt, va >> 12);
        frame | (va & (PAGE_SIZE - 1))
    }

    /// Physical address of an already mapped `va` (4KB pages only).
    pub fn translate(&self, dtb: Dtb, va: u64) -> u64 {
        let mut table = dtb.table_base();
        for shift in [39u64, 30, 21, 12] {
            let entry = self.read_phys_u64(table + ((va >> shift) & 0x1ff) * 8);
            assert!(entry & 1 != 0, "{:#x} not mapped", va);
            table = entry & ADDR_MASK;
        }
        table | (va & (PAGE_SIZE - 1))
    }

    // -------------------------------------------------------------------------
    // Virtual memory
    // -------------------------------------------------------------------------

    pub fn write(&self, dtb: Dtb, va: u64, bytes: &[u8]) {
        let mut done = 0usize;
        while done < bytes.len() {
            let cur = va + done as u64;
            let chunk = ((PAGE_SIZE - (cur & (PAGE_SIZE - 1))) as usize).min(bytes.len() - done);
            let pa = self.back(dtb, cur);
            self.write_phys(pa, &bytes[done..done + chunk]);
            done += chunk;
        }
    }

    pub fn write_u64(&self, dtb: Dtb, va: u64, value: u64) {
        self.write(dtb, va, &value.to_le_bytes());
    }

    pub fn write_u32(&self, dtb: Dtb, va: u64, value: u32) {
        self.write(dtb, va, &value.to_le_bytes());
    }

    pub fn write_u16(&self, dtb: Dtb, va: u64, value: u16) {
        self.write(dtb, va, &value.to_le_bytes());
    }

    /// NUL-terminated string.
    pub fn write_cstr(&self, dtb: Dtb, va: u64, text: &str) {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        self.write(dtb, va, &bytes);
    }

    pub fn write_utf16(&self, dtb: Dtb, va: u64, text: &str) -> u16 {
        let bytes: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
        self.write(dtb, va, &bytes);
        bytes.len() as u16
    }

    // -------------------------------------------------------------------------
    // Registers and breakpoints
    // -------------------------------------------------------------------------

    pub fn set_register(&self, reg: Register, value: u64) {
        let mut regs = self.registers.lock().unwrap();
        match regs.iter_mut().find(|(r, _)| *r == reg) {
            Some(slot) => slot.1 = value,
            None => regs.push((reg, value)),
        }
    }

    pub fn register(&self, reg: Register) -> Option<u64> {
        self.registers
            .lock()
            .unwrap()
            .iter()
            .find(|(r, _)| *r == reg)
            .map(|(_, v)| *v)
    }

    pub fn breakpoint_count(&self) -> usize {
        self.breakpoints.lock().unwrap().len()
    }

    pub fn breakpoint_addrs(&self) -> Vec<u64> {
        self.breakpoints.lock().unwrap().values().map(|bp| bp.addr).collect()
    }

    pub fn filters_at(&self, addr: u64) -> Vec<Filter> {
        self.breakpoints
            .lock()
            .unwrap()
            .values()
            .filter(|bp| bp.addr == addr)
            .map(|bp| bp.filter)
            .collect()
    }

    /// Simulate the guest executing `addr`; returns how many handlers ran.
    pub fn trigger(&self, addr: u64) -> usize {
        let cr3 = self.register(Register::Cr3).unwrap_or(0);
        let handlers: Vec<BreakpointHandler> = self
            .breakpoints
            .lock()
            .unwrap()
            .values()
            .filter(|bp| bp.addr == addr)
            .filter(|bp| match bp.filter {
                Filter::Any => true,
                Filter::Dtb(dtb) => dtb.table_base() == Dtb(cr3).table_base(),
            })
            .map(|bp| bp.handler.clone())
            .collect();
        for handler in &handlers {
            handler();
        }
        handlers.len()
    }

    pub fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }
}

impl DebugCore for MockCore {
    fn pause(&self) -> AxResult {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&self) -> AxResult {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> AxResult {
        self.copy_out(paddr, buf);
        self.read_log.lock().unwrap().push((paddr, buf.len()));

        let fired: Vec<ReadHook> = {
            let mut hooks = self.read_hooks.lock().unwrap();
            let mut fired = Vec::new();
            let mut i = 0;
            while i < hooks.len() {
                let at = hooks[i].0;
                if at >= paddr && at < paddr + buf.len() as u64 {
                    fired.push(hooks.remove(i).1);
                } else {
                    i += 1;
                }
            }
            fired
        };
        for hook in fired {
            hook();
        }
        Ok(())
    }

    fn read_register(&self, reg: Register) -> AxResult<u64> {
        match self.register(reg) {
            Some(value) => Ok(value),
            None => axerrno::ax_err!(NotFound, "register not set"),
        }
    }

    fn write_register(&self, reg: Register, value: u64) -> AxResult {
        self.set_register(reg, value);
        Ok(())
    }

    fn set_breakpoint(
        &self,
        addr: u64,
        filter: Filter,
        handler: BreakpointHandler,
    ) -> AxResult<BreakpointId> {
        let id = self.next_bp.fetch_add(1, Ordering::Relaxed);
        self.breakpoints.lock().unwrap().insert(
            id,
            MockBreakpoint {
                addr,
                filter,
                handler,
            },
        );
        Ok(BreakpointId(id))
    }

    fn clear_breakpoint(&self, id: BreakpointId) -> AxResult {
        match self.breakpoints.lock().unwrap().remove(&id.0) {
            Some(_) => Ok(()),
            None => axerrno::ax_err!(NotFound, "unknown breakpoint"),
        }
    }
}

// =============================================================================
// Debug info backend
// =============================================================================

/// Backend answering from prepared maps: blobs are matched byte for byte,
/// files by module name.
#[derive(Default)]
pub struct MockBackend {
    blobs: Mutex<Vec<(Vec<u8>, SymbolMap)>>,
    files: Mutex<BTreeMap<String, SymbolMap>>,
    parses: Mutex<BTreeMap<String, usize>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_blob(&self, blob: &[u8], map: SymbolMap) {
        self.blobs.lock().unwrap().push((blob.to_vec(), map));
    }

    pub fn add_file(&self, module: &str, map: SymbolMap) {
        self.files.lock().unwrap().insert(module.to_string(), map);
    }

    /// How many times `module` was parsed.
    pub fn parses(&self, module: &str) -> usize {
        self.parses.lock().unwrap().get(module).copied().unwrap_or(0)
    }
}

impl DebugInfoBackend for MockBackend {
    fn parse(&self, module: &str, blob: &[u8]) -> Result<SymbolMap> {
        *self
            .parses
            .lock()
            .unwrap()
            .entry(module.to_string())
            .or_default() += 1;
        self.blobs
            .lock()
            .unwrap()
            .iter()
            .find(|(b, _)| b == blob)
            .map(|(_, map)| map.clone())
            .ok_or_else(|| Error::DebugInfoParse(format!("unknown blob for {}", module)))
    }

    fn load_file(&self, module: &str) -> Result<SymbolMap> {
        self.files
            .lock()
            .unwrap()
            .get(module)
            .cloned()
            .ok_or_else(|| Error::NotFound(module.to_string()))
    }
}

pub fn symbols_with(backend: &Arc<MockBackend>) -> Arc<Symbols> {
    let backend: Arc<dyn DebugInfoBackend> = backend.clone();
    Arc::new(Symbols::new(backend))
}

/// CodeView record as a PE image would carry it.
pub fn codeview(pdb: &str) -> Vec<u8> {
    let mut blob = b"RSDS".to_vec();
    blob.extend_from_slice(&[0x11; 16]);
    blob.extend_from_slice(&1u32.to_le_bytes());
    blob.extend_from_slice(pdb.as_bytes());
    blob.push(0);
    blob
}

/// Write a minimal PE32+ image at `base` whose debug directory points to
/// `cv`.
pub fn write_pe_image(core: &MockCore, dtb: Dtb, base: u64, size: u32, cv: &[u8]) {
    const LFANEW: u64 = 0x80;
    const DEBUG_DIR_RVA: u32 = 0x200;
    const CV_RVA: u32 = 0x300;

    core.write_u16(dtb, base, 0x5a4d);
    core.write_u32(dtb, base + 0x3c, LFANEW as u32);
    core.write_u32(dtb, base + LFANEW, 0x4550);
    let opt = base + LFANEW + 24;
    core.write_u16(dtb, opt, 0x20b);
    core.write_u32(dtb, opt + 56, size);
    let debug_dir = opt + 112 + 6 * 8;
    core.write_u32(dtb, debug_dir, DEBUG_DIR_RVA);
    core.write_u32(dtb, debug_dir + 4, 28);

    let entry = base + DEBUG_DIR_RVA as u64;
    core.write_u32(dtb, entry + 12, 2);
    core.write_u32(dtb, entry + 16, cv.len() as u32);
    core.write_u32(dtb, entry + 20, CV_RVA);
    core.write(dtb, base + CV_RVA as u64, cv);
}

// =============================================================================
// Linux guest
// =============================================================================

pub mod linux {
    use super::*;

    pub const TASK_PID: u64 = 0x10;
    pub const TASK_TGID: u64 = 0x14;
    pub const TASK_REAL_PARENT: u64 = 0x20;
    pub const TASK_GROUP_LEADER: u64 = 0x28;
    pub const TASK_TASKS: u64 = 0x30;
    pub const TASK_MM: u64 = 0x40;
    pub const TASK_ACTIVE_MM: u64 = 0x48;
    pub const TASK_COMM: u64 = 0x100;
    pub const MM_MMAP: u64 = 0x0;
    pub const MM_PGD: u64 = 0x50;
    pub const VMA_START: u64 = 0x0;
    pub const VMA_END: u64 = 0x8;
    pub const VMA_NEXT: u64 = 0x10;
    pub const VMA_FLAGS: u64 = 0x50;
    pub const VMA_FILE: u64 = 0xa0;
    pub const FILE_PATH: u64 = 0x10;
    pub const PATH_DENTRY: u64 = 0x8;
    pub const DENTRY_NAME: u64 = 0x20;
    pub const QSTR_NAME: u64 = 0x8;
    pub const MODULE_LIST: u64 = 0x8;
    pub const MODULE_NAME: u64 = 0x18;
    pub const MODULE_CORE_LAYOUT: u64 = 0x160;
    pub const LAYOUT_BASE: u64 = 0x0;
    pub const LAYOUT_SIZE: u64 = 0x8;

    pub const CURRENT_TASK: u64 = 0x1_7c00;
    pub const GS_BASE: u64 = 0xffff_8880_7fc0_0000;
    pub const INIT_TASK: u64 = 0xffff_ffff_8241_0000;
    pub const MODULES: u64 = 0xffff_ffff_8260_0000;
    pub const WAKE_UP_NEW_TASK: u64 = 0xffff_ffff_810c_1000;
    pub const DO_EXIT: u64 = 0xffff_ffff_8108_2000;
    pub const DO_INIT_MODULE: u64 = 0xffff_ffff_8114_3000;

    const TASKS_BASE: u64 = 0xffff_8880_0100_0000;
    const MM_BASE: u64 = 0xffff_8880_0200_0000;
    const PGD_BASE: u64 = 0xffff_8880_0300_0000;
    const MISC_BASE: u64 = 0xffff_8880_0400_0000;

    pub const REQUIRED_MEMBERS: [(&str, &str); 8] = [
        ("task_struct", "comm"),
        ("task_struct", "pid"),
        ("task_struct", "tgid"),
        ("task_struct", "real_parent"),
        ("task_struct", "tasks"),
        ("task_struct", "mm"),
        ("task_struct", "active_mm"),
        ("mm_struct", "pgd"),
    ];

    /// `vmlinux` struct layout, minus the members listed in `skip`.
    pub fn offsets_without(skip: &[(&str, &str)]) -> SymbolMap {
        let all = [
            ("task_struct", "comm", TASK_COMM),
            ("task_struct", "pid", TASK_PID),
            ("task_struct", "tgid", TASK_TGID),
            ("task_struct", "real_parent", TASK_REAL_PARENT),
            ("task_struct", "tasks", TASK_TASKS),
            ("task_struct", "mm", TASK_MM),
            ("task_struct", "active_mm", TASK_ACTIVE_MM),
            ("mm_struct", "pgd", MM_PGD),
            ("task_struct", "group_leader", TASK_GROUP_LEADER),
            ("mm_struct", "mmap", MM_MMAP),
            ("vm_area_struct", "vm_start", VMA_START),
            ("vm_area_struct", "vm_end", VMA_END),
            ("vm_area_struct", "vm_next", VMA_NEXT),
            ("vm_area_struct", "vm_flags", VMA_FLAGS),
            ("vm_area_struct", "vm_file", VMA_FILE),
            ("file", "f_path", FILE_PATH),
            ("path", "dentry", PATH_DENTRY),
            ("dentry", "d_name", DENTRY_NAME),
            ("qstr", "name", QSTR_NAME),
            ("module", "list", MODULE_LIST),
            ("module", "name", MODULE_NAME),
            ("module", "core_layout", MODULE_CORE_LAYOUT),
            ("module_layout", "base", LAYOUT_BASE),
            ("module_layout", "size", LAYOUT_SIZE),
        ];
        let mut map = SymbolMap::new();
        for (struc, member, offset) in all {
            if !skip.contains(&(struc, member)) {
                map.add_member(struc, member, offset);
            }
        }
        map
    }

    pub fn offsets() -> SymbolMap {
        offsets_without(&[])
    }

    /// Only the required members.
    pub fn required_offsets() -> SymbolMap {
        let mut map = SymbolMap::new();
        let full = offsets();
        for (struc, member) in REQUIRED_MEMBERS {
            let offset = full.struct_offset(struc, member).unwrap();
            map.add_member(struc, member, offset);
        }
        map
    }

    pub fn kallsyms() -> SymbolMap {
        let mut map = SymbolMap::new();
        map.add_symbol("current_task", CURRENT_TASK);
        map.add_symbol("init_task", INIT_TASK);
        map.add_symbol("modules", MODULES);
        map.add_symbol("wake_up_new_task", WAKE_UP_NEW_TASK);
        map.add_symbol("do_exit", DO_EXIT);
        map.add_symbol("do_init_module", DO_INIT_MODULE);
        map
    }

    /// A Linux kernel image in a mock guest.
    pub struct LinuxGuest {
        pub core: Arc<MockCore>,
        pub kdtb: Dtb,
        /// Thread-group leaders in `tasks` ring order, `init_task` first.
        pub leaders: Vec<u64>,
        pub drivers: Vec<u64>,
        next_task: u64,
        next_misc: u64,
    }

    impl LinuxGuest {
        /// Kernel with `init_task` ("swapper/0", pid 0) running.
        pub fn new() -> Self {
            let core = MockCore::new();
            let kdtb = core.new_dtb();
            core.set_register(Register::Cr3, kdtb.0);
            core.set_register(Register::GsBase, GS_BASE);
            core.write_u64(kdtb, MODULES, MODULES);
            core.write_u64(kdtb, MODULES + 8, MODULES);

            let mut guest = Self {
                core,
                kdtb,
                leaders: Vec::new(),
                drivers: Vec::new(),
                next_task: 0,
                next_misc: 0,
            };
            guest.init_task(INIT_TASK, 0, 0, "swapper/0", false);
            guest.leaders.push(INIT_TASK);
            guest.relink();
            guest.set_current(INIT_TASK);
            guest
        }

        fn misc(&mut self) -> u64 {
            let va = MISC_BASE + self.next_misc * PAGE_SIZE;
            self.next_misc += 1;
            va
        }

        fn init_task(&mut self, task: u64, pid: u32, tgid: u32, name: &str, user: bool) {
            let core = &self.core;
            core.write(self.kdtb, task, &[0u8; 0x200]);
            core.write_u32(self.kdtb, task + TASK_PID, pid);
            core.write_u32(self.kdtb, task + TASK_TGID, tgid);
            core.write_u64(self.kdtb, task + TASK_REAL_PARENT, INIT_TASK);
            core.write_u64(self.kdtb, task + TASK_GROUP_LEADER, task);
            core.write_cstr(self.kdtb, task + TASK_COMM, name);
            if user {
                let index = self.next_task;
                let mm = MM_BASE + index * PAGE_SIZE;
                let pgd = PGD_BASE + index * PAGE_SIZE;
                core.write(self.kdtb, pgd, &[0u8; 8]);
                core.write_u64(self.kdtb, mm + MM_PGD, pgd);
                core.write_u64(self.kdtb, task + TASK_MM, mm);
                core.write_u64(self.kdtb, task + TASK_ACTIVE_MM, mm);
            }
        }

        /// Add a process (thread-group leader) with its own address space.
        pub fn add_process(&mut self, pid: u32, name: &str) -> u64 {
            let task = self.alloc_task();
            self.init_task(task, pid, pid, name, true);
            self.leaders.push(task);
            self.relink();
            task
        }

        /// Add a kernel thread (no mm).
        pub fn add_kthread(&mut self, pid: u32, name: &str) -> u64 {
            let task = self.alloc_task();
            self.init_task(task, pid, pid, name, false);
            self.leaders.push(task);
            self.relink();
            task
        }

        /// Add a non-leader thread of `leader`; threads are not on the ring.
        pub fn add_thread(&mut self, leader: u64, pid: u32) -> u64 {
            let task = self.alloc_task();
            let tgid = self.read_u32(leader + TASK_TGID);
            self.init_task(task, pid, tgid, "worker", false);
            let mm = self.core.read_phys_u64(self.core.translate(self.kdtb, leader + TASK_MM));
            self.core.write_u64(self.kdtb, task + TASK_MM, mm);
            self.core.write_u64(self.kdtb, task + TASK_GROUP_LEADER, leader);
            task
        }

        fn alloc_task(&mut self) -> u64 {
            self.next_task += 1;
            TASKS_BASE + self.next_task * PAGE_SIZE
        }

        pub fn read_u32(&self, va: u64) -> u32 {
            let pa = self.core.translate(self.kdtb, va);
            self.core.read_phys_u64(pa) as u32
        }

        /// Rewrite the circular `tasks` list in `leaders` order.
        pub fn relink(&self) {
            let n = self.leaders.len();
            for (i, &task) in self.leaders.iter().enumerate() {
                let next = self.leaders[(i + 1) % n];
                let prev = self.leaders[(i + n - 1) % n];
                self.core.write_u64(self.kdtb, task + TASK_TASKS, next + TASK_TASKS);
                self.core.write_u64(self.kdtb, task + TASK_TASKS + 8, prev + TASK_TASKS);
            }
        }

        pub fn set_parent(&self, task: u64, parent: u64) {
            self.core.write_u64(self.kdtb, task + TASK_REAL_PARENT, parent);
        }

        pub fn set_current(&self, task: u64) {
            self.core.write_u64(self.kdtb, GS_BASE + CURRENT_TASK, task);
        }

        /// Page-table root of a user process.
        pub fn dtb_of(&self, task: u64) -> Dtb {
            let mm = self.core.read_phys_u64(self.core.translate(self.kdtb, task + TASK_MM));
            let pgd = self.core.read_phys_u64(self.core.translate(self.kdtb, mm + MM_PGD));
            Dtb(self.core.translate(self.kdtb, pgd))
        }

        /// Append a VM area to `task`'s mm; areas must be added in order.
        pub fn add_vma(&mut self, task: u64, start: u64, end: u64, flags: u64, file: Option<&str>) -> u64 {
            let vma = self.misc();
            let core = self.core.clone();
            core.write_u64(self.kdtb, vma + VMA_START, start);
            core.write_u64(self.kdtb, vma + VMA_END, end);
            core.write_u64(self.kdtb, vma + VMA_FLAGS, flags);
            core.write_u64(self.kdtb, vma + VMA_NEXT, 0);

            if let Some(name) = file {
                let file_obj = self.misc();
                let dentry = self.misc();
                let name_buf = self.misc();
                core.write_cstr(self.kdtb, name_buf, name);
                core.write_u64(self.kdtb, dentry + DENTRY_NAME + QSTR_NAME, name_buf);
                core.write_u64(self.kdtb, file_obj + FILE_PATH + PATH_DENTRY, dentry);
                core.write_u64(self.kdtb, vma + VMA_FILE, file_obj);
            } else {
                core.write_u64(self.kdtb, vma + VMA_FILE, 0);
            }

            let mm = core.read_phys_u64(core.translate(self.kdtb, task + TASK_MM));
            let mut link = mm + MM_MMAP;
            loop {
                let next = core.read_phys_u64(core.translate(self.kdtb, link));
                if next == 0 {
                    break;
                }
                link = next + VMA_NEXT;
            }
            core.write_u64(self.kdtb, link, vma);
            vma
        }

        /// Load a kernel module and link it on `modules`.
        pub fn add_driver(&mut self, name: &str, base: u64, size: u32) -> u64 {
            let module = self.misc();
            let core = self.core.clone();
            core.write(self.kdtb, module, &[0u8; 0x200]);
            core.write_cstr(self.kdtb, module + MODULE_NAME, name);
            core.write_u64(self.kdtb, module + MODULE_CORE_LAYOUT + LAYOUT_BASE, base);
            core.write_u32(self.kdtb, module + MODULE_CORE_LAYOUT + LAYOUT_SIZE, size);
            self.drivers.push(module);

            let n = self.drivers.len();
            for (i, &m) in self.drivers.iter().enumerate() {
                let next = if i + 1 < n { self.drivers[i + 1] + MODULE_LIST } else { MODULES };
                core.write_u64(self.kdtb, m + MODULE_LIST, next);
            }
            core.write_u64(self.kdtb, MODULES, self.drivers[0] + MODULE_LIST);
            module
        }

        /// Symbol store holding the full kernel layout and symbols.
        pub fn symbols(&self) -> (Arc<MockBackend>, Arc<Symbols>) {
            let backend = MockBackend::new();
            let symbols = symbols_with(&backend);
            symbols
                .insert_source("vmlinux", None, Arc::new(offsets()))
                .unwrap();
            symbols
                .insert_source("kallsyms", None, Arc::new(kallsyms()))
                .unwrap();
            (backend, symbols)
        }
    }
}

// =============================================================================
// NT guest
// =============================================================================

pub mod nt {
    use super::*;

    pub const EPROC_DIRECTORY_TABLE_BASE: u64 = 0x28;
    pub const EPROC_UNIQUE_PROCESS_ID: u64 = 0x2e0;
    pub const EPROC_ACTIVE_PROCESS_LINKS: u64 = 0x2e8;
    pub const EPROC_INHERITED_FROM: u64 = 0x3e0;
    pub const EPROC_PEB: u64 = 0x3f8;
    pub const EPROC_WOW64: u64 = 0x428;
    pub const EPROC_IMAGE_FILE_NAME: u64 = 0x450;
    pub const EPROC_THREAD_LIST_HEAD: u64 = 0x488;
    pub const KPCR_PRCB: u64 = 0x180;
    pub const KPRCB_CURRENT_THREAD: u64 = 0x8;
    pub const KTHREAD_APC_STATE: u64 = 0x98;
    pub const KAPC_STATE_PROCESS: u64 = 0x20;
    pub const ETHREAD_CID: u64 = 0x478;
    pub const CLIENT_ID_UNIQUE_THREAD: u64 = 0x8;
    pub const ETHREAD_THREAD_LIST_ENTRY: u64 = 0x4e8;
    pub const PEB_LDR: u64 = 0x18;
    pub const LDR_IN_LOAD_ORDER: u64 = 0x10;
    pub const ENTRY_LINKS: u64 = 0x0;
    pub const ENTRY_DLL_BASE: u64 = 0x30;
    pub const ENTRY_SIZE_OF_IMAGE: u64 = 0x40;
    pub const ENTRY_FULL_DLL_NAME: u64 = 0x48;
    pub const UNICODE_LENGTH: u64 = 0x0;
    pub const UNICODE_BUFFER: u64 = 0x8;

    pub const KERNEL_BASE: u64 = 0xffff_f800_0260_0000;
    pub const KERNEL_SIZE: u32 = 0x0100_0000;
    /// `KiSystemCall64` offset from the kernel base.
    pub const SYSCALL_ENTRY: u64 = 0x40_6180;
    pub const PS_ACTIVE_PROCESS_HEAD: u64 = 0xc1_e0f0;
    pub const PS_LOADED_MODULE_LIST: u64 = 0xc2_a2d0;
    pub const PSP_INSERT_PROCESS: u64 = 0x6c_1a40;
    pub const MM_CLEAN_PROCESS_ADDRESS_SPACE: u64 = 0x70_2b10;
    pub const PSP_INSERT_THREAD: u64 = 0x6c_2c80;
    pub const PSP_EXIT_THREAD: u64 = 0x6a_5e00;
    pub const MI_PROCESS_LOADER_ENTRY: u64 = 0x33_9f30;
    pub const KPCR: u64 = 0xffff_f800_0180_0000;

    const EPROC_BASE: u64 = 0xffff_c000_0100_0000;
    const THREAD_BASE: u64 = 0xffff_c000_0200_0000;
    const MISC_BASE: u64 = 0xffff_c000_0300_0000;
    const PEB_BASE: u64 = 0x0000_0000_7ffd_0000;
    const USER_MISC: u64 = 0x0000_0000_0010_0000;

    pub const REQUIRED_MEMBERS: [(&str, &str); 8] = [
        ("_EPROCESS", "ActiveProcessLinks"),
        ("_EPROCESS", "UniqueProcessId"),
        ("_EPROCESS", "ImageFileName"),
        ("_KPROCESS", "DirectoryTableBase"),
        ("_KPCR", "Prcb"),
        ("_KPRCB", "CurrentThread"),
        ("_KTHREAD", "ApcState"),
        ("_KAPC_STATE", "Process"),
    ];

    /// Kernel PDB facts with RVAs, minus the members listed in `skip`.
    pub fn kernel_map_without(skip: &[(&str, &str)]) -> SymbolMap {
        let members = [
            ("_EPROCESS", "ActiveProcessLinks", EPROC_ACTIVE_PROCESS_LINKS),
            ("_EPROCESS", "UniqueProcessId", EPROC_UNIQUE_PROCESS_ID),
            ("_EPROCESS", "ImageFileName", EPROC_IMAGE_FILE_NAME),
            ("_KPROCESS", "DirectoryTableBase", EPROC_DIRECTORY_TABLE_BASE),
            ("_KPCR", "Prcb", KPCR_PRCB),
            ("_KPRCB", "CurrentThread", KPRCB_CURRENT_THREAD),
            ("_KTHREAD", "ApcState", KTHREAD_APC_STATE),
            ("_KAPC_STATE", "Process", KAPC_STATE_PROCESS),
            ("_EPROCESS", "InheritedFromUniqueProcessId", EPROC_INHERITED_FROM),
            ("_EPROCESS", "Peb", EPROC_PEB),
            ("_EPROCESS", "Wow64Process", EPROC_WOW64),
            ("_EPROCESS", "ThreadListHead", EPROC_THREAD_LIST_HEAD),
            ("_ETHREAD", "ThreadListEntry", ETHREAD_THREAD_LIST_ENTRY),
            ("_ETHREAD", "Cid", ETHREAD_CID),
            ("_CLIENT_ID", "UniqueThread", CLIENT_ID_UNIQUE_THREAD),
            ("_PEB", "Ldr", PEB_LDR),
            ("_PEB_LDR_DATA", "InLoadOrderModuleList", LDR_IN_LOAD_ORDER),
            ("_LDR_DATA_TABLE_ENTRY", "InLoadOrderLinks", ENTRY_LINKS),
            ("_LDR_DATA_TABLE_ENTRY", "DllBase", ENTRY_DLL_BASE),
            ("_LDR_DATA_TABLE_ENTRY", "SizeOfImage", ENTRY_SIZE_OF_IMAGE),
            ("_LDR_DATA_TABLE_ENTRY", "FullDllName", ENTRY_FULL_DLL_NAME),
            ("_UNICODE_STRING", "Length", UNICODE_LENGTH),
            ("_UNICODE_STRING", "Buffer", UNICODE_BUFFER),
        ];
        let mut map = SymbolMap::new();
        for (struc, member, offset) in members {
            if !skip.contains(&(struc, member)) {
                map.add_member(struc, member, offset);
            }
        }
        map.add_symbol("PsActiveProcessHead", PS_ACTIVE_PROCESS_HEAD);
        map.add_symbol("PsLoadedModuleList", PS_LOADED_MODULE_LIST);
        map.add_symbol("PspInsertProcess", PSP_INSERT_PROCESS);
        map.add_symbol("MmCleanProcessAddressSpace", MM_CLEAN_PROCESS_ADDRESS_SPACE);
        map.add_symbol("PspInsertThread", PSP_INSERT_THREAD);
        map.add_symbol("PspExitThread", PSP_EXIT_THREAD);
        map.add_symbol("MiProcessLoaderEntry", MI_PROCESS_LOADER_ENTRY);
        map.add_symbol("KiSystemCall64", SYSCALL_ENTRY);
        map
    }

    pub fn kernel_map() -> SymbolMap {
        kernel_map_without(&[])
    }

    /// Write a circular LIST_ENTRY ring: `head` followed by `links`.
    pub fn write_ring(core: &MockCore, dtb: Dtb, head: u64, links: &[u64]) {
        let ring: Vec<u64> = std::iter::once(head).chain(links.iter().copied()).collect();
        let n = ring.len();
        for (i, &link) in ring.iter().enumerate() {
            core.write_u64(dtb, link, ring[(i + 1) % n]);
            core.write_u64(dtb, link + 8, ring[(i + n - 1) % n]);
        }
    }

    pub struct NtProcess {
        pub eproc: u64,
        pub dtb: Dtb,
        pub threads: Vec<u64>,
        pub modules: Vec<u64>,
    }

    /// An NT kernel in a mock guest.
    pub struct NtGuest {
        pub core: Arc<MockCore>,
        pub kdtb: Dtb,
        pub processes: Vec<NtProcess>,
        pub drivers: Vec<u64>,
        next_proc: u64,
        next_thread: u64,
        next_misc: u64,
        next_user: u64,
    }

    impl NtGuest {
        pub fn new() -> Self {
            let core = MockCore::new();
            let kdtb = core.new_dtb();
            core.set_register(Register::Cr3, kdtb.0);
            core.set_register(Register::GsBase, KPCR);
            core.set_register(Register::Lstar, KERNEL_BASE + SYSCALL_ENTRY);
            let guest = Self {
                core,
                kdtb,
                processes: Vec::new(),
                drivers: Vec::new(),
                next_proc: 0,
                next_thread: 0,
                next_misc: 0,
                next_user: 0,
            };
            guest.relink();
            write_ring(&guest.core, kdtb, KERNEL_BASE + PS_LOADED_MODULE_LIST, &[]);
            guest
        }

        fn misc(&mut self) -> u64 {
            self.next_misc += 1;
            MISC_BASE + self.next_misc * PAGE_SIZE
        }

        /// Write the kernel PE image carrying `cv` as its CodeView record.
        pub fn write_kernel_image(&self, cv: &[u8]) {
            write_pe_image(&self.core, self.kdtb, KERNEL_BASE, KERNEL_SIZE, cv);
        }

        pub fn add_process(&mut self, pid: u64, name: &str) -> u64 {
            self.next_proc += 1;
            let eproc = EPROC_BASE + self.next_proc * PAGE_SIZE;
            let dtb = self.core.new_dtb();
            let k = self.kdtb;
            self.core.write(k, eproc, &[0u8; 0x600]);
            self.core.write_u64(k, eproc + EPROC_DIRECTORY_TABLE_BASE, dtb.0);
            self.core.write_u64(k, eproc + EPROC_UNIQUE_PROCESS_ID, pid);
            self.core.write_u64(k, eproc + EPROC_INHERITED_FROM, 4);
            self.core.write_cstr(k, eproc + EPROC_IMAGE_FILE_NAME, name);
            write_ring(&self.core, k, eproc + EPROC_THREAD_LIST_HEAD, &[]);
            self.processes.push(NtProcess {
                eproc,
                dtb,
                threads: Vec::new(),
                modules: Vec::new(),
            });
            self.relink();
            eproc
        }

        pub fn process(&self, eproc: u64) -> &NtProcess {
            self.processes.iter().find(|p| p.eproc == eproc).unwrap()
        }

        fn process_mut(&mut self, eproc: u64) -> &mut NtProcess {
            self.processes.iter_mut().find(|p| p.eproc == eproc).unwrap()
        }

        pub fn relink(&self) {
            let links: Vec<u64> = self
                .processes
                .iter()
                .map(|p| p.eproc + EPROC_ACTIVE_PROCESS_LINKS)
                .collect();
            write_ring(&self.core, self.kdtb, KERNEL_BASE + PS_ACTIVE_PROCESS_HEAD, &links);
        }

        pub fn add_thread(&mut self, eproc: u64, tid: u64) -> u64 {
            self.next_thread += 1;
            let thread = THREAD_BASE + self.next_thread * PAGE_SIZE;
            let k = self.kdtb;
            self.core.write(k, thread, &[0u8; 0x600]);
            self.core
                .write_u64(k, thread + KTHREAD_APC_STATE + KAPC_STATE_PROCESS, eproc);
            self.core
                .write_u64(k, thread + ETHREAD_CID + CLIENT_ID_UNIQUE_THREAD, tid);

            let core = self.core.clone();
            let proc = self.process_mut(eproc);
            proc.threads.push(thread);
            let links: Vec<u64> = proc
                .threads
                .iter()
                .map(|t| t + ETHREAD_THREAD_LIST_ENTRY)
                .collect();
            write_ring(&core, k, eproc + EPROC_THREAD_LIST_HEAD, &links);
            thread
        }

        /// Make `thread` the one running on the current processor.
        pub fn set_current(&self, thread: u64) {
            self.core
                .write_u64(self.kdtb, KPCR + KPCR_PRCB + KPRCB_CURRENT_THREAD, thread);
        }

        fn write_entry(&self, dtb: Dtb, entry: u64, name_buf: u64, path: &str, base: u64, size: u32) {
            self.core.write(dtb, entry, &[0u8; 0x80]);
            let len = self.core.write_utf16(dtb, name_buf, path);
            self.core.write_u64(dtb, entry + ENTRY_DLL_BASE, base);
            self.core.write_u32(dtb, entry + ENTRY_SIZE_OF_IMAGE, size);
            let name = entry + ENTRY_FULL_DLL_NAME;
            self.core.write_u16(dtb, name + UNICODE_LENGTH, len);
            self.core.write_u16(dtb, name + 2, len + 2);
            self.core.write_u64(dtb, name + UNICODE_BUFFER, name_buf);
        }

        /// Give `eproc` a PEB with an (empty) loader list.
        pub fn add_peb(&self, eproc: u64) {
            let dtb = self.process(eproc).dtb;
            let ldr = PEB_BASE + PAGE_SIZE;
            self.core.write_u64(self.kdtb, eproc + EPROC_PEB, PEB_BASE);
            self.core.write_u64(dtb, PEB_BASE + PEB_LDR, ldr);
            write_ring(&self.core, dtb, ldr + LDR_IN_LOAD_ORDER, &[]);
        }

        /// Entry of a user module mapped in `eproc`, not yet on its loader
        /// list.
        pub fn make_module(&mut self, eproc: u64, path: &str, base: u64, size: u32, cv: &[u8]) -> u64 {
            let dtb = self.process(eproc).dtb;
            self.next_user += 1;
            let entry = USER_MISC + self.next_user * 2 * PAGE_SIZE;
            self.write_entry(dtb, entry, entry + PAGE_SIZE, path, base, size);
            write_pe_image(&self.core, dtb, base, size, cv);
            entry
        }

        /// Put `entry` on the loader list of `eproc`.
        pub fn link_module(&mut self, eproc: u64, entry: u64) {
            let dtb = self.process(eproc).dtb;
            let core = self.core.clone();
            let proc = self.process_mut(eproc);
            proc.modules.push(entry);
            let links: Vec<u64> = proc.modules.iter().map(|e| e + ENTRY_LINKS).collect();
            write_ring(&core, dtb, PEB_BASE + PAGE_SIZE + LDR_IN_LOAD_ORDER, &links);
        }

        pub fn add_module(&mut self, eproc: u64, path: &str, base: u64, size: u32, cv: &[u8]) -> u64 {
            let entry = self.make_module(eproc, path, base, size, cv);
            self.link_module(eproc, entry);
            entry
        }

        pub fn add_driver(&mut self, path: &str, base: u64, size: u32) -> u64 {
            let entry = self.misc();
            let name_buf = self.misc();
            self.write_entry(self.kdtb, entry, name_buf, path, base, size);
            self.drivers.push(entry);
            let links: Vec<u64> = self.drivers.iter().map(|e| e + ENTRY_LINKS).collect();
            write_ring(&self.core, self.kdtb, KERNEL_BASE + PS_LOADED_MODULE_LIST, &links);
            entry
        }

        /// Symbol store with the kernel PDB registered at the kernel span.
        pub fn symbols(&self) -> (Arc<MockBackend>, Arc<Symbols>) {
            let backend = MockBackend::new();
            let symbols = symbols_with(&backend);
            symbols
                .insert_source(
                    "nt",
                    Some(Span::new(KERNEL_BASE, KERNEL_SIZE as u64)),
                    Arc::new(kernel_map()),
                )
                .unwrap();
            (backend, symbols)
        }
    }
}
