//! Lifecycle event fan-out.
//!
//! One breakpoint backs each event kind of an OS module instance; every
//! `listen_*` call adds a callback behind it. The breakpoint is installed by
//! the first listener and released with the last one.
//!
//! Callbacks are snapshotted out of the lock before they run, so a callback
//! may listen or unlisten (including itself) without deadlocking.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::debug::Breakpoint;
use crate::types::{Driver, Module, Process, Thread};

/// Handle returned by a `listen_*` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

/// Process creation / deletion callback.
pub type ProcEventFn = Arc<dyn Fn(Process) + Send + Sync>;
/// Thread creation / deletion callback: owning process, thread.
pub type ThreadEventFn = Arc<dyn Fn(Process, Thread) + Send + Sync>;
/// Module load callback: owning process, module.
pub type ModEventFn = Arc<dyn Fn(Process, Module) + Send + Sync>;
/// Driver callback: driver, `true` when loaded and `false` when unloaded.
pub type DrvEventFn = Arc<dyn Fn(Driver, bool) + Send + Sync>;

/// Lifecycle event kinds.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ProcCreate = 0,
    ProcDelete = 1,
    ThreadCreate = 2,
    ThreadDelete = 3,
    ModCreate = 4,
    DrvCreate = 5,
}

const EVENT_KINDS: usize = 6;

impl EventKind {
    /// Short label for display.
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::ProcCreate => "proc_create",
            EventKind::ProcDelete => "proc_delete",
            EventKind::ThreadCreate => "thread_create",
            EventKind::ThreadDelete => "thread_delete",
            EventKind::ModCreate => "mod_create",
            EventKind::DrvCreate => "drv_create",
        }
    }
}

/// Registered callback, typed by event kind.
#[derive(Clone)]
pub enum Listener {
    Proc(ProcEventFn),
    Thread(ThreadEventFn),
    Mod(ModEventFn),
    Drv(DrvEventFn),
}

/// Event payload reconstructed at breakpoint hit time.
#[derive(Debug, Clone, Copy)]
pub enum Event {
    Proc(Process),
    Thread(Process, Thread),
    Mod(Process, Module),
    Drv(Driver, bool),
}

impl Listener {
    fn call(&self, event: Event) {
        match (self, event) {
            (Listener::Proc(f), Event::Proc(p)) => f(p),
            (Listener::Thread(f), Event::Thread(p, t)) => f(p, t),
            (Listener::Mod(f), Event::Mod(p, m)) => f(p, m),
            (Listener::Drv(f), Event::Drv(d, loaded)) => f(d, loaded),
            _ => warn!("events: listener and event kinds disagree, dropping event"),
        }
    }
}

#[derive(Default)]
struct Slot {
    breakpoint: Option<Breakpoint>,
    listeners: BTreeMap<EventId, Listener>,
}

/// Per-OS-module listener registry.
pub struct EventHub {
    slots: Mutex<[Slot; EVENT_KINDS]>,
    next_id: AtomicU64,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Default::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a listener for `kind`, installing the backing breakpoint with
    /// `install` if this is the first one.
    ///
    /// Returns `None` when the breakpoint cannot be installed.
    pub fn listen<F>(&self, kind: EventKind, listener: Listener, install: F) -> Option<EventId>
    where
        F: FnOnce() -> Option<Breakpoint>,
    {
        let armed = self.slots.lock()[kind as usize].breakpoint.is_some();
        // installing may call into the debug transport; never under the lock
        let fresh = if armed { None } else { Some(install()?) };

        let id = EventId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut slots = self.slots.lock();
        let slot = &mut slots[kind as usize];
        let redundant = match fresh {
            Some(bp) if slot.breakpoint.is_none() => {
                info!("events: {} armed at {:#x}", kind.label(), bp.addr());
                slot.breakpoint = Some(bp);
                None
            }
            other => other,
        };
        slot.listeners.insert(id, listener);
        drop(slots);
        // lost a race with another first listener
        drop(redundant);

        debug!("events: {} listener {:?} registered", kind.label(), id);
        Some(id)
    }

    /// Remove a listener. Returns how many were removed (0 or 1).
    pub fn unlisten(&self, id: EventId) -> usize {
        let mut released = None;
        let mut removed = 0;
        {
            let mut slots = self.slots.lock();
            for (index, slot) in slots.iter_mut().enumerate() {
                if slot.listeners.remove(&id).is_none() {
                    continue;
                }
                removed = 1;
                if slot.listeners.is_empty() {
                    released = slot.breakpoint.take();
                    debug!("events: last listener of kind {} removed", index);
                }
                break;
            }
        }
        // clearing talks to the debug transport; outside the lock
        drop(released);
        removed
    }

    /// Number of listeners registered for `kind`.
    pub fn listeners(&self, kind: EventKind) -> usize {
        self.slots.lock()[kind as usize].listeners.len()
    }

    /// Whether a breakpoint currently backs `kind`.
    pub fn is_armed(&self, kind: EventKind) -> bool {
        self.slots.lock()[kind as usize].breakpoint.is_some()
    }

    /// Deliver `event` to every listener of `kind`.
    pub fn emit(&self, kind: EventKind, event: Event) {
        let listeners: Vec<Listener> = self.slots.lock()[kind as usize]
            .listeners
            .values()
            .cloned()
            .collect();
        trace!(
            "events: {} firing for {} listeners",
            kind.label(),
            listeners.len()
        );
        for listener in listeners {
            listener.call(event);
        }
    }
}
