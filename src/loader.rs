//! Dynamic symbol loader.
//!
//! Keeps the symbol store in sync with the modules mapped in one process:
//! every module present at construction and every module the process loads
//! afterwards gets its debug info inserted under its base file name, without
//! extension ("C:\Windows\System32\ntdll.dll" loads as "ntdll").

use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use core::ops::ControlFlow;

use crate::error::{Error, Result};
use crate::os::{EventId, OsModule};
use crate::symbols::Symbols;
use crate::types::{Module, Process};

/// Decides whether a module's symbols get loaded, given its full name.
pub type Predicate = Arc<dyn Fn(Module, &str) -> bool + Send + Sync>;

struct Inner {
    os: Arc<dyn OsModule>,
    symbols: Arc<Symbols>,
    process: Process,
    predicate: Option<Predicate>,
}

/// Loads module symbols of one process, now and as modules appear.
///
/// Dropping the loader stops listening; symbols already loaded stay in the
/// store.
pub struct Loader {
    inner: Arc<Inner>,
    listener: Option<EventId>,
}

/// Base file name of a module path, without extension.
pub fn module_basename(path: &str) -> &str {
    let file = path.rsplit(['\\', '/']).next().unwrap_or(path);
    match file.rfind('.') {
        Some(0) | None => file,
        Some(dot) => &file[..dot],
    }
}

impl Inner {
    fn load(&self, module: Module, check: bool) -> Result<String> {
        let Some(name) = self.os.mod_name(self.process, module) else {
            return Err(Error::NotFound(format!("name of module {:#x}", module.id)));
        };
        if check && !self.predicate.as_ref().is_none_or(|accept| accept(module, &name)) {
            return Err(Error::PredicateRejected(name));
        }

        let Some(span) = self.os.mod_span(self.process, module) else {
            return Err(Error::NotFound(format!("span of {}", name)));
        };
        let base = module_basename(&name);
        info!("loader: loading {} at {}", name, span);

        let reader = self.os.reader_for(self.process);
        self.symbols.insert_image(base, &reader, span)?;
        Ok(base.to_string())
    }

    fn load_logged(&self, module: Module) {
        match self.load(module, true) {
            Ok(name) => debug!("loader: {} symbols loaded", name),
            Err(Error::PredicateRejected(name)) => trace!("loader: skipping {}", name),
            Err(Error::AlreadyLoaded(name)) => debug!("loader: {} already loaded", name),
            Err(e) => error!("loader: unable to load symbols for module {:#x}: {}", module.id, e),
        }
    }
}

impl Loader {
    /// Load every module of `process` accepted by `predicate` (all of them
    /// without one), then follow module loads of that process.
    ///
    /// The module-load listener is registered before the initial module
    /// walk, so a module mapped mid-walk may be offered twice; the second
    /// attempt ends in [`Error::AlreadyLoaded`].
    pub fn new(
        os: Arc<dyn OsModule>,
        symbols: Arc<Symbols>,
        process: Process,
        predicate: Option<Predicate>,
    ) -> Self {
        let inner = Arc::new(Inner {
            os,
            symbols,
            process,
            predicate,
        });

        // listen first so that modules mapped during the walk are not missed
        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let listener = inner.os.listen_mod_create(Arc::new(move |proc: Process, module: Module| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if proc.id != inner.process.id {
                return;
            }
            inner.load_logged(module);
        }));
        if listener.is_none() {
            warn!("loader: module loads of process {:#x} will not be followed", process.id);
        }

        let walked = inner.os.mod_list(process, &mut |module| {
            inner.load_logged(module);
            ControlFlow::Continue(())
        });
        if let Err(e) = walked {
            warn!("loader: unable to list modules of process {:#x}: {}", process.id, e);
        }

        Self { inner, listener }
    }

    /// Load `module` regardless of the predicate.
    ///
    /// Returns the name the symbols were stored under.
    pub fn load(&self, module: Module) -> Result<String> {
        self.inner.load(module, false)
    }

    pub fn process(&self) -> Process {
        self.inner.process
    }

    pub fn symbols(&self) -> &Arc<Symbols> {
        &self.inner.symbols
    }

    /// Whether module loads are being followed.
    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        if let Some(id) = self.listener.take() {
            self.inner.os.unlisten(id);
        }
    }
}
