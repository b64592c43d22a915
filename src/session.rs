//! Introspection session: one guest, one symbol store, one OS module.

use alloc::string::String;
use alloc::sync::Arc;

use crate::debug::{DebugCore, PauseGuard};
use crate::debug_info::DebugInfoBackend;
use crate::error::{Error, Result};
use crate::loader::{Loader, Predicate};
use crate::monitor::GenericMonitor;
use crate::os::{Os, OsKind, OsModule};
use crate::symbols::Symbols;
use crate::types::Process;

/// A guest under introspection.
pub struct Session {
    core: Arc<dyn DebugCore>,
    symbols: Arc<Symbols>,
    os: Arc<Os>,
}

impl Session {
    /// Open a session with an empty symbol store fed by `backend`.
    ///
    /// Without an explicit `kind` the guest is identified from its syscall
    /// entry point.
    pub fn setup(
        core: Arc<dyn DebugCore>,
        backend: Arc<dyn DebugInfoBackend>,
        kind: Option<OsKind>,
    ) -> Result<Self> {
        Self::with_symbols(core, Arc::new(Symbols::new(backend)), kind)
    }

    /// Open a session over a pre-populated symbol store.
    pub fn with_symbols(
        core: Arc<dyn DebugCore>,
        symbols: Arc<Symbols>,
        kind: Option<OsKind>,
    ) -> Result<Self> {
        let kind = match kind {
            Some(kind) => kind,
            None => OsKind::identify(&core).ok_or_else(|| {
                error!("session: unable to identify guest os");
                Error::NotFound(String::from("guest os"))
            })?,
        };
        info!("session: {:?} guest", kind);

        let os = Os::setup(kind, core.clone(), symbols.clone())?;
        Ok(Self {
            core,
            symbols,
            os: Arc::new(os),
        })
    }

    pub fn core(&self) -> &Arc<dyn DebugCore> {
        &self.core
    }

    pub fn symbols(&self) -> &Arc<Symbols> {
        &self.symbols
    }

    pub fn os(&self) -> &Arc<Os> {
        &self.os
    }

    pub fn kind(&self) -> OsKind {
        self.os.kind()
    }

    /// Pause the guest until the returned guard is dropped.
    pub fn pause(&self) -> Result<PauseGuard<'_>> {
        Ok(PauseGuard::new(&*self.core)?)
    }

    /// Start loading module symbols of `process`.
    pub fn loader(&self, process: Process, predicate: Option<Predicate>) -> Loader {
        let os: Arc<dyn OsModule> = self.os.clone();
        Loader::new(os, self.symbols.clone(), process, predicate)
    }

    /// Syscall monitor over the built-in NT table.
    pub fn monitor(&self) -> GenericMonitor {
        GenericMonitor::new(self.core.clone(), self.symbols.clone())
    }
}
