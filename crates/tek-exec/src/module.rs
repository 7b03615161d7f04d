//! Modules
//!
//! A module is a registered [`ModuleEntry`] that tasks open by name. The exec
//! task keeps the reference count of every loaded module; the first open has
//! the loader task run the module's init hook, the last close runs its exit
//! hook and unloads it.

use crate::exec::ExecRequest;
use crate::io::IoRequest;
use crate::memory::MemBlock;
use crate::port::{Envelope, MsgId, MsgStatus};
use crate::task::Task;
use crate::{ExecError, ExecResult};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Vector slots every vector-table module must provide
pub const MODULE_RESERVED_VECTORS: usize = 8;

/// Module flag bits
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ModuleFlags(u32);

impl ModuleFlags {
    /// No flags
    pub const NONE: Self = Self(0);
    /// Init hook has run
    pub const INITIALIZED: Self = Self(1);
    /// Module exposes a vector table
    pub const VECTORTABLE: Self = Self(2);
    /// Module has per-opener open and close hooks
    pub const OPENCLOSE: Self = Self(4);

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether all bits of `other` are set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Same flags without `other`'s bits
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for ModuleFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for ModuleFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleFlags({:#x})", self.0)
    }
}

/// Per-opener state returned by [`ModuleEntry::open`]
pub type ModuleHandle = Box<dyn Any + Send + Sync>;

/// Entry points of a module
///
/// Only `name` and `version` are required. The I/O vectors default to
/// rejecting every command.
pub trait ModuleEntry: Send + Sync {
    /// Registered name
    fn name(&self) -> &str;

    /// Version; opens asking for a newer one fail
    fn version(&self) -> u16;

    /// Revision within the version
    fn revision(&self) -> u16 {
        0
    }

    /// Static flags (`VECTORTABLE`, `OPENCLOSE`)
    fn flags(&self) -> ModuleFlags {
        ModuleFlags::NONE
    }

    /// Number of vectors a vector-table module provides
    fn vector_count(&self) -> usize {
        MODULE_RESERVED_VECTORS
    }

    /// Bytes of zeroed module body allocated at load
    fn instance_size(&self) -> usize {
        0
    }

    /// Run once on the loader task before the first open completes
    fn init(&self, _module: &Module) -> bool {
        true
    }

    /// Run when the last opener closes the module
    fn exit(&self, _module: &Module) {}

    /// Per-opener open hook of an `OPENCLOSE` module; `None` refuses the opener
    fn open(&self, _module: &Arc<Module>, _task: &Task) -> Option<ModuleHandle> {
        Some(Box::new(()))
    }

    /// Per-opener close hook of an `OPENCLOSE` module
    fn close(&self, _module: &Module, _handle: Option<ModuleHandle>) {}

    /// Start an I/O request
    ///
    /// Returning the request means it completed synchronously. A module that
    /// keeps the request must reply it once done.
    fn begin_io(
        &self,
        _module: &Arc<Module>,
        mut request: Box<Envelope<IoRequest>>,
    ) -> Option<Box<Envelope<IoRequest>>> {
        request.body.error = Some(crate::io::IoError::UnknownCommand);
        Some(request)
    }

    /// Abort a request started with `begin_io`; `false` if it is not pending
    fn abort_io(&self, _module: &Arc<Module>, _id: MsgId) -> bool {
        false
    }
}

/// A loaded module
pub struct Module {
    entry: Arc<dyn ModuleEntry>,
    flags: AtomicU32,
    body: Option<Mutex<MemBlock>>,
    data: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl Module {
    pub(crate) fn new(entry: Arc<dyn ModuleEntry>, body: Option<MemBlock>) -> Arc<Self> {
        let flags = entry.flags().without(ModuleFlags::INITIALIZED);
        Arc::new(Self {
            entry,
            flags: AtomicU32::new(flags.bits()),
            body: body.map(Mutex::new),
            data: Mutex::new(None),
        })
    }

    /// Entry points
    pub fn entry(&self) -> &Arc<dyn ModuleEntry> {
        &self.entry
    }

    /// Module name
    pub fn name(&self) -> &str {
        self.entry.name()
    }

    /// Module version
    pub fn version(&self) -> u16 {
        self.entry.version()
    }

    /// Module revision
    pub fn revision(&self) -> u16 {
        self.entry.revision()
    }

    /// Current flags
    pub fn flags(&self) -> ModuleFlags {
        ModuleFlags(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn mark_initialized(&self) {
        self.flags
            .fetch_or(ModuleFlags::INITIALIZED.bits(), Ordering::AcqRel);
    }

    /// Whether the init hook has run successfully
    pub fn is_initialized(&self) -> bool {
        self.flags().contains(ModuleFlags::INITIALIZED)
    }

    /// Run `f` on the module body; `None` for modules without one
    pub fn with_body<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let body = self.body.as_ref()?;
        let mut block = body.lock();
        Some(f(block.as_mut_slice()))
    }

    /// Module-wide data
    pub fn data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.data.lock().clone()
    }

    /// Replace the module-wide data, returning the old value
    pub fn set_data(
        &self,
        data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Option<Arc<dyn Any + Send + Sync>> {
        std::mem::replace(&mut *self.data.lock(), data)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name())
            .field("version", &self.version())
            .field("flags", &self.flags())
            .finish()
    }
}

/// One task's open reference to a module
///
/// Give it back with [`Task::close_module`].
pub struct ModuleInstance {
    module: Arc<Module>,
    handle: Option<ModuleHandle>,
}

impl ModuleInstance {
    /// The opened module
    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    /// Per-opener state of an `OPENCLOSE` module
    pub fn handle(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.handle.as_deref()
    }

    /// Mutable per-opener state
    pub fn handle_mut(&mut self) -> Option<&mut (dyn Any + Send + Sync)> {
        self.handle.as_deref_mut()
    }
}

impl fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("module", &self.module.name())
            .field("handle", &self.handle.is_some())
            .finish()
    }
}

impl Task {
    /// Open a registered module of at least `version`
    pub fn open_module(&self, name: &str, version: u16) -> ExecResult<ModuleInstance> {
        let (status, reply) = self.exec_request(ExecRequest::OpenModule {
            name: name.to_string(),
            version,
            module: None,
            error: None,
        })?;
        let module = match reply {
            ExecRequest::OpenModule {
                module: Some(module),
                ..
            } => module,
            ExecRequest::OpenModule {
                error: Some(err), ..
            } => return Err(err),
            _ if status == MsgStatus::Failed => return Err(ExecError::ShutDown),
            _ => return Err(ExecError::ModuleNotFound(name.to_string())),
        };

        if !module.flags().contains(ModuleFlags::OPENCLOSE) {
            return Ok(ModuleInstance {
                module,
                handle: None,
            });
        }
        match module.entry().open(&module, self) {
            Some(handle) => Ok(ModuleInstance {
                module,
                handle: Some(handle),
            }),
            None => {
                tracing::debug!(module = name, task = %self.id(), "module refused opener");
                self.release_module(module)?;
                Err(ExecError::ModuleOpenFailed(name.to_string()))
            }
        }
    }

    /// Close a module opened with [`Task::open_module`]
    pub fn close_module(&self, instance: ModuleInstance) -> ExecResult<()> {
        let ModuleInstance { module, handle } = instance;
        if module.flags().contains(ModuleFlags::OPENCLOSE) {
            module.entry().close(&module, handle);
        }
        self.release_module(module)
    }

    fn release_module(&self, module: Arc<Module>) -> ExecResult<()> {
        let (status, _) = self.exec_request(ExecRequest::CloseModule { module })?;
        match status {
            MsgStatus::Failed => Err(ExecError::ShutDown),
            _ => Ok(()),
        }
    }

    /// Register modules; an entry replaces a registered one of the same name
    pub fn add_modules(&self, entries: impl IntoIterator<Item = Arc<dyn ModuleEntry>>) -> ExecResult<()> {
        self.exec()?.add_modules(entries);
        Ok(())
    }

    /// Unregister modules by name; loaded modules stay until closed
    pub fn rem_modules(&self, names: &[&str]) -> ExecResult<usize> {
        Ok(self.exec()?.rem_modules(names))
    }

    /// Names of registered modules starting with `prefix`, sorted
    pub fn scan_modules(&self, prefix: &str) -> ExecResult<Vec<String>> {
        Ok(self.exec()?.scan_modules(prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;

    impl ModuleEntry for Plain {
        fn name(&self) -> &str {
            "plain"
        }

        fn version(&self) -> u16 {
            3
        }

        fn flags(&self) -> ModuleFlags {
            ModuleFlags::VECTORTABLE | ModuleFlags::INITIALIZED
        }
    }

    #[test]
    fn test_new_module_not_initialized() {
        let module = Module::new(Arc::new(Plain), None);
        assert!(!module.is_initialized());
        assert!(module.flags().contains(ModuleFlags::VECTORTABLE));
        module.mark_initialized();
        assert!(module.is_initialized());
        assert!(module.with_body(|body| body.len()).is_none());
    }

    #[test]
    fn test_module_body() {
        let manager = crate::memory::create_mem_manager(
            &tek_hal::default_host(),
            crate::memory::Backing::Host,
            crate::memory::MemPolicy::MEM_MANAGER,
            Default::default(),
        )
        .unwrap();
        let body = MemBlock::alloc(&manager, 32);
        let module = Module::new(Arc::new(Plain), body);
        assert_eq!(module.with_body(|body| body.iter().all(|b| *b == 0)), Some(true));
        module.with_body(|body| body[0] = 9);
        assert_eq!(module.with_body(|body| body[0]), Some(9));
    }

    #[test]
    fn test_default_begin_io_rejects() {
        let module = Module::new(Arc::new(Plain), None);
        let request = Envelope::new(IoRequest::new());
        let done = module.entry().begin_io(&module, request).unwrap();
        assert_eq!(done.body.error, Some(crate::io::IoError::UnknownCommand));
    }
}
