//! Loaded code modules and the entities resolved from them.
//!
//! A [`Module`] owns a native module handle plus per-name memo caches for the
//! entities resolved through it. Unloading clears the caches before the
//! native handle is released, so no stale token can be handed out afterwards.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::context::Context;
use crate::error::Result;
use crate::exec::deny_callback_context;
use crate::handle::{HandleBox, NULL_HANDLE};
use crate::module::options::JitOptions;
use crate::policy::Operation;

/// A kernel entry point resolved from a loaded module.
///
/// The token stays valid until the owning module is unloaded.
#[derive(Debug, Clone)]
pub struct Function {
    device: usize,
    raw: u64,
    name: String,
}

impl Function {
    pub fn device(&self) -> usize {
        self.device
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn raw(&self) -> u64 {
        self.raw
    }
}

/// A named device-memory global resolved from a loaded module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    pub address: u64,
    pub byte_len: u64,
}

/// A loaded unit of device code.
///
/// Must be explicitly [`unload`](Module::unload)ed.
pub struct Module {
    ctx: Context,
    device: usize,
    handle: HandleBox,
    functions: Mutex<HashMap<String, u64>>,
    globals: Mutex<HashMap<String, Symbol>>,
    textures: Mutex<HashMap<String, u64>>,
    surfaces: Mutex<HashMap<String, u64>>,
}

impl Module {
    /// Load a code image onto `device`.
    ///
    /// Requires [`Operation::ModuleLoad`] authorization. When `options` is
    /// given it is materialized for the load and consumed afterwards, success
    /// or not, so its output fields are readable either way.
    pub fn load(
        ctx: &Context,
        device: usize,
        image: &[u8],
        options: Option<&JitOptions>,
    ) -> Result<Self> {
        deny_callback_context("module load")?;
        ctx.policy().authorize(Operation::ModuleLoad)?;

        let runtime = ctx.runtime();
        let options_raw = match options {
            Some(opts) => opts.materialize(runtime)?,
            None => NULL_HANDLE,
        };

        let loaded = runtime.module_load(device, image, options_raw);
        if let Some(opts) = options {
            opts.consume(runtime);
        }
        let raw = loaded?;
        debug!(device, bytes = image.len(), "Loaded module");

        Ok(Self {
            ctx: ctx.clone(),
            device,
            handle: HandleBox::new(raw),
            functions: Mutex::new(HashMap::new()),
            globals: Mutex::new(HashMap::new()),
            textures: Mutex::new(HashMap::new()),
            surfaces: Mutex::new(HashMap::new()),
        })
    }

    pub fn device(&self) -> usize {
        self.device
    }

    /// Resolve a kernel entry point by name, memoized per module.
    pub fn function(&self, name: &str) -> Result<Function> {
        deny_callback_context("function lookup")?;
        let mut cache = self.functions.lock().unwrap_or_else(|e| e.into_inner());
        let raw = match cache.get(name) {
            Some(&raw) => raw,
            None => {
                let raw = self
                    .ctx
                    .runtime()
                    .module_get_function(self.handle.get()?, name)?;
                cache.insert(name.to_string(), raw);
                raw
            }
        };
        Ok(Function {
            device: self.device,
            raw,
            name: name.to_string(),
        })
    }

    /// Resolve a named global's device address and length, memoized.
    pub fn global(&self, name: &str) -> Result<Symbol> {
        deny_callback_context("global lookup")?;
        let mut cache = self.globals.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(&symbol) = cache.get(name) {
            return Ok(symbol);
        }
        let (address, byte_len) = self
            .ctx
            .runtime()
            .module_get_global(self.handle.get()?, name)?;
        let symbol = Symbol { address, byte_len };
        cache.insert(name.to_string(), symbol);
        Ok(symbol)
    }

    /// Resolve a named texture reference, memoized.
    pub fn texture(&self, name: &str) -> Result<u64> {
        deny_callback_context("texture lookup")?;
        let mut cache = self.textures.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(&raw) = cache.get(name) {
            return Ok(raw);
        }
        let raw = self
            .ctx
            .runtime()
            .module_get_texture(self.handle.get()?, name)?;
        cache.insert(name.to_string(), raw);
        Ok(raw)
    }

    /// Resolve a named surface reference, memoized.
    pub fn surface(&self, name: &str) -> Result<u64> {
        deny_callback_context("surface lookup")?;
        let mut cache = self.surfaces.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(&raw) = cache.get(name) {
            return Ok(raw);
        }
        let raw = self
            .ctx
            .runtime()
            .module_get_surface(self.handle.get()?, name)?;
        cache.insert(name.to_string(), raw);
        Ok(raw)
    }

    /// Unload the module and invalidate every entity resolved from it.
    ///
    /// Caches are emptied before the native handle is released, so a
    /// concurrent lookup cannot surface a token of the dead module.
    /// Idempotent.
    pub fn unload(&self) -> Result<()> {
        self.functions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.globals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.textures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.surfaces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        let raw = self.handle.take();
        if raw != NULL_HANDLE {
            self.ctx.runtime().module_unload(raw)?;
            debug!(device = self.device, "Unloaded module");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("device", &self.device)
            .field("handle", &self.handle.peek())
            .finish()
    }
}
