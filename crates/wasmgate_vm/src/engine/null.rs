//! Null backend: in-process native plugins.
//!
//! The "bytecode" handed to this engine is the UTF-8 name of a plugin in
//! a [`NullPluginRegistry`]. Plugins declare imports and exports like a
//! guest module and call host imports through the linked callback table,
//! so the façade cannot tell them apart from real guests.

use super::{Cloneable, FunctionHandle, WasmEngine, invoke_host, runtime_names};
use crate::callback::{CallbackTable, HostContext};
use crate::memory::{GuestMemory, LinearMemory};
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use wasmgate_core::{FunctionExport, FunctionImport, Signature, VmError, VmResult, Word};

/// Native code standing in for a guest module
pub trait NullPlugin: Send {
    /// Host functions the plugin calls
    fn imports(&self) -> Vec<FunctionImport> {
        Vec::new()
    }

    /// Functions the plugin provides
    fn exports(&self) -> Vec<FunctionExport>;

    /// Size of the plugin's linear memory in bytes
    fn memory_size(&self) -> usize {
        0
    }

    /// Run export `name`
    ///
    /// # Errors
    ///
    /// Any error is treated as a guest trap
    fn call(&mut self, name: &str, host: &mut NullHost<'_>, args: &[Word])
    -> VmResult<Option<Word>>;
}

/// Constructor for a plugin instance
pub type NullPluginFactory = Arc<dyn Fn() -> Box<dyn NullPlugin> + Send + Sync>;

/// Plugins available to the null engine, keyed by name
#[derive(Clone, Default)]
pub struct NullPluginRegistry {
    plugins: IndexMap<String, NullPluginFactory>,
}

impl NullPluginRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin constructor, replacing any under the same name
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn NullPlugin> + Send + Sync + 'static,
    {
        self.plugins.insert(name.to_string(), Arc::new(factory));
    }

    /// Instantiate the plugin registered as `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Box<dyn NullPlugin>> {
        self.plugins.get(name).map(|factory| factory())
    }

    /// Whether a plugin is registered as `name`
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Registered plugin names in registration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }
}

impl fmt::Debug for NullPluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.plugins.keys()).finish()
    }
}

/// Host side of a plugin call
pub struct NullHost<'a> {
    callbacks: &'a CallbackTable,
    context: &'a HostContext,
    memory: &'a mut [u8],
}

impl NullHost<'_> {
    /// Call a host import by (namespace, name)
    ///
    /// # Errors
    ///
    /// Returns error if no callback is linked under that key or the
    /// callback fails
    pub fn call_import(
        &mut self,
        namespace: &str,
        name: &str,
        args: &[Word],
    ) -> VmResult<Option<Word>> {
        let callback = self
            .callbacks
            .get(namespace, name)
            .ok_or_else(|| VmError::UnresolvedImport {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;
        invoke_host(callback, self.context, Some(&mut *self.memory), args)
    }

    /// The plugin's linear memory
    pub fn memory(&mut self) -> LinearMemory<'_> {
        LinearMemory::new(self.memory)
    }
}

/// Engine running [`NullPlugin`]s
pub struct NullEngine {
    plugins: NullPluginRegistry,
    name: Option<String>,
    plugin: Option<Box<dyn NullPlugin>>,
    callbacks: Option<CallbackTable>,
    memory: Vec<u8>,
    functions: Vec<String>,
    failed: bool,
}

impl NullEngine {
    /// Create an engine resolving plugins in `plugins`
    #[must_use]
    pub fn new(plugins: NullPluginRegistry) -> Self {
        Self {
            plugins,
            name: None,
            plugin: None,
            callbacks: None,
            memory: Vec::new(),
            functions: Vec::new(),
            failed: false,
        }
    }

    fn fail(&mut self, err: VmError) -> VmError {
        self.failed = true;
        err
    }

    fn memory_bytes(&mut self) -> VmResult<&mut [u8]> {
        if self.callbacks.is_none() || self.memory.is_empty() {
            return Err(VmError::NoMemory);
        }
        Ok(&mut self.memory)
    }
}

impl WasmEngine for NullEngine {
    fn runtime(&self) -> &'static str {
        runtime_names::NULL
    }

    fn load(&mut self, code: &[u8], _allow_precompiled: bool) -> VmResult<()> {
        if self.plugin.is_some() {
            return Err(VmError::InvalidState {
                expected: "unloaded engine".to_string(),
                actual: "plugin already loaded".to_string(),
            });
        }
        let Ok(name) = std::str::from_utf8(code) else {
            return Err(self.fail(VmError::Load("plugin name is not UTF-8".to_string())));
        };
        let Some(plugin) = self.plugins.get(name) else {
            return Err(self.fail(VmError::Load(format!("unknown null plugin {name}"))));
        };
        debug!(plugin = name, "Loaded null plugin");
        self.name = Some(name.to_string());
        self.plugin = Some(plugin);
        Ok(())
    }

    fn imports(&self) -> Vec<FunctionImport> {
        self.plugin.as_ref().map(|p| p.imports()).unwrap_or_default()
    }

    fn exports(&self) -> Vec<FunctionExport> {
        self.plugin.as_ref().map(|p| p.exports()).unwrap_or_default()
    }

    fn link(&mut self, module_name: &str, callbacks: &CallbackTable) -> VmResult<()> {
        if self.failed {
            return Err(VmError::Link {
                module: module_name.to_string(),
                reason: "engine has failed".to_string(),
            });
        }
        let Some((imports, memory_size)) = self
            .plugin
            .as_ref()
            .map(|plugin| (plugin.imports(), plugin.memory_size()))
        else {
            return Err(VmError::InvalidState {
                expected: "loaded plugin".to_string(),
                actual: "no plugin".to_string(),
            });
        };

        for import in imports {
            let Some(callback) = callbacks.get(&import.namespace, &import.name) else {
                return Err(self.fail(VmError::UnresolvedImport {
                    namespace: import.namespace,
                    name: import.name,
                }));
            };
            if import.signature != Some(callback.signature()) {
                return Err(self.fail(VmError::SignatureMismatch {
                    name: format!("{}.{}", import.namespace, import.name),
                    expected: callback.signature().to_string(),
                    actual: import
                        .signature
                        .map_or_else(|| "non-word signature".to_string(), |s| s.to_string()),
                }));
            }
        }

        self.memory = vec![0; memory_size];
        self.callbacks = Some(callbacks.clone());
        debug!(module = module_name, "Linked null plugin");
        Ok(())
    }

    fn get_function(&mut self, name: &str, signature: Signature) -> Option<FunctionHandle> {
        if self.failed || self.callbacks.is_none() {
            return None;
        }
        let export = self
            .plugin
            .as_ref()?
            .exports()
            .into_iter()
            .find(|export| export.name == name)?;
        if export.signature != Some(signature) {
            debug!(function = name, actual = ?export.signature, expected = %signature, "Export shape mismatch");
            return None;
        }
        self.functions.push(name.to_string());
        Some(FunctionHandle::new(self.functions.len() - 1, signature))
    }

    fn call(
        &mut self,
        function: FunctionHandle,
        ctx: &HostContext,
        args: &[Word],
    ) -> VmResult<Option<Word>> {
        if self.failed {
            return Err(VmError::trap("<any>", "engine has failed"));
        }
        let name = self
            .functions
            .get(function.index())
            .cloned()
            .ok_or_else(|| VmError::trap("<unknown>", "invalid function handle"))?;
        let (Some(plugin), Some(callbacks)) = (self.plugin.as_mut(), self.callbacks.as_ref()) else {
            return Err(VmError::trap(name, "plugin is not linked"));
        };

        trace!(function = %name, ?args, "Calling null plugin");
        let mut host = NullHost {
            callbacks,
            context: ctx,
            memory: &mut self.memory,
        };
        match plugin.call(&name, &mut host, args) {
            Ok(ret) => Ok(ret),
            Err(e) => {
                warn!(function = %name, error = %e, "Null plugin trapped");
                Err(self.fail(VmError::trap(name, e.to_string())))
            }
        }
    }

    fn is_failed(&self) -> bool {
        self.failed
    }

    fn read_memory(&mut self, offset: u64, len: u64) -> VmResult<Vec<u8>> {
        LinearMemory::new(self.memory_bytes()?).read(offset, len)
    }

    fn write_memory(&mut self, offset: u64, data: &[u8]) -> VmResult<()> {
        LinearMemory::new(self.memory_bytes()?).write(offset, data)
    }

    fn cloneable(&self) -> Cloneable {
        Cloneable::CompiledBytecode
    }

    fn clone_engine(&self) -> Option<Box<dyn WasmEngine>> {
        let name = self.name.as_deref()?;
        let mut clone = Self::new(self.plugins.clone());
        clone.plugin = Some(self.plugins.get(name)?);
        clone.name = Some(name.to_string());
        Some(Box::new(clone))
    }
}
