//! Engine selection by runtime name.

use crate::engine::null::{NullEngine, NullPluginRegistry};
use crate::engine::{WasmEngine, runtime_names};
use crate::vm::WasmVm;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;
use wasmgate_core::{VmConfig, VmResult};

/// Builds an engine for a VM
pub type EngineConstructor =
    Arc<dyn Fn(&VmConfig) -> VmResult<Box<dyn WasmEngine>> + Send + Sync>;

/// Engines available to [`EngineRegistry::create_vm`], keyed by runtime name
#[derive(Clone)]
pub struct EngineRegistry {
    engines: IndexMap<String, EngineConstructor>,
    config: VmConfig,
}

impl EngineRegistry {
    /// Create a registry with no engines
    #[must_use]
    pub fn new() -> Self {
        Self {
            engines: IndexMap::new(),
            config: VmConfig::default(),
        }
    }

    /// Create a registry with every built-in engine. The null engine
    /// resolves plugin names in `plugins`.
    #[must_use]
    pub fn with_defaults(plugins: NullPluginRegistry) -> Self {
        let mut registry = Self::new();
        #[cfg(feature = "wasmtime")]
        registry.register(runtime_names::WASMTIME, |config| {
            Ok(Box::new(crate::engine::wasmtime::WasmtimeEngine::new(config)?))
        });
        #[cfg(feature = "wasmi")]
        registry.register(runtime_names::WASMI, |config| {
            Ok(Box::new(crate::engine::wasmi::WasmiEngine::new(config)?))
        });
        registry.register(runtime_names::NULL, move |_config| {
            Ok(Box::new(NullEngine::new(plugins.clone())))
        });
        registry
    }

    /// Set the configuration used by [`EngineRegistry::create_vm`]
    #[must_use]
    pub fn with_config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an engine constructor, replacing any under the same name
    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&VmConfig) -> VmResult<Box<dyn WasmEngine>> + Send + Sync + 'static,
    {
        self.engines.insert(name.to_string(), Arc::new(constructor));
    }

    /// Registered runtime names in registration order
    pub fn runtimes(&self) -> impl Iterator<Item = &str> {
        self.engines.keys().map(String::as_str)
    }

    /// Create a VM on the engine registered as `name`. `None` if the name
    /// is unknown or the engine could not be constructed.
    #[must_use]
    pub fn create_vm(&self, name: &str, scope: &str) -> Option<WasmVm> {
        self.create_vm_with_config(name, scope, self.config.clone())
    }

    /// Like [`EngineRegistry::create_vm`] with an explicit configuration
    #[must_use]
    pub fn create_vm_with_config(
        &self,
        name: &str,
        scope: &str,
        config: VmConfig,
    ) -> Option<WasmVm> {
        let constructor = self.engines.get(name)?;
        if let Err(e) = config.validate() {
            warn!(runtime = name, error = %e, "Rejected VM configuration");
            return None;
        }
        match constructor(&config) {
            Ok(engine) => Some(WasmVm::new(engine, config, scope)),
            Err(e) => {
                warn!(runtime = name, error = %e, "Failed to construct engine");
                None
            }
        }
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::with_defaults(NullPluginRegistry::new())
    }
}

impl fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("runtimes", &self.engines.keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish()
    }
}

/// Create a VM on a built-in engine with the default configuration
#[must_use]
pub fn create_vm(engine_name: &str, scope: &str) -> Option<WasmVm> {
    EngineRegistry::default().create_vm(engine_name, scope)
}
