//! Wasmtime (Cranelift) backend.

use super::{
    Cloneable, FunctionHandle, RawWord, StoreData, WasmEngine, WordType, describe_signature,
    invoke_host, runtime_names, word_signature,
};
use crate::callback::{CallbackTable, HostContext};
use crate::memory::{GuestMemory, LinearMemory};
use crate::section;
use tracing::{debug, trace, warn};
use wasmgate_core::{
    FunctionExport, FunctionImport, Signature, VmConfig, VmError, VmResult, Word,
};
use wasmtime::{
    Caller, Config, Engine, Extern, ExternType, Func, FuncType, Instance, Linker, Module, Store,
    Val, ValType,
};

/// Artifacts from `Module::serialize` are ELF images
const PRECOMPILED_MAGIC: &[u8] = b"\x7fELF";

fn word_type(ty: &ValType) -> Option<WordType> {
    match ty {
        ValType::I32 => Some(WordType::I32),
        ValType::I64 => Some(WordType::I64),
        _ => None,
    }
}

fn signature_of(ty: &FuncType) -> Option<Signature> {
    let params: Vec<_> = ty.params().map(|p| word_type(&p)).collect();
    let results: Vec<_> = ty.results().map(|r| word_type(&r)).collect();
    word_signature(&params, &results)
}

fn word_from_val(val: &Val) -> Option<Word> {
    match val {
        Val::I32(v) => Some(RawWord::I32(*v).into_word()),
        Val::I64(v) => Some(RawWord::I64(*v).into_word()),
        _ => None,
    }
}

fn val_from_word(word: Word, ty: &ValType) -> Val {
    match RawWord::from_word(word, word_type(ty).unwrap_or(WordType::I32)) {
        RawWord::I32(v) => Val::I32(v),
        RawWord::I64(v) => Val::I64(v),
    }
}

/// Engine A: compiles modules with Cranelift
pub struct WasmtimeEngine {
    engine: Engine,
    config: VmConfig,
    store: Store<StoreData>,
    code: Vec<u8>,
    module: Option<Module>,
    instance: Option<Instance>,
    functions: Vec<(String, Func)>,
    failed: bool,
}

impl WasmtimeEngine {
    /// Create an engine with the given configuration
    ///
    /// # Errors
    ///
    /// Returns error if wasmtime rejects the configuration
    pub fn new(config: &VmConfig) -> VmResult<Self> {
        let mut wasm_config = Config::new();
        wasm_config.consume_fuel(config.fuel.is_some());
        let engine = Engine::new(&wasm_config).map_err(|e| VmError::Config(e.to_string()))?;
        Self::with_engine(engine, config)
    }

    fn with_engine(engine: Engine, config: &VmConfig) -> VmResult<Self> {
        let mut store = Store::new(&engine, StoreData::default());
        if let Some(fuel) = config.fuel {
            store
                .set_fuel(fuel)
                .map_err(|e| VmError::Config(e.to_string()))?;
        }
        Ok(Self {
            engine,
            config: config.clone(),
            store,
            code: Vec::new(),
            module: None,
            instance: None,
            functions: Vec::new(),
            failed: false,
        })
    }

    fn fail(&mut self, err: VmError) -> VmError {
        self.failed = true;
        err
    }

    fn memory_bytes(&mut self) -> VmResult<&mut [u8]> {
        let instance = self.instance.ok_or(VmError::NoMemory)?;
        let memory = instance
            .get_memory(&mut self.store, "memory")
            .ok_or(VmError::NoMemory)?;
        Ok(memory.data_mut(&mut self.store))
    }
}

impl WasmEngine for WasmtimeEngine {
    fn runtime(&self) -> &'static str {
        runtime_names::WASMTIME
    }

    fn load(&mut self, code: &[u8], allow_precompiled: bool) -> VmResult<()> {
        if self.module.is_some() {
            return Err(VmError::InvalidState {
                expected: "unloaded engine".to_string(),
                actual: "module already loaded".to_string(),
            });
        }

        // Anything else, binary or WAT text, is compiled from source
        let precompiled = allow_precompiled && code.starts_with(PRECOMPILED_MAGIC);
        let module = if precompiled {
            trace!("Deserializing precompiled module");
            // SAFETY: the embedder opted in with `allow_precompiled`; such
            // artifacts must come from `precompile()` on a trusted host.
            unsafe { Module::deserialize(&self.engine, code) }
        } else {
            Module::new(&self.engine, code)
        };

        match module {
            Ok(module) => {
                debug!(size = code.len(), precompiled, "Loaded module");
                if !precompiled {
                    self.code = code.to_vec();
                }
                self.module = Some(module);
                Ok(())
            }
            Err(e) => Err(self.fail(VmError::Load(e.to_string()))),
        }
    }

    fn imports(&self) -> Vec<FunctionImport> {
        let Some(module) = &self.module else {
            return Vec::new();
        };
        module
            .imports()
            .filter_map(|import| match import.ty() {
                ExternType::Func(ty) => Some(FunctionImport::new(
                    import.module(),
                    import.name(),
                    signature_of(&ty),
                )),
                _ => None,
            })
            .collect()
    }

    fn exports(&self) -> Vec<FunctionExport> {
        let Some(module) = &self.module else {
            return Vec::new();
        };
        module
            .exports()
            .filter_map(|export| match export.ty() {
                ExternType::Func(ty) => Some(FunctionExport::new(export.name(), signature_of(&ty))),
                _ => None,
            })
            .collect()
    }

    fn link(&mut self, module_name: &str, callbacks: &CallbackTable) -> VmResult<()> {
        if self.failed {
            return Err(VmError::Link {
                module: module_name.to_string(),
                reason: "engine has failed".to_string(),
            });
        }
        let module = self.module.clone().ok_or_else(|| VmError::InvalidState {
            expected: "loaded module".to_string(),
            actual: "no module".to_string(),
        })?;

        let mut linker: Linker<StoreData> = Linker::new(&self.engine);
        for import in module.imports() {
            let (namespace, name) = (import.module(), import.name());
            let ExternType::Func(ty) = import.ty() else {
                return Err(self.fail(VmError::UnresolvedImport {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                }));
            };
            let Some(callback) = callbacks.get(namespace, name).cloned() else {
                return Err(self.fail(VmError::UnresolvedImport {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                }));
            };
            if signature_of(&ty) != Some(callback.signature()) {
                return Err(self.fail(VmError::SignatureMismatch {
                    name: format!("{namespace}.{name}"),
                    expected: callback.signature().to_string(),
                    actual: describe_signature(signature_of(&ty)),
                }));
            }

            let result_type = ty.results().next();
            let qualified = format!("{namespace}.{name}");
            let defined = linker.func_new(
                namespace,
                name,
                ty.clone(),
                move |mut caller: Caller<'_, StoreData>, params: &[Val], results: &mut [Val]| {
                    let args: Vec<Word> = params.iter().filter_map(word_from_val).collect();
                    let host = caller.data().context.clone();
                    let memory = caller.get_export("memory").and_then(Extern::into_memory);
                    let bytes = match memory {
                        Some(memory) => Some(memory.data_mut(&mut caller)),
                        None => None,
                    };
                    let ret = invoke_host(&callback, &host, bytes, &args)
                        .map_err(|e| wasmtime::Error::msg(format!("{qualified}: {e}")))?;

                    if let (Some(slot), Some(word), Some(ty)) =
                        (results.first_mut(), ret, result_type.as_ref())
                    {
                        *slot = val_from_word(word, ty);
                    }
                    Ok(())
                },
            );
            if let Err(e) = defined {
                return Err(self.fail(VmError::Link {
                    module: module_name.to_string(),
                    reason: e.to_string(),
                }));
            }
        }

        match linker.instantiate(&mut self.store, &module) {
            Ok(instance) => {
                debug!(module = module_name, "Linked module");
                self.instance = Some(instance);
                Ok(())
            }
            Err(e) => Err(self.fail(VmError::Link {
                module: module_name.to_string(),
                reason: e.to_string(),
            })),
        }
    }

    fn get_function(&mut self, name: &str, signature: Signature) -> Option<FunctionHandle> {
        if self.failed {
            return None;
        }
        let func = self.instance?.get_func(&mut self.store, name)?;
        let actual = signature_of(&func.ty(&self.store));
        if actual != Some(signature) {
            debug!(function = name, ?actual, expected = %signature, "Export shape mismatch");
            return None;
        }
        self.functions.push((name.to_string(), func));
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
        let (name, func) = self
            .functions
            .get(function.index())
            .cloned()
            .ok_or_else(|| VmError::trap("<unknown>", "invalid function handle"))?;

        let ty = func.ty(&self.store);
        let params: Vec<Val> = ty
            .params()
            .zip(args)
            .map(|(ty, word)| val_from_word(*word, &ty))
            .collect();
        let mut results: Vec<Val> = ty.results().map(|ty| val_from_word(Word::ZERO, &ty)).collect();

        trace!(function = %name, ?args, "Calling guest");
        self.store.data_mut().context = ctx.clone();
        let outcome = func.call(&mut self.store, &params, &mut results);
        self.store.data_mut().context = HostContext::none();

        match outcome {
            Ok(()) => Ok(results.first().and_then(word_from_val)),
            Err(e) => {
                warn!(function = %name, error = %e, "Guest trapped");
                Err(self.fail(VmError::trap(name, e.to_string())))
            }
        }
    }

    fn is_failed(&self) -> bool {
        self.failed
    }

    /// Precompiled artifacts keep no source, so they have no custom sections
    fn get_custom_section(&self, name: &str) -> Option<Vec<u8>> {
        section::custom_section(&self.code, name).map(<[u8]>::to_vec)
    }

    fn read_memory(&mut self, offset: u64, len: u64) -> VmResult<Vec<u8>> {
        LinearMemory::new(self.memory_bytes()?).read(offset, len)
    }

    fn write_memory(&mut self, offset: u64, data: &[u8]) -> VmResult<()> {
        LinearMemory::new(self.memory_bytes()?).write(offset, data)
    }

    fn precompile(&self) -> VmResult<Vec<u8>> {
        let module = self.module.as_ref().ok_or_else(|| VmError::InvalidState {
            expected: "loaded module".to_string(),
            actual: "no module".to_string(),
        })?;
        module.serialize().map_err(|e| VmError::Unsupported {
            runtime: self.runtime().to_string(),
            operation: format!("precompile: {e}"),
        })
    }

    fn cloneable(&self) -> Cloneable {
        Cloneable::CompiledBytecode
    }

    fn clone_engine(&self) -> Option<Box<dyn WasmEngine>> {
        let module = self.module.clone()?;
        let mut clone = Self::with_engine(self.engine.clone(), &self.config).ok()?;
        clone.code = self.code.clone();
        clone.module = Some(module);
        Some(Box::new(clone))
    }
}
