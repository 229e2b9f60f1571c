//! Execution engine backends.
//!
//! Every backend implements [`WasmEngine`] against its own linking and
//! calling model. The VM façade only ever talks to this trait, so the
//! observable contract (sticky failure, absent lookups, traps that never
//! unwind into the host) is the same on every engine.

pub mod null;
#[cfg(feature = "wasmi")]
pub mod wasmi;
#[cfg(feature = "wasmtime")]
pub mod wasmtime;

use crate::callback::{CallContext, CallbackTable, HostCallback, HostContext};
use crate::memory::LinearMemory;
use serde::{Deserialize, Serialize};
use wasmgate_core::{FunctionExport, FunctionImport, Signature, VmResult, Word};

/// Well-known runtime names
pub mod runtime_names {
    /// Cranelift-compiled engine
    pub const WASMTIME: &str = "wasmtime";
    /// Interpreting engine
    pub const WASMI: &str = "wasmi";
    /// In-process native plugins
    pub const NULL: &str = "null";
}

/// Native integer type a word crosses the boundary as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WordType {
    I32,
    I64,
}

/// A word in its native guest representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RawWord {
    I32(i32),
    I64(i64),
}

impl RawWord {
    /// wasm32 words cross as `i32`: only the low half is passed
    pub(crate) fn from_word(word: Word, ty: WordType) -> Self {
        match ty {
            WordType::I32 => Self::I32(word.as_i32()),
            WordType::I64 => Self::I64(word.as_i64()),
        }
    }

    pub(crate) fn into_word(self) -> Word {
        match self {
            Self::I32(v) => Word::from_i32(v),
            Self::I64(v) => Word::from_i64(v),
        }
    }
}

/// Word shape of a native function type. `None` if any parameter or the
/// result has no word representation, or there is more than one result.
pub(crate) fn word_signature(
    params: &[Option<WordType>],
    results: &[Option<WordType>],
) -> Option<Signature> {
    if params.iter().any(Option::is_none) {
        return None;
    }
    match results {
        [] => Some(Signature::void(params.len())),
        [Some(_)] => Some(Signature::word(params.len())),
        _ => None,
    }
}

pub(crate) fn describe_signature(signature: Option<Signature>) -> String {
    signature.map_or_else(|| "non-word signature".to_string(), |s| s.to_string())
}

/// Per-store state visible to host callbacks
#[derive(Default)]
pub(crate) struct StoreData {
    pub(crate) context: HostContext,
}

/// Run a host callback on behalf of the guest. `memory` is the guest's
/// exported linear memory, if any.
pub(crate) fn invoke_host(
    callback: &HostCallback,
    host: &HostContext,
    memory: Option<&mut [u8]>,
    args: &[Word],
) -> VmResult<Option<Word>> {
    let mut memory = match memory {
        Some(bytes) => LinearMemory::new(bytes),
        None => LinearMemory::empty(),
    };
    callback.invoke(&mut CallContext::new(host, &mut memory), args)
}

/// Resolved guest function inside one engine instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionHandle {
    index: usize,
    signature: Signature,
}

impl FunctionHandle {
    /// Create a handle for the engine's function slot `index`
    #[must_use]
    pub fn new(index: usize, signature: Signature) -> Self {
        Self { index, signature }
    }

    /// Engine function slot
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Word shape of the function
    #[must_use]
    pub fn signature(&self) -> Signature {
        self.signature
    }
}

/// How a loaded engine can be duplicated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cloneable {
    /// The engine cannot be cloned
    NotCloneable,
    /// Clones share the compiled module and are linked afresh
    CompiledBytecode,
}

/// Capability set every execution engine provides
pub trait WasmEngine: Send {
    /// Runtime name this engine is registered under
    fn runtime(&self) -> &'static str;

    /// Load and validate bytecode
    ///
    /// # Errors
    ///
    /// Returns error if the bytecode is rejected
    fn load(&mut self, code: &[u8], allow_precompiled: bool) -> VmResult<()>;

    /// Function imports declared by the loaded module
    fn imports(&self) -> Vec<FunctionImport>;

    /// Function exports declared by the loaded module
    fn exports(&self) -> Vec<FunctionExport>;

    /// Resolve imports against `callbacks` and instantiate
    ///
    /// # Errors
    ///
    /// Returns error if an import cannot be satisfied or instantiation
    /// traps. Failure is sticky.
    fn link(&mut self, module_name: &str, callbacks: &CallbackTable) -> VmResult<()>;

    /// Look up an export with the given shape. `None` if it is missing,
    /// has another shape, or the engine has failed.
    fn get_function(&mut self, name: &str, signature: Signature) -> Option<FunctionHandle>;

    /// Call a resolved function
    ///
    /// # Errors
    ///
    /// Returns error if the guest traps. Failure is sticky.
    fn call(
        &mut self,
        function: FunctionHandle,
        ctx: &HostContext,
        args: &[Word],
    ) -> VmResult<Option<Word>>;

    /// Whether a load, link or call has failed
    fn is_failed(&self) -> bool;

    /// Payload of a named custom section of the loaded module
    fn get_custom_section(&self, _name: &str) -> Option<Vec<u8>> {
        None
    }

    /// Copy bytes out of guest linear memory
    ///
    /// # Errors
    ///
    /// Returns error if the range is out of bounds or there is no memory
    fn read_memory(&mut self, offset: u64, len: u64) -> VmResult<Vec<u8>>;

    /// Copy bytes into guest linear memory
    ///
    /// # Errors
    ///
    /// Returns error if the range is out of bounds or there is no memory
    fn write_memory(&mut self, offset: u64, data: &[u8]) -> VmResult<()>;

    /// Serialize the loaded module into an engine-precompiled artifact
    ///
    /// # Errors
    ///
    /// Returns error if the engine has no precompiled format
    fn precompile(&self) -> VmResult<Vec<u8>> {
        Err(wasmgate_core::VmError::Unsupported {
            runtime: self.runtime().to_string(),
            operation: "precompile".to_string(),
        })
    }

    /// How this engine can be cloned
    fn cloneable(&self) -> Cloneable {
        Cloneable::NotCloneable
    }

    /// A fresh, loaded but unlinked copy of this engine
    fn clone_engine(&self) -> Option<Box<dyn WasmEngine>> {
        None
    }
}
