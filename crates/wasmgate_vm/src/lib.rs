//! WASMGATE VM
//!
//! Engine-agnostic host for sandboxed WebAssembly modules: load bytecode
//! into an interchangeable engine, restrict which names may cross the
//! boundary, link host callbacks, and call guest exports through typed
//! word-marshaled handles. Any trap leaves the VM permanently failed.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod call;
pub mod callback;
pub mod engine;
pub mod factory;
pub mod memory;
pub mod restriction;
pub mod section;
pub mod vm;

#[cfg(test)]
pub(crate) mod testdata;

pub use call::{CallHandle, DynamicCall, VmId, WasmCallVoid, WasmCallWord};
pub use callback::{CallContext, CallbackTable, HostCallback, HostContext};
pub use engine::null::{NullHost, NullPlugin, NullPluginRegistry};
pub use engine::{Cloneable, FunctionHandle, WasmEngine, runtime_names};
pub use factory::{EngineConstructor, EngineRegistry, create_vm};
pub use memory::{GuestMemory, LinearMemory};
pub use restriction::AbiRestriction;
pub use vm::{VmState, WasmVm};

pub use wasmgate_core::{
    FailState, FunctionExport, FunctionImport, Signature, VmConfig, VmError, VmResult, Word,
};
