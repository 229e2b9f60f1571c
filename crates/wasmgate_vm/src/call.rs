//! Typed host → guest call handles.
//!
//! Handles carry the identity of the VM that resolved them and are always
//! invoked through that VM, so a handle outliving a failure (or pointed at
//! another VM) is rejected instead of executed.

use crate::callback::HostContext;
use crate::engine::FunctionHandle;
use crate::vm::WasmVm;
use std::sync::atomic::{AtomicU64, Ordering};
use wasmgate_core::{Signature, VmError, VmResult, Word};

/// Identity of one VM instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmId(u64);

impl VmId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A call handle that can be resolved from a guest export
pub trait CallHandle: Sized {
    /// Word shape the export must have
    const SIGNATURE: Signature;

    #[doc(hidden)]
    fn bind(vm: VmId, function: FunctionHandle, name: &str) -> Self;
}

#[derive(Debug, Clone)]
struct Target {
    vm: VmId,
    function: FunctionHandle,
    name: String,
}

impl Target {
    fn invoke(&self, vm: &mut WasmVm, ctx: &HostContext, args: &[Word]) -> VmResult<Option<Word>> {
        vm.invoke(self.vm, self.function, &self.name, ctx, args)
    }
}

/// Guest function taking `N` words and returning one
#[derive(Debug, Clone)]
pub struct WasmCallWord<const N: usize> {
    target: Target,
}

impl<const N: usize> WasmCallWord<N> {
    /// Call the guest function
    ///
    /// # Errors
    ///
    /// Returns error if the VM has failed, the handle belongs to another
    /// VM, or the guest traps
    pub fn call(&self, vm: &mut WasmVm, ctx: &HostContext, args: [Word; N]) -> VmResult<Word> {
        self.target
            .invoke(vm, ctx, &args)?
            .ok_or_else(|| VmError::MissingResult(self.target.name.clone()))
    }

    /// Export name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.target.name
    }
}

impl<const N: usize> CallHandle for WasmCallWord<N> {
    const SIGNATURE: Signature = Signature::word(N);

    fn bind(vm: VmId, function: FunctionHandle, name: &str) -> Self {
        Self {
            target: Target {
                vm,
                function,
                name: name.to_string(),
            },
        }
    }
}

/// Guest function taking `N` words and returning nothing
#[derive(Debug, Clone)]
pub struct WasmCallVoid<const N: usize> {
    target: Target,
}

impl<const N: usize> WasmCallVoid<N> {
    /// Call the guest function
    ///
    /// # Errors
    ///
    /// Returns error if the VM has failed, the handle belongs to another
    /// VM, or the guest traps
    pub fn call(&self, vm: &mut WasmVm, ctx: &HostContext, args: [Word; N]) -> VmResult<()> {
        self.target.invoke(vm, ctx, &args).map(|_| ())
    }

    /// Export name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.target.name
    }
}

impl<const N: usize> CallHandle for WasmCallVoid<N> {
    const SIGNATURE: Signature = Signature::void(N);

    fn bind(vm: VmId, function: FunctionHandle, name: &str) -> Self {
        Self {
            target: Target {
                vm,
                function,
                name: name.to_string(),
            },
        }
    }
}

/// Guest function whose arity is only known at runtime
#[derive(Debug, Clone)]
pub struct DynamicCall {
    target: Target,
}

impl DynamicCall {
    pub(crate) fn new(vm: VmId, function: FunctionHandle, name: &str) -> Self {
        Self {
            target: Target {
                vm,
                function,
                name: name.to_string(),
            },
        }
    }

    /// Word shape of the export
    #[must_use]
    pub fn signature(&self) -> Signature {
        self.target.function.signature()
    }

    /// Export name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.target.name
    }

    /// Call the guest function
    ///
    /// # Errors
    ///
    /// Returns error on arity mismatch (the VM is left untouched), or if
    /// the VM has failed or the guest traps
    pub fn call(
        &self,
        vm: &mut WasmVm,
        ctx: &HostContext,
        args: &[Word],
    ) -> VmResult<Option<Word>> {
        let expected = self.signature().params;
        if args.len() != expected {
            return Err(VmError::ArityMismatch {
                name: self.target.name.clone(),
                expected,
                actual: args.len(),
            });
        }
        self.target.invoke(vm, ctx, args)
    }
}
