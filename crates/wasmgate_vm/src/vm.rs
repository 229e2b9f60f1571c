//! The VM façade: load → restrict → link → call.
//!
//! `WasmVm` owns exactly one engine and all boundary state around it. Every
//! lifecycle step that goes wrong moves the VM into `VmState::Failed`, which
//! is terminal: lookups come back absent and calls are rejected.

use crate::call::{CallHandle, DynamicCall, VmId};
use crate::callback::{CallbackTable, HostCallback, HostContext};
use crate::engine::{Cloneable, FunctionHandle, WasmEngine};
use crate::memory::{read_word_with, write_word_with};
use crate::restriction::AbiRestriction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{Span, debug, trace, warn};
use wasmgate_core::{
    FailState, FunctionExport, FunctionImport, Signature, VmConfig, VmError, VmResult, Word,
};

/// Lifecycle state of a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    /// No module loaded
    Created,
    /// Module loaded, not linked
    Loaded,
    /// Module instantiated; calls may flow
    Linked,
    /// Terminal failure
    Failed(FailState),
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Loaded => write!(f, "loaded"),
            Self::Linked => write!(f, "linked"),
            Self::Failed(state) => write!(f, "failed ({state})"),
        }
    }
}

/// A sandboxed module bound to one execution engine
pub struct WasmVm {
    id: VmId,
    engine: Box<dyn WasmEngine>,
    config: VmConfig,
    scope: String,
    state: VmState,
    restriction: AbiRestriction,
    callbacks: CallbackTable,
    exports: HashMap<String, FunctionHandle>,
    span: Span,
}

impl WasmVm {
    /// Bind a VM to `engine`. `scope` labels the VM's tracing span.
    #[must_use]
    pub fn new(engine: Box<dyn WasmEngine>, config: VmConfig, scope: &str) -> Self {
        let span = tracing::debug_span!("wasm_vm", runtime = engine.runtime(), scope);
        Self {
            id: VmId::next(),
            engine,
            config,
            scope: scope.to_string(),
            state: VmState::Created,
            restriction: AbiRestriction::new(),
            callbacks: CallbackTable::new(),
            exports: HashMap::new(),
            span,
        }
    }

    /// Name of the engine this VM runs on
    #[must_use]
    pub fn runtime(&self) -> &'static str {
        self.engine.runtime()
    }

    /// Label given at construction
    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Configuration applied to this VM
    #[must_use]
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> VmState {
        self.state
    }

    /// Whether the VM has failed
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.state, VmState::Failed(_)) || self.engine.is_failed()
    }

    /// Why the VM failed, if it has
    #[must_use]
    pub fn fail_state(&self) -> Option<FailState> {
        match self.state {
            VmState::Failed(state) => Some(state),
            _ if self.engine.is_failed() => Some(FailState::RuntimeError),
            _ => None,
        }
    }

    fn fail(&mut self, err: VmError) -> VmError {
        if !matches!(self.state, VmState::Failed(_)) {
            let state = err.fail_state();
            warn!(parent: &self.span, error = %err, fail_state = %state, "VM failed");
            self.state = VmState::Failed(state);
        }
        err
    }

    /// Load bytecode. Returns `false` if it was rejected (the VM fails) or
    /// a module is already loaded (nothing changes).
    pub fn load(&mut self, code: &[u8], allow_precompiled: bool) -> bool {
        let _guard = self.span.clone().entered();
        if self.state != VmState::Created {
            debug!(state = %self.state, "Load rejected");
            return false;
        }
        if code.len() > self.config.max_module_size {
            self.fail(VmError::ModuleTooLarge {
                size: code.len(),
                limit: self.config.max_module_size,
            });
            return false;
        }
        match self.engine.load(code, allow_precompiled) {
            Ok(()) => {
                debug!(size = code.len(), "Module loaded");
                self.state = VmState::Loaded;
                true
            }
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    /// Enable ABI restriction with an empty exposed set. Only valid once a
    /// module is loaded and before link.
    ///
    /// Callbacks installed earlier survive only if their names are exposed
    /// by the time [`WasmVm::link`] runs.
    pub fn restrict_abi(&mut self) -> bool {
        if self.state != VmState::Loaded {
            debug!(parent: &self.span, state = %self.state, "restrict_abi rejected");
            return false;
        }
        self.restriction.restrict();
        true
    }

    /// Whether ABI restriction is enabled
    #[must_use]
    pub fn is_restricted(&self) -> bool {
        self.restriction.is_restricted()
    }

    /// Allow `name` across the boundary. Only valid while restricted and
    /// before link; exposing a name twice is a no-op.
    pub fn expose_function(&mut self, name: &str) -> bool {
        if self.state != VmState::Loaded {
            return false;
        }
        self.restriction.expose(name)
    }

    /// Install a host callback for the guest import `namespace.name`.
    ///
    /// Under restriction an unexposed name is skipped and `false` is
    /// returned; link will then fail if the guest imports it.
    pub fn register_callback_if_exposed(
        &mut self,
        namespace: &str,
        name: &str,
        callback: HostCallback,
    ) -> bool {
        if !matches!(self.state, VmState::Created | VmState::Loaded) {
            return false;
        }
        if !self.restriction.allows(name) {
            debug!(parent: &self.span, namespace, callback = name, "Skipping unexposed host callback");
            return false;
        }
        self.callbacks.insert(namespace, name, callback);
        true
    }

    /// Resolve guest imports and instantiate. `false` exactly when the VM
    /// has failed.
    pub fn link(&mut self, module_name: &str) -> bool {
        let _guard = self.span.clone().entered();
        if self.state != VmState::Loaded {
            if !self.is_failed() {
                self.fail(VmError::InvalidState {
                    expected: VmState::Loaded.to_string(),
                    actual: self.state.to_string(),
                });
            }
            return false;
        }

        if self.restriction.is_restricted() {
            let dropped = self.restriction.prune(&mut self.callbacks);
            if dropped > 0 {
                debug!(dropped, "Dropped unexposed host callbacks");
            }
            let checked = self
                .restriction
                .check_exports(&self.engine.exports())
                .and_then(|()| {
                    self.restriction
                        .check_imports(&self.engine.imports(), &self.callbacks)
                });
            if let Err(e) = checked {
                self.fail(e);
                return false;
            }
        }

        match self.engine.link(module_name, &self.callbacks) {
            Ok(()) => {
                debug!(module = module_name, restricted = self.is_restricted(), "Module linked");
                self.state = VmState::Linked;
                true
            }
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    fn lookup(&mut self, name: &str, signature: Signature) -> Option<FunctionHandle> {
        if self.state != VmState::Linked || self.engine.is_failed() {
            return None;
        }
        if let Some(function) = self.exports.get(name) {
            return (function.signature() == signature).then_some(*function);
        }
        let function = self.engine.get_function(name, signature)?;
        self.exports.insert(name.to_string(), function);
        Some(function)
    }

    /// Resolve a guest export as a typed handle. `None` if the export is
    /// missing, has another shape, or the VM is not linked or has failed.
    pub fn get_function<H: CallHandle>(&mut self, name: &str) -> Option<H> {
        let function = self.lookup(name, H::SIGNATURE)?;
        Some(H::bind(self.id, function, name))
    }

    /// Like [`WasmVm::get_function`], but also `None` for names that were
    /// not exposed while restricted
    pub fn get_function_if_exposed<H: CallHandle>(&mut self, name: &str) -> Option<H> {
        if !self.restriction.allows(name) {
            debug!(parent: &self.span, export = name, "Lookup of unexposed export");
            return None;
        }
        self.get_function(name)
    }

    /// Resolve a guest export whose arity is only known at runtime
    pub fn get_dynamic_function(&mut self, name: &str) -> Option<DynamicCall> {
        if !self.restriction.allows(name) {
            return None;
        }
        let signature = self
            .engine
            .exports()
            .into_iter()
            .find(|export| export.name == name)?
            .signature?;
        let function = self.lookup(name, signature)?;
        Some(DynamicCall::new(self.id, function, name))
    }

    pub(crate) fn invoke(
        &mut self,
        vm: VmId,
        function: FunctionHandle,
        name: &str,
        ctx: &HostContext,
        args: &[Word],
    ) -> VmResult<Option<Word>> {
        if vm != self.id {
            return Err(VmError::ForeignHandle);
        }
        if let Some(state) = self.fail_state() {
            return Err(VmError::Failed(state));
        }
        if self.state != VmState::Linked {
            return Err(VmError::InvalidState {
                expected: VmState::Linked.to_string(),
                actual: self.state.to_string(),
            });
        }

        let _guard = self.span.clone().entered();
        trace!(function = name, ?args, "Call");
        self.engine
            .call(function, ctx, args)
            .map_err(|e| self.fail(e))
    }

    /// Function imports declared by the loaded module
    #[must_use]
    pub fn imports(&self) -> Vec<FunctionImport> {
        self.engine.imports()
    }

    /// Function exports declared by the loaded module
    #[must_use]
    pub fn exports(&self) -> Vec<FunctionExport> {
        self.engine.exports()
    }

    /// Payload of the named custom section
    #[must_use]
    pub fn get_custom_section(&self, name: &str) -> Option<Vec<u8>> {
        if self.state == VmState::Created {
            return None;
        }
        self.engine.get_custom_section(name)
    }

    fn check_alive(&self) -> VmResult<()> {
        match self.fail_state() {
            Some(state) => Err(VmError::Failed(state)),
            None => Ok(()),
        }
    }

    /// Copy `len` bytes out of guest memory at `pointer`
    ///
    /// # Errors
    ///
    /// Returns error if the VM has failed or the range is out of bounds
    pub fn get_memory(&mut self, pointer: Word, len: Word) -> VmResult<Vec<u8>> {
        self.check_alive()?;
        self.engine.read_memory(pointer.u64(), len.u64())
    }

    /// Copy `data` into guest memory at `pointer`
    ///
    /// # Errors
    ///
    /// Returns error if the VM has failed or the range is out of bounds
    pub fn set_memory(&mut self, pointer: Word, data: &[u8]) -> VmResult<()> {
        self.check_alive()?;
        self.engine.write_memory(pointer.u64(), data)
    }

    /// Read a wasm32 word from guest memory
    ///
    /// # Errors
    ///
    /// Returns error if the VM has failed or the range is out of bounds
    pub fn get_word(&mut self, pointer: Word) -> VmResult<Word> {
        read_word_with(pointer.u64(), |offset, len| {
            self.get_memory(Word::new(offset), Word::new(len))
        })
    }

    /// Write a wasm32 word into guest memory
    ///
    /// # Errors
    ///
    /// Returns error if the VM has failed, the range is out of bounds or
    /// the word does not fit in 32 bits
    pub fn set_word(&mut self, pointer: Word, word: Word) -> VmResult<()> {
        write_word_with(pointer.u64(), word, |offset, bytes| {
            self.set_memory(Word::new(offset), bytes)
        })
    }

    /// Serialize the loaded module into an engine-precompiled artifact
    ///
    /// # Errors
    ///
    /// Returns error if nothing is loaded, the VM has failed or the engine
    /// has no precompiled format
    pub fn precompile(&self) -> VmResult<Vec<u8>> {
        self.check_alive()?;
        if self.state == VmState::Created {
            return Err(VmError::InvalidState {
                expected: VmState::Loaded.to_string(),
                actual: self.state.to_string(),
            });
        }
        self.engine.precompile()
    }

    /// How this VM can be cloned
    #[must_use]
    pub fn cloneable(&self) -> Cloneable {
        if self.is_failed() || self.state == VmState::Created {
            return Cloneable::NotCloneable;
        }
        self.engine.cloneable()
    }

    /// A fresh VM in the `Loaded` state sharing the compiled module, the
    /// restriction and the host callbacks. `None` if not cloneable.
    #[must_use]
    pub fn clone_vm(&self) -> Option<Self> {
        if self.cloneable() == Cloneable::NotCloneable {
            return None;
        }
        let engine = self.engine.clone_engine()?;
        let mut clone = Self::new(engine, self.config.clone(), &self.scope);
        clone.state = VmState::Loaded;
        clone.restriction = self.restriction.clone();
        clone.callbacks = self.callbacks.clone();
        debug!(parent: &self.span, "Cloned VM");
        Some(clone)
    }
}

impl fmt::Debug for WasmVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasmVm")
            .field("runtime", &self.runtime())
            .field("scope", &self.scope)
            .field("state", &self.state)
            .field("restriction", &self.restriction)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{WasmCallVoid, WasmCallWord};
    use crate::engine::runtime_names;
    use crate::testdata::{
        EXPORTS, TestHost, code_for, create, create_with_config, runtimes, spin_module,
        test_module,
    };

    fn word(value: u64) -> Word {
        Word::new(value)
    }

    fn linked(runtime: &str) -> WasmVm {
        let mut vm = create(runtime);
        assert!(vm.load(&code_for(runtime), false));
        TestHost::register(&mut vm);
        assert!(vm.link("test"), "{runtime}: link failed");
        vm
    }

    fn restricted(runtime: &str, exposed: &[&str]) -> WasmVm {
        let mut vm = create(runtime);
        assert!(vm.load(&code_for(runtime), false));
        assert!(vm.restrict_abi());
        for name in exposed {
            assert!(vm.expose_function(name));
        }
        vm
    }

    #[test]
    fn test_vm_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WasmVm>();
    }

    #[test]
    fn test_new_vm_state() {
        for runtime in runtimes() {
            let vm = create(runtime);
            assert_eq!(vm.runtime(), runtime);
            assert_eq!(vm.state(), VmState::Created);
            assert!(!vm.is_failed());
            assert_eq!(vm.fail_state(), None);
            assert!(!vm.is_restricted());
        }
    }

    #[test]
    fn test_sum_and_div() {
        for runtime in runtimes() {
            let mut vm = linked(runtime);
            let ctx = HostContext::none();
            let sum: WasmCallWord<3> = vm.get_function("sum").unwrap();
            let div: WasmCallWord<2> = vm.get_function("div").unwrap();

            assert_eq!(sum.call(&mut vm, &ctx, [word(13), word(14), word(15)]).unwrap(), word(42));
            assert_eq!(div.call(&mut vm, &ctx, [word(42), word(42)]).unwrap(), word(1));
            assert!(!vm.is_failed());
        }
    }

    #[test]
    fn test_div_by_zero_fails_vm() {
        for runtime in runtimes() {
            let mut vm = linked(runtime);
            let ctx = HostContext::none();
            let div: WasmCallWord<2> = vm.get_function("div").unwrap();

            let result = div.call(&mut vm, &ctx, [word(42), word(0)]);
            assert!(matches!(result, Err(VmError::Trap { .. })), "{runtime}: {result:?}");
            assert!(vm.is_failed());
            assert_eq!(vm.fail_state(), Some(FailState::RuntimeError));
        }
    }

    #[test]
    fn test_abort_fails_vm() {
        for runtime in runtimes() {
            let mut vm = linked(runtime);
            let abort: WasmCallVoid<0> = vm.get_function("abort").unwrap();
            assert!(abort.call(&mut vm, &HostContext::none(), []).is_err());
            assert!(vm.is_failed());
        }
    }

    #[test]
    fn test_handles_rejected_after_failure() {
        for runtime in runtimes() {
            let mut vm = linked(runtime);
            let ctx = HostContext::none();
            let sum: WasmCallWord<3> = vm.get_function("sum").unwrap();
            let abort: WasmCallVoid<0> = vm.get_function("abort").unwrap();

            assert!(abort.call(&mut vm, &ctx, []).is_err());
            assert_eq!(
                sum.call(&mut vm, &ctx, [word(1), word(2), word(3)]),
                Err(VmError::Failed(FailState::RuntimeError))
            );
            assert!(vm.get_function::<WasmCallWord<3>>("sum").is_none());
            assert!(vm.get_dynamic_function("sum").is_none());
        }
    }

    #[test]
    fn test_host_callbacks_receive_injected_context() {
        for runtime in runtimes() {
            let mut vm = linked(runtime);
            let host = TestHost::with_random(42);
            let ctx = HostContext::from_arc(host.clone());

            let lucky: WasmCallWord<1> = vm.get_function("lucky").unwrap();
            assert_eq!(lucky.call(&mut vm, &ctx, [word(1)]).unwrap(), word(0));
            assert_eq!(lucky.call(&mut vm, &ctx, [word(42)]).unwrap(), word(1));

            let ping: WasmCallVoid<1> = vm.get_function("ping").unwrap();
            ping.call(&mut vm, &ctx, [word(7)]).unwrap();
            assert_eq!(host.pongs(), vec![7]);
        }
    }

    #[test]
    fn test_host_callback_error_fails_vm() {
        for runtime in runtimes() {
            let mut vm = linked(runtime);
            let lucky: WasmCallWord<1> = vm.get_function("lucky").unwrap();
            // no TestHost injected: the random callback errors
            assert!(lucky.call(&mut vm, &HostContext::none(), [word(1)]).is_err());
            assert!(vm.is_failed());
        }
    }

    #[test]
    fn test_expose_abi() {
        for runtime in runtimes() {
            let mut exposed = EXPORTS.to_vec();
            exposed.extend(["pong", "random"]);
            let mut vm = restricted(runtime, &exposed);
            assert!(vm.is_restricted());
            TestHost::register(&mut vm);
            assert!(vm.link("test"), "{runtime}: link failed");

            let host = TestHost::with_random(42);
            let ctx = HostContext::from_arc(host.clone());
            let lucky: WasmCallWord<1> = vm.get_function_if_exposed("lucky").unwrap();
            assert_eq!(lucky.call(&mut vm, &ctx, [word(42)]).unwrap(), word(1));
            assert!(vm.get_function_if_exposed::<WasmCallWord<1>>("unknown").is_none());
        }
    }

    #[test]
    fn test_restricted_host_function_fails_link() {
        for runtime in runtimes() {
            let mut exposed = EXPORTS.to_vec();
            exposed.push("random");
            let mut vm = restricted(runtime, &exposed);
            let (pong, random) = TestHost::register(&mut vm);
            assert!(!pong);
            assert!(random);

            assert!(!vm.link("test"));
            assert!(vm.is_failed());
            assert_eq!(vm.fail_state(), Some(FailState::RestrictedImport));
            assert!(vm.get_function::<WasmCallWord<3>>("sum").is_none());
        }
    }

    #[test]
    fn test_restricted_module_function_fails_link() {
        for runtime in runtimes() {
            let mut vm = restricted(runtime, &["pong", "random", "ping", "lucky", "sum", "div"]);
            TestHost::register(&mut vm);

            assert!(!vm.link("test"));
            assert!(vm.is_failed());
            assert_eq!(vm.fail_state(), Some(FailState::RestrictedExport));
            assert!(vm.get_function_if_exposed::<WasmCallVoid<1>>("ping").is_none());
            assert!(vm.get_function_if_exposed::<WasmCallWord<1>>("lucky").is_none());
            assert!(vm.get_function_if_exposed::<WasmCallWord<3>>("sum").is_none());
            assert!(vm.get_function_if_exposed::<WasmCallWord<2>>("div").is_none());
            assert!(vm.get_function_if_exposed::<WasmCallVoid<0>>("abort").is_none());
        }
    }

    #[test]
    fn test_callback_registered_before_restriction_fails_link() {
        for runtime in runtimes() {
            let mut vm = create(runtime);
            assert!(vm.load(&code_for(runtime), false));
            assert_eq!(TestHost::register(&mut vm), (true, true));
            assert!(vm.restrict_abi());
            for name in EXPORTS.iter().chain(&["random"]) {
                assert!(vm.expose_function(name));
            }

            assert!(!vm.link("test"), "{runtime}: unexposed pong linked");
            assert_eq!(vm.fail_state(), Some(FailState::RestrictedImport));
            for name in EXPORTS {
                assert!(vm.get_dynamic_function(name).is_none());
            }
        }
    }

    #[test]
    fn test_callback_registered_before_restriction_links_when_exposed() {
        for runtime in runtimes() {
            let mut vm = create(runtime);
            assert!(vm.load(&code_for(runtime), false));
            TestHost::register(&mut vm);
            assert!(vm.restrict_abi());
            for name in EXPORTS.iter().chain(&["pong", "random"]) {
                assert!(vm.expose_function(name));
            }
            assert!(vm.link("test"), "{runtime}: link failed");

            let host = TestHost::with_random(7);
            let ping: WasmCallVoid<1> = vm.get_function_if_exposed("ping").unwrap();
            ping.call(&mut vm, &HostContext::from_arc(host.clone()), [word(3)]).unwrap();
            assert_eq!(host.pongs(), vec![3]);
        }
    }

    #[test]
    fn test_restricting_again_drops_exposed_callbacks() {
        for runtime in runtimes() {
            let mut exposed = EXPORTS.to_vec();
            exposed.extend(["pong", "random"]);
            let mut vm = restricted(runtime, &exposed);
            assert_eq!(TestHost::register(&mut vm), (true, true));

            assert!(vm.restrict_abi());
            for name in EXPORTS {
                assert!(vm.expose_function(name));
            }

            assert!(!vm.link("test"), "{runtime}: stale callbacks linked");
            assert_eq!(vm.fail_state(), Some(FailState::RestrictedImport));
            assert!(vm.get_function_if_exposed::<WasmCallWord<3>>("sum").is_none());
        }
    }

    #[test]
    fn test_expose_function_idempotent() {
        for runtime in runtimes() {
            let mut exposed = EXPORTS.to_vec();
            exposed.extend(["pong", "random", "sum", "pong"]);
            let mut vm = restricted(runtime, &exposed);
            TestHost::register(&mut vm);
            assert!(vm.link("test"));
            let sum: WasmCallWord<3> = vm.get_function_if_exposed("sum").unwrap();
            let ret = sum.call(&mut vm, &HostContext::none(), [word(13), word(14), word(15)]);
            assert_eq!(ret.unwrap(), word(42));
        }
    }

    #[test]
    fn test_restriction_ordering() {
        for runtime in runtimes() {
            let mut vm = create(runtime);
            assert!(!vm.restrict_abi());
            assert!(vm.load(&code_for(runtime), false));
            assert!(!vm.expose_function("sum"));
            TestHost::register(&mut vm);
            assert!(vm.link("test"));
            assert!(!vm.restrict_abi());
            assert!(!vm.expose_function("sum"));
            assert!(!vm.register_callback_if_exposed(
                "env",
                "pong",
                HostCallback::void_u32::<1, _>(|_cx, [_v]| Ok(()))
            ));
        }
    }

    #[test]
    fn test_unrestricted_missing_import_fails_link() {
        for runtime in runtimes() {
            let mut vm = create(runtime);
            assert!(vm.load(&code_for(runtime), false));
            assert!(vm.register_callback_if_exposed(
                "env",
                "random",
                HostCallback::word_u32::<0, _>(|_cx, []| Ok(4))
            ));
            assert!(!vm.link("test"));
            assert_eq!(vm.fail_state(), Some(FailState::MissingFunction));
        }
    }

    #[test]
    fn test_mismatched_callback_shape_fails_link() {
        for runtime in runtimes() {
            let mut vm = create(runtime);
            assert!(vm.load(&code_for(runtime), false));
            vm.register_callback_if_exposed(
                "env",
                "pong",
                HostCallback::word_u32::<1, _>(|_cx, [v]| Ok(v)),
            );
            vm.register_callback_if_exposed(
                "env",
                "random",
                HostCallback::word_u32::<0, _>(|_cx, []| Ok(4)),
            );
            assert!(!vm.link("test"));
            assert_eq!(vm.fail_state(), Some(FailState::LinkFailed));
        }
    }

    #[test]
    fn test_invalid_code_fails_load() {
        for runtime in runtimes() {
            let mut vm = create(runtime);
            assert!(!vm.load(b"definitely not a module", false));
            assert!(vm.is_failed());
            assert_eq!(vm.fail_state(), Some(FailState::UnableToLoadCode));
            assert!(!vm.link("test"));
        }
    }

    #[test]
    fn test_load_twice_rejected() {
        for runtime in runtimes() {
            let mut vm = create(runtime);
            assert!(vm.load(&code_for(runtime), false));
            assert!(!vm.load(&code_for(runtime), false));
            assert_eq!(vm.state(), VmState::Loaded);
            assert!(!vm.is_failed());
        }
    }

    #[test]
    fn test_module_size_limit() {
        for runtime in runtimes() {
            let mut vm = create_with_config(runtime, VmConfig::new().with_max_module_size(4));
            assert!(!vm.load(&code_for(runtime), false));
            assert_eq!(vm.fail_state(), Some(FailState::UnableToLoadCode));
        }
    }

    #[test]
    fn test_link_before_load_fails() {
        for runtime in runtimes() {
            let mut vm = create(runtime);
            assert!(!vm.link("test"));
            assert_eq!(vm.fail_state(), Some(FailState::LinkFailed));
        }
    }

    #[test]
    fn test_lookup_before_link_is_absent() {
        for runtime in runtimes() {
            let mut vm = create(runtime);
            assert!(vm.load(&code_for(runtime), false));
            assert!(vm.get_function::<WasmCallWord<3>>("sum").is_none());
            assert!(!vm.is_failed());
        }
    }

    #[test]
    fn test_lookup_with_wrong_shape_is_absent() {
        for runtime in runtimes() {
            let mut vm = linked(runtime);
            assert!(vm.get_function::<WasmCallWord<2>>("sum").is_none());
            assert!(vm.get_function::<WasmCallVoid<3>>("sum").is_none());
            assert!(vm.get_function::<WasmCallWord<0>>("missing").is_none());
            assert!(vm.get_function::<WasmCallWord<3>>("sum").is_some());
            assert!(!vm.is_failed());
        }
    }

    #[test]
    fn test_foreign_handle_rejected() {
        for runtime in runtimes() {
            let mut first = linked(runtime);
            let mut second = linked(runtime);
            let sum: WasmCallWord<3> = first.get_function("sum").unwrap();
            assert_eq!(
                sum.call(&mut second, &HostContext::none(), [word(1), word(2), word(3)]),
                Err(VmError::ForeignHandle)
            );
            assert!(!second.is_failed());
        }
    }

    #[test]
    fn test_dynamic_call() {
        for runtime in runtimes() {
            let mut vm = linked(runtime);
            let ctx = HostContext::none();
            let sum = vm.get_dynamic_function("sum").unwrap();
            assert_eq!(sum.signature(), Signature::word(3));

            assert!(matches!(
                sum.call(&mut vm, &ctx, &[word(1), word(2)]),
                Err(VmError::ArityMismatch { expected: 3, actual: 2, .. })
            ));
            assert!(!vm.is_failed());
            assert_eq!(
                sum.call(&mut vm, &ctx, &[word(13), word(14), word(15)]).unwrap(),
                Some(word(42))
            );
        }
    }

    #[test]
    fn test_guest_memory() {
        for runtime in runtimes() {
            let mut vm = linked(runtime);
            vm.set_word(word(8), word(42)).unwrap();
            assert_eq!(vm.get_word(word(8)).unwrap(), word(42));

            vm.set_memory(word(16), b"hello").unwrap();
            assert_eq!(vm.get_memory(word(16), word(5)).unwrap(), b"hello");

            assert!(vm.get_memory(word(65_536), word(1)).is_err());
            assert!(vm.set_word(word(0), word(u64::MAX)).is_err());
            assert!(!vm.is_failed());
        }
    }

    #[test]
    fn test_clone_vm() {
        for runtime in runtimes() {
            let mut exposed = EXPORTS.to_vec();
            exposed.extend(["pong", "random"]);
            let mut vm = restricted(runtime, &exposed);
            TestHost::register(&mut vm);
            assert_eq!(vm.cloneable(), Cloneable::CompiledBytecode);

            let mut clone = vm.clone_vm().unwrap();
            assert_eq!(clone.state(), VmState::Loaded);
            assert!(clone.is_restricted());
            assert!(vm.link("test"));
            assert!(clone.link("clone"));

            let ctx = HostContext::none();
            let abort: WasmCallVoid<0> = clone.get_function("abort").unwrap();
            assert!(abort.call(&mut clone, &ctx, []).is_err());
            assert!(clone.clone_vm().is_none());

            let sum: WasmCallWord<3> = vm.get_function("sum").unwrap();
            assert_eq!(sum.call(&mut vm, &ctx, [word(13), word(14), word(15)]).unwrap(), word(42));
        }
    }

    #[test]
    fn test_custom_section() {
        let mut code = test_module();
        crate::section::append_custom_section(&mut code, "wasmgate.meta", b"v1");
        for runtime in runtimes() {
            if runtime == runtime_names::NULL {
                continue;
            }
            let mut vm = create(runtime);
            assert_eq!(vm.get_custom_section("wasmgate.meta"), None);
            assert!(vm.load(&code, false));
            assert_eq!(vm.get_custom_section("wasmgate.meta"), Some(b"v1".to_vec()));
            assert_eq!(vm.get_custom_section("missing"), None);
        }
    }

    #[test]
    fn test_fuel_exhaustion_traps() {
        for runtime in runtimes() {
            if runtime == runtime_names::NULL {
                continue;
            }
            let mut vm = create_with_config(runtime, VmConfig::new().with_fuel(10_000));
            assert!(vm.load(&spin_module(), false));
            assert!(vm.link("spin"));
            let spin: WasmCallVoid<0> = vm.get_function("spin").unwrap();
            assert!(matches!(
                spin.call(&mut vm, &HostContext::none(), []),
                Err(VmError::Trap { .. })
            ));
            assert_eq!(vm.fail_state(), Some(FailState::RuntimeError));
        }
    }

    #[test]
    fn test_precompiled_round_trip() {
        for runtime in runtimes() {
            let mut vm = create(runtime);
            assert!(vm.precompile().is_err());
            assert!(vm.load(&code_for(runtime), false));
            if runtime != runtime_names::WASMTIME {
                assert!(matches!(vm.precompile(), Err(VmError::Unsupported { .. })));
                continue;
            }

            let artifact = vm.precompile().unwrap();
            let mut rejected = create(runtime);
            assert!(!rejected.load(&artifact, false));

            let mut restored = create(runtime);
            assert!(restored.load(&artifact, true));
            TestHost::register(&mut restored);
            assert!(restored.link("precompiled"));
            let sum: WasmCallWord<3> = restored.get_function("sum").unwrap();
            let ret = sum.call(&mut restored, &HostContext::none(), [word(13), word(14), word(15)]);
            assert_eq!(ret.unwrap(), word(42));
        }
    }

    #[test]
    fn test_text_module_loads_with_precompiled_allowed() {
        if !runtimes().contains(&runtime_names::WASMTIME) {
            return;
        }
        let mut vm = create(runtime_names::WASMTIME);
        assert!(vm.load(crate::testdata::TEST_WAT.as_bytes(), true));
        TestHost::register(&mut vm);
        assert!(vm.link("text"));
        let sum: WasmCallWord<3> = vm.get_function("sum").unwrap();
        let ret = sum.call(&mut vm, &HostContext::none(), [word(1), word(2), word(3)]);
        assert_eq!(ret.unwrap(), word(6));

        let mut binary = create(runtime_names::WASMTIME);
        assert!(binary.load(&test_module(), true));
    }

    #[test]
    fn test_precompiled_module_has_no_custom_sections() {
        if !runtimes().contains(&runtime_names::WASMTIME) {
            return;
        }
        let mut code = test_module();
        crate::section::append_custom_section(&mut code, "wasmgate.meta", b"v1");
        let mut vm = create(runtime_names::WASMTIME);
        assert!(vm.load(&code, false));
        let artifact = vm.precompile().unwrap();

        let mut restored = create(runtime_names::WASMTIME);
        assert!(restored.load(&artifact, true));
        assert_eq!(restored.get_custom_section("wasmgate.meta"), None);
    }

    #[test]
    fn test_imports_and_exports() {
        for runtime in runtimes() {
            let mut vm = create(runtime);
            assert!(vm.load(&code_for(runtime), false));
            let imports: Vec<String> = vm.imports().into_iter().map(|i| i.name).collect();
            assert_eq!(imports, vec!["pong", "random"]);
            let exports: Vec<String> = vm.exports().into_iter().map(|e| e.name).collect();
            assert_eq!(exports, EXPORTS);
        }
    }

    #[test]
    fn test_cross_engine_equivalence() {
        let outcomes: Vec<Vec<Option<u64>>> = runtimes()
            .into_iter()
            .map(|runtime| {
                let ctx = HostContext::none();
                let mut vm = linked(runtime);
                let sum: WasmCallWord<3> = vm.get_function("sum").unwrap();
                let div: WasmCallWord<2> = vm.get_function("div").unwrap();
                vec![
                    sum.call(&mut vm, &ctx, [word(13), word(14), word(15)]).ok().map(Word::u64),
                    sum.call(&mut vm, &ctx, [word(u64::from(u32::MAX)), word(1), word(0)])
                        .ok()
                        .map(Word::u64),
                    div.call(&mut vm, &ctx, [word(42), word(42)]).ok().map(Word::u64),
                    div.call(&mut vm, &ctx, [word(42), word(0)]).ok().map(Word::u64),
                    Some(u64::from(vm.is_failed())),
                ]
            })
            .collect();

        assert!(outcomes.windows(2).all(|pair| pair[0] == pair[1]), "{outcomes:?}");
        assert_eq!(outcomes[0], vec![Some(42), Some(0), Some(1), None, Some(1)]);
    }
}
