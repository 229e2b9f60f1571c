//! Guest module and host doubles shared by the VM tests.
//!
//! The same module is provided as WAT for the real engines and as a null
//! plugin, so every scenario runs unchanged on each runtime.

use crate::callback::HostCallback;
use crate::engine::null::{NullHost, NullPlugin, NullPluginRegistry};
use crate::engine::runtime_names;
use crate::factory::EngineRegistry;
use crate::vm::WasmVm;
use std::sync::{Arc, Mutex};
use wasmgate_core::{
    FunctionExport, FunctionImport, Signature, VmConfig, VmError, VmResult, Word,
};

pub(crate) const TEST_WAT: &str = r#"
(module
  (import "env" "pong" (func $pong (param i32)))
  (import "env" "random" (func $random (result i32)))
  (memory (export "memory") 1)
  (func (export "ping") (param i32)
    local.get 0
    call $pong)
  (func (export "lucky") (param i32) (result i32)
    local.get 0
    call $random
    i32.eq)
  (func (export "sum") (param i32 i32 i32) (result i32)
    local.get 0
    local.get 1
    i32.add
    local.get 2
    i32.add)
  (func (export "div") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    i32.div_u)
  (func (export "abort")
    unreachable))
"#;

pub(crate) const SPIN_WAT: &str = r#"
(module
  (func (export "spin")
    (loop br 0)))
"#;

/// Exports of the test module in declaration order
pub(crate) const EXPORTS: [&str; 5] = ["ping", "lucky", "sum", "div", "abort"];

pub(crate) const TEST_PLUGIN: &str = "test-module";

const PAGE_SIZE: usize = 65_536;

pub(crate) fn test_module() -> Vec<u8> {
    wat::parse_str(TEST_WAT).unwrap()
}

pub(crate) fn spin_module() -> Vec<u8> {
    wat::parse_str(SPIN_WAT).unwrap()
}

/// Native twin of [`TEST_WAT`]
struct TestPlugin;

fn take<const N: usize>(name: &str, args: &[Word]) -> VmResult<[Word; N]> {
    <[Word; N]>::try_from(args).map_err(|_| VmError::ArityMismatch {
        name: name.to_string(),
        expected: N,
        actual: args.len(),
    })
}

impl NullPlugin for TestPlugin {
    fn imports(&self) -> Vec<FunctionImport> {
        vec![
            FunctionImport::new("env", "pong", Some(Signature::void(1))),
            FunctionImport::new("env", "random", Some(Signature::word(0))),
        ]
    }

    fn exports(&self) -> Vec<FunctionExport> {
        vec![
            FunctionExport::new("ping", Some(Signature::void(1))),
            FunctionExport::new("lucky", Some(Signature::word(1))),
            FunctionExport::new("sum", Some(Signature::word(3))),
            FunctionExport::new("div", Some(Signature::word(2))),
            FunctionExport::new("abort", Some(Signature::void(0))),
        ]
    }

    fn memory_size(&self) -> usize {
        PAGE_SIZE
    }

    fn call(&mut self, name: &str, host: &mut NullHost<'_>, args: &[Word]) -> VmResult<Option<Word>> {
        match name {
            "ping" => {
                host.call_import("env", "pong", &take::<1>(name, args)?)?;
                Ok(None)
            }
            "lucky" => {
                let [guess] = take::<1>(name, args)?;
                let random = host
                    .call_import("env", "random", &[])?
                    .ok_or_else(|| VmError::MissingResult("random".to_string()))?;
                Ok(Some(Word::from(random.as_u32() == guess.as_u32())))
            }
            "sum" => {
                let [a, b, c] = take::<3>(name, args)?;
                let sum = a.as_u32().wrapping_add(b.as_u32()).wrapping_add(c.as_u32());
                Ok(Some(Word::from_u32(sum)))
            }
            "div" => {
                let [a, b] = take::<2>(name, args)?;
                a.as_u32()
                    .checked_div(b.as_u32())
                    .map(|q| Some(Word::from_u32(q)))
                    .ok_or_else(|| VmError::trap(name, "integer divide by zero"))
            }
            "abort" => Err(VmError::trap(name, "unreachable")),
            _ => Err(VmError::trap(name, "no such export")),
        }
    }
}

pub(crate) fn plugins() -> NullPluginRegistry {
    let mut plugins = NullPluginRegistry::new();
    plugins.register(TEST_PLUGIN, || Box::new(TestPlugin));
    plugins
}

/// Runtimes compiled into this build, in registration order
pub(crate) fn runtimes() -> Vec<&'static str> {
    let mut runtimes = Vec::new();
    if cfg!(feature = "wasmtime") {
        runtimes.push(runtime_names::WASMTIME);
    }
    if cfg!(feature = "wasmi") {
        runtimes.push(runtime_names::WASMI);
    }
    runtimes.push(runtime_names::NULL);
    runtimes
}

pub(crate) fn code_for(runtime: &str) -> Vec<u8> {
    if runtime == runtime_names::NULL {
        TEST_PLUGIN.as_bytes().to_vec()
    } else {
        test_module()
    }
}

pub(crate) fn create(runtime: &str) -> WasmVm {
    EngineRegistry::with_defaults(plugins())
        .create_vm(runtime, "test")
        .unwrap()
}

pub(crate) fn create_with_config(runtime: &str, config: VmConfig) -> WasmVm {
    EngineRegistry::with_defaults(plugins())
        .create_vm_with_config(runtime, "test", config)
        .unwrap()
}

/// Host state injected into calls through `HostContext`
#[derive(Debug, Default)]
pub(crate) struct TestHost {
    random: u32,
    pongs: Mutex<Vec<u32>>,
}

impl TestHost {
    pub(crate) fn with_random(random: u32) -> Arc<Self> {
        Arc::new(Self {
            random,
            pongs: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn pongs(&self) -> Vec<u32> {
        self.pongs.lock().unwrap().clone()
    }

    /// Offer `env.pong` and `env.random` to `vm`; returns which were
    /// installed
    pub(crate) fn register(vm: &mut WasmVm) -> (bool, bool) {
        let pong = vm.register_callback_if_exposed(
            "env",
            "pong",
            HostCallback::void_u32::<1, _>(|cx, [value]| {
                let host = cx
                    .host()
                    .get::<TestHost>()
                    .ok_or_else(|| VmError::host("no test host"))?;
                host.pongs.lock().unwrap().push(value);
                Ok(())
            }),
        );
        let random = vm.register_callback_if_exposed(
            "env",
            "random",
            HostCallback::word_u32::<0, _>(|cx, []| {
                cx.host()
                    .get::<TestHost>()
                    .map(|host| host.random)
                    .ok_or_else(|| VmError::host("no test host"))
            }),
        );
        (pong, random)
    }
}
