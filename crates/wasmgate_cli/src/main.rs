//! WASMGATE CLI
//!
//! Load, inspect, precompile and call WASM modules through any registered
//! engine.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, bail, eyre};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use wasmgate_core::{FunctionExport, FunctionImport, VmConfig, Word};
use wasmgate_vm::{EngineRegistry, HostContext, WasmVm, runtime_names};

#[derive(Parser)]
#[command(name = "wasmgate")]
#[command(about = "WASMGATE - Restricted host/guest boundary for WASM modules", long_about = None)]
struct Cli {
    /// VM configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available engines
    Runtimes,
    /// Show a module's imports, exports and custom sections
    Inspect {
        /// Module file
        file: PathBuf,
        /// Engine to load the module with
        #[arg(short, long, default_value = runtime_names::WASMTIME)]
        runtime: String,
        /// Print the payload of this custom section (hex)
        #[arg(short, long)]
        section: Option<String>,
        /// Emit JSON
        #[arg(long)]
        json: bool,
    },
    /// Call an exported function
    Call {
        /// Module file
        file: PathBuf,
        /// Export to call
        function: String,
        /// Word arguments (decimal or 0x-prefixed hex)
        #[arg(value_parser = parse_word)]
        args: Vec<Word>,
        /// Engine to run the module on
        #[arg(short, long, default_value = runtime_names::WASMTIME)]
        runtime: String,
        /// Restrict the ABI to these names (repeatable)
        #[arg(short, long)]
        expose: Vec<String>,
        /// Accept an engine-precompiled artifact
        #[arg(long)]
        allow_precompiled: bool,
    },
    /// Serialize a module into an engine-precompiled artifact
    Precompile {
        /// Module file
        file: PathBuf,
        /// Output path
        #[arg(short, long)]
        output: PathBuf,
        /// Engine to compile with
        #[arg(short, long, default_value = runtime_names::WASMTIME)]
        runtime: String,
    },
}

#[derive(Serialize)]
struct InspectReport {
    runtime: &'static str,
    imports: Vec<FunctionImport>,
    exports: Vec<FunctionExport>,
    section: Option<String>,
}

fn parse_word(value: &str) -> Result<Word, String> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed
        .map(Word::new)
        .map_err(|e| format!("invalid word {value:?}: {e}"))
}

fn load_config(path: Option<&Path>) -> Result<VmConfig> {
    let Some(path) = path else {
        return Ok(VmConfig::default());
    };
    let json = fs::read_to_string(path)
        .wrap_err_with(|| format!("reading config {}", path.display()))?;
    VmConfig::from_json(&json).wrap_err_with(|| format!("parsing config {}", path.display()))
}

fn describe_failure(vm: &WasmVm) -> String {
    vm.fail_state()
        .map_or_else(|| "no failure recorded".to_string(), |state| state.to_string())
}

fn loaded_vm(
    registry: &EngineRegistry,
    runtime: &str,
    file: &Path,
    allow_precompiled: bool,
) -> Result<WasmVm> {
    let mut vm = registry
        .create_vm(runtime, "cli")
        .ok_or_else(|| eyre!("unknown runtime {runtime}"))?;
    let code = fs::read(file).wrap_err_with(|| format!("reading module {}", file.display()))?;
    if !vm.load(&code, allow_precompiled) {
        bail!("failed to load {}: {}", file.display(), describe_failure(&vm));
    }
    debug!(runtime, size = code.len(), "Loaded module");
    Ok(vm)
}

fn module_name(file: &Path) -> String {
    file.file_stem()
        .map_or_else(|| "module".to_string(), |stem| stem.to_string_lossy().into_owned())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wasmgate=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let registry = EngineRegistry::default().with_config(config.clone());

    match cli.command {
        Commands::Runtimes => {
            for runtime in registry.runtimes() {
                println!("{runtime}");
            }
            Ok(())
        }
        Commands::Inspect {
            file,
            runtime,
            section,
            json,
        } => {
            let vm = loaded_vm(&registry, &runtime, &file, config.allow_precompiled)?;
            let report = InspectReport {
                runtime: vm.runtime(),
                imports: vm.imports(),
                exports: vm.exports(),
                section: section
                    .as_deref()
                    .and_then(|name| vm.get_custom_section(name))
                    .map(hex::encode),
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }
            println!("runtime: {}", report.runtime);
            for import in &report.imports {
                let signature = import.signature.map(|s| s.to_string());
                println!(
                    "import {}.{} {}",
                    import.namespace,
                    import.name,
                    signature.as_deref().unwrap_or("(non-word)")
                );
            }
            for export in &report.exports {
                let signature = export.signature.map(|s| s.to_string());
                println!(
                    "export {} {}",
                    export.name,
                    signature.as_deref().unwrap_or("(non-word)")
                );
            }
            match (section, report.section) {
                (Some(name), Some(payload)) => println!("section {name}: {payload}"),
                (Some(name), None) => println!("section {name}: absent"),
                _ => {}
            }
            Ok(())
        }
        Commands::Call {
            file,
            function,
            args,
            runtime,
            expose,
            allow_precompiled,
        } => {
            let allow_precompiled = allow_precompiled || config.allow_precompiled;
            let mut vm = loaded_vm(&registry, &runtime, &file, allow_precompiled)?;
            if !expose.is_empty() {
                vm.restrict_abi();
                for name in &expose {
                    vm.expose_function(name);
                }
            }
            if !vm.link(&module_name(&file)) {
                bail!("failed to link {}: {}", file.display(), describe_failure(&vm));
            }

            let handle = vm
                .get_dynamic_function(&function)
                .ok_or_else(|| eyre!("no callable export {function}"))?;
            info!(function = %function, signature = %handle.signature(), "Calling export");
            match handle.call(&mut vm, &HostContext::none(), &args) {
                Ok(Some(word)) => println!("{word}"),
                Ok(None) => println!("(void)"),
                Err(e) => bail!("{function} failed: {e} ({})", describe_failure(&vm)),
            }
            Ok(())
        }
        Commands::Precompile {
            file,
            output,
            runtime,
        } => {
            let vm = loaded_vm(&registry, &runtime, &file, false)?;
            let artifact = vm.precompile()?;
            fs::write(&output, &artifact)
                .wrap_err_with(|| format!("writing {}", output.display()))?;
            info!(runtime, size = artifact.len(), output = %output.display(), "Wrote artifact");
            Ok(())
        }
    }
}
