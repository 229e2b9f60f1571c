//! Wasmgate Core Types
//!
//! Engine-independent types shared by every layer of the host/guest
//! boundary: the `Word` marshaling unit, function signatures, the VM
//! error taxonomy and VM configuration. No engine code lives here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod signature;
pub mod word;

// Re-exports
pub use config::VmConfig;
pub use error::{FailState, VmError, VmResult, WordError};
pub use signature::{FunctionExport, FunctionImport, Signature};
pub use word::{WASM32_WORD_SIZE, Word};
