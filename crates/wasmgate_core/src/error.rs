//! Error types for the VM boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// VM result type
pub type VmResult<T> = Result<T, VmError>;

/// Why a VM entered its terminal failed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailState {
    /// Bytecode was rejected by the engine or by configured limits
    UnableToLoadCode,
    /// A guest import had no host callback installed
    MissingFunction,
    /// A guest import was skipped because its name is not exposed
    RestrictedImport,
    /// The guest exports a function whose name is not exposed
    RestrictedExport,
    /// The engine rejected the link or an operation was out of order
    LinkFailed,
    /// A trap occurred during a call
    RuntimeError,
}

impl fmt::Display for FailState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnableToLoadCode => write!(f, "unable to load code"),
            Self::MissingFunction => write!(f, "missing function"),
            Self::RestrictedImport => write!(f, "restricted import"),
            Self::RestrictedExport => write!(f, "restricted export"),
            Self::LinkFailed => write!(f, "link failed"),
            Self::RuntimeError => write!(f, "runtime error"),
        }
    }
}

/// Word conversion errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WordError {
    /// Value does not fit the narrower native width
    #[error("Word {0} does not fit in 32 bits")]
    Overflow(u64),
}

/// VM errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// Bytecode could not be loaded
    #[error("Failed to load module: {0}")]
    Load(String),

    /// Bytecode exceeds the configured size limit
    #[error("Module size {size} exceeds limit {limit}")]
    ModuleTooLarge { size: usize, limit: usize },

    /// Engine-level link failure
    #[error("Failed to link module {module}: {reason}")]
    Link { module: String, reason: String },

    /// Guest import with no installed host callback
    #[error("Unresolved import {namespace}.{name}")]
    UnresolvedImport { namespace: String, name: String },

    /// Guest import whose name was never exposed
    #[error("Import {namespace}.{name} is not exposed")]
    RestrictedImport { namespace: String, name: String },

    /// Guest export whose name was never exposed
    #[error("Export {0} is not exposed")]
    RestrictedExport(String),

    /// Host callback shape differs from the guest declaration
    #[error("Signature mismatch for {name}: expected {expected}, found {actual}")]
    SignatureMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// Wrong number of arguments for a call
    #[error("{name} expects {expected} arguments, got {actual}")]
    ArityMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// Callee produced no value where one was required
    #[error("{0} returned no value")]
    MissingResult(String),

    /// Guest-triggered fault during a call
    #[error("Trap in {function}: {reason}")]
    Trap { function: String, reason: String },

    /// Host callback reported an error
    #[error("Host callback failed: {0}")]
    Host(String),

    /// Operation not valid in the current lifecycle state
    #[error("Invalid state: expected {expected}, found {actual}")]
    InvalidState { expected: String, actual: String },

    /// The VM has failed and accepts no further calls
    #[error("VM has failed: {0}")]
    Failed(FailState),

    /// Call handle belongs to a different VM instance
    #[error("Call handle belongs to another VM")]
    ForeignHandle,

    /// Guest memory access outside linear memory
    #[error("Memory access out of bounds: offset {offset}, length {length}")]
    MemoryOutOfBounds { offset: u64, length: u64 },

    /// Guest exports no linear memory
    #[error("Module has no exported memory")]
    NoMemory,

    /// Engine does not support the operation
    #[error("Unsupported by {runtime}: {operation}")]
    Unsupported { runtime: String, operation: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Word conversion failure
    #[error(transparent)]
    Word(#[from] WordError),
}

impl VmError {
    /// Create a host callback error
    #[must_use]
    pub fn host(message: impl Into<String>) -> Self {
        Self::Host(message.into())
    }

    /// Create a trap
    #[must_use]
    pub fn trap(function: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Trap {
            function: function.into(),
            reason: reason.into(),
        }
    }

    /// Failure state this error moves a VM into when it aborts
    /// a lifecycle step
    #[must_use]
    pub fn fail_state(&self) -> FailState {
        match self {
            Self::Load(_) | Self::ModuleTooLarge { .. } => FailState::UnableToLoadCode,
            Self::UnresolvedImport { .. } => FailState::MissingFunction,
            Self::RestrictedImport { .. } => FailState::RestrictedImport,
            Self::RestrictedExport(_) => FailState::RestrictedExport,
            Self::Link { .. } | Self::SignatureMismatch { .. } | Self::InvalidState { .. } => {
                FailState::LinkFailed
            }
            Self::Failed(state) => *state,
            _ => FailState::RuntimeError,
        }
    }
}

impl From<serde_json::Error> for VmError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}
