//! Function shapes as seen through the word boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Shape of a boundary function: how many words it takes and whether it
/// returns one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    /// Number of word parameters
    pub params: usize,
    /// Whether a single word is returned
    pub returns_word: bool,
}

impl Signature {
    /// Signature returning nothing
    #[must_use]
    pub const fn void(params: usize) -> Self {
        Self {
            params,
            returns_word: false,
        }
    }

    /// Signature returning one word
    #[must_use]
    pub const fn word(params: usize) -> Self {
        Self {
            params,
            returns_word: true,
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ret = if self.returns_word { "word" } else { "void" };
        write!(f, "({}) -> {}", self.params, ret)
    }
}

/// Function the guest expects the host to provide
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionImport {
    /// Import namespace (module name)
    pub namespace: String,
    /// Function name
    pub name: String,
    /// Word shape, `None` if the guest type has no word representation
    pub signature: Option<Signature>,
}

impl FunctionImport {
    /// Create a new import
    #[must_use]
    pub fn new(namespace: &str, name: &str, signature: Option<Signature>) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            signature,
        }
    }
}

/// Function the guest provides to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionExport {
    /// Function name
    pub name: String,
    /// Word shape, `None` if the guest type has no word representation
    pub signature: Option<Signature>,
}

impl FunctionExport {
    /// Create a new export
    #[must_use]
    pub fn new(name: &str, signature: Option<Signature>) -> Self {
        Self {
            name: name.to_string(),
            signature,
        }
    }
}
