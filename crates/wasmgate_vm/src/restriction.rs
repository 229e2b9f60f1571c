//! ABI restriction: the allow-list of names that may cross the boundary.
//!
//! Once restriction is enabled the exposed-name set is the only authority
//! on what links. An unexposed name is treated exactly like a missing one,
//! even when a host callback was installed for it before restriction.

use crate::callback::CallbackTable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use wasmgate_core::{FunctionExport, FunctionImport, VmError, VmResult};

/// Restriction state and exposed-name set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiRestriction {
    restricted: bool,
    exposed: BTreeSet<String>,
}

impl AbiRestriction {
    /// Create an unrestricted registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable restriction with an empty exposed set
    pub fn restrict(&mut self) {
        self.restricted = true;
        self.exposed.clear();
    }

    /// Whether restriction is enabled
    #[must_use]
    pub fn is_restricted(&self) -> bool {
        self.restricted
    }

    /// Allow `name` across the boundary. Returns `false` if restriction is
    /// not enabled; exposing the same name twice is a no-op.
    pub fn expose(&mut self, name: &str) -> bool {
        if !self.restricted {
            return false;
        }
        self.exposed.insert(name.to_string());
        true
    }

    /// Whether `name` may cross the boundary
    #[must_use]
    pub fn allows(&self, name: &str) -> bool {
        !self.restricted || self.exposed.contains(name)
    }

    /// Exposed names in sorted order
    pub fn exposed(&self) -> impl Iterator<Item = &str> {
        self.exposed.iter().map(String::as_str)
    }

    /// Check that every guest import is exposed and has a host callback
    /// installed
    ///
    /// # Errors
    ///
    /// Returns `RestrictedImport` for an unexposed import, whether or not a
    /// callback is installed for it, and `UnresolvedImport` for any other
    /// missing callback
    pub fn check_imports(
        &self,
        imports: &[FunctionImport],
        callbacks: &CallbackTable,
    ) -> VmResult<()> {
        for import in imports {
            if !self.allows(&import.name) {
                return Err(VmError::RestrictedImport {
                    namespace: import.namespace.clone(),
                    name: import.name.clone(),
                });
            }
            if !callbacks.contains(&import.namespace, &import.name) {
                return Err(VmError::UnresolvedImport {
                    namespace: import.namespace.clone(),
                    name: import.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Drop installed callbacks whose names are not exposed. Returns how
    /// many were dropped.
    pub fn prune(&self, callbacks: &mut CallbackTable) -> usize {
        let before = callbacks.len();
        callbacks.retain(|_, name| self.allows(name));
        before - callbacks.len()
    }

    /// Check that the guest exports no function outside the exposed set
    ///
    /// # Errors
    ///
    /// Returns `RestrictedExport` naming the first unexposed export
    pub fn check_exports(&self, exports: &[FunctionExport]) -> VmResult<()> {
        match exports.iter().find(|export| !self.allows(&export.name)) {
            Some(export) => Err(VmError::RestrictedExport(export.name.clone())),
            None => Ok(()),
        }
    }
}
