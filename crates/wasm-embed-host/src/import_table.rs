//! Static import table.
//!
//! [`ImportTable`] is a [`Resolver`] backed by a fixed map from
//! `(module, field)` to a binding. It is built once with an
//! [`ImportTableBuilder`] and never changes afterwards.

use std::collections::{HashMap, HashSet};

use tracing::debug;
use wasm_embed_common::LinkError;
use wasm_embed_core::{HostFunction, Resolver};

type Key = (String, String);

/// A fixed set of host functions and globals.
#[derive(Clone, Default)]
pub struct ImportTable {
    functions: HashMap<Key, HostFunction>,
    globals: HashMap<Key, i64>,
    modules: HashSet<String>,
}

impl ImportTable {
    /// Create a builder for an import table.
    pub fn builder() -> ImportTableBuilder {
        ImportTableBuilder::default()
    }

    /// Returns `true` if any binding lives in `module`.
    pub fn has_module(&self, module: &str) -> bool {
        self.modules.contains(module)
    }

    /// Number of bindings in the table.
    pub fn len(&self) -> usize {
        self.functions.len() + self.globals.len()
    }

    /// Returns `true` if the table has no bindings.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn missing(&self, module: &str, field: &str) -> LinkError {
        if self.has_module(module) {
            LinkError::unknown_field(module, field)
        } else {
            LinkError::unknown_module(module, field)
        }
    }
}

impl Resolver for ImportTable {
    fn resolve_function(&self, module: &str, field: &str) -> Result<HostFunction, LinkError> {
        debug!(module, field, "Resolve func");

        self.functions
            .get(&(module.to_string(), field.to_string()))
            .cloned()
            .ok_or_else(|| self.missing(module, field))
    }

    fn resolve_global(&self, module: &str, field: &str) -> Result<i64, LinkError> {
        debug!(module, field, "Resolve global");

        self.globals
            .get(&(module.to_string(), field.to_string()))
            .copied()
            .ok_or_else(|| self.missing(module, field))
    }
}

impl std::fmt::Debug for ImportTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportTable")
            .field("functions", &self.functions.len())
            .field("globals", &self.globals)
            .finish()
    }
}

/// Builder for [`ImportTable`].
#[derive(Default)]
pub struct ImportTableBuilder {
    inner: ImportTable,
}

impl ImportTableBuilder {
    /// Add a host function. A later binding for the same name replaces it.
    #[must_use]
    pub fn function(
        mut self,
        module: impl Into<String>,
        field: impl Into<String>,
        function: HostFunction,
    ) -> Self {
        let module = module.into();
        self.inner.modules.insert(module.clone());
        self.inner.functions.insert((module, field.into()), function);
        self
    }

    /// Add an immutable global. A later binding for the same name replaces it.
    #[must_use]
    pub fn global(mut self, module: impl Into<String>, field: impl Into<String>, value: i64) -> Self {
        let module = module.into();
        self.inner.modules.insert(module.clone());
        self.inner.globals.insert((module, field.into()), value);
        self
    }

    /// Build the import table.
    #[must_use]
    pub fn build(self) -> ImportTable {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_embed_core::{Frame, host_function};

    fn table() -> ImportTable {
        ImportTable::builder()
            .function("env", "double", host_function(|frame| Ok(frame.local(0)? * 2)))
            .global("env", "answer", 42)
            .build()
    }

    #[test]
    fn test_resolve_function() {
        let double = table().resolve_function("env", "double").unwrap();
        assert_eq!(double(&Frame::new(&[21], &[])), Ok(42));
    }

    #[test]
    fn test_resolve_global() {
        assert_eq!(table().resolve_global("env", "answer"), Ok(42));
    }

    #[test]
    fn test_unknown_field() {
        let table = table();

        assert!(matches!(
            table.resolve_function("env", "triple"),
            Err(LinkError::UnknownField { .. })
        ));
        // Function and global namespaces are separate
        assert_eq!(
            table.resolve_global("env", "double"),
            Err(LinkError::unknown_field("env", "double"))
        );
    }

    #[test]
    fn test_unknown_module() {
        assert!(matches!(
            table().resolve_function("wasi", "double"),
            Err(LinkError::UnknownModule { .. })
        ));
        assert_eq!(
            table().resolve_global("math", "pi"),
            Err(LinkError::unknown_module("math", "pi"))
        );
    }

    #[test]
    fn test_builder_counts() {
        let table = table();

        assert_eq!(table.len(), 2);
        assert!(!table.is_empty());
        assert!(table.has_module("env"));
        assert!(ImportTable::builder().build().is_empty());
    }
}
