//! Import bindings, resolved once per module.
//!
//! [`ResolvedImports`] asks a [`Resolver`] for every function and global a
//! module imports and keeps the answers. Both execution tiers link against
//! the recorded bindings, so a resolver is consulted exactly once per import
//! no matter how often the module is linked.

use std::collections::HashMap;

use tracing::debug;
use wasmtime::ExternType;

use wasm_embed_common::{LinkError, RuntimeError};

use crate::CompiledModule;
use crate::resolver::{HostFunction, Resolver};

/// The bindings a module was resolved against.
#[derive(Clone, Default)]
pub struct ResolvedImports {
    /// Function bindings in function index order.
    functions: Vec<HostFunction>,
    function_names: HashMap<(String, String), usize>,
    globals: HashMap<(String, String), i64>,
}

impl ResolvedImports {
    /// Resolve every function and global import of `module`.
    ///
    /// Other import kinds are left to [`crate::ModuleInstance::link`],
    /// which rejects them.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Link`] with the first error the resolver
    /// reports.
    pub fn resolve(module: &CompiledModule, resolver: &dyn Resolver) -> Result<Self, RuntimeError> {
        let mut imports = Self::default();

        for import in module.inner().imports() {
            let key = (import.module().to_string(), import.name().to_string());

            match import.ty() {
                ExternType::Func(_) => {
                    let host = resolver.resolve_function(&key.0, &key.1)?;
                    imports.function_names.insert(key.clone(), imports.functions.len());
                    imports.functions.push(host);
                }
                ExternType::Global(_) => {
                    let value = resolver.resolve_global(&key.0, &key.1)?;
                    imports.globals.insert(key.clone(), value);
                }
                _ => continue,
            }

            debug!(module = %key.0, field = %key.1, "Import resolved");
        }

        Ok(imports)
    }

    /// The binding of imported function `id`.
    pub fn function(&self, id: u32) -> Option<&HostFunction> {
        self.functions.get(id as usize)
    }

    /// Number of resolved function imports.
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Number of resolved global imports.
    pub fn global_count(&self) -> usize {
        self.globals.len()
    }
}

impl Resolver for ResolvedImports {
    fn resolve_function(&self, module: &str, field: &str) -> Result<HostFunction, LinkError> {
        self.function_names
            .get(&(module.to_string(), field.to_string()))
            .and_then(|index| self.functions.get(*index))
            .cloned()
            .ok_or_else(|| LinkError::unknown_field(module, field))
    }

    fn resolve_global(&self, module: &str, field: &str) -> Result<i64, LinkError> {
        self.globals
            .get(&(module.to_string(), field.to_string()))
            .copied()
            .ok_or_else(|| LinkError::unknown_field(module, field))
    }
}

impl std::fmt::Debug for ResolvedImports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedImports")
            .field("functions", &self.functions.len())
            .field("globals", &self.globals)
            .finish()
    }
}
