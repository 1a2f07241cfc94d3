//! Ahead-of-time acceleration.
//!
//! An [`AccelerationBackend`] turns a [`VirtualMachine`]'s module into an
//! [`AotContext`]: the same module precompiled on the optimized tier, linked
//! against the import bindings the VM already resolved. Once attached with
//! [`VirtualMachine::set_aot_service`] every call runs on it.
//!
//! Acceleration is optional. When the platform has no backend,
//! [`full_compile`] returns `Ok(None)` and the VM stays on the baseline tier.
//!
//! # Artifact Cache
//!
//! [`NativeBackend`] can keep precompiled artifacts on disk, one
//! `<content_hash>.cwasm` file per module, keyed by the BLAKE3 digest of the
//! module bytes. Artifacts are written to a temporary file in the cache
//! directory and renamed into place, so readers never see a partial file.
//! An artifact that fails to load (for example one written by an engine
//! with different settings) is compiled again and overwritten.
//!
//! The cache is an optimization only: a directory that cannot be created or
//! written is logged and the freshly compiled artifact is used from memory.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

use wasm_embed_common::{AotConfig, RuntimeError};

use crate::engine::Tier;
use crate::instance::ModuleInstance;
use crate::module::ModuleLayout;
use crate::resolver::HostFunction;
use crate::vm::VirtualMachine;
use crate::{CompiledModule, WasmEngine};

/// File extension of cached artifacts.
const ARTIFACT_EXTENSION: &str = "cwasm";

/// A service that compiles modules for accelerated execution.
pub trait AccelerationBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this backend can compile on the current platform.
    fn is_available(&self) -> bool;

    /// Compile the VM's module into an [`AotContext`].
    ///
    /// # Errors
    ///
    /// Returns an error if compilation or linking fails.
    fn compile(&self, vm: &VirtualMachine) -> Result<AotContext, RuntimeError>;
}

/// Returns `true` if the current target has a native code generator.
pub fn is_acceleration_available() -> bool {
    cfg!(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "riscv64",
        target_arch = "s390x"
    ))
}

/// Optimized native compilation through Cranelift.
#[derive(Debug, Clone, Default)]
pub struct NativeBackend {
    cache_dir: Option<PathBuf>,
}

impl NativeBackend {
    /// Create a backend without an artifact cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend that caches artifacts in `dir`.
    pub fn with_cache_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: Some(dir.into()),
        }
    }

    /// Create a backend from the AOT configuration.
    pub fn from_config(config: &AotConfig) -> Self {
        Self {
            cache_dir: config.cache_dir.clone(),
        }
    }

    /// The artifact cache directory, if any.
    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    fn load_or_compile(
        engine: &WasmEngine,
        dir: &Path,
        bytes: &[u8],
        layout: Arc<ModuleLayout>,
        content_hash: &str,
    ) -> Result<CompiledModule, RuntimeError> {
        let path = dir.join(format!("{content_hash}.{ARTIFACT_EXTENSION}"));

        if path.is_file() {
            match CompiledModule::from_precompiled_file(
                engine,
                &path,
                Arc::clone(&layout),
                content_hash,
            ) {
                Ok(module) => {
                    debug!(path = %path.display(), "AOT cache hit");
                    return Ok(module);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Discarding cached artifact"),
            }
        }

        let artifact = CompiledModule::precompile(engine, bytes)?;
        match store_artifact(dir, &path, &artifact) {
            Ok(()) => debug!(path = %path.display(), size = artifact.len(), "AOT artifact cached"),
            Err(e) => warn!(path = %path.display(), error = %e, "Could not cache AOT artifact"),
        }

        CompiledModule::from_precompiled(engine, &artifact, layout, content_hash)
    }
}

/// Write `artifact` to `path` through a temporary file in `dir`.
fn store_artifact(dir: &Path, path: &Path, artifact: &[u8]) -> io::Result<()> {
    fs::create_dir_all(dir)?;

    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(artifact)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;

    Ok(())
}

impl AccelerationBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn is_available(&self) -> bool {
        is_acceleration_available()
    }

    #[instrument(skip_all, fields(content_hash = %vm.module().content_hash()))]
    fn compile(&self, vm: &VirtualMachine) -> Result<AotContext, RuntimeError> {
        let engine = WasmEngine::new(vm.config(), Tier::Optimized)?;
        let layout = vm.module().shared_layout();
        let content_hash = vm.module().content_hash();

        let module = match &self.cache_dir {
            Some(dir) => Self::load_or_compile(&engine, dir, vm.bytes(), layout, content_hash)?,
            None => {
                let artifact = CompiledModule::precompile(&engine, vm.bytes())?;
                CompiledModule::from_precompiled(&engine, &artifact, layout, content_hash)?
            }
        };

        let runtime = ModuleInstance::link(&engine, &module, vm.imports(), vm.config())?;

        Ok(AotContext { runtime })
    }
}

/// A backend for platforms without native code generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedBackend;

impl AccelerationBackend for UnsupportedBackend {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn compile(&self, _vm: &VirtualMachine) -> Result<AotContext, RuntimeError> {
        Err(RuntimeError::invalid_config(
            "AOT acceleration is not supported on this platform",
        ))
    }
}

/// The backend for this platform, configured from `config`.
pub fn default_backend(config: &AotConfig) -> Box<dyn AccelerationBackend> {
    if is_acceleration_available() {
        Box::new(NativeBackend::from_config(config))
    } else {
        Box::new(UnsupportedBackend)
    }
}

/// Compile `vm`'s module with the platform's native backend.
///
/// Returns `Ok(None)` when the platform has no backend.
///
/// # Errors
///
/// Returns an error if the backend is available and compilation fails.
pub fn full_compile(vm: &VirtualMachine) -> Result<Option<AotContext>, RuntimeError> {
    full_compile_with(&NativeBackend::new(), vm)
}

/// Compile `vm`'s module with `backend`.
///
/// Returns `Ok(None)` when the backend is not available.
///
/// # Errors
///
/// Returns an error if the backend is available and compilation fails.
pub fn full_compile_with(
    backend: &dyn AccelerationBackend,
    vm: &VirtualMachine,
) -> Result<Option<AotContext>, RuntimeError> {
    if !backend.is_available() {
        info!(backend = backend.name(), "AOT acceleration unavailable");
        return Ok(None);
    }

    let start = Instant::now();
    let ctx = backend.compile(vm)?;

    info!(
        backend = backend.name(),
        content_hash = %ctx.content_hash(),
        functions = ctx.compiled_functions().count(),
        duration_ms = start.elapsed().as_millis(),
        "AOT compilation complete"
    );

    Ok(Some(ctx))
}

/// A module compiled for accelerated execution.
///
/// Owns its own instance: nothing is shared with the VM's baseline tier, so
/// a context must be attached before any guest code runs.
pub struct AotContext {
    runtime: ModuleInstance,
}

impl AotContext {
    /// Content hash of the module this context was compiled from.
    pub fn content_hash(&self) -> &str {
        self.runtime.module().content_hash()
    }

    /// Returns `true` if `name` is an exported function of the compiled module.
    pub fn is_compiled(&self, name: &str) -> bool {
        self.runtime.module().layout().function_export(name).is_some()
    }

    /// Names of the compiled functions that can be invoked.
    pub fn compiled_functions(&self) -> impl Iterator<Item = &str> + '_ {
        self.runtime
            .module()
            .layout()
            .exported_functions()
            .map(|(name, _)| name)
    }

    /// Invoke a compiled function that takes no arguments.
    ///
    /// # Errors
    ///
    /// See [`AotContext::invoke`].
    pub fn invoke_0(&mut self, name: &str) -> Result<i64, RuntimeError> {
        self.invoke(name, &[])
    }

    /// Invoke a compiled function that takes one argument.
    ///
    /// # Errors
    ///
    /// See [`AotContext::invoke`].
    pub fn invoke_1(&mut self, name: &str, p0: i64) -> Result<i64, RuntimeError> {
        self.invoke(name, &[p0])
    }

    /// Invoke a compiled function that takes two arguments.
    ///
    /// # Errors
    ///
    /// See [`AotContext::invoke`].
    pub fn invoke_2(&mut self, name: &str, p0: i64, p1: i64) -> Result<i64, RuntimeError> {
        self.invoke(name, &[p0, p1])
    }

    /// Invoke a compiled function by name.
    ///
    /// The first invocation materializes the instance and runs the start
    /// function.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::FunctionNotCompiled`] if `name` is not in the
    /// compiled set, or an execution error from the call.
    pub fn invoke(&mut self, name: &str, args: &[i64]) -> Result<i64, RuntimeError> {
        if !self.is_compiled(name) {
            return Err(RuntimeError::FunctionNotCompiled {
                name: name.to_string(),
            });
        }

        self.runtime.call(name, args)
    }

    /// Run a defined function by id, exported or not.
    pub(crate) fn invoke_function(&mut self, id: u32, args: &[i64]) -> Result<i64, RuntimeError> {
        self.runtime.call_function(id, args)
    }

    /// Call imported function `id` against this context's instance.
    pub(crate) fn call_import(
        &mut self,
        id: u32,
        host: &HostFunction,
        args: &[i64],
    ) -> Result<i64, RuntimeError> {
        self.runtime.call_import(id, host, args)
    }

    /// Materialize the instance, running the start function if declared.
    pub(crate) fn instantiate(&mut self) -> Result<(), RuntimeError> {
        self.runtime.ensure_instance().map(|_| ())
    }

    /// Returns `true` once guest code may have run on this context.
    pub fn is_materialized(&self) -> bool {
        self.runtime.is_materialized()
    }

    /// Gas consumed so far, `None` when unmetered.
    pub fn gas_consumed(&self) -> Option<u64> {
        self.runtime.gas_consumed()
    }
}

impl std::fmt::Debug for AotContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AotContext")
            .field("content_hash", &self.content_hash())
            .field("materialized", &self.is_materialized())
            .finish_non_exhaustive()
    }
}
