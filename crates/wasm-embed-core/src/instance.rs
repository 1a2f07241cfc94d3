//! WebAssembly instance lifecycle management.
//!
//! This module provides [`ModuleInstance`], which handles one module on one
//! engine tier:
//!
//! 1. Resolve every import through the [`Resolver`] and link it
//! 2. Materialize the instance, which runs the start function if declared
//! 3. Apply the VM's default memory and table sizes
//! 4. Call functions by export name or function id with integer arguments
//! 5. Turn traps into [`RuntimeError`]s carrying a [`StackTrace`]

use tracing::{debug, instrument, warn};
use wasmtime::{
    Caller, Extern, ExternType, FuncType, Global, GlobalType, Instance, Linker, Memory, Mutability,
    Ref, Store, Table, Trap, Val, ValType, WasmBacktrace,
};

use wasm_embed_common::{
    HostFunctionError, LinkError, RuntimeError, StackTrace, TraceFrame, VmConfig,
};

use crate::module::ModuleLayout;
use crate::resolver::{Frame, HostFunction, Resolver};
use crate::store::{HostState, create_store, gas_consumed};
use crate::{CompiledModule, WasmEngine};

/// A linked module on one engine tier.
///
/// Linking happens eagerly in [`ModuleInstance::link`]; the instance itself
/// is created on first use so that the host decides when the start function
/// runs. The start function runs exactly once, before any other guest code.
pub struct ModuleInstance {
    store: Store<HostState>,
    linker: Linker<HostState>,
    module: CompiledModule,
    instance: Option<Instance>,
    config: VmConfig,
}

impl ModuleInstance {
    /// Link `module` against the bindings supplied by `resolver`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Link`] if any import cannot be resolved.
    #[instrument(skip_all, fields(content_hash = %module.content_hash(), tier = %engine.tier()))]
    pub fn link(
        engine: &WasmEngine,
        module: &CompiledModule,
        resolver: &dyn Resolver,
        config: &VmConfig,
    ) -> Result<Self, RuntimeError> {
        let mut store = create_store(engine, config)?;
        let mut linker = Linker::new(engine.inner());
        let memory = module.layout().memory_export().map(String::from);

        for import in module.inner().imports() {
            let (namespace, field) = (import.module(), import.name());

            match import.ty() {
                ExternType::Func(ty) => {
                    let host = resolver.resolve_function(namespace, field)?;
                    define_function(&mut linker, namespace, field, ty, host, memory.clone())?;
                }
                ExternType::Global(ty) => {
                    let value = resolver.resolve_global(namespace, field)?;
                    define_global(&mut linker, &mut store, namespace, field, ty, value)?;
                }
                other => {
                    return Err(LinkError::UnsupportedImport {
                        module: namespace.to_string(),
                        field: field.to_string(),
                        kind: extern_kind(&other).to_string(),
                    }
                    .into());
                }
            }

            debug!(module = namespace, field, "Import linked");
        }

        Ok(Self {
            store,
            linker,
            module: module.clone(),
            instance: None,
            config: config.clone(),
        })
    }

    /// Returns `true` once the instance exists and guest code may have run.
    pub fn is_materialized(&self) -> bool {
        self.instance.is_some()
    }

    /// The module this instance runs.
    pub fn module(&self) -> &CompiledModule {
        &self.module
    }

    /// Gas consumed so far, `None` when unmetered.
    pub fn gas_consumed(&self) -> Option<u64> {
        gas_consumed(&self.store)
    }

    /// Create the instance if it does not exist yet.
    ///
    /// Instantiation runs the module's start function.
    ///
    /// # Errors
    ///
    /// Returns a trap if the start function fails, or
    /// [`RuntimeError::CompilationFailed`] if the module cannot be instantiated.
    pub fn ensure_instance(&mut self) -> Result<Instance, RuntimeError> {
        if let Some(instance) = self.instance {
            return Ok(instance);
        }

        let instance = self
            .linker
            .instantiate(&mut self.store, self.module.inner())
            .map_err(|e| classify_error(e, self.module.layout(), &self.store))?;

        self.apply_defaults(instance);
        self.instance = Some(instance);

        debug!(content_hash = %self.module.content_hash(), "Instance materialized");

        Ok(instance)
    }

    /// Call an exported function with integer arguments.
    ///
    /// Arguments are converted to the parameter types; the first result is
    /// returned as `i64` (zero if the function returns nothing).
    #[instrument(skip(self, args), fields(args = args.len()))]
    pub fn call(&mut self, name: &str, args: &[i64]) -> Result<i64, RuntimeError> {
        let instance = self.ensure_instance()?;

        let func = instance
            .get_func(&mut self.store, name)
            .ok_or_else(|| RuntimeError::ExportNotFound {
                name: name.to_string(),
            })?;
        let ty = func.ty(&self.store);

        let param_types: Vec<ValType> = ty.params().collect();
        if param_types.len() != args.len() {
            return Err(RuntimeError::ArityMismatch {
                name: name.to_string(),
                expected: param_types.len(),
                got: args.len(),
            });
        }

        let params = param_types
            .iter()
            .zip(args)
            .map(|(ty, arg)| i64_to_val(*arg, ty).ok_or_else(|| unsupported(name, ty)))
            .collect::<Result<Vec<_>, _>>()?;
        let mut results = ty
            .results()
            .map(|ty| i64_to_val(0, &ty).ok_or_else(|| unsupported(name, &ty)))
            .collect::<Result<Vec<_>, _>>()?;

        func.call(&mut self.store, &params, &mut results)
            .map_err(|e| classify_error(e, self.module.layout(), &self.store))?;

        Ok(results.first().map_or(0, val_to_i64))
    }

    /// Call a function the module defines, exported or not, by its id.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::FunctionNotCallable`] if `id` is imported or
    /// out of range, otherwise the same errors as [`ModuleInstance::call`].
    pub fn call_function(&mut self, id: u32, args: &[i64]) -> Result<i64, RuntimeError> {
        let name = self
            .module
            .layout()
            .callable_name(id)
            .ok_or(RuntimeError::FunctionNotCallable { id })?
            .into_owned();

        self.call(&name, args)
    }

    /// Call imported function `id` through its host binding, the way guest
    /// code would.
    ///
    /// The instance is materialized first, so the start function has run and
    /// the host function sees the guest's memory.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::FunctionNotCallable`] if `id` is not an imported function
    /// - [`RuntimeError::ArityMismatch`] if `args` does not fit the import's type
    /// - a trap if the host function fails
    #[instrument(skip(self, host, args), fields(args = args.len()))]
    pub fn call_import(
        &mut self,
        id: u32,
        host: &HostFunction,
        args: &[i64],
    ) -> Result<i64, RuntimeError> {
        let (name, ty) = self
            .module
            .inner()
            .imports()
            .filter_map(|import| match import.ty() {
                ExternType::Func(ty) => Some((format!("{}.{}", import.module(), import.name()), ty)),
                _ => None,
            })
            .nth(id as usize)
            .ok_or(RuntimeError::FunctionNotCallable { id })?;

        let params: Vec<ValType> = ty.params().collect();
        if params.len() != args.len() {
            return Err(RuntimeError::ArityMismatch {
                name,
                expected: params.len(),
                got: args.len(),
            });
        }
        let locals = params
            .iter()
            .zip(args)
            .map(|(ty, arg)| {
                i64_to_val(*arg, ty)
                    .map(|val| val_to_i64(&val))
                    .ok_or_else(|| unsupported(&name, ty))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let instance = self.ensure_instance()?;
        let memory = self
            .module
            .layout()
            .memory_export()
            .and_then(|export| instance.get_memory(&mut self.store, &export));
        let data = memory.map_or(&[][..], |memory| memory.data(&self.store));

        let ret = host(&Frame::new(&locals, data)).map_err(|e| {
            RuntimeError::trap(format!("host function failed: {e}"), StackTrace::default())
        })?;

        let value = match ty.results().next() {
            Some(result) => i64_to_val(ret, &result).map_or(0, |val| val_to_i64(&val)),
            None => 0,
        };
        Ok(value)
    }

    /// Grow the module's memories and tables to the configured defaults.
    ///
    /// Memory 0 and every table are exported after re-encoding, so this
    /// reaches the ones the module keeps private too.
    fn apply_defaults(&mut self, instance: Instance) {
        let exports: Vec<Extern> = instance
            .exports(&mut self.store)
            .map(wasmtime::Export::into_extern)
            .collect();

        for export in exports {
            match export {
                Extern::Memory(memory) => self.grow_memory(memory),
                Extern::Table(table) => self.grow_table(table),
                _ => {}
            }
        }
    }

    fn grow_memory(&mut self, memory: Memory) {
        let current = memory.size(&self.store);
        let mut target = u64::from(self.config.default_memory_pages);
        if let Some(maximum) = memory.ty(&self.store).maximum() {
            target = target.min(maximum);
        }
        if target <= current {
            return;
        }

        match memory.grow(&mut self.store, target - current) {
            Ok(_) => debug!(from = current, to = target, "Memory grown to default size"),
            Err(e) => warn!(pages = target, error = %e, "Could not grow memory to default size"),
        }
    }

    fn grow_table(&mut self, table: Table) {
        let current = u64::from(table.size(&self.store));
        let mut target = u64::from(self.config.default_table_size);
        if let Some(maximum) = table.ty(&self.store).maximum() {
            target = target.min(u64::from(maximum));
        }
        if target <= current {
            return;
        }
        let Ok(delta) = (target - current).try_into() else {
            return;
        };

        match table.grow(&mut self.store, delta, Ref::Func(None)) {
            Ok(_) => debug!(from = current, to = target, "Table grown to default size"),
            Err(e) => debug!(error = %e, "Table left at declared size"),
        }
    }
}

impl std::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("module", &self.module)
            .field("materialized", &self.is_materialized())
            .finish_non_exhaustive()
    }
}

/// Register a host function under the exact type the module imports.
fn define_function(
    linker: &mut Linker<HostState>,
    module: &str,
    field: &str,
    ty: FuncType,
    host: HostFunction,
    memory: Option<String>,
) -> Result<(), RuntimeError> {
    let incompatible = |reason: String| LinkError::IncompatibleImport {
        module: module.to_string(),
        field: field.to_string(),
        reason,
    };

    if let Some(param) = ty.params().find(|ty| !is_numeric(ty)) {
        return Err(incompatible(format!("unsupported parameter type {param:?}")).into());
    }
    if ty.results().len() > 1 {
        return Err(incompatible("host functions return at most one value".into()).into());
    }
    let result_ty = ty.results().next();
    if let Some(result) = result_ty.as_ref().filter(|ty| !is_numeric(ty)) {
        return Err(incompatible(format!("unsupported result type {result:?}")).into());
    }

    linker
        .func_new(
            module,
            field,
            ty,
            move |mut caller: Caller<'_, HostState>, params: &[Val], results: &mut [Val]| {
                let locals: Vec<i64> = params.iter().map(val_to_i64).collect();

                let memory = memory
                    .as_deref()
                    .and_then(|name| caller.get_export(name))
                    .and_then(Extern::into_memory);

                let ret = match memory {
                    Some(memory) => host(&Frame::new(&locals, memory.data(&caller)))?,
                    None => host(&Frame::new(&locals, &[]))?,
                };

                if let (Some(slot), Some(ty)) = (results.first_mut(), result_ty.as_ref()) {
                    *slot = i64_to_val(ret, ty).ok_or_else(|| HostFunctionError::InvalidArgument {
                        reason: format!("cannot return a value of type {ty:?}"),
                    })?;
                }

                Ok(())
            },
        )
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to register {module}.{field}: {e}")))?;

    Ok(())
}

/// Define an immutable global with the value the resolver supplied.
fn define_global(
    linker: &mut Linker<HostState>,
    store: &mut Store<HostState>,
    module: &str,
    field: &str,
    ty: GlobalType,
    value: i64,
) -> Result<(), RuntimeError> {
    let incompatible = |reason: String| LinkError::IncompatibleImport {
        module: module.to_string(),
        field: field.to_string(),
        reason,
    };

    if ty.mutability() == Mutability::Var {
        return Err(incompatible("mutable globals cannot be resolved".into()).into());
    }
    let content = ty.content().clone();
    let val = i64_to_val(value, &content)
        .ok_or_else(|| incompatible(format!("unsupported global type {content:?}")))?;

    let global = Global::new(&mut *store, ty, val)
        .map_err(|e| incompatible(format!("failed to create global: {e}")))?;
    linker
        .define(&*store, module, field, global)
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to define {module}.{field}: {e}")))?;

    Ok(())
}

fn extern_kind(ty: &ExternType) -> &'static str {
    match ty {
        ExternType::Func(_) => "function",
        ExternType::Global(_) => "global",
        ExternType::Table(_) => "table",
        ExternType::Memory(_) => "memory",
        _ => "tag",
    }
}

fn is_numeric(ty: &ValType) -> bool {
    matches!(ty, ValType::I32 | ValType::I64 | ValType::F32 | ValType::F64)
}

fn unsupported(name: &str, ty: &ValType) -> RuntimeError {
    RuntimeError::UnsupportedSignature {
        name: name.to_string(),
        reason: format!("value type {ty:?} has no integer representation"),
    }
}

/// Convert a guest value to the host's 64-bit representation.
///
/// `i32` is zero-extended; floats are passed as raw bits.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
pub(crate) fn val_to_i64(val: &Val) -> i64 {
    match val {
        Val::I32(v) => i64::from(*v as u32),
        Val::I64(v) => *v,
        Val::F32(bits) => i64::from(*bits),
        Val::F64(bits) => *bits as i64,
        _ => 0,
    }
}

/// Convert a 64-bit host value to a guest value of type `ty`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]
pub(crate) fn i64_to_val(value: i64, ty: &ValType) -> Option<Val> {
    match ty {
        ValType::I32 => Some(Val::I32(value as i32)),
        ValType::I64 => Some(Val::I64(value)),
        ValType::F32 => Some(Val::F32(value as u32)),
        ValType::F64 => Some(Val::F64(value as u64)),
        _ => None,
    }
}

/// Turn a Wasmtime error into a [`RuntimeError`].
///
/// Anything raised while guest code was on the stack (a trap, a failing host
/// function, gas exhaustion) is an execution failure with a stack trace.
/// Everything else failed before guest code ran.
fn classify_error(
    error: wasmtime::Error,
    layout: &ModuleLayout,
    store: &Store<HostState>,
) -> RuntimeError {
    let trace = capture_trace(&error, layout);

    if error
        .downcast_ref::<Trap>()
        .is_some_and(|trap| *trap == Trap::OutOfFuel)
    {
        return RuntimeError::GasLimitExceeded {
            limit: store.data().gas_limit.unwrap_or(0),
            trace,
        };
    }

    if let Some(host) = error.downcast_ref::<HostFunctionError>() {
        return RuntimeError::trap(format!("host function failed: {host}"), trace);
    }

    if error.downcast_ref::<Trap>().is_some() || !trace.is_empty() {
        return RuntimeError::trap(error.root_cause().to_string(), trace);
    }

    RuntimeError::compilation_failed(format!("Instantiation failed: {error:#}"))
}

fn capture_trace(error: &wasmtime::Error, layout: &ModuleLayout) -> StackTrace {
    let Some(backtrace) = error.downcast_ref::<WasmBacktrace>() else {
        return StackTrace::default();
    };

    let frames = backtrace
        .frames()
        .iter()
        .map(|frame| TraceFrame {
            func_index: frame.func_index(),
            name: frame
                .func_name()
                .or_else(|| layout.export_name(frame.func_index()))
                .map(str::to_string),
            module_offset: frame.module_offset(),
        })
        .collect();

    StackTrace::new(frames)
}
