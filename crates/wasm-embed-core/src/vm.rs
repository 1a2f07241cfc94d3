//! The virtual machine the host drives.
//!
//! [`VirtualMachine`] is the narrow interface the embedding host sees:
//! module introspection, execution by function id, AOT attachment and
//! stack-trace diagnostics. Execution runs on the baseline tier unless an
//! [`AotContext`] is attached, in which case every call goes to it.
//!
//! Every id in the function index space can be run. Defined functions run
//! as guest code whether or not the module exports them; imported ids call
//! the host binding directly.

use std::io::{self, Write};
use std::sync::Arc;

use tracing::{debug, info, instrument};

use wasm_embed_common::{RuntimeError, StackTrace, VmConfig};

use crate::aot::AotContext;
use crate::engine::Tier;
use crate::imports::ResolvedImports;
use crate::instance::ModuleInstance;
use crate::resolver::Resolver;
use crate::{CompiledModule, WasmEngine};

/// One module, its resolver and its execution state.
///
/// # Lifecycle
///
/// 1. [`VirtualMachine::new`] compiles and links the module; no guest code runs
/// 2. Optionally [`VirtualMachine::set_aot_service`] attaches an AOT context
/// 3. [`VirtualMachine::run_start`] runs the start function, if any
/// 4. [`VirtualMachine::run`] calls the entry function
///
/// Step 3 is implied by the first call to [`VirtualMachine::run`].
pub struct VirtualMachine {
    config: VmConfig,
    bytes: Arc<[u8]>,
    imports: ResolvedImports,
    module: CompiledModule,
    baseline: ModuleInstance,
    aot: Option<AotContext>,
    last_trace: Option<StackTrace>,
}

impl VirtualMachine {
    /// Load a module and link its imports.
    ///
    /// `resolver` is asked for each import once; the answers are kept for
    /// the lifetime of the VM and reused by AOT compilation.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::CompilationFailed`] if the bytes are not an
    /// acceptable module, or [`RuntimeError::Link`] if an import cannot be
    /// resolved.
    #[instrument(skip_all)]
    pub fn new(
        bytes: impl Into<Arc<[u8]>>,
        config: VmConfig,
        resolver: Arc<dyn Resolver>,
    ) -> Result<Self, RuntimeError> {
        let bytes = bytes.into();
        let engine = WasmEngine::new(&config, Tier::Baseline)?;
        let module = CompiledModule::from_bytes(&engine, &bytes, &config)?;
        let imports = ResolvedImports::resolve(&module, resolver.as_ref())?;
        let baseline = ModuleInstance::link(&engine, &module, &imports, &config)?;

        info!(
            content_hash = %module.content_hash(),
            exports = module.layout().exported_functions().count(),
            start = ?module.layout().start_function(),
            "Virtual machine ready"
        );

        Ok(Self {
            config,
            bytes,
            imports,
            module,
            baseline,
            aot: None,
            last_trace: None,
        })
    }

    /// The configuration this VM was created with.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// The module on the baseline tier.
    pub fn module(&self) -> &CompiledModule {
        &self.module
    }

    /// The original module bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The import bindings this VM was linked against.
    pub fn imports(&self) -> &ResolvedImports {
        &self.imports
    }

    /// Look up an exported function id by name.
    pub fn get_function_export(&self, name: &str) -> Option<u32> {
        self.module.layout().function_export(name)
    }

    /// The function id of the declared start function.
    pub fn start_function(&self) -> Option<u32> {
        self.module.layout().start_function()
    }

    /// Returns `true` if an AOT context is attached.
    pub fn has_aot_service(&self) -> bool {
        self.aot.is_some()
    }

    /// Attach an AOT context. All later execution goes through it.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::AotAlreadyAttached`] if a context is already attached
    /// - [`RuntimeError::AotAfterExecution`] if guest code already ran
    /// - [`RuntimeError::AotModuleMismatch`] if `ctx` was compiled from
    ///   another module
    pub fn set_aot_service(&mut self, ctx: AotContext) -> Result<(), RuntimeError> {
        if self.aot.is_some() {
            return Err(RuntimeError::AotAlreadyAttached);
        }
        if self.baseline.is_materialized() || ctx.is_materialized() {
            return Err(RuntimeError::AotAfterExecution);
        }
        if ctx.content_hash() != self.module.content_hash() {
            return Err(RuntimeError::AotModuleMismatch {
                expected: self.module.content_hash().to_string(),
                found: ctx.content_hash().to_string(),
            });
        }

        info!(
            content_hash = %ctx.content_hash(),
            functions = ctx.compiled_functions().count(),
            "AOT context attached"
        );
        self.aot = Some(ctx);

        Ok(())
    }

    /// Materialize the instance, running the start function if declared.
    ///
    /// Calling this more than once is a no-op; the start function runs
    /// exactly once per VM.
    ///
    /// # Errors
    ///
    /// Returns a trap if the start function fails.
    #[instrument(skip(self))]
    pub fn run_start(&mut self) -> Result<(), RuntimeError> {
        let result = match self.aot.as_mut() {
            Some(ctx) => ctx.instantiate(),
            None => self.baseline.ensure_instance().map(|_| ()),
        };

        self.record(result)
    }

    /// Run function `id` with integer arguments.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::FunctionNotCallable`] if `id` is out of range
    /// - [`RuntimeError::ArityMismatch`] if `args` does not fit the signature
    /// - a trap or [`RuntimeError::GasLimitExceeded`] if execution fails
    #[instrument(skip(self, args), fields(args = args.len()))]
    pub fn run(&mut self, id: u32, args: &[i64]) -> Result<i64, RuntimeError> {
        let layout = self.module.layout();
        if id >= layout.function_count() {
            return self.record(Err(RuntimeError::FunctionNotCallable { id }));
        }

        debug!(
            function_id = id,
            export = ?layout.export_name(id),
            imported = layout.is_imported_function(id),
            aot = self.aot.is_some(),
            "Running function"
        );

        let result = match (self.imports.function(id), self.aot.as_mut()) {
            (Some(host), Some(ctx)) => ctx.call_import(id, host, args),
            (Some(host), None) => self.baseline.call_import(id, host, args),
            (None, Some(ctx)) => ctx.invoke_function(id, args),
            (None, None) => self.baseline.call_function(id, args),
        };

        self.record(result)
    }

    /// Gas consumed by the active tier, `None` when unmetered.
    pub fn gas_consumed(&self) -> Option<u64> {
        match &self.aot {
            Some(ctx) => ctx.gas_consumed(),
            None => self.baseline.gas_consumed(),
        }
    }

    /// Guest call stack of the most recent failed execution.
    pub fn stack_trace(&self) -> Option<&StackTrace> {
        self.last_trace.as_ref()
    }

    /// Write the most recent stack trace to `out`.
    ///
    /// # Errors
    ///
    /// Returns any error from writing to `out`.
    pub fn write_stack_trace(&self, out: &mut impl Write) -> io::Result<()> {
        match &self.last_trace {
            Some(trace) => write!(out, "stack trace:\n{trace}"),
            None => writeln!(out, "stack trace: <none recorded>"),
        }
    }

    /// Print the most recent stack trace to stderr.
    pub fn print_stack_trace(&self) {
        let _ = self.write_stack_trace(&mut io::stderr().lock());
    }

    fn record<T>(&mut self, result: Result<T, RuntimeError>) -> Result<T, RuntimeError> {
        if let Err(e) = &result {
            self.last_trace = e.trace().cloned();
        }
        result
    }
}

impl std::fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("module", &self.module)
            .field("aot", &self.aot.is_some())
            .finish_non_exhaustive()
    }
}
