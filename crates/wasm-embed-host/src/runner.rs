//! The host's run driver.
//!
//! [`HostRunner`] takes a module from bytes to a [`RunReport`]:
//!
//! 1. Instantiate a [`VirtualMachine`] with the configured resolver
//! 2. Optionally compile the module for AOT execution and attach it
//! 3. Resolve the entry function, falling back to function 0
//! 4. Run the start function, then the entry function, timing both
//! 5. Report the result, or print the stack trace and fail
//!
//! User-facing notices (the entry fallback, the acceleration outcome) go to
//! an optional [`NoticeSink`] as soon as they are known, before any guest
//! code runs.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, instrument, warn};
use wasm_embed_common::{AotConfig, ConfigFile, RunConfig, RunStage, RuntimeError, VmConfig};
use wasm_embed_core::{
    AccelerationBackend, Resolver, VirtualMachine, default_backend, full_compile_with,
};

/// Function id used when the entry export does not exist.
pub const FALLBACK_ENTRY_ID: u32 = 0;

/// Receives one-line notices meant for the user.
pub type NoticeSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Everything that configures one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Virtual machine configuration.
    pub vm: VmConfig,
    /// AOT acceleration settings.
    pub aot: AotConfig,
    /// Entry function and its arguments.
    pub run: RunConfig,
}

impl From<ConfigFile> for RunOptions {
    fn from(file: ConfigFile) -> Self {
        Self {
            vm: file.vm,
            aot: file.aot,
            run: file.run,
        }
    }
}

/// How the entry function was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPoint {
    /// The requested export exists.
    Export {
        /// Export name.
        name: String,
        /// Its function id.
        id: u32,
    },
    /// The requested export is missing; function 0 was run instead.
    Fallback {
        /// The export that was requested.
        requested: String,
    },
}

impl EntryPoint {
    /// The function id that was run.
    pub fn id(&self) -> u32 {
        match self {
            EntryPoint::Export { id, .. } => *id,
            EntryPoint::Fallback { .. } => FALLBACK_ENTRY_ID,
        }
    }

    /// Returns `true` if the requested export was missing.
    pub fn is_fallback(&self) -> bool {
        matches!(self, EntryPoint::Fallback { .. })
    }

    /// The user-facing notice for a fallback entry.
    pub fn notice(&self) -> Option<String> {
        match self {
            EntryPoint::Export { .. } => None,
            EntryPoint::Fallback { requested } => Some(format!(
                "Entry function {requested} not found; starting from {FALLBACK_ENTRY_ID}."
            )),
        }
    }
}

/// What happened to AOT acceleration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelerationOutcome {
    /// Acceleration was not requested.
    Disabled,
    /// Requested, but the platform has no backend; ran on the baseline tier.
    Unsupported,
    /// Compiled and attached.
    Compiled {
        /// Time spent compiling.
        duration: Duration,
    },
}

impl fmt::Display for AccelerationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccelerationOutcome::Disabled => write!(f, "AOT acceleration disabled"),
            AccelerationOutcome::Unsupported => {
                write!(f, "AOT acceleration is not supported on this platform")
            }
            AccelerationOutcome::Compiled { duration } => {
                write!(f, "AOT compilation finished successfully in {duration:?}")
            }
        }
    }
}

/// The outcome of a successful run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// The entry function's result.
    pub return_value: i64,
    /// Time spent in the start and entry functions.
    pub duration: Duration,
    /// How the entry function was chosen.
    pub entry: EntryPoint,
    /// Whether the run was accelerated.
    pub acceleration: AccelerationOutcome,
    /// Gas consumed, `None` when unmetered.
    pub gas_used: Option<u64>,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "return value = {}, duration = {:?}",
            self.return_value, self.duration
        )
    }
}

/// Drives one module through a complete run.
pub struct HostRunner {
    resolver: Arc<dyn Resolver>,
    backend: Option<Box<dyn AccelerationBackend>>,
    notices: Option<NoticeSink>,
}

impl HostRunner {
    /// Create a runner that resolves imports with `resolver`.
    ///
    /// The AOT backend is chosen per run from [`AotConfig`].
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            resolver,
            backend: None,
            notices: None,
        }
    }

    /// Use `backend` for AOT acceleration instead of the platform default.
    #[must_use]
    pub fn with_backend(mut self, backend: Box<dyn AccelerationBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Send user-facing notices to `sink` while running.
    #[must_use]
    pub fn with_notices(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.notices = Some(Arc::new(sink));
        self
    }

    /// Run a module.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::CompilationFailed`] or [`RuntimeError::Link`] if the
    ///   module cannot be instantiated
    /// - an error from AOT compilation, if it was requested and failed
    /// - [`RuntimeError::RunFailed`] if the start or entry function fails;
    ///   the stack trace has already been printed to stderr
    #[instrument(skip_all, fields(entry = %options.run.entry, aot = options.aot.enabled))]
    pub fn run(
        &self,
        bytes: impl Into<Arc<[u8]>>,
        options: &RunOptions,
    ) -> Result<RunReport, RuntimeError> {
        let mut vm = VirtualMachine::new(bytes, options.vm.clone(), Arc::clone(&self.resolver))?;

        let acceleration = if options.aot.enabled {
            let outcome = self.accelerate(&mut vm, &options.aot)?;
            self.notify(&outcome.to_string());
            outcome
        } else {
            AccelerationOutcome::Disabled
        };

        let entry = resolve_entry(&vm, &options.run.entry);
        if let Some(notice) = entry.notice() {
            self.notify(&notice);
        }

        let start = Instant::now();

        if let Some(id) = vm.start_function() {
            info!(function_id = id, "Running start function");
        }
        vm.run_start().map_err(|e| fail(&vm, RunStage::Start, e))?;

        let return_value = vm
            .run(entry.id(), &options.run.args)
            .map_err(|e| fail(&vm, RunStage::Entry, e))?;

        let duration = start.elapsed();
        let gas_used = vm.gas_consumed();

        info!(
            return_value,
            duration_us = duration.as_micros(),
            gas_used = ?gas_used,
            "Run complete"
        );

        Ok(RunReport {
            return_value,
            duration,
            entry,
            acceleration,
            gas_used,
        })
    }

    fn accelerate(
        &self,
        vm: &mut VirtualMachine,
        config: &AotConfig,
    ) -> Result<AccelerationOutcome, RuntimeError> {
        let default;
        let backend: &dyn AccelerationBackend = match &self.backend {
            Some(backend) => backend.as_ref(),
            None => {
                default = default_backend(config);
                default.as_ref()
            }
        };

        info!(backend = backend.name(), "AOT compilation started");
        let start = Instant::now();

        match full_compile_with(backend, vm)? {
            Some(ctx) => {
                let duration = start.elapsed();
                vm.set_aot_service(ctx)?;
                info!(duration_ms = duration.as_millis(), "AOT compilation finished");
                Ok(AccelerationOutcome::Compiled { duration })
            }
            None => {
                warn!("AOT acceleration is not supported on this platform; using baseline tier");
                Ok(AccelerationOutcome::Unsupported)
            }
        }
    }

    fn notify(&self, message: &str) {
        if let Some(sink) = &self.notices {
            sink(message);
        }
    }
}

impl fmt::Debug for HostRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRunner")
            .field("backend", &self.backend.as_ref().map(|b| b.name()))
            .field("notices", &self.notices.is_some())
            .finish_non_exhaustive()
    }
}

fn resolve_entry(vm: &VirtualMachine, name: &str) -> EntryPoint {
    match vm.get_function_export(name) {
        Some(id) => EntryPoint::Export {
            name: name.to_string(),
            id,
        },
        None => {
            warn!(
                entry = name,
                fallback = FALLBACK_ENTRY_ID,
                "Entry function not found; starting from function 0"
            );
            EntryPoint::Fallback {
                requested: name.to_string(),
            }
        }
    }
}

fn fail(vm: &VirtualMachine, stage: RunStage, source: RuntimeError) -> RuntimeError {
    error!(%stage, error = %source, "Run failed");
    vm.print_stack_trace();
    RuntimeError::run_failed(stage, source)
}
