//! Wasmtime engine configuration and creation.
//!
//! Every [`VirtualMachine`](crate::VirtualMachine) compiles its module on a
//! [`WasmEngine`]. Two tiers exist:
//! - [`Tier::Baseline`]: fast to compile, no optimizations; the default
//!   execution path for every module
//! - [`Tier::Optimized`]: full Cranelift optimizations; used by the AOT
//!   acceleration subsystem

use std::fmt;

use tracing::{debug, info};
use wasmtime::{Config, Engine, OptLevel};

use wasm_embed_common::{RuntimeError, VmConfig};

/// Compilation tier of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Unoptimized in-process compilation.
    Baseline,
    /// Optimized ahead-of-time compilation.
    Optimized,
}

impl Tier {
    fn opt_level(self) -> OptLevel {
        match self {
            Tier::Baseline => OptLevel::None,
            Tier::Optimized => OptLevel::Speed,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Baseline => write!(f, "baseline"),
            Tier::Optimized => write!(f, "optimized"),
        }
    }
}

/// WebAssembly engine wrapper.
///
/// This struct wraps a Wasmtime [`Engine`] configured from a [`VmConfig`].
/// Modules and stores must be created on the same engine, so a VM and its
/// AOT context each own one.
///
/// # Configuration
///
/// The engine is configured with:
/// - **Synchronous execution**: calls block until the guest returns or traps
/// - **Fuel metering**: enabled when the VM has a gas limit
/// - **Backtraces**: always captured so failed runs can print a stack trace
/// - **No SIMD** when floating point is disabled, since most lane types are floats
#[derive(Clone)]
pub struct WasmEngine {
    engine: Engine,
    tier: Tier,
    metered: bool,
}

impl WasmEngine {
    /// Create a new WebAssembly engine for the given tier.
    ///
    /// # Errors
    ///
    /// Returns an error if the Wasmtime configuration is invalid.
    pub fn new(config: &VmConfig, tier: Tier) -> Result<Self, RuntimeError> {
        let mut wasmtime_config = Config::new();

        wasmtime_config.cranelift_opt_level(tier.opt_level());
        wasmtime_config.consume_fuel(config.is_metered());
        wasmtime_config.wasm_backtrace(true);

        if config.disable_floating_point {
            wasmtime_config.wasm_relaxed_simd(false);
            wasmtime_config.wasm_simd(false);
            debug!("SIMD disabled along with floating point");
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!(tier = %tier, metered = config.is_metered(), "Wasmtime engine initialized");

        Ok(Self {
            engine,
            tier,
            metered: config.is_metered(),
        })
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the compilation tier.
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Check if fuel metering is enabled.
    pub fn is_metered(&self) -> bool {
        self.metered
    }
}

impl fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasmEngine")
            .field("tier", &self.tier)
            .field("metered", &self.metered)
            .finish_non_exhaustive()
    }
}
