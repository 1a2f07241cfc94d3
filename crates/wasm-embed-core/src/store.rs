//! Per-VM store state.
//!
//! This module provides:
//! - [`HostState`]: data attached to each Wasmtime [`Store`]
//! - [`create_store`]: store construction with resource limits and gas
//! - Gas accounting helpers on top of Wasmtime fuel

use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};

use wasm_embed_common::{RuntimeError, VmConfig};

use crate::WasmEngine;

/// State owned by one VM's store.
///
/// Host functions do not reach into this; they only see a
/// [`Frame`](crate::Frame). It carries the limits the store enforces.
pub struct HostState {
    limits: StoreLimits,

    /// Gas given to the store at creation, `None` when unmetered.
    pub gas_limit: Option<u64>,
}

impl HostState {
    /// Create store state for the given VM configuration.
    pub fn new(config: &VmConfig) -> Self {
        let mut limits = StoreLimitsBuilder::new();
        if let Some(bytes) = config.max_memory_bytes() {
            limits = limits.memory_size(bytes);
        }

        Self {
            limits: limits.build(),
            gas_limit: config.is_metered().then_some(config.gas_limit),
        }
    }
}

/// Create a new Wasmtime store with the given configuration.
///
/// # Errors
///
/// Returns an error if gas cannot be set on the store.
pub fn create_store(
    engine: &WasmEngine,
    config: &VmConfig,
) -> Result<Store<HostState>, RuntimeError> {
    let mut store = Store::new(engine.inner(), HostState::new(config));
    store.limiter(|state| &mut state.limits);

    if engine.is_metered() {
        store
            .set_fuel(config.gas_limit)
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to set gas: {e}")))?;
    }

    Ok(store)
}

/// Get remaining gas from a store.
pub fn remaining_gas(store: &Store<HostState>) -> Option<u64> {
    store.get_fuel().ok()
}

/// Gas consumed since the store was created, `None` when unmetered.
pub fn gas_consumed(store: &Store<HostState>) -> Option<u64> {
    let limit = store.data().gas_limit?;
    let remaining = remaining_gas(store).unwrap_or(0);
    Some(limit.saturating_sub(remaining))
}
