//! Configuration structures for wasm-embed.
//!
//! This module defines configuration options for the three stages of a run:
//! - [`VmConfig`]: Virtual machine settings fixed at instantiation
//! - [`AotConfig`]: Ahead-of-time acceleration settings
//! - [`RunConfig`]: Which function to run and with which arguments

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Size of one WebAssembly linear memory page in bytes.
pub const WASM_PAGE_SIZE: u64 = 64 * 1024;

/// Virtual machine configuration.
///
/// A `VmConfig` is created once per run and handed to the VM by value.
/// Nothing in it can be changed once the VM has been instantiated.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct VmConfig {
    /// Initial linear memory size in 64 KiB pages.
    ///
    /// Exported memories that declare fewer pages are grown to this size
    /// when the instance is materialized, up to their declared maximum.
    #[serde(default = "defaults::default_memory_pages")]
    pub default_memory_pages: u32,

    /// Initial capacity of the indirect-call table.
    ///
    /// Exported function tables are grown to this many elements,
    /// up to their declared maximum.
    #[serde(default = "defaults::default_table_size")]
    pub default_table_size: u32,

    /// Reject modules that use floating-point types or instructions.
    #[serde(default)]
    pub disable_floating_point: bool,

    /// Hard cap on linear memory in pages. `0` means unlimited.
    #[serde(default)]
    pub max_memory_pages: u32,

    /// Gas available to a run. `0` disables metering.
    ///
    /// Gas is implemented with engine fuel: roughly one unit per
    /// executed instruction.
    #[serde(default)]
    pub gas_limit: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            default_memory_pages: defaults::default_memory_pages(),
            default_table_size: defaults::default_table_size(),
            disable_floating_point: false,
            max_memory_pages: 0,
            gas_limit: 0,
        }
    }
}

impl VmConfig {
    /// Returns `true` if gas metering is enabled.
    pub fn is_metered(&self) -> bool {
        self.gas_limit > 0
    }

    /// Maximum linear memory in bytes, if capped.
    pub fn max_memory_bytes(&self) -> Option<usize> {
        if self.max_memory_pages == 0 {
            return None;
        }
        usize::try_from(u64::from(self.max_memory_pages) * WASM_PAGE_SIZE).ok()
    }
}

/// Ahead-of-time acceleration configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AotConfig {
    /// Compile the module to optimized native code before running it.
    #[serde(default)]
    pub enabled: bool,

    /// Directory for compiled artifacts.
    ///
    /// When set, artifacts are stored as `<content_hash>.cwasm` and reused
    /// by later runs of the same module.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

/// What to run once the module is instantiated.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RunConfig {
    /// Export name of the entry function.
    #[serde(default = "defaults::entry")]
    pub entry: String,

    /// Integer arguments passed to the entry function.
    #[serde(default)]
    pub args: Vec<i64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            entry: defaults::entry(),
            args: Vec::new(),
        }
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn default_memory_pages() -> u32 {
        128
    }

    pub const fn default_table_size() -> u32 {
        65536
    }

    pub fn entry() -> String {
        "app_main".to_string()
    }
}
