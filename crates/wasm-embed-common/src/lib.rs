//! Common types, errors, and utilities for wasm-embed.
//!
//! This crate provides shared functionality used across the wasm-embed workspace:
//! - Error types using `thiserror` for link-time and execution failures
//! - Configuration structures for the VM, the AOT subsystem and the run itself
//! - Stack-trace data reported when guest code traps

pub mod config;
pub mod config_file;
pub mod error;
pub mod trace;

pub use config::{AotConfig, RunConfig, VmConfig};
pub use config_file::{ConfigFile, ConfigFileError};
pub use error::{HostFunctionError, LinkError, RunStage, RuntimeError};
pub use trace::{StackTrace, TraceFrame};
