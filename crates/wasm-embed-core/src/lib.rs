//! Virtual machine adapter for wasm-embed.
//!
//! This crate wraps Wasmtime behind the interface an embedding host needs:
//! - [`VirtualMachine`]: load a module, run its start and entry functions
//! - [`Resolver`]: supply the module's imports
//! - [`AotContext`]: optional optimized execution, produced by [`full_compile`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    VirtualMachine                       │
//! │  - Module layout (exports, start function)              │
//! │  - Execution by function id                             │
//! │  - Last stack trace                                     │
//! └─────────────────────────────────────────────────────────┘
//!              │                               │
//!              ▼                               ▼
//! ┌────────────────────────────┐  ┌────────────────────────────┐
//! │  Baseline ModuleInstance   │  │   AotContext (optional)    │
//! │  - OptLevel::None engine   │  │  - OptLevel::Speed engine  │
//! │  - Compiled at load time   │  │  - Precompiled artifact    │
//! └────────────────────────────┘  └────────────────────────────┘
//!              │                               │
//!              └───────────────┬───────────────┘
//!                              ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    ResolvedImports                      │
//! │  (Resolver answers recorded once, linked by both tiers) │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod aot;
pub mod engine;
pub mod imports;
pub mod instance;
pub mod module;
pub mod resolver;
pub mod store;
pub mod vm;

pub use aot::{
    AccelerationBackend, AotContext, NativeBackend, UnsupportedBackend, default_backend,
    full_compile, full_compile_with, is_acceleration_available,
};
pub use engine::{Tier, WasmEngine};
pub use imports::ResolvedImports;
pub use instance::ModuleInstance;
pub use module::{CompiledModule, ModuleLayout, expose_internals};
pub use resolver::{Frame, HostFunction, Resolver, host_function};
pub use store::HostState;
pub use vm::VirtualMachine;
