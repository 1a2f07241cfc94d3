//! Host side of wasm-embed.
//!
//! This crate provides what an embedding host plugs into the virtual
//! machine, and the driver that runs a module end to end.
//!
//! # Components
//!
//! - [`import_table`]: A static [`Resolver`](wasm_embed_core::Resolver) keyed by `(module, field)`
//! - [`env`]: The standard `env` imports (`__life_ping`, `__life_log`, ...)
//! - [`output`]: Where guest output goes
//! - [`runner`]: Instantiate, accelerate, run start and entry, report
//!
//! # Link Policy
//!
//! Every import must be satisfied by the table. An unknown module or field
//! fails instantiation with a [`LinkError`](wasm_embed_common::LinkError);
//! nothing is ever stubbed.

pub mod env;
pub mod import_table;
pub mod output;
pub mod runner;

pub use env::{ENV_MODULE, MAGIC, env_imports, with_env};
pub use import_table::{ImportTable, ImportTableBuilder};
pub use output::{GUEST_PREFIX, GuestOutput, OutputEntry};
pub use runner::{
    AccelerationOutcome, EntryPoint, HostRunner, NoticeSink, RunOptions, RunReport,
};
