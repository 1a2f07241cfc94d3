//! The standard `env` imports.
//!
//! | field          | kind     | behavior                                       |
//! |----------------|----------|------------------------------------------------|
//! | `__life_ping`  | function | returns local 0 plus one (wrapping)            |
//! | `__life_log`   | function | prints `len` bytes at `ptr` (locals 0 and 1)   |
//! | `print_i64`    | function | prints local 0 as a signed integer             |
//! | `__life_magic` | global   | `424`                                          |
//!
//! Printing goes through a [`GuestOutput`]. The logging functions return 0.

use wasm_embed_common::HostFunctionError;
use wasm_embed_core::{Frame, host_function};

use crate::{GuestOutput, ImportTable, ImportTableBuilder};

/// Module namespace of the standard imports.
pub const ENV_MODULE: &str = "env";

/// Value of the `__life_magic` global.
pub const MAGIC: i64 = 424;

/// Build an import table with the standard `env` bindings.
pub fn env_imports(output: GuestOutput) -> ImportTable {
    with_env(ImportTable::builder(), output).build()
}

/// Add the standard `env` bindings to `builder`.
pub fn with_env(builder: ImportTableBuilder, output: GuestOutput) -> ImportTableBuilder {
    let log_output = output.clone();

    builder
        .function(ENV_MODULE, "__life_ping", host_function(ping))
        .function(
            ENV_MODULE,
            "__life_log",
            host_function(move |frame| log(&log_output, frame)),
        )
        .function(
            ENV_MODULE,
            "print_i64",
            host_function(move |frame| print_i64(&output, frame)),
        )
        .global(ENV_MODULE, "__life_magic", MAGIC)
}

fn ping(frame: &Frame<'_>) -> Result<i64, HostFunctionError> {
    Ok(frame.local(0)?.wrapping_add(1))
}

fn log(output: &GuestOutput, frame: &Frame<'_>) -> Result<i64, HostFunctionError> {
    let bytes = frame.read_memory(frame.local(0)?, frame.local(1)?)?;
    output.emit(&String::from_utf8_lossy(bytes));
    Ok(0)
}

fn print_i64(output: &GuestOutput, frame: &Frame<'_>) -> Result<i64, HostFunctionError> {
    output.emit(&format!("print_i64: {}", frame.local(0)?));
    Ok(0)
}
