//! Error types for wasm-embed.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`LinkError`]: The host cannot satisfy the module's imports
//! - [`HostFunctionError`]: A host function rejected its inputs (traps the guest)
//! - [`RuntimeError`]: Top-level errors for loading, linking and running a module

use std::fmt;
use std::io;

use thiserror::Error;

use crate::StackTrace;

/// Link-time contract violations.
///
/// These are raised while resolving a module's imports, before any guest
/// code runs. They mean the embedding and the module are incompatible and
/// are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The import names a module namespace the host does not provide.
    #[error("unknown import module: {module} (while resolving {module}.{field})")]
    UnknownModule {
        /// The requested module namespace.
        module: String,
        /// The requested field.
        field: String,
    },

    /// The namespace is known but has no such field.
    #[error("unknown import field: {module}.{field}")]
    UnknownField {
        /// The requested module namespace.
        module: String,
        /// The requested field.
        field: String,
    },

    /// The import kind cannot be supplied by a resolver.
    #[error("unsupported {kind} import: {module}.{field}")]
    UnsupportedImport {
        /// The requested module namespace.
        module: String,
        /// The requested field.
        field: String,
        /// The import kind (memory, table, ...).
        kind: String,
    },

    /// The resolved binding cannot be given the type the module declares.
    #[error("incompatible import {module}.{field}: {reason}")]
    IncompatibleImport {
        /// The requested module namespace.
        module: String,
        /// The requested field.
        field: String,
        /// Why the binding does not fit.
        reason: String,
    },
}

impl LinkError {
    /// Create a new `UnknownModule` error.
    pub fn unknown_module(module: impl Into<String>, field: impl Into<String>) -> Self {
        Self::UnknownModule {
            module: module.into(),
            field: field.into(),
        }
    }

    /// Create a new `UnknownField` error.
    pub fn unknown_field(module: impl Into<String>, field: impl Into<String>) -> Self {
        Self::UnknownField {
            module: module.into(),
            field: field.into(),
        }
    }
}

/// Errors from host function implementations.
///
/// A host function that fails makes the calling guest code trap.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostFunctionError {
    /// The call frame has fewer locals than the function reads.
    #[error("missing local {index} (frame has {count})")]
    MissingLocal {
        /// Index of the local that was read.
        index: usize,
        /// Number of locals in the frame.
        count: usize,
    },

    /// A pointer/length pair does not address guest memory.
    #[error("memory access out of bounds: ptr={ptr} len={len} (memory size {memory_size})")]
    MemoryOutOfBounds {
        /// Start offset requested.
        ptr: u64,
        /// Length requested.
        len: u64,
        /// Size of guest memory in bytes.
        memory_size: usize,
    },

    /// Invalid argument was passed to a host function.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },
}

/// The run step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    /// The module's declared start function.
    Start,
    /// The host-selected entry function.
    Entry,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStage::Start => write!(f, "start"),
            RunStage::Entry => write!(f, "entry"),
        }
    }
}

/// Top-level runtime errors.
///
/// These errors represent failures across the life cycle of one module
/// execution, from loading the bytes to running the entry function.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The module could not be decoded, validated or compiled.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// The host cannot satisfy the module's imports.
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// The function id is outside the module's function index space.
    #[error("Function {id} does not exist in the module")]
    FunctionNotCallable {
        /// The requested function id.
        id: u32,
    },

    /// The instance has no exported function by that name.
    #[error("No exported function named '{name}'")]
    ExportNotFound {
        /// The requested export name.
        name: String,
    },

    /// The AOT context has no compiled function by that name.
    #[error("Function '{name}' is not in the compiled set")]
    FunctionNotCompiled {
        /// The requested export name.
        name: String,
    },

    /// The number of host-supplied arguments does not match the signature.
    #[error("Function '{name}' takes {expected} arguments, got {got}")]
    ArityMismatch {
        /// The function name.
        name: String,
        /// Parameter count of the function.
        expected: usize,
        /// Argument count supplied.
        got: usize,
    },

    /// The function signature uses types the host cannot express as integers.
    #[error("Function '{name}' has an unsupported signature: {reason}")]
    UnsupportedSignature {
        /// The function name.
        name: String,
        /// Description of the offending type.
        reason: String,
    },

    /// A WebAssembly trap occurred during execution.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
        /// Guest call stack at the trap.
        trace: StackTrace,
    },

    /// Execution used up the configured gas.
    #[error("Gas limit exceeded: {limit}")]
    GasLimitExceeded {
        /// The configured gas limit.
        limit: u64,
        /// Guest call stack when gas ran out.
        trace: StackTrace,
    },

    /// An AOT context is already attached to this VM.
    #[error("An AOT context is already attached")]
    AotAlreadyAttached,

    /// Guest code already ran on the baseline tier.
    #[error("Cannot attach an AOT context after guest code has run")]
    AotAfterExecution,

    /// The AOT context was compiled from a different module.
    #[error("AOT context belongs to module {found}, expected {expected}")]
    AotModuleMismatch {
        /// Content hash of the VM's module.
        expected: String,
        /// Content hash the context was compiled from.
        found: String,
    },

    /// A run step failed. Always fatal for the host.
    #[error("{stage} function failed: {source}")]
    RunFailed {
        /// Which step failed.
        stage: RunStage,
        /// The underlying failure.
        #[source]
        source: Box<RuntimeError>,
        /// Guest call stack, if the failure was a trap.
        trace: Option<StackTrace>,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

impl RuntimeError {
    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>, trace: StackTrace) -> Self {
        Self::Trap {
            message: message.into(),
            trace,
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Wrap an execution failure with the step it happened in.
    pub fn run_failed(stage: RunStage, source: RuntimeError) -> Self {
        let trace = source.trace().cloned();
        Self::RunFailed {
            stage,
            source: Box::new(source),
            trace,
        }
    }

    /// Returns `true` if this error is a link-time contract violation.
    pub fn is_link_error(&self) -> bool {
        matches!(self, Self::Link(_))
    }

    /// Returns `true` if guest code started running and then failed.
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            Self::Trap { .. } | Self::GasLimitExceeded { .. } | Self::RunFailed { .. }
        )
    }

    /// The guest call stack attached to this error, if any.
    pub fn trace(&self) -> Option<&StackTrace> {
        match self {
            Self::Trap { trace, .. } | Self::GasLimitExceeded { trace, .. } => Some(trace),
            Self::RunFailed { trace, .. } => trace.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TraceFrame;

    #[test]
    fn test_error_display() {
        let err = RuntimeError::from(LinkError::unknown_field("env", "nope"));
        assert_eq!(err.to_string(), "Link error: unknown import field: env.nope");

        let err = RuntimeError::GasLimitExceeded {
            limit: 1000,
            trace: StackTrace::default(),
        };
        assert_eq!(err.to_string(), "Gas limit exceeded: 1000");
        assert!(err.trace().is_some());
    }

    #[test]
    fn test_link_error_variants() {
        let module = LinkError::unknown_module("wasi", "fd_write");
        assert!(module.to_string().contains("wasi"));
        assert!(matches!(module, LinkError::UnknownModule { .. }));

        let field = LinkError::unknown_field("env", "missing");
        assert!(matches!(field, LinkError::UnknownField { .. }));
        assert!(RuntimeError::from(field).is_link_error());
    }

    #[test]
    fn test_host_function_error_display() {
        let err = HostFunctionError::MemoryOutOfBounds {
            ptr: 65536,
            len: 4,
            memory_size: 65536,
        };
        assert_eq!(
            err.to_string(),
            "memory access out of bounds: ptr=65536 len=4 (memory size 65536)"
        );
    }

    #[test]
    fn test_run_failed_keeps_trace() {
        let trace = StackTrace::new(vec![TraceFrame {
            func_index: 1,
            name: Some("app_main".into()),
            module_offset: None,
        }]);
        let err = RuntimeError::run_failed(
            RunStage::Entry,
            RuntimeError::trap("unreachable", trace.clone()),
        );

        assert_eq!(err.trace(), Some(&trace));
        assert!(err.is_execution_failure());
        assert!(err.to_string().starts_with("entry function failed"));
    }

    #[test]
    fn test_is_link_error() {
        assert!(!RuntimeError::compilation_failed("bad").is_link_error());
        assert!(!RuntimeError::AotAlreadyAttached.is_execution_failure());
    }
}
