//! WebAssembly module compilation and introspection.
//!
//! This module provides:
//! - [`CompiledModule`]: a Wasmtime [`Module`] plus the metadata the host needs
//! - [`ModuleLayout`]: function indices, exports and the start function,
//!   read directly from the binary
//! - [`expose_internals`]: the re-encoding that lets the host call functions
//!   the module does not export
//!
//! # Compilation Paths
//!
//! - **Baseline**: compile from Wasm bytes at load time ([`CompiledModule::from_bytes`])
//! - **AOT**: precompile to a native artifact and load it
//!   ([`CompiledModule::precompile`] + [`CompiledModule::from_precompiled`])

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument};
use wasm_encoder::{CustomSection, ExportKind, ExportSection, RawSection};
use wasmparser::{ExternalKind, Parser, Payload, TypeRef, Validator, WasmFeatures};
use wasmtime::Module;

use wasm_embed_common::{RuntimeError, VmConfig};

use crate::WasmEngine;

/// Prefix of the exports added for functions, memories and tables the
/// module does not export itself.
pub const INTERNAL_EXPORT_PREFIX: &str = "__wasm_embed";

/// Function-level layout of a module.
///
/// Function ids are indices in the module's function index space:
/// imported functions first, then the functions the module defines.
/// Memories and tables are counted the same way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleLayout {
    imported_functions: u32,
    defined_functions: u32,
    memories: u32,
    tables: u32,
    function_exports: BTreeMap<String, u32>,
    export_names: HashMap<u32, String>,
    memory_exports: HashMap<u32, String>,
    table_exports: HashMap<u32, String>,
    start: Option<u32>,
}

impl ModuleLayout {
    /// Read the layout from a binary module.
    ///
    /// # Errors
    ///
    /// Returns an error if the binary cannot be decoded.
    pub fn parse(bytes: &[u8]) -> Result<Self, RuntimeError> {
        let mut layout = Self::default();

        for payload in Parser::new(0).parse_all(bytes) {
            match payload.map_err(decode_error)? {
                Payload::ImportSection(reader) => {
                    for import in reader {
                        match import.map_err(decode_error)?.ty {
                            TypeRef::Func(_) => layout.imported_functions += 1,
                            TypeRef::Memory(_) => layout.memories += 1,
                            TypeRef::Table(_) => layout.tables += 1,
                            _ => {}
                        }
                    }
                }
                Payload::FunctionSection(reader) => {
                    layout.defined_functions = reader.count();
                }
                Payload::MemorySection(reader) => layout.memories += reader.count(),
                Payload::TableSection(reader) => layout.tables += reader.count(),
                Payload::ExportSection(reader) => {
                    for export in reader {
                        let export = export.map_err(decode_error)?;
                        let name = export.name.to_string();
                        match export.kind {
                            ExternalKind::Func => {
                                layout
                                    .export_names
                                    .entry(export.index)
                                    .or_insert_with(|| name.clone());
                                layout.function_exports.insert(name, export.index);
                            }
                            ExternalKind::Memory => {
                                layout.memory_exports.entry(export.index).or_insert(name);
                            }
                            ExternalKind::Table => {
                                layout.table_exports.entry(export.index).or_insert(name);
                            }
                            _ => {}
                        }
                    }
                }
                Payload::StartSection { func, .. } => layout.start = Some(func),
                _ => {}
            }
        }

        Ok(layout)
    }

    /// Look up an exported function by name.
    pub fn function_export(&self, name: &str) -> Option<u32> {
        self.function_exports.get(name).copied()
    }

    /// The export name of a function, if it is exported.
    pub fn export_name(&self, index: u32) -> Option<&str> {
        self.export_names.get(&index).map(String::as_str)
    }

    /// The start function declared by the module.
    pub fn start_function(&self) -> Option<u32> {
        self.start
    }

    /// Number of imported functions.
    pub fn imported_function_count(&self) -> u32 {
        self.imported_functions
    }

    /// Total number of functions in the index space.
    pub fn function_count(&self) -> u32 {
        self.imported_functions + self.defined_functions
    }

    /// Returns `true` if `id` names an imported function.
    pub fn is_imported_function(&self, id: u32) -> bool {
        id < self.imported_functions
    }

    /// Exported functions, ordered by name.
    pub fn exported_functions(&self) -> impl Iterator<Item = (&str, u32)> + '_ {
        self.function_exports
            .iter()
            .map(|(name, index)| (name.as_str(), *index))
    }

    /// The export under which a defined function can be called once the
    /// module has gone through [`expose_internals`].
    ///
    /// Returns `None` for imported functions and ids out of range.
    pub fn callable_name(&self, id: u32) -> Option<Cow<'_, str>> {
        if self.is_imported_function(id) || id >= self.function_count() {
            return None;
        }

        Some(match self.export_name(id) {
            Some(name) => Cow::Borrowed(name),
            None => Cow::Owned(internal_name("func", id)),
        })
    }

    /// The export under which memory 0 is reachable after
    /// [`expose_internals`], or `None` if the module has no memory.
    pub fn memory_export(&self) -> Option<Cow<'_, str>> {
        if self.memories == 0 {
            return None;
        }

        Some(match self.memory_exports.get(&0) {
            Some(name) => Cow::Borrowed(name.as_str()),
            None => Cow::Owned(internal_name("memory", 0)),
        })
    }

    /// Exports [`expose_internals`] adds: every defined function, memory 0
    /// and every table that the module does not export itself.
    fn internal_exports(&self) -> Vec<(String, ExportKind, u32)> {
        let functions = (self.imported_functions..self.function_count())
            .filter(|id| !self.export_names.contains_key(id))
            .map(|id| (internal_name("func", id), ExportKind::Func, id));
        let memory = (self.memories > 0 && !self.memory_exports.contains_key(&0))
            .then(|| (internal_name("memory", 0), ExportKind::Memory, 0));
        let tables = (0..self.tables)
            .filter(|index| !self.table_exports.contains_key(index))
            .map(|index| (internal_name("table", index), ExportKind::Table, index));

        functions.chain(memory).chain(tables).collect()
    }
}

fn internal_name(kind: &str, index: u32) -> String {
    format!("{INTERNAL_EXPORT_PREFIX}_{kind}_{index}")
}

fn decode_error(e: wasmparser::BinaryReaderError) -> RuntimeError {
    RuntimeError::compilation_failed(format!("Invalid Wasm: {e}"))
}

/// Re-encode `bytes` so that every defined function, memory 0 and every
/// table is exported.
///
/// Wasmtime only reaches a module's internals through its exports. The
/// added names are the ones [`ModuleLayout::callable_name`] and
/// [`ModuleLayout::memory_export`] return. All other sections are copied
/// unchanged, so function indices and the name section stay valid.
///
/// # Errors
///
/// Returns an error if the binary cannot be decoded.
pub fn expose_internals<'a>(
    bytes: &'a [u8],
    layout: &ModuleLayout,
) -> Result<Cow<'a, [u8]>, RuntimeError> {
    let internal = layout.internal_exports();
    if internal.is_empty() {
        return Ok(Cow::Borrowed(bytes));
    }

    let mut module = wasm_encoder::Module::new();
    let mut exported = false;

    for payload in Parser::new(0).parse_all(bytes) {
        let payload = payload.map_err(decode_error)?;

        match &payload {
            Payload::ExportSection(reader) => {
                let mut section = ExportSection::new();
                for export in reader.clone() {
                    let export = export.map_err(decode_error)?;
                    section.export(export.name, export.kind.into(), export.index);
                }
                append_exports(&mut section, &internal);
                module.section(&section);
                exported = true;
                continue;
            }
            Payload::CustomSection(reader) => {
                module.section(&CustomSection {
                    name: reader.name().into(),
                    data: reader.data().into(),
                });
                continue;
            }
            _ => {}
        }

        let Some((id, range)) = payload.as_section() else {
            continue;
        };

        // Modules without exports get the section where it belongs
        if !exported && follows_exports(id) {
            let mut section = ExportSection::new();
            append_exports(&mut section, &internal);
            module.section(&section);
            exported = true;
        }

        module.section(&RawSection {
            id,
            data: &bytes[range],
        });
    }

    if !exported {
        let mut section = ExportSection::new();
        append_exports(&mut section, &internal);
        module.section(&section);
    }

    Ok(Cow::Owned(module.finish()))
}

fn append_exports(section: &mut ExportSection, exports: &[(String, ExportKind, u32)]) {
    for (name, kind, index) in exports {
        section.export(name, *kind, *index);
    }
}

/// Start (8), element (9), code (10), data (11) and data count (12).
fn follows_exports(id: u8) -> bool {
    matches!(id, 8..=12)
}

/// A compiled WebAssembly module.
///
/// This struct wraps a Wasmtime [`Module`] with its [`ModuleLayout`] and a
/// content hash of the original bytes. The hash identifies the module across
/// tiers: an AOT context is only accepted by a VM whose module hash matches.
#[derive(Clone)]
pub struct CompiledModule {
    /// The compiled Wasmtime module.
    module: Module,

    /// Function layout read from the original bytes.
    layout: Arc<ModuleLayout>,

    /// Hash of the original Wasm bytes.
    content_hash: String,

    /// When this module was compiled.
    compiled_at: Instant,
}

impl CompiledModule {
    /// Compile a module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid module, if the module
    /// uses floating point while `config` disables it, or if compilation fails.
    #[instrument(skip_all, fields(bytes_len = bytes.len(), tier = %engine.tier()))]
    pub fn from_bytes(
        engine: &WasmEngine,
        bytes: &[u8],
        config: &VmConfig,
    ) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;
        Self::validate_features(bytes, config)?;

        let layout = ModuleLayout::parse(bytes)?;
        let linkable = expose_internals(bytes, &layout)?;
        let module = Module::new(engine.inner(), &linkable).map_err(|e| {
            RuntimeError::compilation_failed(format!("Module compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(bytes);
        let duration = start.elapsed();

        info!(
            content_hash = %content_hash,
            functions = layout.function_count(),
            duration_ms = duration.as_millis(),
            "Module compiled"
        );

        Ok(Self {
            module,
            layout: Arc::new(layout),
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Precompile WebAssembly bytes into a native artifact for `engine`.
    ///
    /// The artifact is built from the same re-encoded module as
    /// [`CompiledModule::from_bytes`], so both tiers expose the same exports.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails.
    #[instrument(skip_all, fields(bytes_len = bytes.len(), tier = %engine.tier()))]
    pub fn precompile(engine: &WasmEngine, bytes: &[u8]) -> Result<Vec<u8>, RuntimeError> {
        let layout = ModuleLayout::parse(bytes)?;
        let linkable = expose_internals(bytes, &layout)?;

        engine.inner().precompile_module(&linkable).map_err(|e| {
            RuntimeError::compilation_failed(format!("AOT compilation failed: {e}"))
        })
    }

    /// Load a precompiled artifact.
    ///
    /// # Safety
    ///
    /// Deserializing runs no validation on the machine code it loads. The
    /// artifact must come from [`CompiledModule::precompile`] on an engine
    /// with the same configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact is incompatible with `engine`.
    #[allow(unsafe_code)]
    pub fn from_precompiled(
        engine: &WasmEngine,
        artifact: &[u8],
        layout: Arc<ModuleLayout>,
        content_hash: impl Into<String>,
    ) -> Result<Self, RuntimeError> {
        // SAFETY: callers only pass bytes returned by `precompile`
        let module = unsafe { Module::deserialize(engine.inner(), artifact) }.map_err(|e| {
            RuntimeError::compilation_failed(format!("Failed to load AOT artifact: {e}"))
        })?;

        Ok(Self {
            module,
            layout,
            content_hash: content_hash.into(),
            compiled_at: Instant::now(),
        })
    }

    /// Load a precompiled artifact from disk.
    ///
    /// # Safety
    ///
    /// Same contract as [`CompiledModule::from_precompiled`]: the file must
    /// have been written from a [`CompiledModule::precompile`] result. The
    /// artifact cache names files by a BLAKE3 digest of the module bytes and
    /// only ever renames complete files into place.
    #[allow(unsafe_code)]
    #[instrument(skip(engine, layout, content_hash))]
    pub fn from_precompiled_file(
        engine: &WasmEngine,
        path: &Path,
        layout: Arc<ModuleLayout>,
        content_hash: impl Into<String>,
    ) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        // SAFETY: the artifact cache only holds complete `precompile` output
        let module = unsafe { Module::deserialize_file(engine.inner(), path) }.map_err(|e| {
            RuntimeError::compilation_failed(format!(
                "Failed to load AOT artifact from {}: {e}",
                path.display()
            ))
        })?;

        debug!(
            path = %path.display(),
            duration_us = start.elapsed().as_micros(),
            "AOT artifact loaded"
        );

        Ok(Self {
            module,
            layout,
            content_hash: content_hash.into(),
            compiled_at: Instant::now(),
        })
    }

    /// Get the inner Wasmtime module.
    pub fn inner(&self) -> &Module {
        &self.module
    }

    /// Get the function layout.
    pub fn layout(&self) -> &ModuleLayout {
        &self.layout
    }

    /// Get a shared handle to the function layout.
    pub fn shared_layout(&self) -> Arc<ModuleLayout> {
        Arc::clone(&self.layout)
    }

    /// Get the content hash of the original Wasm bytes (BLAKE3, hex).
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get when this module was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
        if bytes.len() < 8 {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: file too small",
            ));
        }

        // Check magic number: \0asm
        if &bytes[0..4] != b"\0asm" {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: bad magic number",
            ));
        }

        Ok(())
    }

    /// Reject floating-point types and instructions when they are disabled.
    fn validate_features(bytes: &[u8], config: &VmConfig) -> Result<(), RuntimeError> {
        if !config.disable_floating_point {
            return Ok(());
        }

        let mut features = WasmFeatures::default();
        features.remove(WasmFeatures::FLOATS | WasmFeatures::SIMD | WasmFeatures::RELAXED_SIMD);

        Validator::new_with_features(features)
            .validate_all(bytes)
            .map_err(|e| {
                RuntimeError::compilation_failed(format!(
                    "Validation failed with floating point disabled: {e}"
                ))
            })?;

        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .field("functions", &self.layout.function_count())
            .finish_non_exhaustive()
    }
}

/// Compute a hash of the given bytes.
pub(crate) fn compute_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tier;

    // Minimal valid Wasm module (empty module)
    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, // magic: \0asm
        0x01, 0x00, 0x00, 0x00, // version: 1
    ];

    fn baseline() -> WasmEngine {
        WasmEngine::new(&VmConfig::default(), Tier::Baseline).unwrap()
    }

    #[test]
    fn test_validate_wasm_header_valid() {
        assert!(CompiledModule::validate_wasm_header(MINIMAL_WASM).is_ok());
    }

    #[test]
    fn test_validate_wasm_header_too_small() {
        let result = CompiledModule::validate_wasm_header(&[0x00, 0x61]);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_wasm_header_bad_magic() {
        let bad_wasm = &[0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
        let result = CompiledModule::validate_wasm_header(bad_wasm);
        assert!(result.is_err());
    }

    #[test]
    fn test_compute_hash() {
        let hash1 = compute_hash(b"hello");
        let hash2 = compute_hash(b"hello");
        let hash3 = compute_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 64); // 256-bit hex
    }

    #[test]
    fn test_layout() {
        let bytes = wat::parse_str(
            r#"
            (module
                (import "env" "__life_ping" (func $ping (param i32) (result i32)))
                (func $init)
                (func $main (result i32) (i32.const 1))
                (export "app_main" (func $main))
                (export "alias" (func $main))
                (start $init)
            )
            "#,
        )
        .unwrap();

        let layout = ModuleLayout::parse(&bytes).unwrap();

        assert_eq!(layout.imported_function_count(), 1);
        assert_eq!(layout.function_count(), 3);
        assert_eq!(layout.function_export("app_main"), Some(2));
        assert_eq!(layout.function_export("alias"), Some(2));
        assert_eq!(layout.function_export("missing"), None);
        assert_eq!(layout.export_name(2), Some("app_main"));
        assert_eq!(layout.export_name(1), None);
        assert_eq!(layout.start_function(), Some(1));
        assert_eq!(layout.exported_functions().count(), 2);
        assert!(layout.is_imported_function(0));
        assert_eq!(layout.callable_name(0), None);
        assert_eq!(layout.callable_name(1).as_deref(), Some("__wasm_embed_func_1"));
        assert_eq!(layout.callable_name(2).as_deref(), Some("app_main"));
        assert_eq!(layout.callable_name(3), None);
        assert_eq!(layout.memory_export(), None);
    }

    #[test]
    fn test_expose_internals() {
        let bytes = wat::parse_str(
            r#"
            (module
                (memory 1)
                (table 2 funcref)
                (func $hidden (result i32) (i32.const 5))
                (func (export "shown") (result i32) (i32.const 6))
            )
            "#,
        )
        .unwrap();
        let layout = ModuleLayout::parse(&bytes).unwrap();

        let exposed = expose_internals(&bytes, &layout).unwrap();
        let reparsed = ModuleLayout::parse(&exposed).unwrap();

        assert_eq!(reparsed.function_export("shown"), Some(1));
        assert_eq!(reparsed.function_export("__wasm_embed_func_0"), Some(0));
        assert_eq!(reparsed.memory_export().as_deref(), Some("__wasm_embed_memory_0"));
        assert!(reparsed.internal_exports().is_empty());
        assert_eq!(layout.memory_export().as_deref(), Some("__wasm_embed_memory_0"));
        assert!(wasmparser::validate(&exposed).is_ok());
    }

    #[test]
    fn test_expose_internals_without_export_section() {
        let bytes = wat::parse_str(
            r#"
            (module
                (func $a (result i32) (i32.const 5))
                (func $b (result i32) (call $a))
                (start $c)
                (func $c)
                (data (i32.const 0) "x")
                (memory 1)
            )
            "#,
        )
        .unwrap();
        let layout = ModuleLayout::parse(&bytes).unwrap();

        let exposed = expose_internals(&bytes, &layout).unwrap();
        let reparsed = ModuleLayout::parse(&exposed).unwrap();

        assert!(wasmparser::validate(&exposed).is_ok());
        assert_eq!(reparsed.start_function(), Some(2));
        assert_eq!(reparsed.exported_functions().count(), 3);
    }

    #[test]
    fn test_fully_exported_module_unchanged() {
        let bytes = wat::parse_str(
            r#"(module (memory (export "mem") 1) (func (export "f")))"#,
        )
        .unwrap();
        let layout = ModuleLayout::parse(&bytes).unwrap();

        assert!(matches!(expose_internals(&bytes, &layout).unwrap(), Cow::Borrowed(_)));
        assert_eq!(layout.memory_export().as_deref(), Some("mem"));
    }

    #[test]
    fn test_module_compilation() {
        let module = CompiledModule::from_bytes(&baseline(), MINIMAL_WASM, &VmConfig::default());
        assert!(module.is_ok());

        let module = module.unwrap();
        assert_eq!(module.layout().function_count(), 0);
        assert!(!module.content_hash().is_empty());
    }

    #[test]
    fn test_floating_point_rejected() {
        let bytes = wat::parse_str(
            r#"
            (module
                (func (export "half") (param f64) (result f64)
                    (f64.div (local.get 0) (f64.const 2)))
            )
            "#,
        )
        .unwrap();
        let config = VmConfig {
            disable_floating_point: true,
            ..Default::default()
        };
        let engine = WasmEngine::new(&config, Tier::Baseline).unwrap();

        let result = CompiledModule::from_bytes(&engine, &bytes, &config);
        assert!(matches!(
            result,
            Err(RuntimeError::CompilationFailed { .. })
        ));

        // Same module is fine with floating point enabled
        assert!(CompiledModule::from_bytes(&baseline(), &bytes, &VmConfig::default()).is_ok());
    }

    #[test]
    fn test_integer_module_accepted_without_fp() {
        let bytes = wat::parse_str(r#"(module (func (export "one") (result i32) (i32.const 1)))"#)
            .unwrap();
        let config = VmConfig {
            disable_floating_point: true,
            ..Default::default()
        };
        let engine = WasmEngine::new(&config, Tier::Baseline).unwrap();

        assert!(CompiledModule::from_bytes(&engine, &bytes, &config).is_ok());
    }

    #[test]
    fn test_precompile_roundtrip() {
        let bytes = wat::parse_str(r#"(module (func (export "one") (result i32) (i32.const 1)))"#)
            .unwrap();
        let engine = WasmEngine::new(&VmConfig::default(), Tier::Optimized).unwrap();
        let layout = Arc::new(ModuleLayout::parse(&bytes).unwrap());

        let artifact = CompiledModule::precompile(&engine, &bytes).unwrap();
        let module =
            CompiledModule::from_precompiled(&engine, &artifact, layout, compute_hash(&bytes))
                .unwrap();

        assert_eq!(module.content_hash(), compute_hash(&bytes));
        assert_eq!(module.layout().function_export("one"), Some(0));
    }

    #[test]
    fn test_module_debug() {
        let module =
            CompiledModule::from_bytes(&baseline(), MINIMAL_WASM, &VmConfig::default()).unwrap();

        let debug_str = format!("{module:?}");
        assert!(debug_str.contains("CompiledModule"));
        assert!(debug_str.contains("content_hash"));
    }
}
