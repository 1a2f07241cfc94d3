//! End-to-end tests for wasm-embed-host.
//!
//! These tests run guest modules through [`HostRunner`] with the standard
//! `env` imports, the same way the command-line host does.

use std::sync::Arc;

use wasm_embed_common::{AotConfig, LinkError, RunConfig, RunStage, RuntimeError, VmConfig};
use wasm_embed_core::{NativeBackend, UnsupportedBackend};
use wasm_embed_host::{
    AccelerationOutcome, EntryPoint, GuestOutput, HostRunner, RunOptions, env_imports,
};

/// Guest that exercises every standard import.
const APP: &str = r#"
    (module
        (import "env" "__life_ping" (func $ping (param i32) (result i32)))
        (import "env" "__life_log" (func $log (param i32 i32) (result i32)))
        (import "env" "print_i64" (func $print (param i64) (result i32)))
        (import "env" "__life_magic" (global $magic i64))
        (memory (export "memory") 1)
        (data (i32.const 0) "hi")
        (func (export "app_main") (result i32)
            (drop (call $log (i32.const 0) (i32.const 2)))
            (drop (call $print (i64.const 7)))
            (drop (call $print (global.get $magic)))
            (call $ping (i32.const 41)))
    )
"#;

fn setup() -> (HostRunner, GuestOutput) {
    let output = GuestOutput::captured();
    let runner = HostRunner::new(Arc::new(env_imports(output.clone())));
    (runner, output)
}

fn wasm(wat: &str) -> Vec<u8> {
    wat::parse_str(wat).unwrap()
}

fn aot_enabled() -> RunOptions {
    RunOptions {
        aot: AotConfig {
            enabled: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

// ============================================================================
// Test: Standard Imports
// ============================================================================

#[test]
fn test_app_main_pings() {
    let (runner, output) = setup();

    let report = runner.run(wasm(APP), &RunOptions::default()).unwrap();

    assert_eq!(report.return_value, 42);
    assert_eq!(
        report.entry,
        EntryPoint::Export {
            name: "app_main".into(),
            id: 3,
        }
    );
    assert_eq!(
        output.lines(),
        vec![
            "[app] hi",
            "[app] print_i64: 7",
            "[app] print_i64: 424",
        ]
    );
    assert_eq!(report.gas_used, None);
}

#[test]
fn test_unknown_import_fails_before_running() {
    let (runner, output) = setup();
    let bytes = wasm(
        r#"
        (module
            (import "env" "__life_log" (func $log (param i32 i32) (result i32)))
            (import "env" "__life_unknown" (func))
            (func (export "app_main"))
        )
        "#,
    );

    let err = runner.run(bytes, &RunOptions::default()).unwrap_err();

    assert!(matches!(
        err,
        RuntimeError::Link(LinkError::UnknownField { ref field, .. }) if field == "__life_unknown"
    ));
    assert!(output.lines().is_empty());
}

#[test]
fn test_log_out_of_bounds_traps() {
    let (runner, _) = setup();
    let bytes = wasm(
        r#"
        (module
            (import "env" "__life_log" (func $log (param i32 i32) (result i32)))
            (memory (export "memory") 1 1)
            (func (export "app_main") (result i32)
                (call $log (i32.const 65535) (i32.const 2)))
        )
        "#,
    );

    let err = runner.run(bytes, &RunOptions::default()).unwrap_err();

    assert!(matches!(
        err,
        RuntimeError::RunFailed {
            stage: RunStage::Entry,
            trace: Some(_),
            ..
        }
    ));
}

// ============================================================================
// Test: Entry Resolution
// ============================================================================

#[test]
fn test_missing_entry_falls_back_to_zero() {
    let (runner, _) = setup();
    let bytes = wasm(
        r#"
        (module
            (func (export "first") (result i32) (i32.const 11))
            (func (export "second") (result i32) (i32.const 22))
        )
        "#,
    );
    let options = RunOptions {
        run: RunConfig {
            entry: "does_not_exist".into(),
            args: vec![],
        },
        ..Default::default()
    };

    let report = runner.run(bytes, &options).unwrap();

    assert_eq!(report.return_value, 11);
    assert_eq!(
        report.entry,
        EntryPoint::Fallback {
            requested: "does_not_exist".into(),
        }
    );
}

#[test]
fn test_fallback_runs_unexported_function() {
    let (runner, _) = setup();
    let bytes = wasm(r#"(module (func (result i32) (i32.const 5)))"#);

    let report = runner.run(bytes, &RunOptions::default()).unwrap();

    assert_eq!(report.return_value, 5);
    assert!(report.entry.is_fallback());
}

#[test]
fn test_fallback_runs_imported_function() {
    let (runner, _) = setup();
    let bytes = wasm(
        r#"
        (module
            (import "env" "__life_ping" (func $ping (param i32) (result i32)))
            (func (export "other") (result i32) (i32.const 2))
        )
        "#,
    );
    let options = RunOptions {
        run: RunConfig {
            entry: "missing".into(),
            args: vec![41],
        },
        ..Default::default()
    };

    let report = runner.run(bytes, &options).unwrap();

    assert_eq!(report.return_value, 42);
    assert_eq!(report.entry.id(), 0);
}

#[test]
fn test_fallback_runs_under_aot() {
    let (runner, _) = setup();
    let bytes = wasm(
        r#"
        (module
            (func $hidden (result i32) (i32.const 5))
            (func (export "other") (result i32) (i32.const 2))
        )
        "#,
    );

    let report = runner
        .with_backend(Box::new(NativeBackend::new()))
        .run(bytes, &aot_enabled())
        .unwrap();

    assert_eq!(report.return_value, 5);
    assert!(matches!(
        report.acceleration,
        AccelerationOutcome::Compiled { .. }
    ));
}

#[test]
fn test_fallback_notice_before_guest_output() {
    let output = GuestOutput::captured();
    let notice_output = output.clone();
    let runner = HostRunner::new(Arc::new(env_imports(output.clone())))
        .with_notices(move |notice| notice_output.emit(notice));
    let bytes = wasm(
        r#"
        (module
            (import "env" "print_i64" (func $print (param i64) (result i32)))
            (func (drop (call $print (i64.const 1))) unreachable)
        )
        "#,
    );

    let err = runner.run(bytes, &RunOptions::default()).unwrap_err();

    assert!(err.is_execution_failure());
    assert_eq!(
        output.lines(),
        vec![
            "[app] Entry function app_main not found; starting from 0.",
            "[app] print_i64: 1",
        ]
    );
}

// ============================================================================
// Test: Start Function
// ============================================================================

#[test]
fn test_start_function_runs_first() {
    let (runner, output) = setup();
    let bytes = wasm(
        r#"
        (module
            (import "env" "print_i64" (func $print (param i64) (result i32)))
            (global $ready (mut i32) (i32.const 0))
            (func $init
                (drop (call $print (i64.const 1)))
                (global.set $ready (i32.const 1)))
            (func (export "app_main") (result i32)
                (drop (call $print (i64.const 2)))
                (global.get $ready))
            (start $init)
        )
        "#,
    );

    let report = runner.run(bytes, &RunOptions::default()).unwrap();

    assert_eq!(report.return_value, 1);
    assert_eq!(
        output.lines(),
        vec!["[app] print_i64: 1", "[app] print_i64: 2"]
    );
}

// ============================================================================
// Test: AOT Acceleration
// ============================================================================

#[test]
fn test_aot_run_matches_baseline() {
    let (baseline_runner, baseline_output) = setup();
    let (aot_runner, aot_output) = setup();

    let baseline = baseline_runner
        .run(wasm(APP), &RunOptions::default())
        .unwrap();
    let accelerated = aot_runner
        .with_backend(Box::new(NativeBackend::new()))
        .run(wasm(APP), &aot_enabled())
        .unwrap();

    assert!(matches!(
        accelerated.acceleration,
        AccelerationOutcome::Compiled { .. }
    ));
    assert_eq!(baseline.return_value, accelerated.return_value);
    assert_eq!(baseline_output.lines(), aot_output.lines());
}

#[test]
fn test_unsupported_platform_degrades() {
    let (runner, _) = setup();

    let report = runner
        .with_backend(Box::new(UnsupportedBackend))
        .run(wasm(APP), &aot_enabled())
        .unwrap();

    assert_eq!(report.acceleration, AccelerationOutcome::Unsupported);
    assert_eq!(report.return_value, 42);
}

#[test]
fn test_aot_cache_dir() {
    let dir = tempfile::tempdir().unwrap();
    let options = RunOptions {
        aot: AotConfig {
            enabled: true,
            cache_dir: Some(dir.path().to_path_buf()),
        },
        ..Default::default()
    };

    for _ in 0..2 {
        let (runner, _) = setup();
        let report = runner.run(wasm(APP), &options).unwrap();
        assert_eq!(report.return_value, 42);
    }

    let cached = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(cached, 1);
}

#[test]
fn test_aot_cache_dir_unusable() {
    let (runner, _) = setup();
    let not_a_dir = tempfile::NamedTempFile::new().unwrap();
    let options = RunOptions {
        aot: AotConfig {
            enabled: true,
            cache_dir: Some(not_a_dir.path().to_path_buf()),
        },
        ..Default::default()
    };
    let bytes = wasm(r#"(module (func (export "app_main") (result i32) (i32.const 9)))"#);

    let report = runner.run(bytes, &options).unwrap();

    assert_eq!(report.return_value, 9);
}

// ============================================================================
// Test: Memory
// ============================================================================

#[test]
fn test_log_reads_unexported_memory() {
    let (runner, output) = setup();
    let bytes = wasm(
        r#"
        (module
            (import "env" "__life_log" (func $log (param i32 i32) (result i32)))
            (memory 1)
            (data (i32.const 16) "private")
            (func (export "app_main") (result i32)
                (call $log (i32.const 16) (i32.const 7)))
        )
        "#,
    );

    runner.run(bytes, &RunOptions::default()).unwrap();

    assert_eq!(output.lines(), vec!["[app] private"]);
}

#[test]
fn test_log_without_memory_traps() {
    let (runner, _) = setup();
    let bytes = wasm(
        r#"
        (module
            (import "env" "__life_log" (func $log (param i32 i32) (result i32)))
            (func (export "app_main") (result i32)
                (call $log (i32.const 0) (i32.const 1)))
        )
        "#,
    );

    let err = runner.run(bytes, &RunOptions::default()).unwrap_err();

    assert!(err.is_execution_failure());
}

// ============================================================================
// Test: Configuration
// ============================================================================

#[test]
fn test_gas_metered_run() {
    let (runner, _) = setup();
    let options = RunOptions {
        vm: VmConfig {
            gas_limit: 1_000_000,
            ..Default::default()
        },
        ..Default::default()
    };

    let report = runner.run(wasm(APP), &options).unwrap();

    assert_eq!(report.return_value, 42);
    assert!(report.gas_used.is_some_and(|gas| gas > 0 && gas < 1_000_000));
}

#[test]
fn test_no_fp_rejects_float_module() {
    let (runner, _) = setup();
    let options = RunOptions {
        vm: VmConfig {
            disable_floating_point: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let bytes = wasm(
        r#"(module (func (export "app_main") (result i64)
            (i64.trunc_f64_s (f64.const 42.0))))"#,
    );

    let err = runner.run(bytes, &options).unwrap_err();
    assert!(matches!(err, RuntimeError::CompilationFailed { .. }));

    // APP is integer-only
    assert_eq!(runner.run(wasm(APP), &options).unwrap().return_value, 42);
}
