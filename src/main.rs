//! wasm-embed CLI entry point.
//!
//! Runs one WebAssembly module: instantiate it with the standard `env`
//! imports, optionally accelerate it, run its start and entry functions and
//! print the result.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueHint};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wasm_embed_common::ConfigFile;
use wasm_embed_host::{GuestOutput, HostRunner, RunOptions, env_imports};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the WebAssembly module.
    #[arg(value_hint = ValueHint::FilePath)]
    module: PathBuf,

    /// Integer arguments passed to the entry function.
    #[arg(allow_negative_numbers = true)]
    args: Vec<i64>,

    /// Entry function name [default: app_main]
    #[arg(long, env = "WASM_EMBED_ENTRY")]
    entry: Option<String>,

    /// Enable AOT acceleration.
    #[arg(long)]
    polymerase: bool,

    /// Disable floating point.
    #[arg(long = "no-fp")]
    no_fp: bool,

    /// TOML configuration file. Flags override its values.
    #[arg(long, env = "WASM_EMBED_CONFIG", value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
}

impl Cli {
    fn options(&self) -> anyhow::Result<RunOptions> {
        let file = match &self.config {
            Some(path) => ConfigFile::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => ConfigFile::default(),
        };

        let mut options = RunOptions::from(file);
        if let Some(entry) = &self.entry {
            options.run.entry.clone_from(entry);
        }
        if !self.args.is_empty() {
            options.run.args.clone_from(&self.args);
        }
        if self.polymerase {
            options.aot.enabled = true;
        }
        if self.no_fp {
            options.vm.disable_floating_point = true;
        }

        Ok(options)
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wasm_embed=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let options = cli.options()?;

    debug!(?options, "Configuration loaded");

    let bytes = std::fs::read(&cli.module)
        .with_context(|| format!("Failed to read module {}", cli.module.display()))?;

    info!(module = %cli.module.display(), size = bytes.len(), "Module loaded");

    // Notices print as they happen, so they precede guest output and failures
    let runner = HostRunner::new(Arc::new(env_imports(GuestOutput::stdout())))
        .with_notices(|notice| println!("{notice}"));
    let report = runner
        .run(bytes, &options)
        .with_context(|| format!("Failed to run {}", cli.module.display()))?;

    if let Some(gas) = report.gas_used {
        println!("gas used = {gas}");
    }
    println!("{report}");

    Ok(())
}
