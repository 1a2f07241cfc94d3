//! Guest output sink.
//!
//! Host functions that print on behalf of the guest write to a
//! [`GuestOutput`]. Every line is:
//! 1. Echoed to stdout, when echo is enabled (the CLI)
//! 2. Captured in memory, when capture is enabled (tests, library callers)
//! 3. Emitted via the `tracing` crate for observability

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

/// Prefix for every line the guest prints.
pub const GUEST_PREFIX: &str = "[app]";

/// A line printed by the guest.
#[derive(Debug, Clone)]
pub struct OutputEntry {
    /// The line, including the [`GUEST_PREFIX`].
    pub message: String,
    /// When it was printed.
    pub timestamp: Instant,
}

/// Where guest output goes.
///
/// Cheap to clone; clones share the captured lines.
#[derive(Debug, Clone)]
pub struct GuestOutput {
    echo: bool,
    captured: Option<Arc<Mutex<Vec<OutputEntry>>>>,
}

impl GuestOutput {
    /// Echo guest output to stdout without keeping it.
    pub fn stdout() -> Self {
        Self {
            echo: true,
            captured: None,
        }
    }

    /// Keep guest output in memory without echoing it.
    pub fn captured() -> Self {
        Self {
            echo: false,
            captured: Some(Arc::default()),
        }
    }

    /// Print one guest line, adding the [`GUEST_PREFIX`].
    pub fn emit(&self, message: &str) {
        let line = format!("{GUEST_PREFIX} {message}");

        if self.echo {
            let _ = writeln!(io::stdout().lock(), "{line}");
        }

        debug!(guest_log = true, "{}", message);

        if let Some(captured) = &self.captured {
            captured.lock().push(OutputEntry {
                message: line,
                timestamp: Instant::now(),
            });
        }
    }

    /// Captured entries, oldest first.
    pub fn entries(&self) -> Vec<OutputEntry> {
        self.captured
            .as_ref()
            .map(|captured| captured.lock().clone())
            .unwrap_or_default()
    }

    /// Captured lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .map(|entry| entry.message)
            .collect()
    }
}

impl Default for GuestOutput {
    fn default() -> Self {
        Self::stdout()
    }
}
