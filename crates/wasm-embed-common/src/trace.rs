//! Call-stack diagnostics for failed runs.
//!
//! A [`StackTrace`] is captured whenever guest code traps and is what the
//! host prints before terminating a failed run.

use std::fmt;

/// One guest frame, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Index of the function in the module's function index space.
    pub func_index: u32,

    /// Function name, from the name section or the export table.
    pub name: Option<String>,

    /// Byte offset of the faulting instruction within the module.
    pub module_offset: Option<usize>,
}

/// Guest call stack at the point of a trap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackTrace {
    /// Frames, innermost first.
    pub frames: Vec<TraceFrame>,
}

impl StackTrace {
    /// Create a trace from frames ordered innermost first.
    pub fn new(frames: Vec<TraceFrame>) -> Self {
        Self { frames }
    }

    /// Returns `true` if no guest frames were captured.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of captured frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "func[{}]", self.func_index)?;
        if let Some(name) = &self.name {
            write!(f, " <{name}>")?;
        }
        if let Some(offset) = self.module_offset {
            write!(f, " @ {offset:#x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.frames.is_empty() {
            return writeln!(f, "  <no guest frames>");
        }
        for (depth, frame) in self.frames.iter().enumerate() {
            writeln!(f, "  {depth:>2}: {frame}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_display() {
        let frame = TraceFrame {
            func_index: 3,
            name: Some("app_main".into()),
            module_offset: Some(0x4a),
        };
        assert_eq!(frame.to_string(), "func[3] <app_main> @ 0x4a");

        let anonymous = TraceFrame {
            func_index: 7,
            name: None,
            module_offset: None,
        };
        assert_eq!(anonymous.to_string(), "func[7]");
    }

    #[test]
    fn test_trace_display() {
        let trace = StackTrace::new(vec![
            TraceFrame {
                func_index: 2,
                name: Some("inner".into()),
                module_offset: None,
            },
            TraceFrame {
                func_index: 1,
                name: Some("app_main".into()),
                module_offset: None,
            },
        ]);

        let rendered = trace.to_string();
        assert_eq!(trace.len(), 2);
        assert!(rendered.contains("0: func[2] <inner>"));
        assert!(rendered.contains("1: func[1] <app_main>"));
    }

    #[test]
    fn test_empty_trace_display() {
        let trace = StackTrace::default();
        assert!(trace.is_empty());
        assert!(trace.to_string().contains("no guest frames"));
    }
}
