//! The contract between the host and guest imports.
//!
//! A [`Resolver`] supplies every binding a module imports. The VM asks it once
//! per import at link time; function bindings are then kept and called
//! whenever guest code calls the imported slot.

use std::sync::Arc;

use wasm_embed_common::{HostFunctionError, LinkError};

/// A host-provided function callable from guest code.
///
/// It receives a read-only [`Frame`] for the duration of the call and
/// returns a 64-bit result, which the VM converts to the import's declared
/// result type. Returning an error traps the guest.
pub type HostFunction = Arc<dyn Fn(&Frame<'_>) -> Result<i64, HostFunctionError> + Send + Sync>;

/// Supplies host bindings for a module's imports.
///
/// Unknown names must be reported as a [`LinkError`], never answered with a
/// placeholder binding.
pub trait Resolver: Send + Sync {
    /// Resolve an imported function.
    fn resolve_function(&self, module: &str, field: &str) -> Result<HostFunction, LinkError>;

    /// Resolve an imported immutable global.
    fn resolve_global(&self, module: &str, field: &str) -> Result<i64, LinkError>;
}

/// Wrap a closure as a [`HostFunction`].
pub fn host_function<F>(f: F) -> HostFunction
where
    F: Fn(&Frame<'_>) -> Result<i64, HostFunctionError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// The guest's view handed to a host function.
///
/// Locals are the call's arguments as 64-bit integers: `i32` values are
/// zero-extended, floats are passed as their raw bits. `memory` is the
/// instance's exported linear memory (empty if it exports none) and must not
/// be retained past the call.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    locals: &'a [i64],
    memory: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Create a frame over the given locals and memory.
    pub fn new(locals: &'a [i64], memory: &'a [u8]) -> Self {
        Self { locals, memory }
    }

    /// All locals of the call.
    pub fn locals(&self) -> &'a [i64] {
        self.locals
    }

    /// Read one local.
    pub fn local(&self, index: usize) -> Result<i64, HostFunctionError> {
        self.locals
            .get(index)
            .copied()
            .ok_or(HostFunctionError::MissingLocal {
                index,
                count: self.locals.len(),
            })
    }

    /// The guest's linear memory.
    pub fn memory(&self) -> &'a [u8] {
        self.memory
    }

    /// Borrow `len` bytes of guest memory starting at `ptr`.
    ///
    /// Pointers and lengths are 32-bit guest values; only their low 32 bits
    /// are used.
    pub fn read_memory(&self, ptr: i64, len: i64) -> Result<&'a [u8], HostFunctionError> {
        let start = u64::from(low_u32(ptr));
        let len = u64::from(low_u32(len));
        let out_of_bounds = HostFunctionError::MemoryOutOfBounds {
            ptr: start,
            len,
            memory_size: self.memory.len(),
        };

        let (Ok(begin), Ok(end)) = (usize::try_from(start), usize::try_from(start + len)) else {
            return Err(out_of_bounds);
        };

        self.memory.get(begin..end).ok_or(out_of_bounds)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn low_u32(value: i64) -> u32 {
    value as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_locals() {
        let locals = [41, 7];
        let frame = Frame::new(&locals, &[]);

        assert_eq!(frame.local(0), Ok(41));
        assert_eq!(frame.local(1), Ok(7));
        assert_eq!(
            frame.local(2),
            Err(HostFunctionError::MissingLocal { index: 2, count: 2 })
        );
    }

    #[test]
    fn test_read_memory() {
        let memory = b"..hi..";
        let frame = Frame::new(&[], memory);

        assert_eq!(frame.read_memory(2, 2).unwrap(), b"hi");
        assert_eq!(frame.read_memory(0, 0).unwrap(), b"");
        assert_eq!(frame.read_memory(0, 6).unwrap(), memory);
    }

    #[test]
    fn test_read_memory_out_of_bounds() {
        let memory = [0u8; 4];
        let frame = Frame::new(&[], &memory);

        assert!(matches!(
            frame.read_memory(3, 2),
            Err(HostFunctionError::MemoryOutOfBounds { ptr: 3, len: 2, memory_size: 4 })
        ));
        // Negative values are reinterpreted as large unsigned offsets
        assert!(frame.read_memory(-1, 1).is_err());
    }

    #[test]
    fn test_host_function_wrapper() {
        let double = host_function(|frame| Ok(frame.local(0)? * 2));
        let locals = [21];

        assert_eq!(double(&Frame::new(&locals, &[])), Ok(42));
    }
}
