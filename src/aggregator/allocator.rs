//! Append-only arena backing aggregation records.

use std::ptr::NonNull;

use thiserror::Error;

/// Size of every arena block.
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Memory for a record could not be obtained.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("cannot allocate {size} bytes")]
pub struct AllocError {
    pub size: usize,
}

/// Hands out zeroed byte buffers carved from large blocks.
///
/// Buffers stay valid and never move until the arena is dropped; there is
/// no per-buffer free.
pub struct Arena {
    blocks: Vec<NonNull<[u8]>>,
    /// Bytes used in the last block.
    used: usize,
}

// SAFETY: the arena exclusively owns its blocks; handing it to another
// thread moves that ownership along with it.
unsafe impl Send for Arena {}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    /// Creates an arena without allocating.
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            used: BLOCK_SIZE,
        }
    }

    /// Returns a zeroed buffer of `size` bytes.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size > BLOCK_SIZE {
            return Err(AllocError { size });
        }
        if BLOCK_SIZE - self.used < size {
            self.new_block()?;
        }

        let block = self.blocks.last().ok_or(AllocError { size })?;
        let base = block.as_ptr() as *mut u8;
        // SAFETY: `used + size <= BLOCK_SIZE`, so the result stays inside the
        // block and is non-null.
        let ptr = unsafe { NonNull::new_unchecked(base.add(self.used)) };
        self.used += size;
        Ok(ptr)
    }

    /// Number of blocks obtained so far.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Total bytes reserved by the arena.
    pub fn reserved_bytes(&self) -> usize {
        self.blocks.len() * BLOCK_SIZE
    }

    fn new_block(&mut self) -> Result<(), AllocError> {
        let err = AllocError { size: BLOCK_SIZE };
        let mut buf: Vec<u8> = Vec::new();
        buf.try_reserve_exact(BLOCK_SIZE).map_err(|_| err)?;
        self.blocks.try_reserve(1).map_err(|_| err)?;
        buf.resize(BLOCK_SIZE, 0);

        let raw = Box::into_raw(buf.into_boxed_slice());
        // SAFETY: `Box::into_raw` never returns null.
        self.blocks.push(unsafe { NonNull::new_unchecked(raw) });
        self.used = 0;
        Ok(())
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        for block in self.blocks.drain(..) {
            // SAFETY: every block came from `Box::into_raw` and is freed once.
            drop(unsafe { Box::from_raw(block.as_ptr()) });
        }
    }
}
